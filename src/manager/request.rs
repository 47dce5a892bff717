//! Requests: action lists with completion events
//!
//! A request is created by the caller, queued, picked by one worker, run
//! sequentially against that worker's connection, and completed by setting
//! its event. Setting the event early cancels the request: before pickup
//! the worker skips it entirely; mid-run the results are discarded.

use crate::article::Article;
use crate::codec::{GroupEntry, OverviewEntry, XoverSort};
use crate::commands::GroupSummary;
use crate::connection::StatOutcome;
use crate::error::Error;
use crate::response::Response;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;

/// One connection method invocation
#[derive(Debug)]
pub enum Action {
    /// Select a group
    Group(String),
    /// Fetch the (optionally filtered) group list
    Groups {
        /// Case-insensitive name prefixes
        filters: Vec<String>,
        /// Reuse the connection's cached listing
        lazy: bool,
    },
    /// STAT/HEAD probe
    Stat {
        /// Message-ID
        id: String,
        /// HEAD instead of STAT
        full: bool,
        /// Group to join first, where the server record requires it
        group: Option<String>,
    },
    /// Overview query
    Xover {
        /// Group to select first
        group: Option<String>,
        /// Range start
        start: u64,
        /// Range end (inclusive)
        end: u64,
        /// Result ordering
        sort: XoverSort,
    },
    /// Date-based cursor seek
    SeekByDate {
        /// Reference date
        refdate: DateTime<Utc>,
        /// Group to select first
        group: Option<String>,
    },
    /// Article fetch with decoding
    Fetch {
        /// Message-ID
        id: String,
        /// Scratch directory for decoded payloads
        work_dir: PathBuf,
        /// Group to join first, where the server record requires it
        group: Option<String>,
    },
    /// Article post
    Post(Box<Article>),
}

/// The outcome of one action
#[derive(Debug)]
pub enum ActionResult {
    /// GROUP outcome (None: no such group)
    Group(Option<GroupSummary>),
    /// Filtered group list
    Groups(Vec<GroupEntry>),
    /// STAT/HEAD outcome
    Stat(StatOutcome),
    /// Overview records keyed by the requested sort
    Xover(BTreeMap<String, OverviewEntry>),
    /// Matched article number
    Seek(u64),
    /// Fetched article (None: missing everywhere)
    Fetch(Option<Box<Article>>),
    /// Posted article with the server's verdict
    Post {
        /// The article handed back to the caller
        article: Box<Article>,
        /// Final 240/441 response
        response: Response,
    },
    /// The action failed
    Error(Error),
}

/// Completion event with set-once semantics
#[derive(Debug, Default)]
pub struct Event {
    set: AtomicBool,
    notify: Notify,
}

impl Event {
    /// Mark the event set and wake all waiters
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the event has been set
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the event is set
    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// A queued unit of work for one worker
#[derive(Debug)]
pub struct Request {
    actions: Mutex<Vec<Action>>,
    results: Mutex<Vec<ActionResult>>,
    event: Event,
    created_at: Instant,
    started_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,
}

impl Request {
    /// Wrap actions into a shareable request
    pub fn new(actions: Vec<Action>) -> Arc<Self> {
        Arc::new(Self {
            actions: Mutex::new(actions),
            results: Mutex::new(Vec::new()),
            event: Event::default(),
            created_at: Instant::now(),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        })
    }

    /// Cancel: a worker that has not started skips it; one mid-run
    /// discards its results
    pub fn cancel(&self) {
        self.event.set();
    }

    /// Whether the completion event is set (done or cancelled)
    pub fn is_done(&self) -> bool {
        self.event.is_set()
    }

    /// Wait for completion
    pub async fn wait(&self) {
        self.event.wait().await;
    }

    /// Time since creation
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Worker-side: claim the actions and stamp the start time
    pub(crate) fn take_actions(&self) -> Vec<Action> {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        std::mem::take(&mut *self.actions.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Worker-side: publish results and set the event
    ///
    /// When the event was already set (cancelled mid-run) the results are
    /// discarded.
    pub(crate) fn complete(&self, results: Vec<ActionResult>) {
        *self.finished_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        if self.event.is_set() {
            return;
        }
        *self.results.lock().unwrap_or_else(|e| e.into_inner()) = results;
        self.event.set();
    }

    /// Caller-side: consume the results after completion
    pub fn take_results(&self) -> Vec<ActionResult> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_set_once() {
        let event = Event::default();
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        event.set();
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn test_event_wakes_waiter() {
        let event = Arc::new(Event::default());
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move {
                event.wait().await;
                true
            })
        };
        tokio::task::yield_now().await;
        event.set();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_cancelled_request_discards_results() {
        let request = Request::new(vec![Action::Group("alt.test".to_string())]);
        request.cancel();
        request.complete(vec![ActionResult::Group(None)]);
        assert!(request.take_results().is_empty());
    }

    #[test]
    fn test_completed_request_keeps_results() {
        let request = Request::new(vec![Action::Group("alt.test".to_string())]);
        let _ = request.take_actions();
        request.complete(vec![ActionResult::Group(None)]);
        assert!(request.is_done());
        assert_eq!(request.take_results().len(), 1);
    }
}
