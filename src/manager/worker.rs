//! Workers: one task, one connection, one shared queue
//!
//! A worker pulls requests off the shared FIFO, runs each request's
//! actions sequentially against its own connection, and parks on the queue
//! again. A shutdown sentinel unblocks and retires it.

use super::request::{Action, ActionResult, Request};
use crate::connection::NntpConnection;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

/// Item on the shared work queue
pub(crate) enum QueueItem {
    /// A request to execute
    Work(Arc<Request>),
    /// Poison pill: the receiving worker exits
    Shutdown,
}

/// Mutex-guarded availability tracker shared by the manager and workers
#[derive(Debug, Default)]
pub(crate) struct WorkerTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    available: HashSet<usize>,
    busy: HashSet<usize>,
    next_id: usize,
}

impl WorkerTracker {
    /// Register a new worker as available, if the cap allows; returns its id
    pub(crate) fn try_register(&self, cap: usize) -> Option<usize> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let total = state.available.len() + state.busy.len();
        if !state.available.is_empty() || total >= cap {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.available.insert(id);
        Some(id)
    }

    /// Register a new worker regardless of availability, if the cap allows
    ///
    /// Used to pre-grow the pool before a segment fan-out.
    pub(crate) fn try_grow(&self, cap: usize) -> Option<usize> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let total = state.available.len() + state.busy.len();
        if total >= cap {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.available.insert(id);
        Some(id)
    }

    pub(crate) fn mark_busy(&self, id: usize) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.available.remove(&id);
        state.busy.insert(id);
    }

    pub(crate) fn mark_available(&self, id: usize) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.busy.remove(&id);
        state.available.insert(id);
    }

    pub(crate) fn retire(&self, id: usize) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.available.remove(&id);
        state.busy.remove(&id);
    }

    /// Total registered workers
    pub(crate) fn total(&self) -> usize {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.available.len() + state.busy.len()
    }
}

/// The shared FIFO's receiving side, one lock-holder at a time
pub(crate) type SharedQueue = Arc<tokio::sync::Mutex<UnboundedReceiver<QueueItem>>>;

pub(crate) struct Worker {
    id: usize,
    connection: NntpConnection,
    queue: SharedQueue,
    tracker: Arc<WorkerTracker>,
    closing: Arc<AtomicBool>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        connection: NntpConnection,
        queue: SharedQueue,
        tracker: Arc<WorkerTracker>,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            connection,
            queue,
            tracker,
            closing,
        }
    }

    /// Pull and execute requests until shut down
    pub(crate) async fn run(mut self) {
        debug!("worker {} ready", self.id);
        loop {
            let item = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let request = match item {
                Some(QueueItem::Work(request)) => request,
                Some(QueueItem::Shutdown) | None => break,
            };

            // shutdown in progress: queued work is cancelled, not run
            if self.closing.load(Ordering::SeqCst) {
                request.cancel();
                continue;
            }
            // cancelled before pickup: skip without touching the connection
            if request.is_done() {
                debug!("worker {} skipping cancelled request", self.id);
                continue;
            }

            self.tracker.mark_busy(self.id);
            let actions = request.take_actions();
            let mut results = Vec::with_capacity(actions.len());
            for action in actions {
                results.push(execute(&mut self.connection, action).await);
            }
            request.complete(results);
            self.tracker.mark_available(self.id);
        }

        self.tracker.retire(self.id);
        if let Err(e) = self.connection.close().await {
            warn!("worker {} close failed: {}", self.id, e);
        }
        debug!("worker {} retired", self.id);
    }
}

/// Run one action against the worker's connection
async fn execute(connection: &mut NntpConnection, action: Action) -> ActionResult {
    if !connection.is_connected()
        && let Err(e) = connection.connect().await
    {
        return ActionResult::Error(e);
    }

    match action {
        Action::Group(name) => match connection.select_group(&name).await {
            Ok(summary) => ActionResult::Group(summary),
            Err(e) => ActionResult::Error(e),
        },
        Action::Groups { filters, lazy } => match connection.list_groups(&filters, lazy).await {
            Ok(entries) => ActionResult::Groups(entries),
            Err(e) => ActionResult::Error(e),
        },
        Action::Stat { id, full, group } => {
            match connection.stat(&id, full, group.as_deref()).await {
                Ok(outcome) => ActionResult::Stat(outcome),
                Err(e) => ActionResult::Error(e),
            }
        }
        Action::Xover {
            group,
            start,
            end,
            sort,
        } => match connection.xover(group.as_deref(), start, end, sort).await {
            Ok(entries) => ActionResult::Xover(entries),
            Err(e) => ActionResult::Error(e),
        },
        Action::SeekByDate { refdate, group } => {
            match connection.seek_by_date(refdate, group.as_deref()).await {
                Ok(index) => ActionResult::Seek(index),
                Err(e) => ActionResult::Error(e),
            }
        }
        Action::Fetch {
            id,
            work_dir,
            group,
        } => match connection.fetch(&id, &work_dir, group.as_deref()).await {
            Ok(article) => ActionResult::Fetch(article.map(Box::new)),
            Err(e) => ActionResult::Error(e),
        },
        Action::Post(mut article) => match connection.post(&mut article).await {
            Ok(response) => ActionResult::Post { article, response },
            Err(e) => ActionResult::Error(e),
        },
    }
}
