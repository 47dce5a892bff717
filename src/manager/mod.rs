//! Worker pool and request queue over pooled connections
//!
//! The manager owns a bounded set of workers (each bound 1:1 to a
//! connection) pulling requests from one shared FIFO. Workers are spawned
//! lazily: a request that arrives with nobody available and headroom under
//! the thread cap brings a new worker (and its connection) up first.

mod request;
mod worker;

pub use request::{Action, ActionResult, Event, Request};

use crate::article::Article;
use crate::codec::{GroupEntry, OverviewEntry, XoverSort};
use crate::commands::GroupSummary;
use crate::config::Settings;
use crate::connection::{NntpConnection, StatOutcome};
use crate::error::{Error, Result};
use crate::nzb::Nzb;
use crate::response::Response;
use crate::segment::SegmentedPost;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use worker::{QueueItem, SharedQueue, Worker, WorkerTracker};

/// Pooled connection manager dispatching requests across workers
pub struct Manager {
    /// Effective server record: first configured server, remaining servers
    /// appended to its backup chain
    config: crate::config::ServerConfig,
    /// Concurrency cap: workers == connections <= threads
    threads: usize,
    work_dir: PathBuf,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    queue_rx: SharedQueue,
    tracker: Arc<WorkerTracker>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Set during shutdown; workers cancel queued work instead of running it
    closing: Arc<std::sync::atomic::AtomicBool>,
}

impl Manager {
    /// Build a manager from the settings record
    ///
    /// The first server is the primary; every further configured server is
    /// appended to its ordered backup list.
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut servers = settings.servers.clone();
        if servers.is_empty() {
            return Err(Error::Other("no servers configured".to_string()));
        }
        servers.sort_by_key(|s| s.priority);
        let mut config = servers.remove(0);
        for server in servers {
            config.backups.push(server);
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            threads: settings.processing.threads.max(1),
            work_dir: settings.global.resolved_work_dir(),
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            tracker: Arc::new(WorkerTracker::default()),
            handles: Mutex::new(Vec::new()),
            closing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Current worker count
    pub fn workers(&self) -> usize {
        self.tracker.total()
    }

    /// The configured concurrency cap
    pub fn threads(&self) -> usize {
        self.threads
    }

    fn spawn_worker(&self, id: usize) {
        let connection = NntpConnection::new(self.config.clone(), self.work_dir.clone());
        let worker = Worker::new(
            id,
            connection,
            self.queue_rx.clone(),
            self.tracker.clone(),
            self.closing.clone(),
        );
        let handle = tokio::spawn(worker.run());
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        debug!("spawned worker {} ({} total)", id, self.tracker.total());
    }

    /// Grow the pool toward `count` workers (bounded by the thread cap)
    pub fn spawn_workers(&self, count: usize) {
        let target = count.min(self.threads);
        while let Some(id) = self.tracker.try_grow(target) {
            self.spawn_worker(id);
        }
    }

    /// Enqueue a request, spawning a worker first when none is available
    ///
    /// Non-blocking: the caller holds the request and can `wait` on it or
    /// cancel it.
    pub fn put(&self, request: Arc<Request>) -> Result<()> {
        if let Some(id) = self.tracker.try_register(self.threads) {
            self.spawn_worker(id);
        }
        self.queue_tx
            .send(QueueItem::Work(request))
            .map_err(|_| Error::Other("request queue closed".to_string()))
    }

    /// Submit actions and wait for their results
    async fn run(&self, actions: Vec<Action>) -> Result<Vec<ActionResult>> {
        let request = Request::new(actions);
        self.put(request.clone())?;
        request.wait().await;
        Ok(request.take_results())
    }

    /// Select a group
    pub async fn group(&self, name: &str) -> Result<Option<GroupSummary>> {
        match single(self.run(vec![Action::Group(name.to_string())]).await?)? {
            ActionResult::Group(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the group list through one pooled connection
    pub async fn groups(&self, filters: &[String], lazy: bool) -> Result<Vec<GroupEntry>> {
        let action = Action::Groups {
            filters: filters.to_vec(),
            lazy,
        };
        match single(self.run(vec![action]).await?)? {
            ActionResult::Groups(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// Probe an article by Message-ID
    pub async fn stat(&self, id: &str, full: bool, group: Option<&str>) -> Result<StatOutcome> {
        let action = Action::Stat {
            id: id.to_string(),
            full,
            group: group.map(str::to_string),
        };
        match single(self.run(vec![action]).await?)? {
            ActionResult::Stat(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Query overview records
    pub async fn xover(
        &self,
        group: &str,
        start: u64,
        end: u64,
        sort: XoverSort,
    ) -> Result<BTreeMap<String, OverviewEntry>> {
        let action = Action::Xover {
            group: Some(group.to_string()),
            start,
            end,
            sort,
        };
        match single(self.run(vec![action]).await?)? {
            ActionResult::Xover(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// Seek the group cursor to the first article at or after `refdate`
    pub async fn seek_by_date(&self, refdate: DateTime<Utc>, group: &str) -> Result<u64> {
        let action = Action::SeekByDate {
            refdate,
            group: Some(group.to_string()),
        };
        match single(self.run(vec![action]).await?)? {
            ActionResult::Seek(index) => Ok(index),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch one article by Message-ID
    pub async fn get(
        &self,
        id: &str,
        work_dir: &Path,
        group: Option<&str>,
    ) -> Result<Option<Article>> {
        let action = Action::Fetch {
            id: id.to_string(),
            work_dir: work_dir.to_path_buf(),
            group: group.map(str::to_string),
        };
        match single(self.run(vec![action]).await?)? {
            ActionResult::Fetch(article) => Ok(article.map(|boxed| *boxed)),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch an article stub in place, adopting the decoded response
    pub async fn get_article(&self, article: &mut Article, work_dir: &Path) -> Result<bool> {
        let id = article
            .id()
            .ok_or_else(|| Error::Content("article stub has no Message-ID".to_string()))?
            .to_string();
        let group = article.groups().first().cloned();
        match self.get(&id, work_dir, group.as_deref()).await? {
            Some(fetched) => {
                article.adopt(fetched)?;
                Ok(true)
            }
            None => {
                article.set_valid(false);
                Ok(false)
            }
        }
    }

    /// Fetch every segment of a post concurrently and load the results
    /// back into their source articles
    pub async fn get_post(&self, post: &mut SegmentedPost, work_dir: &Path) -> Result<usize> {
        self.spawn_workers(post.segcount());
        let group = post.groups().first().cloned();

        let mut pending = Vec::with_capacity(post.segcount());
        for article in post.articles() {
            let id = article
                .id()
                .ok_or_else(|| Error::Content("segment stub has no Message-ID".to_string()))?
                .to_string();
            let request = Request::new(vec![Action::Fetch {
                id,
                work_dir: work_dir.to_path_buf(),
                group: group.clone(),
            }]);
            self.put(request.clone())?;
            pending.push(request);
        }

        let mut fetched = 0;
        for (article, request) in post.articles_mut().iter_mut().zip(pending) {
            request.wait().await;
            match single(request.take_results())? {
                ActionResult::Fetch(Some(response_article)) => {
                    // completion order is irrelevant; identity must hold
                    if response_article.id() != article.id() {
                        return Err(Error::Other(format!(
                            "response id {:?} does not match request id {:?}",
                            response_article.id(),
                            article.id()
                        )));
                    }
                    article.adopt(*response_article)?;
                    fetched += 1;
                }
                ActionResult::Fetch(None) => {
                    warn!("segment {:?} missing on all servers", article.id());
                    article.set_valid(false);
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(fetched)
    }

    /// Fetch every file of a manifest
    ///
    /// The pool is pre-grown to `min(segcount, threads)` workers before the
    /// fan-out.
    pub async fn get_nzb(&self, nzb: &mut Nzb, work_dir: &Path) -> Result<usize> {
        self.spawn_workers(nzb.segcount());
        let mut fetched = 0;
        for post in nzb.files_mut() {
            fetched += self.get_post(post, work_dir).await?;
        }
        Ok(fetched)
    }

    /// Post one article, returning it with the server's verdict
    pub async fn post(&self, article: Article) -> Result<(Article, Response)> {
        match single(self.run(vec![Action::Post(Box::new(article))]).await?)? {
            ActionResult::Post { article, response } => Ok((*article, response)),
            other => Err(unexpected(other)),
        }
    }

    /// Post every article of a segmented post concurrently
    ///
    /// Returns per-article verdicts in part order.
    pub async fn post_segmented(&self, post: &mut SegmentedPost) -> Result<Vec<Response>> {
        self.spawn_workers(post.segcount());

        let articles: Vec<Article> = {
            let mut swapped = Vec::with_capacity(post.segcount());
            for article in post.articles_mut() {
                swapped.push(std::mem::take(article));
            }
            swapped
        };

        let mut pending = Vec::with_capacity(articles.len());
        for article in articles {
            let request = Request::new(vec![Action::Post(Box::new(article))]);
            self.put(request.clone())?;
            pending.push(request);
        }

        let mut verdicts = Vec::with_capacity(pending.len());
        for (slot, request) in post.articles_mut().iter_mut().zip(pending) {
            request.wait().await;
            match single(request.take_results())? {
                ActionResult::Post { article, response } => {
                    *slot = *article;
                    verdicts.push(response);
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(verdicts)
    }

    /// Post every file of a manifest, in order
    pub async fn post_nzb(&self, nzb: &mut Nzb) -> Result<Vec<Response>> {
        self.spawn_workers(nzb.segcount());
        let mut verdicts = Vec::new();
        for post in nzb.files_mut() {
            verdicts.extend(self.post_segmented(post).await?);
        }
        Ok(verdicts)
    }

    /// Drain pending work, retire every worker, and close all connections
    ///
    /// Pending requests still queued behind the sentinels are cancelled by
    /// the workers (the closing flag makes them skip instead of execute),
    /// so shutdown is bounded by the in-flight commands only.
    pub async fn close(&self) {
        self.closing.store(true, std::sync::atomic::Ordering::SeqCst);

        // one sentinel per worker unblocks them all
        for _ in 0..self.tracker.total() {
            let _ = self.queue_tx.send(QueueItem::Shutdown);
        }

        let handles: Vec<_> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("worker join failed: {}", e);
            }
        }

        self.closing.store(false, std::sync::atomic::Ordering::SeqCst);
        debug!("manager closed");
    }
}

/// Expect exactly one result from a single-action request
fn single(mut results: Vec<ActionResult>) -> Result<ActionResult> {
    match results.len() {
        1 => match results.pop() {
            Some(ActionResult::Error(e)) => Err(e),
            Some(result) => Ok(result),
            None => Err(Error::Other("empty response list".to_string())),
        },
        0 => Err(Error::Other("request produced no response".to_string())),
        n => Err(Error::Other(format!("expected one response, got {}", n))),
    }
}

fn unexpected(result: ActionResult) -> Error {
    Error::Other(format!("unexpected response variant: {:?}", result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn settings(threads: usize) -> Settings {
        Settings {
            servers: vec![ServerConfig::plain("primary.example.com", "u", "p")],
            processing: crate::config::ProcessingConfig {
                threads,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_new_requires_servers() {
        let empty = Settings::default();
        assert!(Manager::new(&empty).is_err());
    }

    #[test]
    fn test_servers_fold_into_backup_chain() {
        let mut s = settings(4);
        let mut second = ServerConfig::plain("second.example.com", "u", "p");
        second.priority = 5;
        s.servers.push(second);

        let manager = Manager::new(&s).unwrap();
        assert_eq!(manager.config.host, "primary.example.com");
        assert_eq!(manager.config.backups.len(), 1);
        assert_eq!(manager.config.backups[0].host, "second.example.com");
    }

    #[tokio::test]
    async fn test_spawn_workers_bounded_by_threads() {
        let manager = Manager::new(&settings(3)).unwrap();
        manager.spawn_workers(10);
        assert_eq!(manager.workers(), 3);
        manager.close().await;
        assert_eq!(manager.workers(), 0);
    }

    #[tokio::test]
    async fn test_lazy_spawn_on_put() {
        let manager = Manager::new(&settings(2)).unwrap();
        assert_eq!(manager.workers(), 0);

        let request = Request::new(vec![]);
        manager.put(request.clone()).unwrap();
        assert_eq!(manager.workers(), 1);
        request.wait().await;

        manager.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_request_skipped() {
        let manager = Manager::new(&settings(1)).unwrap();
        let request = Request::new(vec![Action::Group("alt.test".to_string())]);
        request.cancel();
        manager.put(request.clone()).unwrap();

        request.wait().await;
        assert!(request.take_results().is_empty());
        manager.close().await;
    }
}
