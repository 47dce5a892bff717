//! Staged posting pipeline
//!
//! A loaded source path gets a sibling `<path>.nrws/` staging area holding
//! archive output (`prep/`), encoded article text (`staged/`), and a
//! durable store (`staged.db`). The five stages — prepare, stage, upload,
//! verify, clean — are individually resumable off the store and bracketed
//! by `pre_`/`post_` hooks.

mod archive;
mod hooks;
mod store;

pub use archive::{Par2Generator, RarArchiver, detect_split_size, source_size};
pub use hooks::{Hook, HookContext, HookRegistry};
pub use store::{NewStagedArticle, StagedArticle, StagedStore};

use crate::article::Article;
use crate::codec::YENC_LINE_WIDTH;
use crate::config::PostingConfig;
use crate::error::{Error, Result};
use crate::manager::{Action, ActionResult, Manager, Request};
use crate::nzb::Nzb;
use crate::response::codes;
use crate::segment::SegmentedPost;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffix appended to the source path for the staging area
const STAGING_SUFFIX: &str = ".nrws";

/// Archive output directory inside the staging area
const PREP_DIR: &str = "prep";

/// Encoded article directory inside the staging area
const STAGE_DIR: &str = "staged";

/// Durable store file inside the staging area
const STAGE_DB: &str = "staged.db";

/// Options for a full factory run
#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    /// Groups to post into
    pub groups: Vec<String>,
    /// Archive volume size; None selects by source size
    pub archive_size: Option<u64>,
    /// Article split size; None uses the posting config
    pub split_size: Option<u64>,
    /// From template override
    pub poster: Option<String>,
    /// Subject template override
    pub subject: Option<String>,
}

/// The staged posting factory
pub struct PostFactory {
    manager: Arc<Manager>,
    posting: PostingConfig,
    hooks: HookRegistry,
    path: Option<PathBuf>,
    staging_root: Option<PathBuf>,
}

impl PostFactory {
    /// A factory posting through `manager` with `posting` templates
    pub fn new(manager: Arc<Manager>, posting: PostingConfig, hooks: HookRegistry) -> Self {
        Self {
            manager,
            posting,
            hooks,
            path: None,
            staging_root: None,
        }
    }

    /// Bind a source path; all stages operate relative to it
    pub fn load(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::Content(format!("no such path: {}", path.display())));
        }
        let staging_root = PathBuf::from(format!("{}{}", path.display(), STAGING_SUFFIX));
        debug!(
            "loaded {} (staging at {})",
            path.display(),
            staging_root.display()
        );
        self.path = Some(path);
        self.staging_root = Some(staging_root);
        Ok(())
    }

    fn require_path(&self) -> Result<(&Path, &Path)> {
        match (self.path.as_deref(), self.staging_root.as_deref()) {
            (Some(path), Some(root)) => Ok((path, root)),
            _ => Err(Error::Content("no source path loaded".to_string())),
        }
    }

    fn prep_dir(&self) -> Result<PathBuf> {
        Ok(self.require_path()?.1.join(PREP_DIR))
    }

    fn stage_dir(&self) -> Result<PathBuf> {
        Ok(self.require_path()?.1.join(STAGE_DIR))
    }

    fn db_path(&self) -> Result<PathBuf> {
        Ok(self.require_path()?.1.join(STAGE_DB))
    }

    /// Run a stage inside its pre/post hook bracket
    async fn bracketed<F>(&mut self, stage: &str, inner: F) -> Result<bool>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let path = self.require_path()?.0.to_path_buf();
        let pre = HookContext::named(format!("pre_{}", stage)).with_path(path.clone());
        if !self.hooks.call(&pre) {
            warn!("{} aborted by pre_{} hook", stage, stage);
            return Ok(false);
        }

        let status = match inner.await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} failed: {}", stage, e);
                false
            }
        };

        let post = HookContext::named(format!("post_{}", stage))
            .with_path(path)
            .with_status(status);
        self.hooks.call(&post);
        Ok(status)
    }

    /// Stage 1: archive the source and generate recovery records
    ///
    /// Archive and recovery outputs are atomic: any failure removes the
    /// whole `prep/` directory.
    pub async fn prepare(&mut self, archive_size: Option<u64>) -> Result<bool> {
        let (path, _) = self.require_path()?;
        let path = path.to_path_buf();
        let prep = self.prep_dir()?;
        let archive_size = archive_size.or_else(|| {
            // a configured archive cap stands in when the caller gave none
            (self.posting.max_archive_size > 0).then_some(self.posting.max_archive_size)
        });
        let inner = async {
            let result = prepare_inner(&path, &prep, archive_size).await;
            if result.is_err() && prep.exists() {
                let _ = std::fs::remove_dir_all(&prep);
            }
            result
        };
        self.bracketed("prepare", inner).await
    }

    /// Stage 2: split, encode, and persist every prepared file
    pub async fn stage(
        &mut self,
        groups: &[String],
        split_size: Option<u64>,
        poster: Option<&str>,
        subject: Option<&str>,
    ) -> Result<bool> {
        if groups.is_empty() {
            return Err(Error::Content("stage requires at least one group".to_string()));
        }
        let prep = self.prep_dir()?;
        let stage_dir = self.stage_dir()?;
        let db_path = self.db_path()?;
        let split = split_size.unwrap_or(self.posting.max_article_size).max(1);
        let poster = poster.unwrap_or(&self.posting.poster).to_string();
        let subject = subject.unwrap_or(&self.posting.subject).to_string();
        let groups = groups.to_vec();

        let inner = stage_inner(prep, stage_dir, db_path, groups, split, poster, subject);
        self.bracketed("stage", inner).await
    }

    /// Stage 3: rebuild articles from the store and post them
    ///
    /// Rows already posted are skipped, so an aborted upload resumes from
    /// the first row without a posted timestamp. A SHA-1 mismatch between
    /// the staged file and its stored digest is fatal for the file.
    pub async fn upload(&mut self, default_groups: &[String]) -> Result<bool> {
        let (path, _) = self.require_path()?;
        let nzb_path = PathBuf::from(format!("{}.nzb", path.display()));
        let db_path = self.db_path()?;
        let manager = self.manager.clone();
        let defaults = default_groups.to_vec();

        let inner = upload_inner(manager, db_path, nzb_path, defaults);
        self.bracketed("upload", inner).await
    }

    /// Stage 4: HEAD every posted-but-unverified row and stamp it verified
    pub async fn verify(&mut self) -> Result<bool> {
        let db_path = self.db_path()?;
        let manager = self.manager.clone();
        let inner = verify_inner(manager, db_path);
        self.bracketed("verify", inner).await
    }

    /// Stage 5: remove the staging area entirely
    pub async fn clean(&mut self) -> Result<bool> {
        let root = self.require_path()?.1.to_path_buf();
        let inner = async move {
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            Ok(())
        };
        self.bracketed("clean", inner).await
    }

    /// Run every stage in order; stops at the first failed stage
    pub async fn run(&mut self, options: &PostOptions) -> Result<bool> {
        if !self.prepare(options.archive_size).await? {
            return Ok(false);
        }
        if !self
            .stage(
                &options.groups,
                options.split_size,
                options.poster.as_deref(),
                options.subject.as_deref(),
            )
            .await?
        {
            return Ok(false);
        }
        if !self.upload(&options.groups).await? {
            return Ok(false);
        }
        if !self.verify().await? {
            return Ok(false);
        }
        self.clean().await
    }

    /// Mutable access to the hook registry
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }
}

async fn prepare_inner(path: &Path, prep: &Path, archive_size: Option<u64>) -> Result<()> {
    std::fs::create_dir_all(prep)?;

    let total = source_size(path)?;
    let volume_size = archive_size.unwrap_or_else(|| detect_split_size(total));
    let name = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());

    let rar = RarArchiver::from_path()
        .ok_or_else(|| Error::ExternalTool("rar not found on PATH".to_string()))?;
    let volumes = rar.archive(path, prep, &name, volume_size).await?;
    if volumes.is_empty() {
        return Err(Error::ExternalTool("rar produced no volumes".to_string()));
    }
    info!(
        "archived {} into {} volume(s) of <= {} byte(s)",
        path.display(),
        volumes.len(),
        volume_size
    );

    let par2 = Par2Generator::from_path()
        .ok_or_else(|| Error::ExternalTool("par2 not found on PATH".to_string()))?;
    par2.create(prep, &name).await?;
    Ok(())
}

async fn stage_inner(
    prep: PathBuf,
    stage_dir: PathBuf,
    db_path: PathBuf,
    groups: Vec<String>,
    split_size: u64,
    poster: String,
    subject: String,
) -> Result<()> {
    std::fs::create_dir_all(&stage_dir)?;
    let store = StagedStore::open(&db_path).await?;

    let mut sources: Vec<PathBuf> = std::fs::read_dir(&prep)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    sources.sort();
    if sources.is_empty() {
        store.close().await;
        return Err(Error::Content(format!(
            "nothing prepared under {}",
            prep.display()
        )));
    }

    let result = async {
        for (index, source) in sources.iter().enumerate() {
            let sort_no = index as u32 + 1;
            let mut post = SegmentedPost::from_path(source, &stage_dir)?;
            post.sort_no = sort_no;
            post.subject = subject.clone();
            post.poster = poster.clone();
            for group in &groups {
                post.add_group(group.clone());
            }

            post.split(split_size)?;
            post.encode(YENC_LINE_WIDTH)?;
            post.apply_template()?;

            let total = post.segcount();
            let remote_file = post.filename.clone();
            for article in post.articles_mut() {
                let sequence_no = article.sequence_no;
                let message_id = article.msgid(false).to_string();

                let staged_name = format!("{:05}.{:05}.ntx", sort_no, sequence_no);
                let staged_path = stage_dir.join(&staged_name);
                std::fs::write(&staged_path, &article.body)?;

                let mut hasher = Sha1::new();
                hasher.update(&article.body);
                let sha1 = hasher
                    .finalize()
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>();

                let headers: Vec<(String, String)> = article
                    .header
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();

                let row = NewStagedArticle {
                    local_file: staged_path.to_string_lossy().into_owned(),
                    message_id,
                    subject: article.subject.clone(),
                    poster: article.poster.clone(),
                    remote_file: remote_file.clone(),
                    size: article.body.len() as i64,
                    sha1,
                    sequence_no: sequence_no as i64,
                    sort_no: sort_no as i64,
                };
                store.insert(&row, &groups, &headers).await?;
            }
            info!("staged {} as {} article(s)", remote_file, total);
        }
        Ok(())
    }
    .await;

    store.close().await;
    result
}

async fn upload_inner(
    manager: Arc<Manager>,
    db_path: PathBuf,
    nzb_path: PathBuf,
    default_groups: Vec<String>,
) -> Result<()> {
    let store = StagedStore::open(&db_path).await?;
    let result = upload_rows(&manager, &store, &nzb_path, &default_groups).await;
    store.close().await;
    result
}

async fn upload_rows(
    manager: &Manager,
    store: &StagedStore,
    nzb_path: &Path,
    default_groups: &[String],
) -> Result<()> {
    let rows = store.all_ordered().await?;
    if rows.is_empty() {
        return Err(Error::Store("nothing staged to upload".to_string()));
    }

    let mut pending = Vec::new();
    for row in &rows {
        if row.posted_date.is_some() {
            debug!("row {} already posted; skipping", row.id);
            continue;
        }

        let body = std::fs::read(&row.local_file)?;

        let mut hasher = Sha1::new();
        hasher.update(&body);
        let found = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        if found != row.sha1 {
            return Err(Error::StagingIntegrity {
                file: row.local_file.clone(),
                expected: row.sha1.clone(),
                found,
            });
        }

        let mut groups = store.groups_for(row.id).await?;
        if groups.is_empty() {
            groups = default_groups.to_vec();
        }

        let mut article = Article::with_id(row.message_id.clone());
        article.subject = row.subject.clone();
        article.poster = row.poster.clone();
        article.body = body;
        article.sequence_no = row.sequence_no as u32;
        article.expected_size = Some(row.size as u64);
        for group in groups {
            article.add_group(group);
        }
        for (key, value) in store.headers_for(row.id).await? {
            article.header.push(key, value);
        }

        // collision probe, once per unposted row
        if manager
            .stat(&row.message_id, false, None)
            .await
            .map(|outcome| outcome.is_found())
            .unwrap_or(false)
        {
            let fresh = article.msgid(true).to_string();
            warn!(
                "message id {} already on server; regenerated as {}",
                row.message_id, fresh
            );
            store.update_message_id(row.id, &fresh).await?;
        }

        let request = Request::new(vec![Action::Post(Box::new(article))]);
        manager.put(request.clone())?;
        pending.push((row.id, request));
    }

    let mut failures = 0;
    for (row_id, request) in pending {
        request.wait().await;
        let mut results = request.take_results();
        match results.pop() {
            Some(ActionResult::Post { response, .. })
                if response.code == codes::ARTICLE_POSTED =>
            {
                store
                    .mark_posted(row_id, chrono::Utc::now().timestamp())
                    .await?;
            }
            Some(ActionResult::Post { response, .. }) => {
                warn!("row {} rejected: {} {}", row_id, response.code, response.message);
                failures += 1;
            }
            Some(ActionResult::Error(e)) => {
                warn!("row {} post failed: {}", row_id, e);
                failures += 1;
            }
            other => {
                warn!("row {} produced no verdict: {:?}", row_id, other);
                failures += 1;
            }
        }
    }

    // describe what made it up, regardless of stragglers
    let rows = store.all_ordered().await?;
    let nzb = manifest_from_rows(store, &rows, nzb_path).await?;
    nzb.save(nzb_path)?;
    info!("manifest written to {}", nzb_path.display());

    if failures > 0 {
        return Err(Error::PostingFailed(format!(
            "{} article(s) were not accepted",
            failures
        )));
    }
    Ok(())
}

/// Build a manifest describing the posted rows
async fn manifest_from_rows(
    store: &StagedStore,
    rows: &[StagedArticle],
    nzb_path: &Path,
) -> Result<Nzb> {
    let work_dir = nzb_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let mut posts: Vec<SegmentedPost> = Vec::new();

    for row in rows {
        if row.posted_date.is_none() {
            continue;
        }
        let matches_last = posts
            .last()
            .map(|post| post.sort_no as i64 == row.sort_no)
            .unwrap_or(false);
        if !matches_last {
            let mut post = SegmentedPost::new(row.remote_file.clone(), &work_dir);
            post.sort_no = row.sort_no as u32;
            post.subject = row.subject.clone();
            post.poster = row.poster.clone();
            post.date = row.posted_date.unwrap_or_default();
            for group in store.groups_for(row.id).await? {
                post.add_group(group);
            }
            posts.push(post);
        }
        if let Some(post) = posts.last_mut() {
            let mut stub = Article::with_id(row.message_id.clone());
            stub.expected_size = Some(row.size as u64);
            post.total_size += row.size as u64;
            post.add(stub);
        }
    }

    if posts.is_empty() {
        return Err(Error::PostingFailed("nothing was posted".to_string()));
    }
    Ok(Nzb::from_posts(posts, work_dir))
}

async fn verify_inner(manager: Arc<Manager>, db_path: PathBuf) -> Result<()> {
    let store = StagedStore::open(&db_path).await?;
    let result = async {
        let rows = store.posted_unverified().await?;
        let mut missing = 0;
        for row in &rows {
            let groups = store.groups_for(row.id).await?;
            let group = groups.first().map(String::as_str);
            match manager.stat(&row.message_id, true, group).await {
                Ok(outcome) if outcome.is_found() => {
                    store
                        .mark_verified(row.id, chrono::Utc::now().timestamp())
                        .await?;
                }
                Ok(_) => {
                    warn!("row {} not yet visible on server", row.id);
                    missing += 1;
                }
                Err(e) => {
                    warn!("verification of row {} failed: {}", row.id, e);
                    missing += 1;
                }
            }
        }
        if missing > 0 {
            return Err(Error::Other(format!(
                "{} article(s) unverified",
                missing
            )));
        }
        Ok(())
    }
    .await;
    store.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessingConfig, ServerConfig, Settings};
    use tempfile::tempdir;

    fn factory() -> PostFactory {
        let settings = Settings {
            servers: vec![ServerConfig::plain("unused.example.com", "u", "p")],
            processing: ProcessingConfig {
                threads: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let manager = Arc::new(Manager::new(&settings).unwrap());
        PostFactory::new(manager, PostingConfig::default(), HookRegistry::new())
    }

    #[tokio::test]
    async fn test_load_requires_existing_path() {
        let dir = tempdir().unwrap();
        let mut factory = factory();
        assert!(factory.load(dir.path().join("missing.bin")).is_err());

        std::fs::write(dir.path().join("present.bin"), b"data").unwrap();
        factory.load(dir.path().join("present.bin")).unwrap();
        assert_eq!(
            factory.db_path().unwrap(),
            PathBuf::from(format!(
                "{}.nrws/staged.db",
                dir.path().join("present.bin").display()
            ))
        );
    }

    #[tokio::test]
    async fn test_pre_hook_aborts_stage() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("src.bin"), b"data").unwrap();

        let mut factory = factory();
        factory.load(dir.path().join("src.bin")).unwrap();
        factory
            .hooks_mut()
            .add("pre_clean", Box::new(|_| false));

        assert!(!factory.clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_post_hook_sees_status() {
        use std::sync::Mutex as StdMutex;
        use std::sync::Arc as StdArc;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("src.bin"), b"data").unwrap();

        let seen: StdArc<StdMutex<Option<bool>>> = StdArc::new(StdMutex::new(None));
        let mut factory = factory();
        factory.load(dir.path().join("src.bin")).unwrap();
        {
            let seen = seen.clone();
            factory.hooks_mut().add(
                "post_clean",
                Box::new(move |context| {
                    *seen.lock().unwrap() = context.status;
                    true
                }),
            );
        }

        assert!(factory.clean().await.unwrap());
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_stage_requires_groups() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("src.bin"), b"data").unwrap();
        let mut factory = factory();
        factory.load(dir.path().join("src.bin")).unwrap();
        assert!(factory.stage(&[], None, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_stage_persists_rows() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("upload.bin");
        std::fs::write(&source, vec![0x42u8; 5000]).unwrap();

        let mut factory = factory();
        factory.load(&source).unwrap();

        // hand-build prep/ so the external archivers are not needed
        let prep = factory.prep_dir().unwrap();
        std::fs::create_dir_all(&prep).unwrap();
        std::fs::write(prep.join("upload.rar"), vec![0x13u8; 4000]).unwrap();
        std::fs::write(prep.join("upload.par2"), vec![0x07u8; 500]).unwrap();

        let groups = vec!["alt.binaries.test".to_string()];
        assert!(factory.stage(&groups, Some(2048), None, None).await.unwrap());

        let store = StagedStore::open(&factory.db_path().unwrap()).await.unwrap();
        let rows = store.all_ordered().await.unwrap();
        // upload.par2 (500 -> 1 part) + upload.rar (4000 -> 2 parts)
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].sort_no, 1);
        assert_eq!(rows[0].sequence_no, 1);
        assert!(rows.iter().all(|r| r.posted_date.is_none()));
        assert!(rows.iter().all(|r| !r.message_id.is_empty()));

        // staged text exists and digests match
        for row in &rows {
            let body = std::fs::read(&row.local_file).unwrap();
            let mut hasher = Sha1::new();
            hasher.update(&body);
            let sha1 = hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>();
            assert_eq!(sha1, row.sha1);
            assert!(body.starts_with(b"=ybegin"));
        }

        assert_eq!(
            store.groups_for(rows[0].id).await.unwrap(),
            vec!["alt.binaries.test".to_string()]
        );
        store.close().await;
    }
}
