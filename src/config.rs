//! Engine settings records
//!
//! The core is handed these records fully populated; reading them from a
//! configuration file is the front-end's job. Field names line up with the
//! YAML surface (`global`, `servers`, `posting`, `processing`, `database`)
//! so any serde format loader can produce them directly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of concurrent workers
pub const DEFAULT_THREADS: usize = 5;

/// Default block size for header batch operations
pub const DEFAULT_HEADER_BATCH_SIZE: u64 = 25000;

/// NNTP server record
///
/// One primary server plus an ordered list of backups consulted on a miss
/// or server error. Backups are full server records themselves.
#[must_use]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname (e.g. "news.example.com")
    pub host: String,

    /// Server port (typically 119 for plain, 563 for TLS)
    pub port: u16,

    /// Username for AUTHINFO USER
    pub username: String,

    /// Password for AUTHINFO PASS
    pub password: String,

    /// Use TLS/SSL encryption
    #[serde(default)]
    pub secure: bool,

    /// Verify the peer certificate when `secure` is set
    ///
    /// When disabled, self-signed and mismatched certificates are accepted.
    /// Only use this against servers you trust on a closed network.
    #[serde(default = "default_true")]
    pub verify_cert: bool,

    /// Attempt XFEATURE COMPRESS GZIP after authenticating
    #[serde(default)]
    pub compress: bool,

    /// Select the group before fetching by Message-ID
    ///
    /// Most servers resolve Message-IDs globally; joining first is only
    /// needed for servers that scope article lookup to the current group.
    #[serde(default)]
    pub join_group: bool,

    /// Fetch headers with the article payload (ARTICLE vs BODY)
    #[serde(default = "default_true")]
    pub use_head: bool,

    /// Fetch payloads with BODY instead of ARTICLE
    #[serde(default)]
    pub use_body: bool,

    /// Priority among configured servers (lower is consulted first)
    #[serde(default)]
    pub priority: u32,

    /// Character encoding assumed for header text
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Ordered backup servers consulted on miss or server error
    #[serde(default)]
    pub backups: Vec<ServerConfig>,
}

fn default_true() -> bool {
    true
}

fn default_encoding() -> String {
    "ISO-8859-1".to_string()
}

impl ServerConfig {
    /// Create a plain-text server record on the standard port (119)
    pub fn plain(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 119, false, username, password)
    }

    /// Create a TLS server record on the standard secure port (563)
    pub fn tls(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, 563, true, username, password)
    }

    /// Create a server record with explicit host/port/TLS settings
    pub fn new(
        host: impl Into<String>,
        port: u16,
        secure: bool,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            secure,
            verify_cert: true,
            compress: false,
            join_group: false,
            use_head: true,
            use_body: false,
            priority: 0,
            encoding: default_encoding(),
            backups: Vec::new(),
        }
    }

    /// Attach a backup server record, keeping the list ordered by priority
    pub fn with_backup(mut self, backup: ServerConfig) -> Self {
        self.backups.push(backup);
        self.backups.sort_by_key(|s| s.priority);
        self
    }
}

/// Global paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Base directory for engine state
    pub base_dir: PathBuf,

    /// Scratch directory for decoded content
    ///
    /// A literal `<base_dir>` prefix is substituted with `base_dir`.
    pub work_dir: PathBuf,
}

impl GlobalConfig {
    /// Resolve `work_dir`, applying the `<base_dir>` substitution
    pub fn resolved_work_dir(&self) -> PathBuf {
        let raw = self.work_dir.to_string_lossy();
        match raw.strip_prefix("<base_dir>") {
            Some(rest) => {
                let rest = rest.trim_start_matches(['/', '\\']);
                self.base_dir.join(rest)
            }
            None => self.work_dir.clone(),
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            work_dir: PathBuf::from("<base_dir>/var/tmp"),
        }
    }
}

/// Posting templates and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingConfig {
    /// From-header template for staged articles
    pub poster: String,

    /// Subject template for staged articles
    ///
    /// Recognized tokens: `{filename}`, `{part}`, `{total}`.
    pub subject: String,

    /// Maximum encoded article payload size in bytes
    pub max_article_size: u64,

    /// Maximum archive volume size in bytes (0 selects by source size)
    pub max_archive_size: u64,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            poster: "newsreap <reaper@newsreap.io>".to_string(),
            subject: "{filename} ({part}/{total})".to_string(),
            max_article_size: 760 * 1024,
            max_archive_size: 0,
        }
    }
}

/// Concurrency and batching knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum concurrent workers (each worker owns one connection)
    pub threads: usize,

    /// Articles fetched per header batch
    pub header_batch_size: u64,

    /// Optional ramdisk path used for scratch content
    #[serde(default)]
    pub ramdisk: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            header_batch_size: DEFAULT_HEADER_BATCH_SIZE,
            ramdisk: None,
        }
    }
}

/// Local store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Engine URL for local stores (e.g. "sqlite://newsreap.db")
    pub engine: String,
}

/// Complete settings record handed to the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Paths
    pub global: GlobalConfig,
    /// Servers in priority order; the first is the primary
    pub servers: Vec<ServerConfig>,
    /// Posting templates and limits
    pub posting: PostingConfig,
    /// Concurrency knobs
    pub processing: ProcessingConfig,
    /// Store location
    pub database: DatabaseConfig,
}
