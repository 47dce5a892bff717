//! NNTP protocol engine
//!
//! One [`NntpConnection`] drives one server conversation: welcome,
//! authentication, optional stream compression, group selection, overview
//! and article retrieval through the codec chain, and posting. Each
//! connection owns its ordered backup connections, consulted on a miss or
//! server error.

mod articles;
mod groups;
mod io;
mod posting;

pub use articles::StatOutcome;

use crate::codec::GroupEntry;
use crate::commands;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::response::codes;
use crate::socket::NntpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{debug, warn};

/// BufReader capacity for high-throughput article downloads (256KB)
const BUFREADER_CAPACITY: usize = 256 * 1024;

/// Currently selected group cursors
#[derive(Debug, Clone, Default)]
pub struct GroupCursor {
    /// Selected group name
    pub name: String,
    /// Estimated article count
    pub count: u64,
    /// Low water mark
    pub low: u64,
    /// High water mark
    pub high: u64,
    /// Read pointer within the group
    pub index: u64,
}

/// An authenticated NNTP conversation with optional backups
pub struct NntpConnection {
    /// Server record this connection talks to
    config: Arc<ServerConfig>,
    /// Buffered transport; None until connected
    stream: Option<BufReader<NntpStream>>,
    /// Welcome received
    connected: bool,
    /// Welcome advertised posting
    can_post: bool,
    /// XFEATURE COMPRESS GZIP accepted; bodies may arrive zlib-compressed
    gzip: bool,
    /// Selected group, when one is joined
    group: Option<GroupCursor>,
    /// Last status line seen
    last_code: u16,
    last_message: String,
    /// Cached LIST ACTIVE parse for lazy group listings
    group_cache: Option<Vec<GroupEntry>>,
    /// Ordered backup connections, consulted on miss or server error
    backups: Vec<NntpConnection>,
    /// Scratch directory handed to decoders
    work_dir: PathBuf,
}

impl NntpConnection {
    /// Build a connection (and its backups) from a server record
    ///
    /// Nothing touches the network until [`connect`](Self::connect).
    pub fn new(config: ServerConfig, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let backups = config
            .backups
            .iter()
            .cloned()
            .map(|mut backup| {
                backup.backups.clear();
                NntpConnection::new(backup, work_dir.clone())
            })
            .collect();

        Self {
            config: Arc::new(config),
            stream: None,
            connected: false,
            can_post: false,
            gzip: false,
            group: None,
            last_code: 0,
            last_message: String::new(),
            group_cache: None,
            backups,
            work_dir,
        }
    }

    /// The server record behind this connection
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether the welcome has been received
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the welcome advertised posting
    pub fn can_post(&self) -> bool {
        self.can_post
    }

    /// Whether XFEATURE COMPRESS GZIP is active
    pub fn is_compressed(&self) -> bool {
        self.gzip
    }

    /// The selected group's cursors, when one is joined
    pub fn current_group(&self) -> Option<&GroupCursor> {
        self.group.as_ref()
    }

    /// Last status line seen on this connection
    pub fn last_response(&self) -> (u16, &str) {
        (self.last_code, &self.last_message)
    }

    /// Establish the conversation: welcome, AUTHINFO, XFEATURE, group re-join
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        let stream = crate::socket::connect(&self.config, None).await?;
        self.stream = Some(BufReader::with_capacity(BUFREADER_CAPACITY, stream));

        // welcome
        let welcome = self.read_status().await?;
        if !welcome.is_success() {
            self.stream = None;
            return Err(Error::Protocol {
                code: welcome.code,
                message: welcome.message,
            });
        }
        self.can_post = welcome.code == codes::READY_POSTING_ALLOWED
            || welcome.message.to_ascii_uppercase().contains("POSTING OK");
        self.connected = true;
        debug!(
            "welcome from {}: {} {}",
            self.config.host, welcome.code, welcome.message
        );

        if !self.config.username.is_empty() {
            self.authenticate().await?;
        }

        if self.config.compress {
            self.try_enable_compression().await?;
        }

        // re-join the previously selected group after a reconnect
        if let Some(cursor) = self.group.take() {
            let _ = self.select_group(&cursor.name).await;
        }

        Ok(())
    }

    /// AUTHINFO USER/PASS exchange
    async fn authenticate(&mut self) -> Result<()> {
        debug!("authenticating as {}", self.config.username);

        self.send_command(&commands::authinfo_user(&self.config.username))
            .await?;
        let response = self.read_status().await?;

        if response.code == codes::AUTH_CONTINUE {
            self.send_command(&commands::authinfo_pass(&self.config.password))
                .await?;
            let response = self.read_status().await?;
            if response.code != codes::AUTH_ACCEPTED {
                self.connected = false;
                self.stream = None;
                return Err(Error::AuthFailed(response.message));
            }
        } else if response.code != codes::AUTH_ACCEPTED {
            self.connected = false;
            self.stream = None;
            return Err(Error::AuthFailed(response.message));
        }

        debug!("authentication successful");
        Ok(())
    }

    /// Attempt XFEATURE COMPRESS GZIP; a rejection downgrades to plain mode
    async fn try_enable_compression(&mut self) -> Result<()> {
        self.send_command(commands::xfeature_compress_gzip()).await?;
        let response = self.read_status().await?;

        if response.is_success() {
            self.gzip = true;
            debug!("XFEATURE COMPRESS GZIP enabled ({})", response.code);
        } else {
            self.gzip = false;
            debug!(
                "XFEATURE COMPRESS GZIP rejected ({}), staying uncompressed",
                response.code
            );
        }
        Ok(())
    }

    /// Send QUIT where possible and reset all session state
    pub async fn close(&mut self) -> Result<()> {
        if self.connected
            && self.stream.is_some()
            && let Err(e) = self.send_command(commands::quit()).await
        {
            warn!("QUIT failed for {}: {}", self.config.host, e);
        }
        self.stream = None;
        self.connected = false;
        self.can_post = false;
        self.gzip = false;
        self.group = None;

        for backup in &mut self.backups {
            Box::pin(backup.close()).await?;
        }
        Ok(())
    }

    /// Drop the transport without a QUIT (server fault path)
    pub(crate) fn drop_stream(&mut self) {
        self.stream = None;
        self.connected = false;
        self.gzip = false;
    }

    /// Ordered backup connections
    pub fn backups(&self) -> &[NntpConnection] {
        &self.backups
    }

    /// Scratch directory handed to decoders
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}
