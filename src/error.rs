//! NNTP engine error types

use thiserror::Error;

/// Errors raised by the transport, protocol engine, and staging pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during network or file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error during secure connection
    #[error("TLS error: {0}")]
    Tls(String),

    /// No TLS protocol left to try after fallback
    #[error("No TLS protocol left to negotiate with {0}")]
    NoProtocolLeft(String),

    /// Operation timed out
    #[error("Connection timeout")]
    Timeout,

    /// Write stalled past the per-batch stall timer
    #[error("Connection write timeout after {0} bytes")]
    WriteTimeout(usize),

    /// Remote closed the connection mid-operation
    #[error("Connection lost")]
    ConnectionLost,

    /// Response could not be parsed as NNTP
    #[error("Invalid response: {0}")]
    BadResponse(String),

    /// Multi-line body could not be retrieved or decoded
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// NNTP protocol error with response code
    #[error("NNTP error {code}: {message}")]
    Protocol {
        /// 3-digit NNTP response code (e.g. 411, 441, 502)
        code: u16,
        /// Message text from the server
        message: String,
    },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// No such newsgroup
    #[error("No such newsgroup: {0}")]
    NoSuchGroup(String),

    /// Posting not permitted by the server
    #[error("Posting not permitted")]
    PostingNotPermitted,

    /// Server rejected a posted article
    #[error("Posting failed: {0}")]
    PostingFailed(String),

    /// Content framing or state violation (not CRC; CRC clears validity instead)
    #[error("Content error: {0}")]
    Content(String),

    /// Staged chunk digest no longer matches the stored digest
    #[error("Staging integrity failure for {file}: expected {expected}, found {found}")]
    StagingIntegrity {
        /// Local staged file that failed verification
        file: String,
        /// SHA-1 recorded when the chunk was staged
        expected: String,
        /// SHA-1 computed at upload time
        found: String,
    },

    /// Staging database failure
    #[error("Staging store error: {0}")]
    Store(String),

    /// External archive or recovery tool failure
    #[error("External tool error: {0}")]
    ExternalTool(String),

    /// Manifest (NZB) parse or emit failure
    #[error("NZB error: {0}")]
    Nzb(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the operation may be retried on the same connection
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::ConnectionLost | Error::FetchError(_) | Error::BadResponse(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
