//! NNTP response types and status codes

use crate::article::Header;
use crate::content::Content;

/// The outcome of one NNTP command
///
/// Carries the status line, any body lines no decoder claimed, and the
/// Content objects the codec chain produced while the body streamed in.
#[derive(Debug, Default)]
pub struct Response {
    /// 3-digit NNTP response code (0 until a status line was parsed)
    pub code: u16,
    /// Status message from the server
    pub message: String,
    /// Body lines left unclaimed by every decoder
    pub body: Vec<String>,
    /// Header block parsed by the header decoder, when one ran
    pub headers: Option<Header>,
    /// Decoded content emitted by the codec chain, in emission order
    pub contents: Vec<Content>,
}

impl Response {
    /// Build a bodyless response from a status line
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            body: Vec::new(),
            headers: None,
            contents: Vec::new(),
        }
    }

    /// Whether the response indicates success (2xx)
    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Whether the response indicates continuation (3xx)
    pub fn is_continuation(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Whether the response indicates an error (4xx or 5xx)
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// Whether the response indicates a server fault (5xx)
    pub fn is_server_error(&self) -> bool {
        self.code >= 500
    }

    /// Unclaimed body joined back into one block
    pub fn body_text(&self) -> String {
        self.body.join("\n")
    }
}

/// NNTP response codes used by this engine (RFC 3977 plus XFEATURE)
pub mod codes {
    /// Server ready, posting allowed
    pub const READY_POSTING_ALLOWED: u16 = 200;
    /// Server ready, no posting
    pub const READY_NO_POSTING: u16 = 201;
    /// Closing connection
    pub const CLOSING_CONNECTION: u16 = 205;
    /// Group selected
    pub const GROUP_SELECTED: u16 = 211;
    /// List of newsgroups follows
    pub const LIST_FOLLOWS: u16 = 215;
    /// Article follows
    pub const ARTICLE_FOLLOWS: u16 = 220;
    /// Head follows
    pub const HEAD_FOLLOWS: u16 = 221;
    /// Body follows
    pub const BODY_FOLLOWS: u16 = 222;
    /// Article exists (STAT)
    pub const ARTICLE_STAT: u16 = 223;
    /// Overview information follows
    pub const OVERVIEW_FOLLOWS: u16 = 224;
    /// New article list follows
    pub const NEW_ARTICLES_FOLLOW: u16 = 230;
    /// New newsgroup list follows
    pub const NEW_GROUPS_FOLLOW: u16 = 231;
    /// Article posted successfully
    pub const ARTICLE_POSTED: u16 = 240;
    /// Authentication accepted
    pub const AUTH_ACCEPTED: u16 = 281;
    /// XFEATURE compression enabled (legacy extension)
    pub const XFEATURE_ENABLED: u16 = 290;

    /// Send article to be posted
    pub const SEND_ARTICLE: u16 = 340;
    /// Continue with authentication
    pub const AUTH_CONTINUE: u16 = 381;

    /// Service temporarily unavailable
    pub const SERVICE_UNAVAILABLE: u16 = 400;
    /// No such newsgroup
    pub const NO_SUCH_GROUP: u16 = 411;
    /// No newsgroup selected
    pub const NO_GROUP_SELECTED: u16 = 412;
    /// No article with that number
    pub const NO_SUCH_ARTICLE_NUMBER: u16 = 423;
    /// No article with that message-id
    pub const NO_SUCH_ARTICLE_ID: u16 = 430;
    /// Posting not permitted
    pub const POSTING_NOT_PERMITTED: u16 = 440;
    /// Posting failed
    pub const POSTING_FAILED: u16 = 441;
    /// Authentication required
    pub const AUTH_REQUIRED: u16 = 480;
    /// Authentication rejected
    pub const AUTH_REJECTED: u16 = 481;

    /// Command not recognized
    pub const COMMAND_NOT_RECOGNIZED: u16 = 500;
    /// Command syntax error
    pub const COMMAND_SYNTAX_ERROR: u16 = 501;
    /// Access denied / command unavailable
    pub const ACCESS_DENIED: u16 = 502;
    /// Feature not supported
    pub const FEATURE_NOT_SUPPORTED: u16 = 503;
}
