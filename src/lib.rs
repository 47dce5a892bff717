#![doc = include_str!("../README.md")]

/// Articles and their header maps
pub mod article;
/// Incremental per-response decoders (header, yEnc, uuencode, overview, group list)
pub mod codec;
mod commands;
/// Engine settings records
pub mod config;
/// NNTP protocol engine with backups and compression
pub mod connection;
/// File-backed content streams
pub mod content;
mod error;
/// Worker pool and request queue over pooled connections
pub mod manager;
/// NZB manifest parsing and emission
pub mod nzb;
/// Staged posting pipeline
pub mod post;
mod response;
/// Segmented posts: one file in transit as N articles
pub mod segment;
/// TCP/TLS transport
pub mod socket;

pub use article::{Article, Header};
pub use codec::{
    DecodeStep, Decoded, Decoder, DecoderChain, GroupEntry, GroupListDecoder, HeaderDecoder,
    OverviewEntry, UuDecoder, XoverDecoder, XoverSort, YencDecoder, uu_encode, yenc_encode,
};
pub use commands::{GroupSummary, parse_group_response, parse_status_line};
pub use config::{
    DatabaseConfig, GlobalConfig, PostingConfig, ProcessingConfig, ServerConfig, Settings,
};
pub use connection::{GroupCursor, NntpConnection, StatOutcome};
pub use content::{BLOCK_SIZE, Content};
pub use error::{Error, Result};
pub use manager::{Action, ActionResult, Event, Manager, Request};
pub use nzb::Nzb;
pub use post::{
    HookContext, HookRegistry, Par2Generator, PostFactory, PostOptions, RarArchiver, StagedArticle,
    StagedStore, detect_split_size,
};
pub use response::{Response, codes};
pub use segment::SegmentedPost;
pub use socket::{NntpStream, TlsProtocol};
