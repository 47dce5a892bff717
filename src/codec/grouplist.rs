//! LIST ACTIVE response decoder
//!
//! Parses `group high low flags` lines into entries. RFC 3977 orders the
//! water marks high-first; an empty group reports `high < low`, so the
//! count is `high - low + 1` when `high >= low` and zero otherwise.

use super::{DecodeStep, Decoded, Decoder};
use tracing::warn;

/// Posting status flags from the group list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingStatus {
    /// Posting allowed (`y`)
    Allowed,
    /// Posting denied (`n`)
    Denied,
    /// Postings are moderated (`m`)
    Moderated,
    /// A flag this client does not interpret; servers may add new ones
    Other(char),
}

impl PostingStatus {
    fn from_char(c: char) -> Self {
        match c.to_ascii_lowercase() {
            'y' => PostingStatus::Allowed,
            'n' => PostingStatus::Denied,
            'm' => PostingStatus::Moderated,
            other => PostingStatus::Other(other),
        }
    }
}

/// One group list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// Group name, lowercased
    pub name: String,
    /// High water mark
    pub high: u64,
    /// Low water mark
    pub low: u64,
    /// Estimated article count
    pub count: u64,
    /// Posting flags in server order
    pub flags: Vec<PostingStatus>,
}

/// Parse one `group high low flags` line
pub fn parse_group_line(line: &str) -> Option<GroupEntry> {
    let mut fields = line.split_whitespace();
    let name = fields.next()?;
    let high: u64 = fields.next()?.parse().ok()?;
    let low: u64 = fields.next()?.parse().ok()?;

    let count = if high >= low { high - low + 1 } else { 0 };

    let flags = fields
        .next()
        .map(|raw| raw.chars().map(PostingStatus::from_char).collect())
        .unwrap_or_default();

    Some(GroupEntry {
        name: name.to_lowercase(),
        high,
        low,
        count,
        flags,
    })
}

/// Incremental group list decoder; emits all entries when the body ends
#[derive(Debug, Default)]
pub struct GroupListDecoder {
    entries: Vec<GroupEntry>,
    engaged: bool,
}

impl GroupListDecoder {
    /// A fresh decoder
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for GroupListDecoder {
    fn detect(&self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        parse_group_line(text).is_some()
    }

    fn feed(&mut self, line: &[u8]) -> DecodeStep {
        self.engaged = true;
        let text = String::from_utf8_lossy(line);
        match parse_group_line(&text) {
            Some(entry) => self.entries.push(entry),
            None => warn!("unparsable group list line skipped"),
        }
        DecodeStep::Continue
    }

    fn finalize(&mut self) -> DecodeStep {
        if !self.engaged {
            return DecodeStep::Skip;
        }
        self.engaged = false;
        DecodeStep::Done(Decoded::Groups(std::mem::take(&mut self.entries)))
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.engaged = false;
    }
}
