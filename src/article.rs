//! Articles and their header maps

use crate::content::Content;
use crate::error::{Error, Result};
use crate::response::Response;

/// Default host tag used in generated Message-IDs
const MSGID_HOST: &str = "newsreap";

/// An ordered, case-insensitive key/value map
///
/// Duplicate keys are allowed; lookups return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    /// An empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key/value pair, keeping any existing entries for the key
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace the first entry for `key`, or append when absent
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// First value for `key`, case-insensitive
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in insertion order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Whether any entry exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove every entry for `key`
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Append folded-continuation text to the most recent entry
    pub fn fold_last(&mut self, continuation: &str) {
        if let Some((_, value)) = self.entries.last_mut() {
            value.push(' ');
            value.push_str(continuation);
        }
    }
}

/// A single posting unit: headers, body text, and decoded payloads
#[derive(Debug, Default)]
pub struct Article {
    /// Message-ID without angle brackets; generated lazily
    id: String,
    /// Subject line
    pub subject: String,
    /// From line
    pub poster: String,
    /// Raw article body; NNTP bodies are 8-bit (yEnc text in particular)
    pub body: Vec<u8>,
    /// Parsed header map
    pub header: Header,
    /// Decoded payloads, keyed uniquely by [`Content::key`]
    contents: Vec<Content>,
    /// Sequence number within the owning segmented post
    pub sequence_no: u32,
    /// Declared payload size, for stubs built from a manifest
    pub expected_size: Option<u64>,
    /// Groups this article belongs to, insertion-ordered, unique
    groups: Vec<String>,
    /// Cleared when any payload failed integrity checks
    valid: bool,
}

impl Article {
    /// Create an article with subject and poster
    pub fn new(subject: impl Into<String>, poster: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            poster: poster.into(),
            valid: true,
            ..Self::default()
        }
    }

    /// Create an article stub around an existing Message-ID
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut article = Self::new("", "");
        article.id = id.into().trim_matches(['<', '>']).to_string();
        article
    }

    /// Return the Message-ID, generating `<unix-ts.part@host>` when unset
    /// or when `reset` forces a new one
    pub fn msgid(&mut self, reset: bool) -> &str {
        if self.id.is_empty() || reset {
            let now = chrono::Utc::now();
            self.id = format!(
                "{}.{}.{}@{}",
                now.timestamp(),
                now.timestamp_subsec_micros(),
                self.sequence_no.max(1),
                MSGID_HOST
            );
        }
        &self.id
    }

    /// The Message-ID if one was assigned
    pub fn id(&self) -> Option<&str> {
        if self.id.is_empty() {
            None
        } else {
            Some(&self.id)
        }
    }

    /// Attach a decoded payload; duplicates (same key) are rejected
    pub fn add(&mut self, content: Content) -> Result<()> {
        let key = content.key();
        if self.contents.iter().any(|c| c.key() == key) {
            return Err(Error::Content(format!("duplicate content key {}", key)));
        }
        if !content.is_valid() {
            self.valid = false;
        }
        self.contents.push(content);
        self.contents.sort_by_key(|c| c.key());
        Ok(())
    }

    /// Decoded payloads in key order
    pub fn contents(&self) -> &[Content] {
        &self.contents
    }

    /// Take ownership of the decoded payloads
    pub fn take_contents(&mut self) -> Vec<Content> {
        std::mem::take(&mut self.contents)
    }

    /// Add a group, preserving order and uniqueness
    pub fn add_group(&mut self, group: impl Into<String>) {
        let group = group.into().to_lowercase();
        if !self.groups.contains(&group) {
            self.groups.push(group);
        }
    }

    /// Groups this article belongs to
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Whether every payload passed integrity checks
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Clear or restore the validity flag
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Populate this article from a fetched response
    ///
    /// Consumes the response's parsed header block, unclaimed body lines,
    /// and decoded payloads. Subject/poster/Message-ID fields are refreshed
    /// from the headers when present.
    pub fn load(&mut self, mut response: Response) -> Result<()> {
        if let Some(header) = response.headers.take() {
            if let Some(subject) = header.get("Subject") {
                self.subject = subject.to_string();
            }
            if let Some(poster) = header.get("From") {
                self.poster = poster.to_string();
            }
            if let Some(id) = header.get("Message-ID") {
                self.id = id.trim_matches(['<', '>']).to_string();
            }
            if let Some(groups) = header.get("Newsgroups") {
                for group in groups.split(',') {
                    self.add_group(group.trim());
                }
            }
            self.header = header;
        }
        self.body = response.body.join("\n").into_bytes();
        for content in response.contents.drain(..) {
            self.add(content)?;
        }
        Ok(())
    }

    /// The body as text, lossy for any non-UTF-8 bytes
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Take over the fetched form of this article
    ///
    /// Used when a stub (from a manifest) is filled in by a completed
    /// fetch: decoded payloads, headers, and body move across; identity
    /// fields stay with the stub.
    pub fn adopt(&mut self, mut fetched: Article) -> Result<()> {
        self.header = std::mem::take(&mut fetched.header);
        self.body = std::mem::take(&mut fetched.body);
        if !fetched.is_valid() {
            self.valid = false;
        }
        for content in fetched.take_contents() {
            self.add(content)?;
        }
        Ok(())
    }

    /// Render the article for POST: headers, blank line, dot-stuffed body
    ///
    /// The terminating `.` line is the connection's responsibility. The
    /// result is raw bytes: yEnc bodies are 8-bit and must pass through
    /// unmangled.
    pub fn serialize_for_posting(&mut self) -> Result<Vec<u8>> {
        if self.groups.is_empty() {
            return Err(Error::Content("article has no groups".to_string()));
        }
        let id = self.msgid(false).to_string();

        let mut out = Vec::with_capacity(self.body.len() + 512);
        out.extend_from_slice(format!("Message-ID: <{}>\r\n", id).as_bytes());
        out.extend_from_slice(format!("Newsgroups: {}\r\n", self.groups.join(",")).as_bytes());
        out.extend_from_slice(format!("Subject: {}\r\n", self.subject).as_bytes());
        out.extend_from_slice(format!("From: {}\r\n", self.poster).as_bytes());
        for (key, value) in self.header.iter() {
            if matches!(
                key.to_ascii_lowercase().as_str(),
                "message-id" | "newsgroups" | "subject" | "from"
            ) {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");

        for line in self.body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
        Ok(out)
    }
}
