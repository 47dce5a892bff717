//! Header block decoder
//!
//! Parses `Key: value` lines at the top of an ARTICLE/HEAD body. The first
//! blank line ends the block. Once finished, the decoder refuses to
//! re-engage within the same response so body text resembling a header is
//! left alone.

use super::{DecodeStep, Decoded, Decoder};
use crate::article::Header;
use tracing::trace;

/// Incremental `Key: value` block parser
#[derive(Debug, Default)]
pub struct HeaderDecoder {
    parsed: Header,
    active: bool,
    finished: bool,
    /// Blank lines are tolerated before the first real header line
    seen_entry: bool,
}

impl HeaderDecoder {
    /// A fresh decoder
    pub fn new() -> Self {
        Self::default()
    }

    fn looks_like_header(line: &[u8]) -> bool {
        // "Key: value" with a printable token before the colon
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return false;
        };
        if colon == 0 {
            return false;
        }
        line[..colon]
            .iter()
            .all(|&b| b.is_ascii_graphic() && b != b':')
    }
}

impl Decoder for HeaderDecoder {
    fn detect(&self, line: &[u8]) -> bool {
        if self.finished {
            return false;
        }
        // tolerate whitespace-only lines at the very top of the block
        if !self.seen_entry && line.iter().all(|b| b.is_ascii_whitespace()) {
            return true;
        }
        Self::looks_like_header(line)
    }

    fn feed(&mut self, line: &[u8]) -> DecodeStep {
        self.active = true;

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            if !self.seen_entry {
                // leading blank; stay hungry
                return DecodeStep::Continue;
            }
            // blank line terminates the block
            self.finished = true;
            self.active = false;
            trace!("header block complete: {} entr(ies)", self.parsed.len());
            return DecodeStep::Done(Decoded::Headers(std::mem::take(&mut self.parsed)));
        }

        // folded continuation line: append to the previous entry
        if self.seen_entry && (line[0] == b' ' || line[0] == b'\t') {
            let text = String::from_utf8_lossy(line);
            self.parsed.fold_last(text.trim());
            return DecodeStep::Continue;
        }

        let text = String::from_utf8_lossy(line);
        match text.split_once(':') {
            Some((key, value)) => {
                self.parsed.push(key.trim(), value.trim());
                self.seen_entry = true;
                DecodeStep::Continue
            }
            None => {
                // not header-shaped after all; hand the block back as-is
                self.finished = true;
                self.active = false;
                if self.parsed.is_empty() {
                    DecodeStep::Skip
                } else {
                    DecodeStep::Done(Decoded::Headers(std::mem::take(&mut self.parsed)))
                }
            }
        }
    }

    fn finalize(&mut self) -> DecodeStep {
        self.finished = true;
        self.active = false;
        if self.parsed.is_empty() {
            DecodeStep::Skip
        } else {
            DecodeStep::Done(Decoded::Headers(std::mem::take(&mut self.parsed)))
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(decoder: &mut HeaderDecoder, lines: &[&[u8]]) -> Option<Header> {
        for line in lines {
            match decoder.feed(line) {
                DecodeStep::Done(Decoded::Headers(h)) => return Some(h),
                DecodeStep::Done(_) | DecodeStep::Skip | DecodeStep::Failed => return None,
                DecodeStep::Continue => {}
            }
        }
        match decoder.finalize() {
            DecodeStep::Done(Decoded::Headers(h)) => Some(h),
            _ => None,
        }
    }

    #[test]
    fn test_basic_block() {
        let mut decoder = HeaderDecoder::new();
        let header = feed_all(
            &mut decoder,
            &[
                b"Subject: test post",
                b"From: poster <p@example.com>",
                b"Message-ID: <abc@host>",
                b"",
            ],
        )
        .unwrap();
        assert_eq!(header.get("subject"), Some("test post"));
        assert_eq!(header.get("Message-ID"), Some("<abc@host>"));
        assert_eq!(header.len(), 3);
    }

    #[test]
    fn test_leading_blank_lines_tolerated() {
        let mut decoder = HeaderDecoder::new();
        assert!(decoder.detect(b"  "));
        let header = feed_all(&mut decoder, &[b"", b"  ", b"Subject: late start", b""]).unwrap();
        assert_eq!(header.get("Subject"), Some("late start"));
    }

    #[test]
    fn test_no_reengage_after_finish() {
        let mut decoder = HeaderDecoder::new();
        feed_all(&mut decoder, &[b"Subject: one", b""]).unwrap();
        // body text that resembles a header must not be claimed
        assert!(!decoder.detect(b"Note: this is body text"));
    }

    #[test]
    fn test_reset_reengages() {
        let mut decoder = HeaderDecoder::new();
        feed_all(&mut decoder, &[b"Subject: one", b""]).unwrap();
        decoder.reset();
        assert!(decoder.detect(b"Subject: two"));
    }

    #[test]
    fn test_detect_rejects_non_headers() {
        let decoder = HeaderDecoder::new();
        assert!(!decoder.detect(b"no colon here"));
        assert!(!decoder.detect(b": empty key"));
        assert!(!decoder.detect(b"spaced key : value"));
        assert!(decoder.detect(b"X-Custom-Header: ok"));
    }
}
