//! uuencode decoding and the incremental uu decoder
//!
//! Regions are framed by `begin <perm> <name>` and `end`. Each data line
//! opens with a length character (`(c - 32) & 63` bytes) followed by
//! 4-character groups encoding 3 bytes each. Malformed lines get one
//! recovery attempt using the classic length-derived truncation
//! `((len * 4) + 5) / 3` before being skipped.

use super::{DecodeStep, Decoded, Decoder};
use crate::content::Content;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Bytes encoded per uuencoded line
pub const UU_BYTES_PER_LINE: usize = 45;

/// Decode one uu character
fn uu_char(c: u8) -> u8 {
    (c.wrapping_sub(32)) & 63
}

/// Decode the data portion of a uu line into `count` bytes
///
/// `data` excludes the leading length character. Returns None when the
/// line is too short or holds characters outside the uu alphabet.
fn decode_groups(data: &[u8], count: usize) -> Option<Vec<u8>> {
    let needed_chars = count.div_ceil(3) * 4;
    if data.len() < needed_chars {
        return None;
    }
    let data = &data[..needed_chars];
    if data.iter().any(|&c| !(0x20..=0x60).contains(&c)) {
        return None;
    }

    let mut out = Vec::with_capacity(count);
    for group in data.chunks(4) {
        let c: Vec<u8> = group.iter().copied().map(uu_char).collect();
        out.push((c[0] << 2) | (c[1] >> 4));
        if out.len() < count {
            out.push((c[1] << 4) | (c[2] >> 2));
        }
        if out.len() < count {
            out.push((c[2] << 6) | c[3]);
        }
    }
    out.truncate(count);
    Some(out)
}

/// Decode a full uu data line, with the length-derived recovery fallback
fn decode_line(line: &[u8]) -> Option<Vec<u8>> {
    let count = uu_char(line[0]) as usize;
    if count == 0 {
        return Some(Vec::new());
    }

    if let Some(bytes) = decode_groups(&line[1..], count) {
        return Some(bytes);
    }

    // recovery: derive the char budget from the length byte and retry
    // against a truncated line (trailing-space corruption is the usual
    // culprit)
    let nbytes = (count * 4 + 5) / 3;
    let truncated = &line[..line.len().min(nbytes + 1)];
    let mut padded = truncated[1..].to_vec();
    let needed = count.div_ceil(3) * 4;
    while padded.len() < needed {
        padded.push(b' ');
    }
    decode_groups(&padded, count)
}

/// Incremental uuencode decoder producing one [`Content`] per region
pub struct UuDecoder {
    work_dir: PathBuf,
    content: Option<Content>,
    /// Any line failed both decode attempts
    damaged: bool,
}

impl UuDecoder {
    /// A decoder writing decoded payloads beneath `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            content: None,
            damaged: false,
        }
    }

    fn is_begin(line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        let mut tokens = text.split_whitespace();
        if tokens.next() != Some("begin") {
            return false;
        }
        // mode is 3-4 octal digits; a name must follow
        let Some(mode) = tokens.next() else {
            return false;
        };
        if !(3..=4).contains(&mode.len()) || !mode.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return false;
        }
        tokens.next().is_some()
    }

    fn emit(&mut self) -> DecodeStep {
        match self.content.take() {
            Some(mut content) => {
                if content.close().is_err() {
                    return DecodeStep::Failed;
                }
                if self.damaged {
                    content.set_valid(false);
                }
                debug!("uu region complete: {}", content.key());
                DecodeStep::Done(Decoded::Payload(content))
            }
            None => DecodeStep::Skip,
        }
    }
}

impl Decoder for UuDecoder {
    fn detect(&self, line: &[u8]) -> bool {
        Self::is_begin(line)
    }

    fn feed(&mut self, line: &[u8]) -> DecodeStep {
        if self.content.is_none() {
            if !Self::is_begin(line) {
                return DecodeStep::Failed;
            }
            let text = String::from_utf8_lossy(line);
            let name = text
                .split_whitespace()
                .nth(2)
                .unwrap_or("unknown")
                .to_string();
            self.content = Some(Content::with_filename(&self.work_dir, name));
            self.damaged = false;
            return DecodeStep::Continue;
        }

        if line == b"end" {
            return self.emit();
        }
        if line.is_empty() || line == b"`" {
            // zero-length data line; the end marker should follow
            return DecodeStep::Continue;
        }

        match decode_line(line) {
            Some(bytes) => {
                let Some(content) = self.content.as_mut() else {
                    return DecodeStep::Failed;
                };
                if content.write(&bytes).is_err() {
                    self.content = None;
                    return DecodeStep::Failed;
                }
                DecodeStep::Continue
            }
            None => {
                warn!("undecodable uu line ({} byte(s)); skipped", line.len());
                self.damaged = true;
                DecodeStep::Continue
            }
        }
    }

    fn finalize(&mut self) -> DecodeStep {
        // body ended without the end marker
        self.damaged = true;
        self.emit()
    }

    fn reset(&mut self) {
        self.content = None;
        self.damaged = false;
    }
}

/// Encode a payload as uuencoded text, including begin/end framing
pub fn uu_encode(data: &[u8], name: &str, mode: u32) -> Vec<u8> {
    fn encode_char(c: u8) -> u8 {
        if c == 0 {
            b'`'
        } else {
            c + 32
        }
    }

    let mut out = Vec::with_capacity(data.len() * 4 / 3 + 128);
    out.extend_from_slice(format!("begin {:03o} {}\r\n", mode, name).as_bytes());

    for chunk in data.chunks(UU_BYTES_PER_LINE) {
        out.push(encode_char(chunk.len() as u8));
        for group in chunk.chunks(3) {
            let b0 = group[0];
            let b1 = group.get(1).copied().unwrap_or(0);
            let b2 = group.get(2).copied().unwrap_or(0);
            out.push(encode_char(b0 >> 2));
            out.push(encode_char(((b0 << 4) | (b1 >> 4)) & 63));
            out.push(encode_char(((b1 << 2) | (b2 >> 6)) & 63));
            out.push(encode_char(b2 & 63));
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"`\r\nend\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn decode_text(work_dir: &std::path::Path, text: &[u8]) -> Option<Content> {
        let mut decoder = UuDecoder::new(work_dir);
        let mut out = None;
        for line in text.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let DecodeStep::Done(Decoded::Payload(content)) = decoder.feed(line) {
                out = Some(content);
            }
        }
        out
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let encoded = uu_encode(&payload, "bytes.bin", 0o644);
        let mut content = decode_text(dir.path(), &encoded).unwrap();

        assert!(content.is_valid());
        assert_eq!(content.filename(), "bytes.bin");
        content.rewind().unwrap();
        assert_eq!(content.read(2048).unwrap(), payload);
    }

    #[test]
    fn test_roundtrip_crc_preserved() {
        let dir = tempdir().unwrap();
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let expected = hasher.finalize();

        let encoded = uu_encode(&payload, "fox.txt", 0o644);
        let mut content = decode_text(dir.path(), &encoded).unwrap();
        assert_eq!(content.crc32().unwrap(), expected);
    }

    #[test]
    fn test_detect_begin_framing() {
        let dir = tempdir().unwrap();
        let decoder = UuDecoder::new(dir.path());
        assert!(decoder.detect(b"begin 644 file.bin"));
        assert!(decoder.detect(b"begin 0644 file with spaces.bin"));
        assert!(!decoder.detect(b"begin file.bin"));
        assert!(!decoder.detect(b"begin 99 file.bin"));
        assert!(!decoder.detect(b"begin 644"));
        assert!(!decoder.detect(b"beginning of text"));
    }

    #[test]
    fn test_recovery_on_stripped_trailing_spaces() {
        let dir = tempdir().unwrap();
        // "M" declares 45 bytes; strip the line's trailing padding spaces
        let payload = vec![0x20u8; 4];
        let mut encoded = uu_encode(&payload, "pad.bin", 0o644);
        // corrupt: drop the final two encoded chars of the data line
        let pos = encoded.windows(2).position(|w| w == b"\r\n").unwrap();
        let data_start = pos + 2;
        let data_end = data_start + encoded[data_start..].iter().position(|&b| b == b'\r').unwrap();
        encoded.drain(data_end - 2..data_end);

        let mut content = decode_text(dir.path(), &encoded).unwrap();
        // recovery pads the truncated group; length still honored
        assert_eq!(content.len().unwrap(), 4);
    }

    #[test]
    fn test_unrecoverable_line_skipped_and_flagged() {
        let dir = tempdir().unwrap();
        let text = b"begin 644 junk.bin\r\n\
                     $\x01\x02\x03\x04\r\n\
                     `\r\nend\r\n";
        let content = decode_text(dir.path(), text).unwrap();
        assert!(!content.is_valid());
    }

    #[test]
    fn test_missing_end_finalizes_invalid() {
        let dir = tempdir().unwrap();
        let mut decoder = UuDecoder::new(dir.path());
        decoder.feed(b"begin 644 cut.bin");
        decoder.feed(b"#0V%T");
        match decoder.finalize() {
            DecodeStep::Done(Decoded::Payload(content)) => assert!(!content.is_valid()),
            other => panic!("expected payload, got {:?}", other),
        }
    }
}
