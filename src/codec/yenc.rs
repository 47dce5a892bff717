//! yEnc encoding and the incremental yEnc decoder
//!
//! Decoding follows the escape rule: each byte is `(wire - 42) mod 256`,
//! with `=X` escapes decoding as `(X - 64 - 42) mod 256`. Framing is
//! `=ybegin`, an optional `=ypart` for multi-part posts, data lines, and a
//! `=yend` trailer carrying `size=`/`crc32=`/`pcrc32=` which the decoder
//! checks against the bytes it produced.

use super::{DecodeStep, Decoded, Decoder};
use crate::content::Content;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Default yEnc line width for encoding
pub const YENC_LINE_WIDTH: usize = 128;

/// Parse `key=value` pairs from a marker line remainder
///
/// The `name=` value runs to end of line and may contain spaces, so it is
/// handled last.
fn parse_params(rest: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = rest.trim();
    if let Some(pos) = rest.find("name=") {
        params.insert("name".to_string(), rest[pos + 5..].trim().to_string());
        rest = &rest[..pos];
    }
    for token in rest.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            params.insert(key.to_string(), value.to_string());
        }
    }
    params
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for =ybegin
    Idle,
    /// =ybegin seen; an =ypart may follow
    Begun,
    /// Consuming escaped data lines
    Data,
}

/// Incremental yEnc decoder producing one [`Content`] per encoded region
pub struct YencDecoder {
    work_dir: PathBuf,
    state: State,
    content: Option<Content>,
    hasher: crc32fast::Hasher,
    decoded_bytes: u64,
    /// Trailing `=` left dangling at a line break
    pending_escape: bool,
    /// Escape rule was violated somewhere in the region
    damaged: bool,
    /// Optional early-exit byte budget
    max_bytes: u64,
    /// Budget reached; swallow data lines until =yend
    skipping: bool,
    /// Declared part/total from =ybegin
    part: Option<u32>,
    total: Option<u32>,
    /// Expected CRCs from =yend are checked at emission
    expected_size: Option<u64>,
}

impl YencDecoder {
    /// A decoder writing decoded payloads beneath `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            state: State::Idle,
            content: None,
            hasher: crc32fast::Hasher::new(),
            decoded_bytes: 0,
            pending_escape: false,
            damaged: false,
            max_bytes: 0,
            skipping: false,
            part: None,
            total: None,
            expected_size: None,
        }
    }

    /// Stop decoding after `max_bytes` of output; the remainder of the
    /// region is consumed but discarded
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn begin(&mut self, line: &str) -> DecodeStep {
        let params = parse_params(&line["=ybegin".len()..]);

        self.hasher = crc32fast::Hasher::new();
        self.decoded_bytes = 0;
        self.pending_escape = false;
        self.damaged = false;
        self.skipping = false;
        self.expected_size = None;

        let name = params.get("name").cloned().unwrap_or_default();
        let mut content = Content::with_filename(&self.work_dir, name);
        if let Some(size) = params.get("size").and_then(|s| s.parse().ok()) {
            content.set_total_size(size);
        }
        self.part = params.get("part").and_then(|s| s.parse().ok());
        self.total = params.get("total").and_then(|s| s.parse().ok());
        if let Some(part) = self.part {
            let total = self.total.unwrap_or(part.max(1));
            if content.set_part(part, total.max(part)).is_err() {
                self.damaged = true;
            }
        }

        self.content = Some(content);
        self.state = State::Begun;
        DecodeStep::Continue
    }

    fn ypart(&mut self, line: &str) -> DecodeStep {
        let params = parse_params(&line["=ypart".len()..]);
        // =ypart offsets are 1-based inclusive on the wire
        let begin: Option<u64> = params.get("begin").and_then(|s| s.parse().ok());
        let end: Option<u64> = params.get("end").and_then(|s| s.parse().ok());
        if let (Some(content), Some(begin), Some(end)) = (self.content.as_mut(), begin, end) {
            if begin >= 1 && end >= begin && content.set_range(begin - 1, end).is_err() {
                self.damaged = true;
            }
        }
        self.state = State::Data;
        DecodeStep::Continue
    }

    fn end(&mut self, line: &str) -> DecodeStep {
        let params = parse_params(&line["=yend".len()..]);
        self.expected_size = params.get("size").and_then(|s| s.parse().ok());
        let crc32 = params
            .get("crc32")
            .and_then(|s| u32::from_str_radix(s, 16).ok());
        let pcrc32 = params
            .get("pcrc32")
            .and_then(|s| u32::from_str_radix(s, 16).ok());

        let Some(mut content) = self.content.take() else {
            self.state = State::Idle;
            return DecodeStep::Failed;
        };
        if content.close().is_err() {
            self.state = State::Idle;
            return DecodeStep::Failed;
        }

        let produced = std::mem::take(&mut self.hasher).finalize();
        let mut valid = !self.damaged;

        // multi-part trailers carry the part CRC in pcrc32; single-part in crc32
        let expected_crc = pcrc32.or(crc32);
        if !self.skipping {
            if let Some(expected) = expected_crc
                && expected != produced
            {
                warn!(
                    "yEnc CRC mismatch for {}: expected {:08x}, produced {:08x}",
                    content.filename(),
                    expected,
                    produced
                );
                valid = false;
            }
            if let Some(size) = self.expected_size
                && size != self.decoded_bytes
            {
                warn!(
                    "yEnc size mismatch for {}: declared {}, decoded {}",
                    content.filename(),
                    size,
                    self.decoded_bytes
                );
                valid = false;
            }
        }

        content.set_valid(valid);
        self.state = State::Idle;
        debug!(
            "yEnc region complete: {} ({} byte(s), valid={})",
            content.key(),
            self.decoded_bytes,
            valid
        );
        DecodeStep::Done(Decoded::Payload(content))
    }

    fn data_line(&mut self, line: &[u8]) -> DecodeStep {
        if self.skipping {
            return DecodeStep::Continue;
        }

        let mut decoded = Vec::with_capacity(line.len());
        let mut escape = self.pending_escape;
        self.pending_escape = false;

        for &byte in line {
            if byte == b'\r' {
                continue;
            }
            if escape {
                decoded.push(byte.wrapping_sub(64).wrapping_sub(42));
                escape = false;
            } else if byte == b'=' {
                escape = true;
            } else {
                decoded.push(byte.wrapping_sub(42));
            }
        }
        if escape {
            // a dangling escape at a line break is a framing violation;
            // resolve it against the next line but flag the region
            self.pending_escape = true;
            self.damaged = true;
        }

        self.hasher.update(&decoded);
        self.decoded_bytes += decoded.len() as u64;

        let Some(content) = self.content.as_mut() else {
            return DecodeStep::Failed;
        };
        if content.write(&decoded).is_err() {
            self.state = State::Idle;
            self.content = None;
            return DecodeStep::Failed;
        }

        if self.max_bytes > 0 && self.decoded_bytes >= self.max_bytes {
            debug!("yEnc early exit after {} byte(s)", self.decoded_bytes);
            self.skipping = true;
        }
        DecodeStep::Continue
    }
}

impl Decoder for YencDecoder {
    fn detect(&self, line: &[u8]) -> bool {
        line.starts_with(b"=ybegin ")
    }

    fn feed(&mut self, line: &[u8]) -> DecodeStep {
        if line.starts_with(b"=ybegin ") {
            let text = String::from_utf8_lossy(line).into_owned();
            return self.begin(&text);
        }
        if self.state == State::Begun && line.starts_with(b"=ypart ") {
            let text = String::from_utf8_lossy(line).into_owned();
            return self.ypart(&text);
        }
        if line.starts_with(b"=yend ") || line == b"=yend" {
            let text = String::from_utf8_lossy(line).into_owned();
            return self.end(&text);
        }

        match self.state {
            State::Idle => DecodeStep::Failed,
            State::Begun => {
                self.state = State::Data;
                self.data_line(line)
            }
            State::Data => self.data_line(line),
        }
    }

    fn finalize(&mut self) -> DecodeStep {
        // body ended without =yend: truncated region, emitted invalid
        match self.content.take() {
            Some(mut content) => {
                let _ = content.close();
                content.set_valid(false);
                self.state = State::Idle;
                warn!("truncated yEnc region for {}", content.filename());
                DecodeStep::Done(Decoded::Payload(content))
            }
            None => {
                self.state = State::Idle;
                DecodeStep::Skip
            }
        }
    }

    fn reset(&mut self) {
        let work_dir = std::mem::take(&mut self.work_dir);
        let max_bytes = self.max_bytes;
        *self = Self::new(work_dir).with_max_bytes(max_bytes);
    }
}

/// Encode a payload into yEnc text
///
/// `part_info` is `(part, total, begin, end, total_size)` with 1-based
/// inclusive wire offsets; when present an `=ypart` line is emitted and the
/// trailer carries `pcrc32`, otherwise `crc32`.
pub fn yenc_encode(
    data: &[u8],
    filename: &str,
    line_width: usize,
    part_info: Option<(u32, u32, u64, u64, u64)>,
) -> Result<Vec<u8>> {
    if line_width == 0 || line_width > 997 {
        return Err(Error::Content(format!(
            "invalid yEnc line width {}",
            line_width
        )));
    }

    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 256);
    match part_info {
        Some((part, total, _, _, total_size)) => {
            out.extend_from_slice(
                format!(
                    "=ybegin part={} total={} line={} size={} name={}\r\n",
                    part, total, line_width, total_size, filename
                )
                .as_bytes(),
            );
        }
        None => {
            out.extend_from_slice(
                format!(
                    "=ybegin line={} size={} name={}\r\n",
                    line_width,
                    data.len(),
                    filename
                )
                .as_bytes(),
            );
        }
    }
    if let Some((_, _, begin, end, _)) = part_info {
        out.extend_from_slice(format!("=ypart begin={} end={}\r\n", begin, end).as_bytes());
    }

    let mut column = 0usize;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        let critical = matches!(encoded, 0x00 | 0x0a | 0x0d | b'=')
            || (column == 0 && matches!(encoded, b'\t' | b' ' | b'.'));

        let width = if critical { 2 } else { 1 };
        if column + width > line_width {
            out.extend_from_slice(b"\r\n");
            column = 0;
        }
        // positional escapes depend on the final column
        let critical = matches!(encoded, 0x00 | 0x0a | 0x0d | b'=')
            || (column == 0 && matches!(encoded, b'\t' | b' ' | b'.'));
        if critical {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            column += 2;
        } else {
            out.push(encoded);
            column += 1;
        }
    }
    if column > 0 {
        out.extend_from_slice(b"\r\n");
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    let crc = hasher.finalize();
    if part_info.is_some() {
        out.extend_from_slice(format!("=yend size={} pcrc32={:08x}\r\n", data.len(), crc).as_bytes());
    } else {
        out.extend_from_slice(format!("=yend size={} crc32={:08x}\r\n", data.len(), crc).as_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn decode_text(work_dir: &std::path::Path, text: &[u8]) -> Option<Content> {
        let mut decoder = YencDecoder::new(work_dir);
        let mut out = None;
        for line in text.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let DecodeStep::Done(Decoded::Payload(content)) = decoder.feed(line) {
                out = Some(content);
            }
        }
        out
    }

    #[test]
    fn test_roundtrip_full_byte_range() {
        let dir = tempdir().unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        let encoded = yenc_encode(&payload, "all-bytes.bin", YENC_LINE_WIDTH, None).unwrap();
        let mut content = decode_text(dir.path(), &encoded).unwrap();

        assert!(content.is_valid());
        assert_eq!(content.filename(), "all-bytes.bin");
        assert_eq!(content.len().unwrap(), 4096);
        content.rewind().unwrap();
        assert_eq!(content.read(8192).unwrap(), payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        assert_eq!(content.crc32().unwrap(), hasher.finalize());
    }

    #[test]
    fn test_multipart_attributes() {
        let dir = tempdir().unwrap();
        let payload = vec![0xd6u8; 1000];
        let encoded =
            yenc_encode(&payload, "file.rar", 128, Some((2, 3, 1001, 2000, 3000))).unwrap();
        let content = decode_text(dir.path(), &encoded).unwrap();

        assert!(content.is_valid());
        assert_eq!(content.part(), 2);
        assert_eq!(content.total_parts(), 3);
        assert_eq!(content.range(), (Some(1000), Some(2000)));
        assert_eq!(content.total_size(), Some(3000));
    }

    #[test]
    fn test_crc_mismatch_still_emitted_invalid() {
        let dir = tempdir().unwrap();
        let text = b"=ybegin line=128 size=4 name=bad.bin\r\n\
                     \x8f\x96\x96\x99\r\n\
                     =yend size=4 crc32=deadbeef\r\n";
        let content = decode_text(dir.path(), text).unwrap();
        assert!(!content.is_valid());
        assert_eq!(content.filename(), "bad.bin");
    }

    #[test]
    fn test_size_mismatch_invalidates() {
        let dir = tempdir().unwrap();
        let text = b"=ybegin line=128 size=9 name=short.bin\r\n\
                     \x8f\x96\x96\x99\r\n\
                     =yend size=9\r\n";
        let content = decode_text(dir.path(), text).unwrap();
        assert!(!content.is_valid());
    }

    #[test]
    fn test_truncated_region_finalizes_invalid() {
        let dir = tempdir().unwrap();
        let mut decoder = YencDecoder::new(dir.path());
        assert!(matches!(
            decoder.feed(b"=ybegin line=128 size=100 name=cut.bin"),
            DecodeStep::Continue
        ));
        assert!(matches!(decoder.feed(b"\x8f\x96\x96"), DecodeStep::Continue));
        match decoder.finalize() {
            DecodeStep::Done(Decoded::Payload(content)) => assert!(!content.is_valid()),
            other => panic!("expected truncated payload, got {:?}", other),
        }
    }

    #[test]
    fn test_max_bytes_early_exit() {
        let dir = tempdir().unwrap();
        let payload = vec![0x41u8; 4096];
        let encoded = yenc_encode(&payload, "big.bin", 128, None).unwrap();

        let mut decoder = YencDecoder::new(dir.path()).with_max_bytes(256);
        let mut out = None;
        for line in encoded.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            if let DecodeStep::Done(Decoded::Payload(content)) = decoder.feed(line) {
                out = Some(content);
            }
        }
        let mut content = out.unwrap();
        let len = content.len().unwrap();
        assert!(len >= 256, "decoder stops only at a line boundary");
        assert!(len < 4096);
    }

    #[test]
    fn test_name_with_spaces() {
        let params = parse_params(" part=1 line=128 size=5 name=my file (1).bin");
        assert_eq!(params.get("name").map(String::as_str), Some("my file (1).bin"));
        assert_eq!(params.get("part").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_encoded_lines_respect_width() {
        let payload = vec![0x00u8; 1024];
        let encoded = yenc_encode(&payload, "zeros.bin", 64, None).unwrap();
        for line in encoded.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            assert!(line.len() <= 66, "line width exceeded: {}", line.len());
        }
    }

    #[test]
    fn test_detect_only_ybegin() {
        let dir = tempdir().unwrap();
        let decoder = YencDecoder::new(dir.path());
        assert!(decoder.detect(b"=ybegin line=128 size=1 name=x"));
        assert!(!decoder.detect(b"=ypart begin=1 end=2"));
        assert!(!decoder.detect(b"plain body"));
    }
}
