//! Low-level response I/O for the protocol engine
//!
//! Single-line status reads, multi-line bodies fed through the decoder
//! chain, and the zlib-compressed body path negotiated via XFEATURE.
//! The receive loop never panics past its caller: terminal conditions are
//! encoded as response codes and validity flags.

use super::NntpConnection;
use crate::codec::{ChainOutput, Decoded, DecoderChain};
use crate::commands;
use crate::error::{Error, Result};
use crate::response::Response;
use crate::socket;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;
use tracing::{trace, warn};

/// Timeout for a single status line
const SINGLE_LINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for a complete multi-line body
const MULTILINE_TIMEOUT: Duration = Duration::from_secs(180);

/// Ceiling for one compressed body
const MAX_COMPRESSED_BODY: usize = 64 * 1024 * 1024;

/// Chunk size for compressed body reads
const COMPRESSED_CHUNK: usize = 256 * 1024;

/// Grace period before treating a stalled trickle as final
///
/// Some providers drip the last bytes of a body after a pause; when the
/// buffer does not yet end at the terminator, one more readable byte
/// within this window keeps the read alive.
const TRICKLE_WAIT: Duration = Duration::from_secs(1);

/// Strip NNTP dot-stuffing (leading ".." becomes ".")
fn unstuff(line: &[u8]) -> &[u8] {
    if line.starts_with(b"..") {
        &line[1..]
    } else {
        line
    }
}

impl NntpConnection {
    /// Send one command line
    pub(crate) async fn send_command(&mut self, command: &str) -> Result<()> {
        trace!("sending: {}", command.trim_end());
        self.send_bytes(command.as_bytes()).await
    }

    /// Send raw bytes (serialized article bodies are 8-bit)
    pub(crate) async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(Error::ConnectionLost)?
            .get_mut();
        socket::send(stream, data).await?;
        Ok(())
    }

    /// Read one raw line, without the trailing CRLF
    async fn read_line(&mut self, budget: Duration) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionLost)?;

        let mut line = Vec::with_capacity(512);
        let read = timeout(budget, stream.read_until(b'\n', &mut line)).await;
        match read {
            Err(_) => Err(Error::Timeout),
            Ok(Err(e)) => {
                self.drop_stream();
                Err(Error::Io(e))
            }
            Ok(Ok(0)) => {
                self.drop_stream();
                Err(Error::ConnectionLost)
            }
            Ok(Ok(_)) => {
                while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(line)
            }
        }
    }

    /// Read and record a status line
    pub(crate) async fn read_status(&mut self) -> Result<Response> {
        let line = self.read_line(SINGLE_LINE_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&line);
        trace!("received: {}", text);

        let (code, message) = commands::parse_status_line(&text)?;
        self.last_code = code;
        self.last_message = message.clone();
        Ok(Response::status(code, message))
    }

    /// Read a multi-line body into `response`, feeding `chain`
    ///
    /// Payloads and header blocks land on the response; overview and group
    /// list values are returned for the caller. Error-coded responses carry
    /// no body and return immediately.
    pub(crate) async fn read_multiline(
        &mut self,
        response: &mut Response,
        chain: &mut DecoderChain,
    ) -> Result<Vec<Decoded>> {
        if response.is_error() {
            return Ok(Vec::new());
        }

        let compressed = self.gzip && response.message.contains("COMPRESS=GZIP");
        let mut extras = Vec::new();

        if compressed {
            let raw = timeout(MULTILINE_TIMEOUT, self.read_compressed_body())
                .await
                .map_err(|_| Error::Timeout)??;
            let body = decompress(&raw)?;
            trace!("decompressed {} -> {} byte(s)", raw.len(), body.len());

            for line in body.split(|&b| b == b'\n') {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line == b"." {
                    break;
                }
                let line = unstuff(line);
                route(chain.feed(line), line, response, &mut extras);
            }
        } else {
            let started = tokio::time::Instant::now();
            loop {
                let remaining = MULTILINE_TIMEOUT
                    .checked_sub(started.elapsed())
                    .ok_or(Error::Timeout)?;
                let line = self.read_line(remaining).await?;
                if line == b"." {
                    break;
                }
                let line = unstuff(&line);
                route(chain.feed(line), line, response, &mut extras);
            }
        }

        if let Some(value) = chain.finish() {
            route(ChainOutput::Produced(value), b"", response, &mut extras);
        }
        Ok(extras)
    }

    /// Collect a compressed body up to its uncompressed `.` terminator
    ///
    /// Reads chunks until the terminator; a stall mid-body is tolerated as
    /// long as more bytes arrive within the trickle window, bounded overall
    /// by the caller's timeout.
    async fn read_compressed_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(COMPRESSED_CHUNK);
        let mut chunk = vec![0u8; COMPRESSED_CHUNK];

        loop {
            let stream = self.stream.as_mut().ok_or(Error::ConnectionLost)?;
            let read = timeout(TRICKLE_WAIT, stream.read(&mut chunk)).await;
            let n = match read {
                // stalled; the terminator is not there yet, keep listening
                Err(_) => continue,
                Ok(Err(e)) => {
                    self.drop_stream();
                    return Err(Error::Io(e));
                }
                Ok(Ok(0)) => {
                    self.drop_stream();
                    return Err(Error::ConnectionLost);
                }
                Ok(Ok(n)) => n,
            };

            body.extend_from_slice(&chunk[..n]);
            if body.len() > MAX_COMPRESSED_BODY {
                return Err(Error::FetchError(format!(
                    "compressed body exceeds {} byte(s)",
                    MAX_COMPRESSED_BODY
                )));
            }

            if body.ends_with(b".\r\n") {
                body.truncate(body.len() - 3);
                return Ok(body);
            }
            if body.ends_with(b".\n") {
                body.truncate(body.len() - 2);
                return Ok(body);
            }
        }
    }
}

/// Route a chain outcome onto the response or the extras list
///
/// Lines no decoder claimed are appended verbatim to the response body.
fn route(output: ChainOutput, line: &[u8], response: &mut Response, extras: &mut Vec<Decoded>) {
    match output {
        ChainOutput::Produced(Decoded::Payload(content)) => response.contents.push(content),
        ChainOutput::Produced(Decoded::Headers(header)) => response.headers = Some(header),
        ChainOutput::Produced(value) => extras.push(value),
        ChainOutput::Consumed => {}
        ChainOutput::Unclaimed => response
            .body
            .push(String::from_utf8_lossy(line).into_owned()),
    }
}

/// Inflate an XFEATURE body; the extension says GZIP but servers emit zlib
fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 3);
    match decoder.read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(e) => {
            warn!("zlib decompression failed: {}", e);
            Err(Error::FetchError(format!("zlib decompression failed: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unstuff() {
        assert_eq!(unstuff(b"..dotted"), b".dotted");
        assert_eq!(unstuff(b"plain"), b"plain");
        assert_eq!(unstuff(b"."), b".");
        assert_eq!(unstuff(b"..."), b"..");
    }

    #[test]
    fn test_decompress_roundtrip() {
        use flate2::Compression;
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let payload = b"224 overview data\r\nmore overview data\r\n";
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_decompress_garbage_is_fetch_error() {
        let result = decompress(b"definitely not zlib");
        assert!(matches!(result, Err(Error::FetchError(_))));
    }

    #[test]
    fn test_timeout_ordering() {
        assert!(MULTILINE_TIMEOUT > SINGLE_LINE_TIMEOUT);
        assert!(TRICKLE_WAIT < SINGLE_LINE_TIMEOUT);
    }
}
