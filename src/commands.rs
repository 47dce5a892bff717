//! NNTP command builders and status-line parsers

use crate::error::{Error, Result};
use crate::response::Response;

/// Build AUTHINFO USER command
pub fn authinfo_user(username: &str) -> String {
    format!("AUTHINFO USER {}\r\n", username)
}

/// Build AUTHINFO PASS command
pub fn authinfo_pass(password: &str) -> String {
    format!("AUTHINFO PASS {}\r\n", password)
}

/// Build XFEATURE COMPRESS GZIP command
///
/// Legacy compression extension. Multiline bodies after a successful
/// negotiation arrive as a zlib stream when the status line advertises
/// COMPRESS=GZIP.
pub fn xfeature_compress_gzip() -> &'static str {
    "XFEATURE COMPRESS GZIP\r\n"
}

/// Build GROUP command
pub fn group(name: &str) -> String {
    format!("GROUP {}\r\n", name)
}

/// Build LIST ACTIVE command
pub fn list_active() -> &'static str {
    "LIST ACTIVE\r\n"
}

/// Build XOVER command for an article-number range
pub fn xover(start: u64, end: u64) -> String {
    format!("XOVER {}-{}\r\n", start, end)
}

/// Build STAT command for a Message-ID
pub fn stat(id: &str) -> String {
    format!("STAT <{}>\r\n", id.trim_matches(['<', '>']))
}

/// Build HEAD command for a Message-ID
pub fn head(id: &str) -> String {
    format!("HEAD <{}>\r\n", id.trim_matches(['<', '>']))
}

/// Build ARTICLE command for a Message-ID
pub fn article(id: &str) -> String {
    format!("ARTICLE <{}>\r\n", id.trim_matches(['<', '>']))
}

/// Build BODY command for a Message-ID
pub fn body(id: &str) -> String {
    format!("BODY <{}>\r\n", id.trim_matches(['<', '>']))
}

/// Build POST command
pub fn post() -> &'static str {
    "POST\r\n"
}

/// Build QUIT command
pub fn quit() -> &'static str {
    "QUIT\r\n"
}

/// Parse an `NNN text` status line into code and message
pub fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let line = line.trim_end();
    if line.len() < 3 {
        return Err(Error::BadResponse(line.to_string()));
    }
    let (code_str, rest) = line.split_at(3);
    let code: u16 = code_str
        .parse()
        .map_err(|_| Error::BadResponse(line.to_string()))?;
    if !(100..=599).contains(&code) {
        return Err(Error::BadResponse(line.to_string()));
    }
    Ok((code, rest.trim_start().to_string()))
}

/// Parsed `211 count low high name` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    /// Estimated article count
    pub count: u64,
    /// Low water mark
    pub low: u64,
    /// High water mark
    pub high: u64,
    /// Group name echoed by the server
    pub name: String,
}

/// Parse a GROUP response status message
pub fn parse_group_response(response: &Response) -> Result<GroupSummary> {
    if !response.is_success() {
        return Err(Error::Protocol {
            code: response.code,
            message: response.message.clone(),
        });
    }

    let parts: Vec<&str> = response.message.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(Error::BadResponse(response.message.clone()));
    }

    let count = parts[0]
        .parse()
        .map_err(|_| Error::BadResponse(response.message.clone()))?;
    let low = parts[1]
        .parse()
        .map_err(|_| Error::BadResponse(response.message.clone()))?;
    let high = parts[2]
        .parse()
        .map_err(|_| Error::BadResponse(response.message.clone()))?;

    Ok(GroupSummary {
        count,
        low,
        high,
        name: parts[3].to_string(),
    })
}

/// Normalize a Message-ID to its bracketed wire form
pub fn wire_message_id(id: &str) -> String {
    format!("<{}>", id.trim_matches(['<', '>']))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_terminate_with_crlf() {
        assert_eq!(group("alt.test"), "GROUP alt.test\r\n");
        assert_eq!(xover(100, 200), "XOVER 100-200\r\n");
        assert_eq!(stat("abc@host"), "STAT <abc@host>\r\n");
        assert_eq!(stat("<abc@host>"), "STAT <abc@host>\r\n");
        assert_eq!(quit(), "QUIT\r\n");
    }

    #[test]
    fn test_parse_status_line() {
        let (code, message) = parse_status_line("200 news.example.com ready\r\n").unwrap();
        assert_eq!(code, 200);
        assert_eq!(message, "news.example.com ready");
    }

    #[test]
    fn test_parse_status_line_bare_code() {
        let (code, message) = parse_status_line("205").unwrap();
        assert_eq!(code, 205);
        assert_eq!(message, "");
    }

    #[test]
    fn test_parse_status_line_garbage() {
        assert!(parse_status_line("ready when you are").is_err());
        assert!(parse_status_line("99").is_err());
        assert!(parse_status_line("999 out of range").is_err());
    }

    #[test]
    fn test_parse_group_response() {
        // a very large binaries group
        let response = Response::status(
            211,
            "709278590 69039573 778318162 alt.binaries.l2g.znb",
        );
        let summary = parse_group_response(&response).unwrap();
        assert_eq!(summary.count, 709278590);
        assert_eq!(summary.low, 69039573);
        assert_eq!(summary.high, 778318162);
        assert_eq!(summary.name, "alt.binaries.l2g.znb");
    }

    #[test]
    fn test_parse_group_response_failure_code() {
        let response = Response::status(411, "no such group");
        assert!(parse_group_response(&response).is_err());
    }

    #[test]
    fn test_parse_group_response_short_payload() {
        let response = Response::status(211, "3 1");
        assert!(parse_group_response(&response).is_err());
    }

    #[test]
    fn test_wire_message_id() {
        assert_eq!(wire_message_id("a@b"), "<a@b>");
        assert_eq!(wire_message_id("<a@b>"), "<a@b>");
    }
}
