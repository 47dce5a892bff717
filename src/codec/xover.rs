//! Overview (XOVER) response decoder
//!
//! Parses tab-separated overview lines into records and offers the sort
//! policies the date-seek logic relies on.

use super::{DecodeStep, Decoded, Decoder};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

/// How overview records are keyed for ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XoverSort {
    /// Poster, then posting time
    ByPosterTime,
    /// Posting time
    #[default]
    ByTime,
    /// Article number
    ByArticleNo,
}

/// One overview record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverviewEntry {
    /// Article number within the group
    pub article_no: u64,
    /// Subject line
    pub subject: String,
    /// From line
    pub poster: String,
    /// Posting date normalized to UTC
    pub date: DateTime<Utc>,
    /// Message-ID with angle brackets stripped
    pub message_id: String,
    /// Payload size in bytes
    pub size: u64,
    /// Line count
    pub lines: u64,
    /// Cross-post map: group name to article number in that group
    pub xref: Vec<(String, u64)>,
}

impl OverviewEntry {
    /// Ordering key under the given sort policy
    ///
    /// Time-based keys render as `YYYYmmddHHMMSS:<article-no>` so a bare
    /// date prefix compares correctly against them.
    pub fn sort_key(&self, sort: XoverSort) -> String {
        match sort {
            XoverSort::ByTime => format!(
                "{}:{:010}",
                self.date.format("%Y%m%d%H%M%S"),
                self.article_no
            ),
            XoverSort::ByPosterTime => format!(
                "{}:{}:{:010}",
                self.poster,
                self.date.format("%Y%m%d%H%M%S"),
                self.article_no
            ),
            XoverSort::ByArticleNo => format!("{:010}", self.article_no),
        }
    }
}

/// Render a reference date as a key comparable with [`OverviewEntry::sort_key`]
pub fn date_key(date: &DateTime<Utc>) -> String {
    format!("{}:0000000000", date.format("%Y%m%d%H%M%S"))
}

/// Parse an overview date field to UTC
///
/// Servers emit RFC 2822 dates with assorted deviations; a few fallback
/// formats cover the common offenders.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc2822(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    // "11 Aug 2014 08:33:07 GMT" (no weekday) and numeric-offset variants
    for format in ["%d %b %Y %H:%M:%S %z", "%a, %d %b %Y %H:%M:%S %z"] {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    let trimmed = text
        .trim_end_matches("GMT")
        .trim_end_matches("UTC")
        .trim_end();
    for format in ["%d %b %Y %H:%M:%S", "%a, %d %b %Y %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed.and_utc());
        }
    }
    None
}

/// Parse one tab-separated overview line
pub fn parse_overview_line(line: &str) -> Option<OverviewEntry> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 8 {
        return None;
    }

    let article_no: u64 = fields[0].trim().parse().ok()?;
    let date = parse_date(fields[3])?;

    let mut xref = Vec::new();
    if let Some(raw) = fields.get(8) {
        let raw = raw
            .trim()
            .strip_prefix("Xref:")
            .unwrap_or(raw)
            .trim();
        // first token is the reporting server
        for token in raw.split_whitespace().skip(1) {
            if let Some((group, no)) = token.rsplit_once(':')
                && let Ok(no) = no.parse()
            {
                xref.push((group.to_lowercase(), no));
            }
        }
    }

    Some(OverviewEntry {
        article_no,
        subject: fields[1].trim().to_string(),
        poster: fields[2].trim().to_string(),
        date,
        message_id: fields[4].trim().trim_matches(['<', '>']).to_string(),
        size: fields[6].trim().parse().unwrap_or(0),
        lines: fields[7].trim().parse().unwrap_or(0),
        xref,
    })
}

/// Incremental overview decoder; emits all records when the body ends
#[derive(Debug, Default)]
pub struct XoverDecoder {
    entries: Vec<OverviewEntry>,
    engaged: bool,
}

impl XoverDecoder {
    /// A fresh decoder
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for XoverDecoder {
    fn detect(&self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        let mut fields = text.split('\t');
        matches!(fields.next(), Some(first) if first.trim().parse::<u64>().is_ok())
            && fields.count() >= 7
    }

    fn feed(&mut self, line: &[u8]) -> DecodeStep {
        self.engaged = true;
        let text = String::from_utf8_lossy(line);
        match parse_overview_line(&text) {
            Some(entry) => self.entries.push(entry),
            None => warn!("unparsable overview line skipped"),
        }
        DecodeStep::Continue
    }

    fn finalize(&mut self) -> DecodeStep {
        if !self.engaged {
            return DecodeStep::Skip;
        }
        self.engaged = false;
        DecodeStep::Done(Decoded::Overview(std::mem::take(&mut self.entries)))
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.engaged = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = "100\tA Package [001/001] - \"file.rar\" yEnc (001/001)\t\
        poster <poster@example.com>\tMon, 11 Aug 2014 08:33:07 GMT\t\
        <pkg001@example.com>\t\t1061463\t8160\t\
        Xref: news.example.com alt.binaries.test:100 alt.binaries.other:4512";

    #[test]
    fn test_parse_overview_line() {
        let entry = parse_overview_line(SAMPLE).unwrap();
        assert_eq!(entry.article_no, 100);
        assert_eq!(
            entry.subject,
            "A Package [001/001] - \"file.rar\" yEnc (001/001)"
        );
        assert_eq!(entry.size, 1061463);
        assert_eq!(entry.lines, 8160);
        assert_eq!(entry.message_id, "pkg001@example.com");
        assert_eq!(
            entry.date,
            Utc.with_ymd_and_hms(2014, 8, 11, 8, 33, 7).unwrap()
        );
        assert_eq!(
            entry.xref,
            vec![
                ("alt.binaries.test".to_string(), 100),
                ("alt.binaries.other".to_string(), 4512)
            ]
        );
    }

    #[test]
    fn test_parse_date_variants() {
        let expected = Utc.with_ymd_and_hms(2014, 8, 11, 8, 33, 7).unwrap();
        assert_eq!(parse_date("Mon, 11 Aug 2014 08:33:07 GMT").unwrap(), expected);
        assert_eq!(parse_date("Mon, 11 Aug 2014 08:33:07 +0000").unwrap(), expected);
        assert_eq!(parse_date("11 Aug 2014 08:33:07 GMT").unwrap(), expected);
        assert_eq!(
            parse_date("Mon, 11 Aug 2014 10:33:07 +0200").unwrap(),
            expected
        );
        assert!(parse_date("yesterday-ish").is_none());
    }

    #[test]
    fn test_sort_keys() {
        let entry = parse_overview_line(SAMPLE).unwrap();
        assert_eq!(entry.sort_key(XoverSort::ByTime), "20140811083307:0000000100");
        assert!(entry
            .sort_key(XoverSort::ByPosterTime)
            .starts_with("poster <poster@example.com>:20140811083307"));
        assert_eq!(entry.sort_key(XoverSort::ByArticleNo), "0000000100");
    }

    #[test]
    fn test_date_key_compares_with_sort_key() {
        let entry = parse_overview_line(SAMPLE).unwrap();
        let before = Utc.with_ymd_and_hms(2014, 8, 11, 8, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2014, 8, 11, 9, 0, 0).unwrap();
        assert!(date_key(&before) < entry.sort_key(XoverSort::ByTime));
        assert!(date_key(&after) > entry.sort_key(XoverSort::ByTime));
    }

    #[test]
    fn test_decoder_accumulates_until_finalize() {
        let mut decoder = XoverDecoder::new();
        assert!(decoder.detect(SAMPLE.as_bytes()));
        assert!(matches!(decoder.feed(SAMPLE.as_bytes()), DecodeStep::Continue));
        match decoder.finalize() {
            DecodeStep::Done(Decoded::Overview(entries)) => assert_eq!(entries.len(), 1),
            other => panic!("expected overview, got {:?}", other),
        }
        // drained; a second finalize has nothing
        assert!(matches!(decoder.finalize(), DecodeStep::Skip));
    }

    #[test]
    fn test_detect_rejects_non_overview() {
        let decoder = XoverDecoder::new();
        assert!(!decoder.detect(b"Subject: hello"));
        assert!(!decoder.detect(b"plain text"));
        assert!(!decoder.detect(b"100\tonly\ttwo"));
    }
}
