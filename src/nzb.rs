//! NZB manifest parsing and emission
//!
//! An NZB describes a complete upload as an ordered sequence of segmented
//! posts, each carrying per-segment Message-IDs and expected sizes.
//!
//! Reference: <https://sabnzbd.org/wiki/extra/nzb-spec>

use crate::article::Article;
use crate::error::{Error, Result};
use crate::segment::SegmentedPost;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pull the quoted file name out of a subject line, the usual convention
/// for binary posts
fn filename_from_subject(subject: &str) -> Option<String> {
    let start = subject.find('"')?;
    let rest = &subject[start + 1..];
    let end = rest.find('"')?;
    let name = rest[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// An ordered set of segmented posts describing one upload
#[derive(Debug, Default)]
pub struct Nzb {
    files: Vec<SegmentedPost>,
    work_dir: PathBuf,
}

impl Nzb {
    /// Wrap already-built posts into a manifest
    pub fn from_posts(files: Vec<SegmentedPost>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            files,
            work_dir: work_dir.into(),
        }
    }

    /// Parse a manifest from XML text
    pub fn parse(xml: &str, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut files: Vec<SegmentedPost> = Vec::new();
        let mut current: Option<SegmentedPost> = None;
        let mut in_group = false;
        let mut segment_attrs: Option<(u64, u32)> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name().as_ref() {
                    b"file" => {
                        let mut post = SegmentedPost::new("", &work_dir);
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .unescape_value()
                                .map_err(|e| Error::Nzb(e.to_string()))?
                                .to_string();
                            match attr.key.as_ref() {
                                b"poster" => post.poster = value,
                                b"date" => post.date = value.parse().unwrap_or(0),
                                b"subject" => post.subject = value,
                                _ => {}
                            }
                        }
                        post.filename = filename_from_subject(&post.subject)
                            .unwrap_or_else(|| post.subject.clone());
                        post.sort_no = files.len() as u32 + 1;
                        current = Some(post);
                    }
                    b"group" => in_group = true,
                    b"segment" => {
                        let mut bytes = 0u64;
                        let mut number = 0u32;
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value).to_string();
                            match attr.key.as_ref() {
                                b"bytes" => bytes = value.parse().unwrap_or(0),
                                b"number" => number = value.parse().unwrap_or(0),
                                _ => {}
                            }
                        }
                        segment_attrs = Some((bytes, number));
                    }
                    _ => {}
                },
                Ok(Event::Text(ref t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Nzb(e.to_string()))?
                        .to_string();
                    if in_group {
                        if let Some(post) = current.as_mut() {
                            post.add_group(text);
                        }
                    } else if let Some((bytes, number)) = segment_attrs.take()
                        && let Some(post) = current.as_mut()
                    {
                        let mut article = Article::with_id(text);
                        article.expected_size = Some(bytes);
                        article.sequence_no = number;
                        post.total_size += bytes;
                        // add() renumbers; restore the manifest's numbering
                        let declared = number;
                        post.add(article);
                        if let Some(last) = post.articles_mut().last_mut() {
                            last.sequence_no = declared;
                        }
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"file" => {
                        if let Some(mut post) = current.take() {
                            post.articles_mut().sort_by_key(|a| a.sequence_no);
                            files.push(post);
                        }
                    }
                    b"group" => in_group = false,
                    b"segment" => segment_attrs = None,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(Error::Nzb(format!("XML parse error: {}", e))),
                _ => {}
            }
            buf.clear();
        }

        if files.is_empty() {
            return Err(Error::Nzb("manifest holds no files".to_string()));
        }
        debug!("parsed manifest: {} file(s)", files.len());
        Ok(Self { files, work_dir })
    }

    /// Read and parse a manifest file
    pub fn load(path: impl AsRef<Path>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let xml = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&xml, work_dir)
    }

    /// The manifest's posts, in order
    pub fn files(&self) -> &[SegmentedPost] {
        &self.files
    }

    /// Mutable access to the manifest's posts
    pub fn files_mut(&mut self) -> &mut [SegmentedPost] {
        &mut self.files
    }

    /// Take ownership of the posts
    pub fn into_files(self) -> Vec<SegmentedPost> {
        self.files
    }

    /// Total number of segments across all files
    pub fn segcount(&self) -> usize {
        self.files.iter().map(SegmentedPost::segcount).sum()
    }

    /// Total declared bytes across all files
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.total_size).sum()
    }

    /// Whether every file carries a gap-free 1..N segment sequence
    pub fn is_valid(&self) -> bool {
        if self.files.is_empty() {
            return false;
        }
        for file in &self.files {
            if file.segcount() == 0 {
                return false;
            }
            let mut seen = HashSet::new();
            let mut max = 0u32;
            for article in file.articles() {
                let n = article.sequence_no;
                if n == 0 || !seen.insert(n) {
                    return false;
                }
                max = max.max(n);
            }
            if max as usize != file.segcount() {
                return false;
            }
        }
        true
    }

    /// Render the canonical XML form
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        let io_map = |e: std::io::Error| Error::Nzb(e.to_string());

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(io_map)?;

        let mut root = BytesStart::new("nzb");
        root.push_attribute(("xmlns", "http://www.newzbin.com/DTD/2003/nzb"));
        writer.write_event(Event::Start(root)).map_err(io_map)?;

        for file in &self.files {
            let mut file_elem = BytesStart::new("file");
            file_elem.push_attribute(("poster", file.poster.as_str()));
            file_elem.push_attribute(("date", file.date.to_string().as_str()));
            file_elem.push_attribute(("subject", file.subject.as_str()));
            writer.write_event(Event::Start(file_elem)).map_err(io_map)?;

            // groups: the unique set this file was posted to
            writer
                .write_event(Event::Start(BytesStart::new("groups")))
                .map_err(io_map)?;
            let mut emitted = HashSet::new();
            let mut groups: Vec<&String> = file.groups().iter().collect();
            if groups.is_empty() {
                // fall back to the union of per-article groups
                for article in file.articles() {
                    groups.extend(article.groups().iter());
                }
            }
            for group in groups {
                if emitted.insert(group.clone()) {
                    writer
                        .write_event(Event::Start(BytesStart::new("group")))
                        .map_err(io_map)?;
                    writer
                        .write_event(Event::Text(BytesText::new(group)))
                        .map_err(io_map)?;
                    writer
                        .write_event(Event::End(BytesEnd::new("group")))
                        .map_err(io_map)?;
                }
            }
            writer
                .write_event(Event::End(BytesEnd::new("groups")))
                .map_err(io_map)?;

            writer
                .write_event(Event::Start(BytesStart::new("segments")))
                .map_err(io_map)?;
            for article in file.articles() {
                let mut seg = BytesStart::new("segment");
                let bytes = article.expected_size.unwrap_or(0);
                seg.push_attribute(("bytes", bytes.to_string().as_str()));
                seg.push_attribute(("number", article.sequence_no.to_string().as_str()));
                writer.write_event(Event::Start(seg)).map_err(io_map)?;
                writer
                    .write_event(Event::Text(BytesText::new(article.id().unwrap_or(""))))
                    .map_err(io_map)?;
                writer
                    .write_event(Event::End(BytesEnd::new("segment")))
                    .map_err(io_map)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("segments")))
                .map_err(io_map)?;

            writer
                .write_event(Event::End(BytesEnd::new("file")))
                .map_err(io_map)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("nzb")))
            .map_err(io_map)?;

        let body = writer.into_inner().into_inner();
        String::from_utf8(body).map_err(|e| Error::Nzb(e.to_string()))
    }

    /// Write the canonical XML form to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let xml = self.to_xml()?;
        std::fs::write(path.as_ref(), xml)?;
        debug!("manifest saved to {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const NO_SEGMENTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="poster &lt;p@example.com&gt;" date="1407746387" subject="x">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
    </segments>
  </file>
</nzb>"#;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="poster <p@example.com>" date="1407746387" subject="A Package [1/2] - &quot;vol1.rar&quot; yEnc (1/2)">
    <groups>
      <group>alt.binaries.test</group>
      <group>alt.binaries.other</group>
    </groups>
    <segments>
      <segment bytes="768000" number="1">part1@example.com</segment>
      <segment bytes="120000" number="2">part2@example.com</segment>
    </segments>
  </file>
</nzb>"#;

    #[test]
    fn test_parse_manifest() {
        let dir = tempdir().unwrap();
        let nzb = Nzb::parse(MANIFEST, dir.path()).unwrap();
        assert_eq!(nzb.files().len(), 1);

        let file = &nzb.files()[0];
        assert_eq!(file.filename, "vol1.rar");
        assert_eq!(file.date, 1407746387);
        assert_eq!(file.total_size, 888000);
        assert_eq!(file.groups().len(), 2);
        assert_eq!(file.segcount(), 2);

        let article = &file.articles()[0];
        assert_eq!(article.id(), Some("part1@example.com"));
        assert_eq!(article.expected_size, Some(768000));
        assert_eq!(article.sequence_no, 1);
    }

    #[test]
    fn test_no_files_rejected_no_segments_invalid() {
        let dir = tempdir().unwrap();
        assert!(Nzb::parse("<nzb></nzb>", dir.path()).is_err());

        // a file with no segments parses but fails the validity check
        let nzb = Nzb::parse(NO_SEGMENTS, dir.path()).unwrap();
        assert!(!nzb.is_valid());
    }

    #[test]
    fn test_validity_checks_sequence() {
        let dir = tempdir().unwrap();
        let mut nzb = Nzb::parse(MANIFEST, dir.path()).unwrap();
        assert!(nzb.is_valid());

        // break the numbering
        nzb.files_mut()[0].articles_mut()[1].sequence_no = 5;
        assert!(!nzb.is_valid());
    }

    #[test]
    fn test_roundtrip_save_parse() {
        let dir = tempdir().unwrap();
        let nzb = Nzb::parse(MANIFEST, dir.path()).unwrap();

        let path = dir.path().join("out.nzb");
        nzb.save(&path).unwrap();

        let reparsed = Nzb::load(&path, dir.path()).unwrap();
        assert_eq!(reparsed.files().len(), 1);
        assert_eq!(reparsed.files()[0].filename, "vol1.rar");
        assert_eq!(reparsed.segcount(), 2);
        assert_eq!(reparsed.total_bytes(), 888000);
        assert_eq!(
            reparsed.files()[0].articles()[1].id(),
            Some("part2@example.com")
        );
    }

    #[test]
    fn test_filename_from_subject() {
        assert_eq!(
            filename_from_subject("A Package [1/2] - \"vol1.rar\" yEnc (1/2)"),
            Some("vol1.rar".to_string())
        );
        assert_eq!(filename_from_subject("no quotes here"), None);
        assert_eq!(filename_from_subject("empty \"\" quotes"), None);
    }

    #[test]
    fn test_segcount_spans_files() {
        let dir = tempdir().unwrap();
        let mut posts = Vec::new();
        for i in 0..3 {
            let mut post = SegmentedPost::new(format!("f{}.bin", i), dir.path());
            let mut article = Article::with_id(format!("seg{}@example.com", i));
            article.expected_size = Some(100);
            post.add(article);
            posts.push(post);
        }
        let nzb = Nzb::from_posts(posts, dir.path());
        assert_eq!(nzb.segcount(), 3);
        assert!(nzb.is_valid());
    }
}
