//! Segmented posts: one file in transit as N articles

use crate::article::Article;
use crate::codec::yenc_encode;
use crate::content::Content;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Substitute `{filename}`, `{part}`, and `{total}` tokens in a template
fn fill_template(template: &str, filename: &str, part: u32, total: u32) -> String {
    template
        .replace("{filename}", filename)
        .replace("{part}", &format!("{:03}", part))
        .replace("{total}", &format!("{:03}", total))
}

/// A file split across N articles (parts 1..N)
#[derive(Debug, Default)]
pub struct SegmentedPost {
    /// File name the parts reassemble as
    pub filename: String,
    /// Subject template (or literal subject for parsed manifests)
    pub subject: String,
    /// From template
    pub poster: String,
    /// Posting date as Unix epoch UTC (manifest round-trips)
    pub date: i64,
    /// Total expected size of the reassembled file
    pub total_size: u64,
    /// Sort number across sibling posts
    pub sort_no: u32,
    /// Groups the post targets, insertion-ordered, unique
    groups: Vec<String>,
    /// Owned articles, parts 1..N
    articles: Vec<Article>,
    /// Backing file, when built from a local source
    source: Option<Content>,
    work_dir: PathBuf,
}

impl SegmentedPost {
    /// A post without a local backing file (manifest stubs)
    pub fn new(filename: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// A post backed by a local file to be split and encoded
    pub fn from_path(path: impl AsRef<Path>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = path.as_ref();
        let mut source = Content::from_path(path)?;
        let total_size = source.len()?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut post = Self::new(filename, work_dir);
        post.total_size = total_size;
        post.source = Some(source);
        Ok(post)
    }

    /// Deterministic ordering key: `<sort_no>/<filename>`
    pub fn key(&self) -> String {
        format!("{}/{}", self.sort_no, self.filename)
    }

    /// Add a target group, preserving order and uniqueness
    pub fn add_group(&mut self, group: impl Into<String>) {
        let group = group.into().to_lowercase();
        if !self.groups.contains(&group) {
            self.groups.push(group);
        }
    }

    /// Groups the post targets
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Append an article; its sequence number is assigned from position
    pub fn add(&mut self, mut article: Article) {
        article.sequence_no = self.articles.len() as u32 + 1;
        self.articles.push(article);
    }

    /// Owned articles in part order
    pub fn articles(&self) -> &[Article] {
        &self.articles
    }

    /// Mutable access to the owned articles
    pub fn articles_mut(&mut self) -> &mut [Article] {
        &mut self.articles
    }

    /// Number of segments
    pub fn segcount(&self) -> usize {
        self.articles.len()
    }

    /// Split the backing file into articles of at most `size` bytes each
    ///
    /// Replaces any previously held articles. Each article owns exactly one
    /// Content part with `begin`/`end`/`total_size` computed by the split.
    pub fn split(&mut self, size: u64) -> Result<usize> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| Error::Content("segmented post has no backing file".to_string()))?;
        let parts = source.split(size, crate::content::BLOCK_SIZE * 16)?;

        self.articles.clear();
        for part in parts {
            let mut article = Article::new("", "");
            article.sequence_no = part.part();
            article.expected_size = Some(part.range().1.unwrap_or(0) - part.range().0.unwrap_or(0));
            article.add(part)?;
            self.articles.push(article);
        }
        debug!("{} split into {} article(s)", self.key(), self.articles.len());
        Ok(self.articles.len())
    }

    /// Encode every article's payload into postable yEnc text
    ///
    /// The encoded text becomes the article body; the binary part stays
    /// attached for checksumming and staging.
    pub fn encode(&mut self, line_width: usize) -> Result<()> {
        let total = self.articles.len() as u32;
        let filename = self.filename.clone();
        let total_size = self.total_size;

        for article in &mut self.articles {
            let part_no = article.sequence_no;
            let Some(content) = article.contents().first() else {
                return Err(Error::Content(format!(
                    "article {} of {} has no payload",
                    part_no, filename
                )));
            };
            let (begin, end) = content.range();
            let (begin, end) = match (begin, end) {
                (Some(b), Some(e)) => (b, e),
                _ => (0, total_size),
            };

            // read the payload back out of the part
            let mut bytes = Vec::with_capacity((end - begin) as usize);
            {
                let contents = article.take_contents();
                let mut restored = Vec::with_capacity(contents.len());
                for mut part in contents {
                    part.rewind()?;
                    loop {
                        let block = part.read(crate::content::BLOCK_SIZE)?;
                        if block.is_empty() {
                            break;
                        }
                        bytes.extend_from_slice(&block);
                    }
                    restored.push(part);
                }
                for part in restored {
                    article.add(part)?;
                }
            }

            let part_info = if total > 1 {
                Some((part_no, total, begin + 1, end, total_size))
            } else {
                None
            };
            let encoded = yenc_encode(&bytes, &filename, line_width, part_info)?;
            article.body = encoded;
        }
        Ok(())
    }

    /// Fill subject/from/newsgroups for every article from the templates
    pub fn apply_template(&mut self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::Content(format!(
                "segmented post {} has no groups",
                self.filename
            )));
        }
        let total = self.articles.len() as u32;
        for article in &mut self.articles {
            let part = article.sequence_no;
            article.subject = fill_template(&self.subject, &self.filename, part, total);
            article.poster = self.poster.clone();
            for group in &self.groups {
                article.add_group(group.clone());
            }
        }
        Ok(())
    }

    /// Reassemble fetched parts into one Content, ordered by key
    ///
    /// Articles must carry their decoded payloads; parts are concatenated
    /// in `(sort_no, filename, part)` order regardless of completion order.
    pub fn join(&mut self) -> Result<Content> {
        let mut parts: Vec<Content> = Vec::new();
        for article in &mut self.articles {
            parts.extend(article.take_contents());
        }
        if parts.is_empty() {
            return Err(Error::Content(format!(
                "no decoded parts for {}",
                self.filename
            )));
        }
        parts.sort_by_key(|c| c.key());

        let mut whole = Content::with_filename(&self.work_dir, self.filename.clone());
        whole.set_sort_no(self.sort_no);
        whole.append(&mut parts)?;
        Ok(whole)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_source(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_split_assigns_sequence_numbers() {
        let dir = tempdir().unwrap();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let path = write_source(dir.path(), "src.bin", &payload);

        let mut post = SegmentedPost::from_path(&path, dir.path()).unwrap();
        let n = post.split(2048).unwrap();
        assert_eq!(n, 3);
        assert_eq!(post.articles()[0].sequence_no, 1);
        assert_eq!(post.articles()[2].sequence_no, 3);
        assert_eq!(post.articles()[2].expected_size, Some(5000 - 4096));
    }

    #[test]
    fn test_split_encode_produces_postable_bodies() {
        let dir = tempdir().unwrap();
        let payload = vec![0xaau8; 3000];
        let path = write_source(dir.path(), "vol.rar", &payload);

        let mut post = SegmentedPost::from_path(&path, dir.path()).unwrap();
        post.split(2048).unwrap();
        post.encode(128).unwrap();

        let body = post.articles()[0].body_text().into_owned();
        assert!(body.starts_with("=ybegin part=1 total=2"));
        assert!(body.contains("=ypart begin=1 end=2048"));
        assert!(body.contains("=yend"));

        let body = post.articles()[1].body_text().into_owned();
        assert!(body.contains("=ypart begin=2049 end=3000"));
    }

    #[test]
    fn test_apply_template() {
        let dir = tempdir().unwrap();
        let payload = vec![1u8; 100];
        let path = write_source(dir.path(), "thing.bin", &payload);

        let mut post = SegmentedPost::from_path(&path, dir.path()).unwrap();
        post.subject = "\"{filename}\" yEnc ({part}/{total})".to_string();
        post.poster = "reaper <r@example.com>".to_string();
        post.add_group("alt.binaries.test");
        post.split(50).unwrap();
        post.apply_template().unwrap();

        let article = &post.articles()[1];
        assert_eq!(article.subject, "\"thing.bin\" yEnc (002/002)");
        assert_eq!(article.poster, "reaper <r@example.com>");
        assert_eq!(article.groups(), &["alt.binaries.test".to_string()]);
    }

    #[test]
    fn test_apply_template_requires_groups() {
        let dir = tempdir().unwrap();
        let mut post = SegmentedPost::new("x.bin", dir.path());
        assert!(post.apply_template().is_err());
    }

    #[test]
    fn test_join_reorders_parts() {
        let dir = tempdir().unwrap();
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 199) as u8).collect();
        let path = write_source(dir.path(), "joined.bin", &payload);

        let mut post = SegmentedPost::from_path(&path, dir.path()).unwrap();
        post.split(1000).unwrap();
        // completion order is irrelevant: reverse the articles
        post.articles.reverse();

        let mut whole = post.join().unwrap();
        assert_eq!(whole.len().unwrap(), 4000);
        whole.rewind().unwrap();
        assert_eq!(whole.read(8192).unwrap(), payload);
    }
}
