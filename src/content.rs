//! File-backed content streams
//!
//! A [`Content`] is the byte-stream abstraction beneath decoded articles and
//! the staging pipeline. It is backed by a file on disk (a uniquely named
//! temporary in the working directory until bound), tracks its position
//! within a larger logical whole for split parts, and deletes its backing
//! file on drop while "attached".

use crate::error::{Error, Result};
use sha1::Digest;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Block size for streamed reads and copies
pub const BLOCK_SIZE: usize = 8192;

/// Render a digest as lowercase hex
fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// A possibly large byte sequence with on-disk backing
#[derive(Debug)]
pub struct Content {
    /// Directory unique temporaries are created in
    work_dir: PathBuf,
    /// Logical file name (what the bytes reassemble as)
    filename: String,
    /// Backing file, once bound
    path: Option<PathBuf>,
    /// Open handle; None until first read/write
    file: Option<File>,
    /// Part number within the logical whole (1-based)
    part: u32,
    /// Total number of parts
    total_parts: u32,
    /// Byte range start within the logical whole
    begin: Option<u64>,
    /// Byte range end (exclusive) within the logical whole
    end: Option<u64>,
    /// Size of the logical whole
    total_size: Option<u64>,
    /// Sort key across sibling contents
    sort_no: u32,
    /// Backing file is deleted when the Content drops
    attached: bool,
    /// Cleared when decoding detected corruption
    valid: bool,
    /// Unflushed writes exist
    dirty: bool,
    /// key() of the Content this part was split from
    parent_key: Option<String>,
}

impl Content {
    /// Create an unbound Content; the backing file is created on first write
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            filename: String::new(),
            path: None,
            file: None,
            part: 1,
            total_parts: 1,
            begin: None,
            end: None,
            total_size: None,
            sort_no: 0,
            attached: true,
            valid: true,
            dirty: false,
            parent_key: None,
        }
    }

    /// Create an unbound Content with a logical file name
    pub fn with_filename(work_dir: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        let mut content = Self::new(work_dir);
        content.filename = filename.into();
        content
    }

    /// Bind an existing file; detached by default so the caller's file
    /// survives the Content
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::Content(format!(
                "no such file: {}",
                path.display()
            )));
        }
        let work_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut content = Self::with_filename(work_dir, filename);
        content.path = Some(path);
        content.attached = false;
        Ok(content)
    }

    /// Logical file name
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Rename the logical file
    pub fn set_filename(&mut self, filename: impl Into<String>) {
        self.filename = filename.into();
    }

    /// Backing file path, if bound
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Part number (1-based)
    pub fn part(&self) -> u32 {
        self.part
    }

    /// Total number of parts
    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    /// Assign part numbering; `part` must not exceed `total_parts`
    pub fn set_part(&mut self, part: u32, total_parts: u32) -> Result<()> {
        if part > total_parts || part == 0 {
            return Err(Error::Content(format!(
                "invalid part {}/{}",
                part, total_parts
            )));
        }
        self.part = part;
        self.total_parts = total_parts;
        Ok(())
    }

    /// Byte range within the logical whole, when known
    pub fn range(&self) -> (Option<u64>, Option<u64>) {
        (self.begin, self.end)
    }

    /// Set the byte range; `begin` must precede `end`
    pub fn set_range(&mut self, begin: u64, end: u64) -> Result<()> {
        if begin >= end {
            return Err(Error::Content(format!("invalid range [{}, {})", begin, end)));
        }
        self.begin = Some(begin);
        self.end = Some(end);
        Ok(())
    }

    /// Size of the logical whole
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Record the size of the logical whole
    pub fn set_total_size(&mut self, size: u64) {
        self.total_size = Some(size);
    }

    /// Sort key across sibling contents
    pub fn sort_no(&self) -> u32 {
        self.sort_no
    }

    /// Assign the sort key
    pub fn set_sort_no(&mut self, sort_no: u32) {
        self.sort_no = sort_no;
    }

    /// Whether decoding left the content intact
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Clear or restore the validity flag
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// key() of the Content this part was split from
    pub fn parent_key(&self) -> Option<&str> {
        self.parent_key.as_deref()
    }

    /// Deterministic ordering key: `<sort_no>/<filename>/<part>`
    pub fn key(&self) -> String {
        format!("{}/{}/{:05}", self.sort_no, self.filename, self.part)
    }

    /// Stop tracking the backing file; it survives this Content
    pub fn detach(&mut self) {
        self.attached = false;
    }

    /// Resume tracking the backing file for deletion on drop
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Whether the backing file is deleted when this Content drops
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Bind a backing file, creating a unique temporary when unbound
    fn bind(&mut self) -> Result<&Path> {
        if self.path.is_none() {
            fs::create_dir_all(&self.work_dir)?;
            let unique = uuid::Uuid::new_v4().simple().to_string();
            let name = if self.filename.is_empty() {
                format!("{}.tmp", unique)
            } else {
                format!("{}.{}.tmp", self.filename, unique)
            };
            self.path = Some(self.work_dir.join(name));
        }
        // bind() only returns with path set
        self.path
            .as_deref()
            .ok_or_else(|| Error::Content("unbound content".to_string()))
    }

    /// Open the backing file read-write-append, creating it if needed
    fn handle(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            self.bind()?;
            let path = self
                .path
                .as_ref()
                .ok_or_else(|| Error::Content("unbound content".to_string()))?;
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| Error::Content("backing file not open".to_string()))
    }

    /// Close the open handle, flushing pending writes
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Append bytes to the stream
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self.handle()?;
        file.write_all(data)?;
        self.dirty = true;
        Ok(())
    }

    /// Read up to `n` bytes from the current position
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let file = self.handle()?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = file.read(&mut buf[filled..])?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Rewind the read position to the start of the stream
    pub fn rewind(&mut self) -> Result<()> {
        let file = self.handle()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Stream length in bytes
    pub fn len(&mut self) -> Result<u64> {
        if self.dirty {
            self.close()?;
        }
        match &self.path {
            Some(path) => Ok(fs::metadata(path)?.len()),
            None => Ok(0),
        }
    }

    /// Whether the stream holds no bytes
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Copy the full contents of each `other` onto the end of this stream
    ///
    /// The others' read positions are rewound first; their ranges are not
    /// consulted, so callers reassembling split parts must order them by
    /// [`Content::key`] beforehand.
    pub fn append(&mut self, others: &mut [Content]) -> Result<()> {
        for other in others.iter_mut() {
            other.close()?;
            other.rewind()?;
            loop {
                let block = other.read(BLOCK_SIZE)?;
                if block.is_empty() {
                    break;
                }
                self.write(&block)?;
            }
        }
        self.close()
    }

    /// Split into parts of at most `chunk_size` bytes
    ///
    /// The concatenation of the returned parts equals this stream. Each part
    /// is a fresh attached temporary carrying `part`/`total_parts`,
    /// `[begin, end)`, `total_size`, and a back-reference to this Content's
    /// key. `mem_buf` bounds the copy buffer.
    pub fn split(&mut self, chunk_size: u64, mem_buf: usize) -> Result<Vec<Content>> {
        if chunk_size == 0 {
            return Err(Error::Content("split size must be positive".to_string()));
        }
        let total = self.len()?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let parts = total.div_ceil(chunk_size);
        let parent_key = self.key();
        let buf_size = mem_buf.clamp(BLOCK_SIZE, 64 * 1024 * 1024);

        self.rewind()?;
        let mut out = Vec::with_capacity(parts as usize);
        for idx in 0..parts {
            let begin = idx * chunk_size;
            let end = ((idx + 1) * chunk_size).min(total);

            let mut child = Content::with_filename(&self.work_dir, self.filename.clone());
            child.sort_no = self.sort_no;
            child.set_part((idx + 1) as u32, parts as u32)?;
            child.set_range(begin, end)?;
            child.set_total_size(total);
            child.parent_key = Some(parent_key.clone());

            let mut remaining = (end - begin) as usize;
            while remaining > 0 {
                let want = remaining.min(buf_size);
                let block = self.read(want)?;
                if block.is_empty() {
                    return Err(Error::Content(
                        "backing file shrank during split".to_string(),
                    ));
                }
                child.write(&block)?;
                remaining -= block.len();
            }
            child.close()?;
            out.push(child);
        }

        debug!(
            "split {} into {} part(s) of <= {} byte(s)",
            self.key(),
            out.len(),
            chunk_size
        );
        Ok(out)
    }

    /// Move or copy the backing file to `path`
    ///
    /// After a move the Content is detached; a copy leaves attachment as-is.
    pub fn save(&mut self, path: impl AsRef<Path>, copy: bool) -> Result<()> {
        self.close()?;
        let src = self
            .path
            .clone()
            .ok_or_else(|| Error::Content("nothing to save: unbound content".to_string()))?;
        let dst = path.as_ref();
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }

        if copy {
            fs::copy(&src, dst)?;
            return Ok(());
        }

        // rename first; fall back to copy+remove across filesystems
        if fs::rename(&src, dst).is_err() {
            fs::copy(&src, dst)?;
            fs::remove_file(&src)?;
        }
        self.path = Some(dst.to_path_buf());
        self.attached = false;
        Ok(())
    }

    /// Streaming digest over the backing file
    fn digest_with<D: Digest>(&mut self) -> Result<String> {
        self.close()?;
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(hex(&D::digest(b""))),
        };
        let mut file = File::open(&path)?;
        let mut hasher = D::new();
        let mut buf = [0u8; BLOCK_SIZE];
        loop {
            let got = file.read(&mut buf)?;
            if got == 0 {
                break;
            }
            hasher.update(&buf[..got]);
        }
        Ok(hex(&hasher.finalize()))
    }

    /// MD5 of the stream as lowercase hex
    pub fn md5(&mut self) -> Result<String> {
        self.digest_with::<md5::Md5>()
    }

    /// SHA-1 of the stream as lowercase hex
    pub fn sha1(&mut self) -> Result<String> {
        self.digest_with::<sha1::Sha1>()
    }

    /// SHA-256 of the stream as lowercase hex
    pub fn sha256(&mut self) -> Result<String> {
        self.digest_with::<sha2::Sha256>()
    }

    /// CRC32 of the stream
    pub fn crc32(&mut self) -> Result<u32> {
        self.close()?;
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(0),
        };
        let mut file = File::open(&path)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = [0u8; BLOCK_SIZE];
        loop {
            let got = file.read(&mut buf)?;
            if got == 0 {
                break;
            }
            hasher.update(&buf[..got]);
        }
        Ok(hasher.finalize())
    }
}

impl Drop for Content {
    fn drop(&mut self) {
        self.file.take();
        if self.attached
            && let Some(path) = &self.path
            && path.is_file()
            && let Err(e) = fs::remove_file(path)
        {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut content = Content::new(dir.path());
        content.write(b"hello world").unwrap();
        content.rewind().unwrap();
        assert_eq!(content.read(5).unwrap(), b"hello");
        assert_eq!(content.read(64).unwrap(), b" world");
        assert_eq!(content.len().unwrap(), 11);
    }

    #[test]
    fn test_attached_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path;
        {
            let mut content = Content::new(dir.path());
            content.write(b"ephemeral").unwrap();
            content.close().unwrap();
            path = content.path().unwrap().to_path_buf();
            assert!(path.is_file());
        }
        assert!(!path.is_file());
    }

    #[test]
    fn test_detached_file_survives_drop() {
        let dir = tempdir().unwrap();
        let path;
        {
            let mut content = Content::new(dir.path());
            content.write(b"durable").unwrap();
            content.close().unwrap();
            content.detach();
            path = content.path().unwrap().to_path_buf();
        }
        assert!(path.is_file());
    }

    #[test]
    fn test_save_move_detaches() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("saved.bin");
        let path;
        {
            let mut content = Content::new(dir.path());
            content.write(b"kept").unwrap();
            content.save(&dst, false).unwrap();
            assert!(!content.is_attached());
            path = content.path().unwrap().to_path_buf();
            assert_eq!(path, dst);
        }
        assert_eq!(fs::read(&dst).unwrap(), b"kept");
        assert!(path.is_file());
    }

    #[test]
    fn test_save_copy_preserves_attachment() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("copied.bin");
        let mut content = Content::new(dir.path());
        content.write(b"copied").unwrap();
        content.save(&dst, true).unwrap();
        assert!(content.is_attached());
        assert_ne!(content.path().unwrap(), dst);
        assert_eq!(fs::read(&dst).unwrap(), b"copied");
    }

    #[test]
    fn test_split_append_commutes() {
        let dir = tempdir().unwrap();
        let mut original = Content::with_filename(dir.path(), "blob.bin");

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        original.write(&payload).unwrap();
        let md5_before = original.md5().unwrap();

        let mut parts = original.split(1024, 4096).unwrap();
        assert_eq!(parts.len(), 10);
        assert_eq!(parts[0].part(), 1);
        assert_eq!(parts[0].total_parts(), 10);
        assert_eq!(parts[0].range(), (Some(0), Some(1024)));
        assert_eq!(parts[9].range(), (Some(9216), Some(10_000)));
        assert_eq!(parts[3].total_size(), Some(10_000));
        assert_eq!(parts[3].parent_key(), Some(original.key().as_str()));

        let mut rebuilt = Content::with_filename(dir.path(), "rebuilt.bin");
        rebuilt.append(&mut parts).unwrap();
        assert_eq!(rebuilt.len().unwrap(), 10_000);
        assert_eq!(rebuilt.md5().unwrap(), md5_before);
    }

    #[test]
    fn test_split_rejects_zero_chunk() {
        let dir = tempdir().unwrap();
        let mut content = Content::new(dir.path());
        content.write(b"abc").unwrap();
        assert!(content.split(0, 4096).is_err());
    }

    #[test]
    fn test_range_invariants() {
        let dir = tempdir().unwrap();
        let mut content = Content::new(dir.path());
        assert!(content.set_range(10, 10).is_err());
        assert!(content.set_range(10, 9).is_err());
        assert!(content.set_range(0, 1).is_ok());
        assert!(content.set_part(3, 2).is_err());
        assert!(content.set_part(2, 2).is_ok());
    }

    #[test]
    fn test_key_ordering() {
        let dir = tempdir().unwrap();
        let mut a = Content::with_filename(dir.path(), "file.rar");
        a.set_sort_no(1);
        a.set_part(2, 10).unwrap();
        let mut b = Content::with_filename(dir.path(), "file.rar");
        b.set_sort_no(1);
        b.set_part(10, 10).unwrap();
        // zero-padded part keeps lexicographic order numeric
        assert!(a.key() < b.key());
    }

    #[test]
    fn test_digests_of_known_input() {
        let dir = tempdir().unwrap();
        let mut content = Content::new(dir.path());
        content.write(b"abc").unwrap();
        assert_eq!(content.md5().unwrap(), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            content.sha1().unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            content.sha256().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(content.crc32().unwrap(), 0x352441c2);
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = tempdir().unwrap();
        assert!(Content::from_path(dir.path().join("nope.bin")).is_err());
    }
}
