//! External archive and recovery tools
//!
//! The factory shells out to `rar` for volume archiving and `par2` for
//! recovery records; binaries are discovered on PATH. Archive internals are
//! out of scope here, only the invocation and its outputs.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Pick a volume size from the total source size
///
/// The schedule keeps part counts manageable across source magnitudes:
/// under 100 MiB posts in 5 MiB volumes, scaling to 400 MiB volumes past
/// 25 GiB.
pub fn detect_split_size(total: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    if total < 100 * MIB {
        5 * MIB
    } else if total < GIB {
        15 * MIB
    } else if total < 5 * GIB {
        50 * MIB
    } else if total < 15 * GIB {
        100 * MIB
    } else if total < 25 * GIB {
        200 * MIB
    } else {
        400 * MIB
    }
}

/// Total size of a file or directory tree
pub fn source_size(path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Volume archiver over the external `rar` binary
pub struct RarArchiver {
    binary: PathBuf,
}

impl RarArchiver {
    /// Use an explicit binary path
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Discover `rar` on PATH
    pub fn from_path() -> Option<Self> {
        which::which("rar").ok().map(Self::new)
    }

    /// Archive `source` into volumes under `out_dir`
    ///
    /// Uses store-only compression (`-m0`); the payload is typically
    /// already compressed and yEnc prefers stable volume sizes. Returns
    /// the created volume paths in name order.
    pub async fn archive(
        &self,
        source: &Path,
        out_dir: &Path,
        name: &str,
        volume_size: u64,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(out_dir)?;
        let base = out_dir.join(format!("{}.rar", name));
        let volume_kib = (volume_size / 1024).max(1);

        let output = Command::new(&self.binary)
            .arg("a")
            .arg("-ep1")
            .arg("-m0")
            .arg(format!("-v{}k", volume_kib))
            .arg(&base)
            .arg(source)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to execute rar: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "rar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let volumes = list_outputs(out_dir, &["rar"])?;
        debug!("rar produced {} volume(s)", volumes.len());
        Ok(volumes)
    }
}

/// Recovery record generator over the external `par2` binary
pub struct Par2Generator {
    binary: PathBuf,
    /// Redundancy percentage handed to `-r`
    pub redundancy: u8,
}

impl Par2Generator {
    /// Use an explicit binary path
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            redundancy: 5,
        }
    }

    /// Discover `par2` on PATH
    pub fn from_path() -> Option<Self> {
        which::which("par2").ok().map(Self::new)
    }

    /// Create recovery files covering every volume in `dir`
    pub async fn create(&self, dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
        let base = dir.join(format!("{}.par2", name));
        let mut command = Command::new(&self.binary);
        command
            .arg("c")
            .arg(format!("-r{}", self.redundancy))
            .arg("-q")
            .arg(&base);
        for volume in list_outputs(dir, &["rar"])? {
            command.arg(volume);
        }

        let output = command
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to execute par2: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "par2 exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let records = list_outputs(dir, &["par2"])?;
        debug!("par2 produced {} recovery file(s)", records.len());
        Ok(records)
    }
}

/// Files in `dir` whose extension matches, sorted by name
///
/// rar volume suffixes (`.rar`, `.r00`, ...) and `.part01.rar` styles both
/// sort into posting order by name.
fn list_outputs(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matched = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                extensions.contains(&ext.as_str())
                    || (extensions.contains(&"rar")
                        && ext.len() == 3
                        && ext.starts_with('r')
                        && ext[1..].chars().all(|c| c.is_ascii_digit()))
            })
            .unwrap_or(false);
        if matched {
            out.push(path);
        }
    }
    out.sort();
    if out.is_empty() {
        warn!("no outputs matching {:?} under {}", extensions, dir.display());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    #[test]
    fn test_detect_split_size_schedule() {
        assert_eq!(detect_split_size(0), 5 * MIB);
        assert_eq!(detect_split_size(100 * MIB - 1), 5 * MIB);
        assert_eq!(detect_split_size(100 * MIB), 15 * MIB);
        assert_eq!(detect_split_size(GIB - 1), 15 * MIB);
        // 1G lands in the 50 MiB bucket
        assert_eq!(detect_split_size(GIB), 50 * MIB);
        assert_eq!(detect_split_size(5 * GIB), 100 * MIB);
        assert_eq!(detect_split_size(15 * GIB), 200 * MIB);
        // 25G lands in the 400 MiB bucket
        assert_eq!(detect_split_size(25 * GIB), 400 * MIB);
        assert_eq!(detect_split_size(u64::MAX), 400 * MIB);
    }

    #[test]
    fn test_source_size_walks_tree() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.bin"), vec![0u8; 50]).unwrap();

        assert_eq!(source_size(dir.path()).unwrap(), 150);
        assert_eq!(source_size(&dir.path().join("a.bin")).unwrap(), 100);
    }

    #[test]
    fn test_list_outputs_matches_volume_suffixes() {
        let dir = tempdir().unwrap();
        for name in ["x.rar", "x.r00", "x.r01", "x.par2", "x.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let rars = list_outputs(dir.path(), &["rar"]).unwrap();
        let names: Vec<_> = rars
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["x.r00", "x.r01", "x.rar"]);

        let pars = list_outputs(dir.path(), &["par2"]).unwrap();
        assert_eq!(pars.len(), 1);
    }
}
