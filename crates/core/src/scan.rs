use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub entries: Vec<FileEntry>,
    pub total_bytes: u64,
}

/// Lists every non-directory entry below `root` with its size.
///
/// Unreadable subtrees are logged and skipped; a file whose size cannot be read counts as 0 bytes.
/// Only a failure on `root` itself is returned as an error.
pub fn scan_dir(root: &Path) -> Result<ScanResult> {
    let mut out = ScanResult::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!(event = "scan.skip", error = %e, "scan.skip");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        // Follows symlinks so a link is sized like its target. A link to a directory is treated
        // like the directory walk treats it: not descended into and not counted.
        let size_bytes = match std::fs::metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => {
                debug!(
                    event = "scan.skip_dir_link",
                    path = %entry.path().display(),
                    "scan.skip_dir_link"
                );
                continue;
            }
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(
                    event = "scan.size_unavailable",
                    path = %entry.path().display(),
                    error = %e,
                    "scan.size_unavailable"
                );
                0
            }
        };

        out.total_bytes += size_bytes;
        out.entries.push(FileEntry::new(entry.into_path(), size_bytes));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: PathBuf, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn lists_nested_files_with_sizes() {
        let temp = tempfile::tempdir().unwrap();
        write_file(temp.path().join("a.txt"), b"hello");
        write_file(temp.path().join("nested/deeper/b.bin"), &[0u8; 300]);
        std::fs::create_dir_all(temp.path().join("empty")).unwrap();

        let res = scan_dir(temp.path()).unwrap();

        assert_eq!(res.entries.len(), 2);
        assert_eq!(res.total_bytes, 305);
        let mut names: Vec<_> = res
            .entries
            .iter()
            .map(|e| e.path.strip_prefix(temp.path()).unwrap().to_path_buf())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![PathBuf::from("a.txt"), PathBuf::from("nested/deeper/b.bin")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn directory_links_are_not_counted() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("root");
        write_file(root.join("a.txt"), b"hello");
        write_file(temp.path().join("outside/big.bin"), &[0u8; 4096]);
        write_file(temp.path().join("target.txt"), b"abc");
        std::os::unix::fs::symlink(temp.path().join("outside"), root.join("linkdir")).unwrap();
        std::os::unix::fs::symlink(temp.path().join("target.txt"), root.join("linkfile")).unwrap();

        let res = scan_dir(&root).unwrap();

        let mut names: Vec<_> = res
            .entries
            .iter()
            .map(|e| e.path.strip_prefix(&root).unwrap().to_path_buf())
            .collect();
        names.sort();
        assert_eq!(names, vec![PathBuf::from("a.txt"), PathBuf::from("linkfile")]);
        assert_eq!(res.total_bytes, 8);
    }

    #[test]
    fn missing_root_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        assert!(scan_dir(&temp.path().join("nope")).is_err());
    }
}
