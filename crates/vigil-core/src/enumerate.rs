//! Safe directory traversal for on-demand scans.
//!
//! Symlinks and other reparse points are never followed; unreadable
//! entries are logged and skipped. Filters mirror the pipeline's own
//! (size, extension, excluded folders) so a full scan and a real-time
//! event agree on what is scannable.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ScopingConfig;

/// Traversal filters derived from [`ScopingConfig`].
#[derive(Debug, Clone)]
pub struct EnumerateOptions {
    /// Files above this size are skipped.
    pub max_file_size: u64,
    /// Lowercased extensions (no dot) that are skipped.
    pub excluded_extensions: HashSet<String>,
    /// Folders whose subtrees are skipped entirely.
    pub excluded_folders: Vec<PathBuf>,
}

impl EnumerateOptions {
    /// Builds options from scoping config; the quarantine root is always
    /// an excluded folder.
    #[must_use]
    pub fn from_scoping(scoping: &ScopingConfig) -> Self {
        let mut excluded_folders = scoping.excluded_folders.clone();
        excluded_folders.push(scoping.quarantine_path.clone());
        Self {
            max_file_size: scoping.max_file_size_bytes(),
            excluded_extensions: scoping
                .excluded_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            excluded_folders,
        }
    }

    /// Returns true if a regular file at `path` with `size` passes the
    /// filters.
    #[must_use]
    pub fn admits(&self, path: &Path, size: u64) -> bool {
        if size > self.max_file_size {
            return false;
        }
        if let Some(ext) = path.extension() {
            if self
                .excluded_extensions
                .contains(&ext.to_string_lossy().to_lowercase())
            {
                return false;
            }
        }
        !self.is_under_excluded(path)
    }

    fn is_under_excluded(&self, path: &Path) -> bool {
        self.excluded_folders.iter().any(|f| path.starts_with(f))
    }
}

/// Enumerates scannable files under the given roots.
///
/// Roots that are plain files are admitted directly (subject to filters);
/// directories are walked without following links.
#[must_use]
pub fn enumerate_files(roots: &[PathBuf], options: &EnumerateOptions) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        if root.is_file() {
            if let Ok(meta) = std::fs::metadata(root) {
                if options.admits(root, meta.len()) {
                    files.push(root.clone());
                }
            }
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir() && options.is_under_excluded(entry.path()))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if options.admits(entry.path(), meta.len()) {
                files.push(entry.into_path());
            }
        }
    }
    debug!(count = files.len(), "enumeration complete");
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> EnumerateOptions {
        EnumerateOptions {
            max_file_size: 1024,
            excluded_extensions: ["log".to_string()].into_iter().collect(),
            excluded_folders: Vec::new(),
        }
    }

    #[test]
    fn test_enumerates_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.exe"), b"x").unwrap();
        std::fs::write(dir.path().join("a/b/deep.dll"), b"y").unwrap();

        let files = enumerate_files(&[dir.path().to_path_buf()], &options());
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_size_filter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![0u8; 2048]).unwrap();
        std::fs::write(dir.path().join("small.bin"), b"ok").unwrap();

        let files = enumerate_files(&[dir.path().to_path_buf()], &options());
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("small.bin"));
    }

    #[test]
    fn test_extension_filter_case_insensitive() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("trace.LOG"), b"x").unwrap();
        std::fs::write(dir.path().join("app.exe"), b"x").unwrap();

        let files = enumerate_files(&[dir.path().to_path_buf()], &options());
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("app.exe"));
    }

    #[test]
    fn test_excluded_folder_subtree_skipped() {
        let dir = TempDir::new().unwrap();
        let excluded = dir.path().join("quarantine");
        std::fs::create_dir_all(excluded.join("files")).unwrap();
        std::fs::write(excluded.join("files/blob.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("ok.bin"), b"x").unwrap();

        let mut opts = options();
        opts.excluded_folders.push(excluded);

        let files = enumerate_files(&[dir.path().to_path_buf()], &opts);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("ok.bin"));
    }

    #[test]
    fn test_file_root_admitted_directly() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("single.exe");
        std::fs::write(&file, b"x").unwrap();

        let files = enumerate_files(&[file.clone()], &options());
        assert_eq!(files, vec![file]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_followed() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("real");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("inner.exe"), b"x").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();

        let files = enumerate_files(&[dir.path().to_path_buf()], &options());
        // inner.exe reachable once through "real", not twice through the link
        assert_eq!(files.len(), 1);
    }
}
