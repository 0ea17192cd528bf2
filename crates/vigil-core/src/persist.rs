//! Atomic JSON persistence helpers.
//!
//! Every on-disk store in the engine (signature DB, prevalence, quarantine
//! metadata, config) is a JSON file written via write-temp-then-rename, so
//! a crash mid-write never exposes a torn file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, VigilError};

/// Serializes `value` as pretty JSON and renames it into place.
///
/// The temporary file lives in the target's directory so the final rename
/// stays on one volume.
pub fn write_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VigilError::io(parent, e))?;
    }

    let json = serde_json::to_vec_pretty(value).map_err(|e| VigilError::Persistence {
        store: path.display().to_string(),
        detail: e.to_string(),
    })?;

    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, &json).map_err(|e| VigilError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        VigilError::io(path, e)
    })?;
    Ok(())
}

/// Reads and deserializes a JSON file.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| VigilError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| VigilError::Persistence {
        store: path.display().to_string(),
        detail: e.to_string(),
    })
}

/// Picks a non-existing sibling of `path` by suffixing ` (1)`, ` (2)`, ...
/// before the extension. Used by quarantine restore when the target exists.
#[must_use]
pub fn unique_target_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "restored".to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("exhausted u32 uniquifier suffixes");
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
