//! Filesystem change events and ingress filtering.
//!
//! OS notification APIs live outside this crate; platform adapters turn
//! native notifications into [`FileEvent`]s and push them through an
//! [`EventSink`]. The sink applies the exclusion filter before anything
//! reaches the coalescer, so excluded subtrees (the quarantine root above
//! all) cost nothing downstream and can never be re-enqueued.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use vigil_core::config::ScopingConfig;

use crate::coalescer::Coalescer;

/// The kind of filesystem change observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A file appeared.
    Created,
    /// A file's contents changed.
    Modified,
    /// A file was renamed into place.
    Renamed,
}

/// One filesystem change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    /// Absolute path of the changed file.
    pub path: PathBuf,
    /// What changed.
    pub change_kind: ChangeKind,
    /// When the change was observed.
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    /// An event stamped now.
    #[must_use]
    pub fn now(path: impl Into<PathBuf>, change_kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            change_kind,
            timestamp: Utc::now(),
        }
    }
}

/// Ingress exclusion filter.
#[derive(Debug, Clone)]
pub struct EventFilter {
    excluded_folders: Vec<PathBuf>,
    quarantine_root: PathBuf,
}

impl EventFilter {
    /// Builds the filter from scoping config.
    #[must_use]
    pub fn from_scoping(scoping: &ScopingConfig) -> Self {
        Self {
            excluded_folders: scoping.excluded_folders.clone(),
            quarantine_root: scoping.quarantine_path.clone(),
        }
    }

    /// Returns true if events for `path` may enter the pipeline.
    #[must_use]
    pub fn admits(&self, path: &Path) -> bool {
        if path.starts_with(&self.quarantine_root) {
            return false;
        }
        !self.excluded_folders.iter().any(|f| path.starts_with(f))
    }
}

/// Handle watcher adapters push events through.
///
/// Cheap to clone; filtering happens here, coalescing behind it.
#[derive(Clone)]
pub struct EventSink {
    filter: Arc<EventFilter>,
    coalescer: Arc<Coalescer>,
}

impl EventSink {
    pub(crate) fn new(filter: Arc<EventFilter>, coalescer: Arc<Coalescer>) -> Self {
        Self { filter, coalescer }
    }

    /// Submits one event; excluded paths are dropped before coalescing.
    pub fn submit(&self, event: FileEvent) {
        if !self.filter.admits(&event.path) {
            trace!(path = %event.path.display(), "event excluded at ingress");
            return;
        }
        self.coalescer.submit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> EventFilter {
        EventFilter {
            excluded_folders: vec![PathBuf::from("/srv/excluded")],
            quarantine_root: PathBuf::from("/var/lib/vigil/quarantine"),
        }
    }

    #[test]
    fn test_quarantine_root_never_admitted() {
        let filter = filter();
        assert!(!filter.admits(Path::new("/var/lib/vigil/quarantine/files/x.qvault")));
    }

    #[test]
    fn test_excluded_folder_subtree() {
        let filter = filter();
        assert!(!filter.admits(Path::new("/srv/excluded/deep/file.exe")));
        assert!(filter.admits(Path::new("/srv/other/file.exe")));
    }

    #[test]
    fn test_event_serialization() {
        let event = FileEvent::now("/tmp/new.exe", ChangeKind::Created);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Created"));
    }
}
