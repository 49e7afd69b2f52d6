use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Store opening parameters.
///
/// The two targets are paging/file-handle tuning knobs surfaced through the
/// service settings; they are accepted for API fidelity and recorded with
/// the open store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding entity files; `None` keeps everything in memory
    /// (used by tests and transient deployments).
    pub dir: Option<PathBuf>,
    pub open_oversize_files_target: usize,
    pub cached_pages_target: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            open_oversize_files_target: default_open_files_target(),
            cached_pages_target: default_cached_pages_target(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }
}

const fn default_open_files_target() -> usize {
    16
}

const fn default_cached_pages_target() -> usize {
    1024
}

/// Meta record persisted alongside the entities: the ID allocator cursor and
/// the singleton storage-parent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoreMeta {
    pub next_id: u64,
    pub parent_id: Option<u64>,
}

impl Default for StoreMeta {
    fn default() -> Self {
        Self {
            next_id: 1,
            parent_id: None,
        }
    }
}
