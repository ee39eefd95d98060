// Launcher page state: the launcher saves one JSON file per page, and each
// of those files is offered for backup.

use std::path::{Path, PathBuf};

/// Source of extra files to include in a backup.
pub trait PageStateProvider: Send + Sync {
    fn files_for_backup(&self) -> Vec<PathBuf>;
}

pub struct LauncherPageSaver {
    pages_dir: PathBuf,
}

impl LauncherPageSaver {
    pub fn new(pages_dir: impl Into<PathBuf>) -> Self {
        Self {
            pages_dir: pages_dir.into(),
        }
    }

    pub fn pages_dir(&self) -> &Path {
        &self.pages_dir
    }
}

impl PageStateProvider for LauncherPageSaver {
    /// Saved page files in name order. A missing or unreadable directory
    /// contributes nothing.
    fn files_for_backup(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.pages_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("no launcher pages in {}: {}", self.pages_dir.display(), e);
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files
    }
}
