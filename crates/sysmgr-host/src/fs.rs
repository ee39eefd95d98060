// Filesystem queries used when assembling the backup list.
//
// Behind a trait so tests (and other hosts) can substitute their own view of
// the disk. Symlinks are followed.

use std::path::Path;

pub trait Filesystem: Send + Sync {
    /// True when `path` is non-empty and names something on disk.
    fn exists(&self, path: &Path) -> bool;
    /// True when `path` exists and is a regular file.
    fn is_regular_file(&self, path: &Path) -> bool;
}

pub struct LocalFs;

impl Filesystem for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        !path.as_os_str().is_empty() && std::fs::metadata(path).is_ok()
    }

    fn is_regular_file(&self, path: &Path) -> bool {
        std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, LocalFs) {
        (tempfile::tempdir().unwrap(), LocalFs)
    }

    #[test]
    fn regular_file() {
        let (dir, fs) = setup();
        let file = dir.path().join("launcher-cards.json");
        std::fs::write(&file, "[]").unwrap();
        assert!(fs.exists(&file));
        assert!(fs.is_regular_file(&file));
    }

    #[test]
    fn directory_exists_but_is_not_regular() {
        let (dir, fs) = setup();
        assert!(fs.exists(dir.path()));
        assert!(!fs.is_regular_file(dir.path()));
    }

    #[test]
    fn missing_path() {
        let (dir, fs) = setup();
        let missing = dir.path().join("nope");
        assert!(!fs.exists(&missing));
        assert!(!fs.is_regular_file(&missing));
    }

    #[test]
    fn empty_path_never_exists() {
        let fs = LocalFs;
        assert!(!fs.exists(Path::new("")));
        assert!(!fs.is_regular_file(Path::new("")));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_file_is_followed() {
        let (dir, fs) = setup();
        let target = dir.path().join("target.json");
        std::fs::write(&target, "{}").unwrap();
        let link = dir.path().join("link.json");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(fs.is_regular_file(&link));

        std::fs::remove_file(&target).unwrap();
        assert!(!fs.exists(&link));
    }
}
