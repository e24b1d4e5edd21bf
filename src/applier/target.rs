//! Filesystem seam for the applier
//!
//! Paths are relative to the target root (`proc/sys/vm/swappiness`), so the
//! same applier drives the live system, a chroot being prepared for an image,
//! or a scratch directory in tests.

use crate::error::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub trait SystemTarget: Send + Sync {
    /// File content, `None` when the file does not exist
    fn read(&self, path: &str) -> Result<Option<String>>;

    /// Overwrite an existing kernel attribute
    fn write(&self, path: &str, content: &str) -> Result<()>;

    /// Create or replace a configuration file, creating parent directories
    fn write_persistent(&self, path: &str, content: &str) -> Result<()>;

    /// Delete a file; a file that is already gone is not an error
    fn remove(&self, path: &str) -> Result<()>;

    /// Entry names of a directory, sorted; empty when it does not exist
    fn list(&self, dir: &str) -> Result<Vec<String>>;
}

/// [`SystemTarget`] over a real directory tree
#[derive(Debug, Clone)]
pub struct FsTarget {
    root: PathBuf,
}

impl FsTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl SystemTarget for FsTarget {
    fn read(&self, path: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.resolve(path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path);
        // kernel attributes are never created, only written
        let mut file = fs::OpenOptions::new().write(true).truncate(true).open(&full)?;
        io::Write::write_all(&mut file, content.as_bytes())?;
        Ok(())
    }

    fn write_persistent(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = full.with_extension("situne-tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &full)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.resolve(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_target_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let target = FsTarget::new(dir.path());

        assert_eq!(target.read("etc/situne/gpu.conf").unwrap(), None);
        target.write_persistent("etc/situne/gpu.conf", "power_mode = \"balanced\"\n").unwrap();
        assert_eq!(
            target.read("/etc/situne/gpu.conf").unwrap().as_deref(),
            Some("power_mode = \"balanced\"\n")
        );
        assert_eq!(target.list("etc/situne").unwrap(), vec!["gpu.conf".to_string()]);

        target.remove("etc/situne/gpu.conf").unwrap();
        target.remove("etc/situne/gpu.conf").unwrap();
        assert!(target.list("etc/situne").unwrap().is_empty());
        assert!(target.list("does/not/exist").unwrap().is_empty());
    }

    #[test]
    fn test_live_write_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let target = FsTarget::new(dir.path());
        assert!(target.write("proc/sys/vm/swappiness", "10").is_err());

        fs::create_dir_all(dir.path().join("proc/sys/vm")).unwrap();
        fs::write(dir.path().join("proc/sys/vm/swappiness"), "60\n").unwrap();
        target.write("proc/sys/vm/swappiness", "10").unwrap();
        assert_eq!(target.read("proc/sys/vm/swappiness").unwrap().as_deref(), Some("10"));
    }
}
