//! Whole-document persistence with write-to-temp-then-rename.
//!
//! The new contents are written and synced to a temporary file in the target's
//! directory, then renamed over the target. Readers observe either the old or
//! the new document, never a partial one. Two concurrent writers race at the
//! granularity of the whole document and the last rename wins.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{IndexError, Result};

/// A fully written temporary file that has not yet replaced its target.
///
/// Dropping it without calling [`commit`](StagedWrite::commit) deletes the
/// temporary file and leaves the target untouched.
pub struct StagedWrite {
    tmp: NamedTempFile,
    target: PathBuf,
}

/// Write `contents` next to `path` without touching `path` itself.
pub fn stage(path: &Path, contents: &str) -> Result<StagedWrite> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| IndexError::persistence(&parent, e))?;

    let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| IndexError::persistence(path, e))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| IndexError::persistence(tmp.path(), e))?;

    Ok(StagedWrite {
        tmp,
        target: path.to_path_buf(),
    })
}

impl StagedWrite {
    /// Atomically replace the target with the staged contents.
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.tmp
            .persist(&target)
            .map_err(|e| IndexError::persistence(&target, e.error))?;
        Ok(())
    }

    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }
}

pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    stage(path, contents)?.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.toml");
        write_atomic(&path, "a = 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a = 1\n");
    }

    #[test]
    fn write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.toml");
        write_atomic(&path, "old\n").unwrap();
        write_atomic(&path, "new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }

    #[test]
    fn crash_before_rename_keeps_committed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.toml");
        write_atomic(&path, "committed = true\n").unwrap();

        let staged = stage(&path, "committed = false\n").unwrap();
        let tmp_path = staged.temp_path().to_path_buf();
        assert!(tmp_path.exists());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "committed = true\n"
        );

        // Simulated crash: the staged write is abandoned.
        drop(staged);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "committed = true\n"
        );
        assert!(!tmp_path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
