//! Time-based deletion of derived files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Outcome of one sweep over one or more directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Regular files looked at.
    pub scanned: u64,
    pub deleted: u64,
    pub bytes_deleted: u64,
    /// Entries skipped because their type or mtime could not be read.
    pub skipped: u64,
    /// Files that were expired but could not be removed.
    pub errors: u64,
}

impl SweepReport {
    pub fn merge(&mut self, other: &SweepReport) {
        self.scanned += other.scanned;
        self.deleted += other.deleted;
        self.bytes_deleted += other.bytes_deleted;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Whether a file last modified at `modified` has outlived `max_age` at `now`.
///
/// Files with an mtime in the future are never expired.
pub fn is_expired(modified: SystemTime, now: SystemTime, max_age: Duration) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age > max_age,
        Err(_) => false,
    }
}

/// Delete regular files in `dir` (not recursive) older than `max_age`.
///
/// A missing directory is an empty sweep. With `dry_run` nothing is removed
/// but the report counts what would have been.
pub fn sweep_dir(dir: &Path, max_age: Duration, now: SystemTime, dry_run: bool) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "sweep target does not exist");
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to read directory entry");
                report.skipped += 1;
                continue;
            }
        };

        // DirEntry::metadata does not follow symlinks, so links are left alone
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(_) => {
                report.skipped += 1;
                continue;
            }
        };
        report.scanned += 1;

        let modified = match meta.modified() {
            Ok(modified) => modified,
            Err(_) => {
                report.skipped += 1;
                continue;
            }
        };
        if !is_expired(modified, now, max_age) {
            continue;
        }

        let path = entry.path();
        if dry_run {
            debug!(path = %path.display(), "would delete expired file");
        } else {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "deleted expired file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to delete expired file");
                    report.errors += 1;
                    continue;
                }
            }
        }
        report.deleted += 1;
        report.bytes_deleted += meta.len();
    }

    Ok(report)
}

/// Sweep several directories, merging their reports.
///
/// A directory that cannot be read is logged and counted as one error; the
/// remaining directories are still swept.
pub fn sweep_dirs(dirs: &[PathBuf], max_age: Duration, now: SystemTime, dry_run: bool) -> SweepReport {
    let mut total = SweepReport::default();
    for dir in dirs {
        match sweep_dir(dir, max_age, now, dry_run) {
            Ok(report) => total.merge(&report),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "sweep failed");
                total.errors += 1;
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    fn write_aged(dir: &Path, name: &str, bytes: &[u8], age: Duration) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    #[test]
    fn test_is_expired() {
        let now = SystemTime::now();
        assert!(is_expired(now - 11 * MINUTE, now, 10 * MINUTE));
        assert!(!is_expired(now - 9 * MINUTE, now, 10 * MINUTE));
        assert!(!is_expired(now + MINUTE, now, 10 * MINUTE));
    }

    #[test]
    fn test_sweep_deletes_only_expired_files() {
        let dir = TempDir::new().unwrap();
        let old = write_aged(dir.path(), "old.png", b"12345", 30 * MINUTE);
        let fresh = write_aged(dir.path(), "fresh.png", b"123", MINUTE);
        fs::create_dir(dir.path().join("nested")).unwrap();

        let report = sweep_dir(dir.path(), 10 * MINUTE, SystemTime::now(), false).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.bytes_deleted, 5);
        assert_eq!(report.errors, 0);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_dry_run_keeps_files() {
        let dir = TempDir::new().unwrap();
        let old = write_aged(dir.path(), "old.pdf", b"%PDF-", 60 * MINUTE);

        let report = sweep_dir(dir.path(), 10 * MINUTE, SystemTime::now(), true).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(old.exists());
    }

    #[test]
    fn test_missing_dir_is_empty_report() {
        let dir = TempDir::new().unwrap();
        let report = sweep_dir(&dir.path().join("absent"), MINUTE, SystemTime::now(), false).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn test_sweep_dirs_merges() {
        let images = TempDir::new().unwrap();
        let uploads = TempDir::new().unwrap();
        write_aged(images.path(), "a.png", b"aa", 20 * MINUTE);
        write_aged(uploads.path(), "b.pdf", b"bbb", 20 * MINUTE);
        File::create(uploads.path().join("new.pdf")).unwrap();

        let report = sweep_dirs(
            &[images.path().to_path_buf(), uploads.path().to_path_buf()],
            10 * MINUTE,
            SystemTime::now(),
            false,
        );
        assert_eq!(report.scanned, 3);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.bytes_deleted, 5);
    }
}
