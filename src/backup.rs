//! Reversible deletion: copies of files taken right before a run deletes
//! them, kept for a bounded window.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   2024-05-01T03-00-00/
//!     metadata.json
//!     home/alice/.config/google-chrome/Default/Cookies
//!   2024-05-01T03-00-00-1/
//!     ...
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use bytesize::ByteSize;
use chrono::{Duration, Local, NaiveDateTime};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::AppConfig;
use crate::error::{CleanerError, Result};

const METADATA_FILE: &str = "metadata.json";
const DIR_NAME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
const MAX_NAME_ATTEMPTS: usize = 1000;

/// What the run that produced a backup was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupContext {
    pub browsers: Vec<String>,
    pub delete_bookmarks: bool,
    pub delete_downloads: bool,
    pub delete_downloads_folder: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpFile {
    pub original: PathBuf,
    /// Relative to the backup directory.
    pub backup: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: NaiveDateTime,
    pub browsers: Vec<String>,
    #[serde(default)]
    pub delete_bookmarks: bool,
    #[serde(default)]
    pub delete_downloads: bool,
    #[serde(default)]
    pub delete_downloads_folder: bool,
    #[serde(default)]
    pub files_count: usize,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub files: Vec<BackedUpFile>,
}

#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub id: String,
    pub path: PathBuf,
    pub metadata: BackupMetadata,
}

impl BackupEntry {
    /// Collision counter in the directory name: 0 for the plain timestamp,
    /// N for `-N`. Unrecognized names sort last.
    fn name_attempt(&self) -> Option<usize> {
        let base = self.metadata.timestamp.format(DIR_NAME_FORMAT).to_string();
        let rest = self.id.strip_prefix(base.as_str())?;
        if rest.is_empty() {
            return Some(0);
        }
        rest.strip_prefix('-')?.parse().ok()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResult {
    pub restored_count: usize,
    pub failed_count: usize,
    pub restored_files: Vec<PathBuf>,
    pub failed_files: Vec<PathBuf>,
}

impl RestoreResult {
    pub fn is_success(&self) -> bool {
        self.restored_count > 0
    }
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    retention_days: i64,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, retention_days: i64, max_backups: usize) -> Self {
        BackupManager {
            root: root.into(),
            retention_days,
            max_backups,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.backups_dir(),
            config.backup_retention_days,
            config.max_backups,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copies every existing file (directories expand to the files under
    /// them). Returns the backup id, or `None` when nothing was copyable.
    pub fn create_backup(
        &self,
        files: &[PathBuf],
        context: &BackupContext,
    ) -> Result<Option<String>> {
        self.create_backup_at(files, context, Local::now().naive_local())
    }

    pub fn create_backup_at(
        &self,
        files: &[PathBuf],
        context: &BackupContext,
        now: NaiveDateTime,
    ) -> Result<Option<String>> {
        let sources = expand_sources(files);
        if sources.is_empty() {
            warn!("Nothing to back up");
            return Ok(None);
        }

        fs::create_dir_all(&self.root)?;
        let (id, dir) = self.claim_dir(now)?;

        let mut copied = Vec::new();
        let mut claimed = HashSet::new();
        let mut total_size = 0u64;
        for source in &sources {
            let relative = strip_root(source);
            if relative.as_os_str().is_empty() {
                continue;
            }
            if !claimed.insert(relative.clone()) {
                debug!("{} already backed up under another spelling", source.display());
                continue;
            }
            let dest = dir.join(&relative);
            match copy_preserving_mtime(source, &dest) {
                Ok(bytes) => {
                    total_size += bytes;
                    copied.push(BackedUpFile {
                        original: source.clone(),
                        backup: relative,
                    });
                }
                Err(e) => error!("Failed to back up {}: {}", source.display(), e),
            }
        }

        if copied.is_empty() {
            error!("No files could be backed up, discarding {}", id);
            let _ = fs::remove_dir_all(&dir);
            return Ok(None);
        }

        let metadata = BackupMetadata {
            timestamp: now,
            browsers: context.browsers.clone(),
            delete_bookmarks: context.delete_bookmarks,
            delete_downloads: context.delete_downloads,
            delete_downloads_folder: context.delete_downloads_folder,
            files_count: copied.len(),
            total_size,
            files: copied,
        };
        if let Err(e) = write_metadata(&dir, &metadata) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        info!(
            "Backup {} created: {} files ({})",
            id,
            metadata.files_count,
            ByteSize(total_size)
        );
        Ok(Some(id))
    }

    /// Backups with readable metadata, newest first.
    pub fn list_backups(&self) -> Vec<BackupEntry> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Cannot list backups in {}: {}", self.root.display(), e);
                }
                return Vec::new();
            }
        };

        let mut backups: Vec<BackupEntry> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let path = entry.path();
                let id = entry.file_name().to_string_lossy().into_owned();
                match read_metadata(&path) {
                    Ok(metadata) => Some(BackupEntry { id, path, metadata }),
                    Err(e) => {
                        debug!("Ignoring backup {}: {}", id, e);
                        None
                    }
                }
            })
            .collect();

        backups.sort_by(|a, b| {
            b.metadata
                .timestamp
                .cmp(&a.metadata.timestamp)
                .then_with(|| b.name_attempt().cmp(&a.name_attempt()))
                .then_with(|| b.id.cmp(&a.id))
        });
        backups
    }

    /// Copies files back to where they came from. Missing backup files are
    /// counted as failures, not errors.
    pub fn restore_backup(&self, id: &str) -> Result<RestoreResult> {
        let dir = self.backup_dir(id)?;
        let metadata = read_metadata(&dir)?;

        let mut result = RestoreResult::default();
        for file in &metadata.files {
            let source = dir.join(&file.backup);
            if !source.is_file() {
                warn!("Backup copy missing: {}", source.display());
                result.failed_count += 1;
                result.failed_files.push(file.original.clone());
                continue;
            }
            match copy_preserving_mtime(&source, &file.original) {
                Ok(_) => {
                    result.restored_count += 1;
                    result.restored_files.push(file.original.clone());
                }
                Err(e) => {
                    error!("Failed to restore {}: {}", file.original.display(), e);
                    result.failed_count += 1;
                    result.failed_files.push(file.original.clone());
                }
            }
        }

        info!(
            "Restored {}/{} files from backup {}",
            result.restored_count,
            metadata.files.len(),
            id
        );
        Ok(result)
    }

    pub fn cleanup_old_backups(&self) -> usize {
        self.cleanup_old_backups_at(Local::now().naive_local())
    }

    /// Deletes backups older than the retention window, then the oldest of
    /// what remains beyond `max_backups`. Returns how many were deleted.
    pub fn cleanup_old_backups_at(&self, now: NaiveDateTime) -> usize {
        let cutoff = now - Duration::days(self.retention_days);
        let mut deleted = 0;

        for entry in self.list_backups() {
            if entry.metadata.timestamp < cutoff && self.remove_entry(&entry, "expired") {
                deleted += 1;
            }
        }

        for entry in self.list_backups().into_iter().skip(self.max_backups) {
            if self.remove_entry(&entry, "over limit") {
                deleted += 1;
            }
        }
        deleted
    }

    pub fn delete_backup(&self, id: &str) -> Result<()> {
        let dir = self.backup_dir(id)?;
        fs::remove_dir_all(&dir)?;
        info!("Deleted backup {}", id);
        Ok(())
    }

    fn remove_entry(&self, entry: &BackupEntry, reason: &str) -> bool {
        match fs::remove_dir_all(&entry.path) {
            Ok(()) => {
                info!("Removed {} backup {}", reason, entry.id);
                true
            }
            Err(e) => {
                error!("Failed to remove backup {}: {}", entry.id, e);
                false
            }
        }
    }

    fn backup_dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(CleanerError::Backup(format!("invalid backup id '{}'", id)));
        }
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(CleanerError::NotFound(format!("backup {}", id)));
        }
        Ok(dir)
    }

    /// Creates a fresh directory; `create_dir` failing on existing paths
    /// keeps earlier backups from being reused.
    fn claim_dir(&self, now: NaiveDateTime) -> Result<(String, PathBuf)> {
        let base = now.format(DIR_NAME_FORMAT).to_string();
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let id = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CleanerError::Backup(format!(
            "no free backup name for {}",
            base
        )))
    }
}

fn expand_sources(files: &[PathBuf]) -> BTreeSet<PathBuf> {
    let mut sources = BTreeSet::new();
    for path in files {
        let metadata = match fs::symlink_metadata(path) {
            Ok(md) => md,
            Err(_) => continue,
        };
        if metadata.is_dir() {
            for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
                if entry.file_type().is_file() {
                    sources.insert(entry.into_path());
                }
            }
        } else if metadata.is_file() {
            sources.insert(path.clone());
        }
    }
    sources
}

/// Drops the root and any drive prefix: `C:\Users\a` -> `Users/a`.
/// `..` is resolved lexically and never climbs above the root.
fn strip_root(path: &Path) -> PathBuf {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.into_iter().collect()
}

fn copy_preserving_mtime(source: &Path, dest: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = fs::copy(source, dest)?;
    if let Ok(modified) = fs::metadata(source).and_then(|md| md.modified()) {
        if let Ok(file) = fs::File::options().write(true).open(dest) {
            let _ = file.set_modified(modified);
        }
    }
    Ok(bytes)
}

fn write_metadata(dir: &Path, metadata: &BackupMetadata) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
    fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
    fs::rename(&tmp, dir.join(METADATA_FILE))?;
    Ok(())
}

fn read_metadata(dir: &Path) -> Result<BackupMetadata> {
    let raw = fs::read(dir.join(METADATA_FILE))?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn context() -> BackupContext {
        BackupContext {
            browsers: vec!["chrome".into()],
            ..Default::default()
        }
    }

    fn seed(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn backup_then_restore_round_trip() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("profile");
        let files = vec![
            seed(&data, "Cookies", "cookie-jar"),
            seed(&data, "History", "visited"),
            seed(&data, "Sessions/Session_1", "tabs"),
        ];
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);

        let id = manager.create_backup(&files, &context()).unwrap().unwrap();
        for f in &files {
            fs::remove_file(f).unwrap();
        }

        let result = manager.restore_backup(&id).unwrap();
        assert!(result.is_success());
        assert_eq!(result.restored_count, 3);
        assert_eq!(result.failed_count, 0);
        assert_eq!(fs::read_to_string(&files[0]).unwrap(), "cookie-jar");
        assert_eq!(fs::read_to_string(&files[1]).unwrap(), "visited");
        assert_eq!(fs::read_to_string(&files[2]).unwrap(), "tabs");
    }

    #[test]
    fn metadata_describes_the_backup() {
        let temp = TempDir::new().unwrap();
        let file = seed(temp.path(), "profile/Cookies", "12345");
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);

        let id = manager
            .create_backup_at(&[file.clone()], &context(), at(1, 3))
            .unwrap()
            .unwrap();
        assert_eq!(id, "2024-05-01T03-00-00");

        let backups = manager.list_backups();
        assert_eq!(backups.len(), 1);
        let meta = &backups[0].metadata;
        assert_eq!(meta.files_count, 1);
        assert_eq!(meta.total_size, 5);
        assert_eq!(meta.browsers, vec!["chrome".to_string()]);
        assert_eq!(meta.files[0].original, file);
        assert!(meta.files[0].backup.is_relative());
        assert!(backups[0].path.join(&meta.files[0].backup).is_file());
    }

    #[test]
    fn directories_expand_to_their_files() {
        let temp = TempDir::new().unwrap();
        seed(temp.path(), "profile/Cache/a", "1");
        seed(temp.path(), "profile/Cache/b/c", "22");
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);

        manager
            .create_backup(&[temp.path().join("profile/Cache")], &context())
            .unwrap()
            .unwrap();
        let meta = &manager.list_backups()[0].metadata;
        assert_eq!(meta.files_count, 2);
        assert_eq!(meta.total_size, 3);
    }

    #[test]
    fn nothing_copyable_leaves_no_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("backups");
        let manager = BackupManager::new(&root, 7, 5);

        let id = manager
            .create_backup(&[temp.path().join("missing")], &context())
            .unwrap();
        assert!(id.is_none());
        assert!(!root.exists() || fs::read_dir(&root).unwrap().count() == 0);
    }

    #[test]
    fn same_second_backups_get_distinct_directories() {
        let temp = TempDir::new().unwrap();
        let file = seed(temp.path(), "f", "x");
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);

        let first = manager.create_backup_at(&[file.clone()], &context(), at(1, 3)).unwrap();
        let second = manager.create_backup_at(&[file], &context(), at(1, 3)).unwrap();
        assert_eq!(first.as_deref(), Some("2024-05-01T03-00-00"));
        assert_eq!(second.as_deref(), Some("2024-05-01T03-00-00-1"));
        assert_eq!(manager.list_backups().len(), 2);
    }

    #[test]
    fn same_second_backups_list_by_claim_order() {
        let temp = TempDir::new().unwrap();
        let file = seed(temp.path(), "f", "x");
        let manager = BackupManager::new(temp.path().join("backups"), 7, 20);

        for _ in 0..11 {
            manager.create_backup_at(&[file.clone()], &context(), at(1, 3)).unwrap();
        }
        let ids: Vec<String> = manager.list_backups().into_iter().map(|b| b.id).collect();
        assert_eq!(ids.len(), 11);
        assert_eq!(ids[0], "2024-05-01T03-00-00-10");
        assert_eq!(ids[1], "2024-05-01T03-00-00-9");
        assert_eq!(ids[9], "2024-05-01T03-00-00-1");
        assert_eq!(ids[10], "2024-05-01T03-00-00");
    }

    #[test]
    fn parent_components_resolve_before_mapping() {
        assert_eq!(strip_root(Path::new("/a/b/../c")), PathBuf::from("a/c"));
        assert_eq!(strip_root(Path::new("/../../etc/x")), PathBuf::from("etc/x"));

        let temp = TempDir::new().unwrap();
        let file = seed(temp.path(), "profile/Cookies", "cookie");
        let detour = temp.path().join("profile/Cache/../Cookies");
        fs::create_dir_all(temp.path().join("profile/Cache")).unwrap();
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);

        let id = manager
            .create_backup_at(&[file, detour], &context(), at(1, 3))
            .unwrap()
            .unwrap();
        let entry = manager.list_backups().into_iter().find(|b| b.id == id).unwrap();
        assert_eq!(entry.metadata.files_count, 1);
        assert!(entry
            .metadata
            .files
            .iter()
            .all(|f| !f.backup.components().any(|c| c == Component::ParentDir)));
    }

    #[test]
    fn list_is_newest_first_and_skips_corrupt_entries() {
        let temp = TempDir::new().unwrap();
        let file = seed(temp.path(), "f", "x");
        let root = temp.path().join("backups");
        let manager = BackupManager::new(&root, 7, 5);

        manager.create_backup_at(&[file.clone()], &context(), at(1, 3)).unwrap();
        manager.create_backup_at(&[file], &context(), at(3, 3)).unwrap();
        fs::create_dir_all(root.join("garbage")).unwrap();
        fs::write(root.join("garbage/metadata.json"), "{not json").unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();

        let ids: Vec<String> = manager.list_backups().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["2024-05-03T03-00-00", "2024-05-01T03-00-00"]);
    }

    #[test]
    fn count_limit_removes_only_the_oldest() {
        let temp = TempDir::new().unwrap();
        let file = seed(temp.path(), "f", "x");
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);
        for hour in 0..6 {
            manager.create_backup_at(&[file.clone()], &context(), at(10, hour)).unwrap();
        }

        assert_eq!(manager.cleanup_old_backups_at(at(10, 12)), 1);
        let remaining: Vec<String> = manager.list_backups().into_iter().map(|b| b.id).collect();
        assert_eq!(remaining.len(), 5);
        assert!(!remaining.contains(&"2024-05-10T00-00-00".to_string()));
    }

    #[test]
    fn age_limit_applies_before_count_limit() {
        let temp = TempDir::new().unwrap();
        let file = seed(temp.path(), "f", "x");
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);
        manager.create_backup_at(&[file.clone()], &context(), at(1, 0)).unwrap();
        manager.create_backup_at(&[file.clone()], &context(), at(2, 0)).unwrap();
        manager.create_backup_at(&[file], &context(), at(9, 0)).unwrap();

        // May 1 and 2 are more than 7 days before May 10 noon
        assert_eq!(manager.cleanup_old_backups_at(at(10, 12)), 2);
        assert_eq!(manager.list_backups().len(), 1);
        // Nothing left to do
        assert_eq!(manager.cleanup_old_backups_at(at(10, 12)), 0);
    }

    #[test]
    fn restore_tolerates_missing_copies() {
        let temp = TempDir::new().unwrap();
        let a = seed(temp.path(), "p/a", "a");
        let b = seed(temp.path(), "p/b", "b");
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);
        let id = manager.create_backup(&[a.clone(), b.clone()], &context()).unwrap().unwrap();

        let entry = manager.list_backups().remove(0);
        let copy_of_b = entry
            .metadata
            .files
            .iter()
            .find(|f| f.original == b)
            .map(|f| entry.path.join(&f.backup))
            .unwrap();
        fs::remove_file(copy_of_b).unwrap();
        fs::remove_file(&a).unwrap();

        let result = manager.restore_backup(&id).unwrap();
        assert!(result.is_success());
        assert_eq!(result.restored_files, vec![a]);
        assert_eq!(result.failed_files, vec![b]);
    }

    #[test]
    fn delete_rejects_traversal_and_unknown_ids() {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path().join("backups"), 7, 5);
        assert!(matches!(manager.delete_backup("../etc"), Err(CleanerError::Backup(_))));
        assert!(matches!(manager.delete_backup("a/b"), Err(CleanerError::Backup(_))));
        assert!(matches!(
            manager.delete_backup("2024-01-01T00-00-00"),
            Err(CleanerError::NotFound(_))
        ));

        let file = seed(temp.path(), "f", "x");
        let id = manager.create_backup(&[file], &context()).unwrap().unwrap();
        manager.delete_backup(&id).unwrap();
        assert!(manager.list_backups().is_empty());
    }
}
