//! Named collections of day partitions.
//!
//! A group maps day timestamps to [`TimeEntry`] partitions stored under
//! `<db>/<group>/<day>/data`. Partitions are created on first reference and
//! removed by renaming their directory to a hidden name, after which the
//! recursive delete happens in the background.

use crate::config::SyncMode;
use crate::error::{Result, ZangetsuError};
use crate::storage::layout;
use crate::storage::time_entry::{CloseWaiter, TimeEntry};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Validates a group name.
///
/// Names must be non-empty, must not start with `.`, and may only contain
/// `[A-Za-z0-9_.-]`. Since the name becomes a path component this also
/// rejects path traversal.
///
/// # Errors
///
/// Returns [`ZangetsuError::InvalidGroupName`] for any other name.
pub fn validate_group_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ZangetsuError::InvalidGroupName(name.to_string()))
    }
}

/// A named set of day partitions.
#[derive(Debug)]
pub struct Group {
    name: String,
    path: PathBuf,
    sync_mode: SyncMode,
    entries: BTreeMap<u64, Arc<TimeEntry>>,
}

impl Group {
    /// Creates an empty group rooted at `<root>/<name>`.
    ///
    /// Nothing is created on disk until the first partition is referenced.
    ///
    /// # Errors
    ///
    /// Returns [`ZangetsuError::InvalidGroupName`] for an invalid name.
    pub fn new(root: &Path, name: &str, sync_mode: SyncMode) -> Result<Self> {
        validate_group_name(name)?;
        Ok(Self {
            name: name.to_string(),
            path: layout::group_dir(root, name),
            sync_mode,
            entries: BTreeMap::new(),
        })
    }

    /// Loads a group and its partitions from disk.
    ///
    /// Hidden directories left over from interrupted removals are deleted in
    /// the background; non-timestamp directories are ignored. A partition
    /// directory without a data file is skipped and left as it is.
    pub fn load(
        root: &Path,
        name: &str,
        sync_mode: SyncMode,
        mut next_object_id: impl FnMut() -> u64,
    ) -> Result<Self> {
        let mut group = Self::new(root, name, sync_mode)?;

        for dir_entry in fs::read_dir(&group.path)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };

            if layout::is_hidden(file_name) {
                if file_name.starts_with(layout::HIDDEN_PREFIX) {
                    info!("Purging stale partition {}", dir_entry.path().display());
                    layout::remove_in_background(dir_entry.path());
                }
                continue;
            }

            if !dir_entry.file_type()?.is_dir() {
                continue;
            }

            if let Some(day) = layout::parse_day_dir(file_name) {
                let data_path = layout::data_file_path(&group.path, day);
                if !data_path.is_file() {
                    debug!("Skipping partition without data file {}", data_path.display());
                    continue;
                }
                let entry = TimeEntry::open_existing(next_object_id(), day, data_path, sync_mode)?;
                group.entries.insert(day, entry);
            } else {
                debug!(
                    "Skipping non-partition directory {}",
                    dir_entry.path().display()
                );
            }
        }

        debug!("Loaded group {} with {} partitions", group.name, group.len());
        Ok(group)
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the group has no partitions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the partition for `day`, if any.
    pub fn get(&self, day: u64) -> Option<&Arc<TimeEntry>> {
        self.entries.get(&day)
    }

    /// Iterates partitions in day order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &Arc<TimeEntry>)> {
        self.entries.iter().map(|(day, entry)| (*day, entry))
    }

    /// Returns the partition for `day`, creating its directory and data file
    /// on first reference.
    ///
    /// An existing data file is reopened with its size taken from disk.
    pub fn get_or_create(
        &mut self,
        day: u64,
        next_object_id: impl FnOnce() -> u64,
    ) -> Result<Arc<TimeEntry>> {
        if let Some(entry) = self.entries.get(&day) {
            return Ok(Arc::clone(entry));
        }

        fs::create_dir_all(layout::partition_dir(&self.path, day))?;
        let data_path = layout::data_file_path(&self.path, day);
        let entry = TimeEntry::open(next_object_id(), day, data_path, self.sync_mode)?;
        self.entries.insert(day, Arc::clone(&entry));
        Ok(entry)
    }

    /// Closes and detaches one partition, then deletes its directory.
    ///
    /// Returns `None` if the partition does not exist. The directory is
    /// renamed to a hidden name right away and deleted in the background.
    pub fn remove(&mut self, day: u64) -> Result<Option<CloseWaiter>> {
        let Some(entry) = self.entries.remove(&day) else {
            return Ok(None);
        };
        let waiter = entry.close();

        let dir = layout::partition_dir(&self.path, day);
        if dir.exists() {
            let hidden = layout::rename_to_hidden(&dir)?;
            layout::remove_in_background(hidden);
        }

        debug!("Removed partition {}/{}", self.name, day);
        Ok(Some(waiter))
    }

    /// Closes every partition and deletes the group directory.
    pub fn remove_all(mut self) -> Result<Vec<CloseWaiter>> {
        let waiters = self.close();

        if self.path.exists() {
            let hidden = layout::rename_to_hidden(&self.path)?;
            layout::remove_in_background(hidden);
        }

        debug!("Removed group {}", self.name);
        Ok(waiters)
    }

    /// Requests every partition to close without touching the files.
    pub fn close(&mut self) -> Vec<CloseWaiter> {
        let waiters: Vec<_> = self.entries.values().map(|entry| entry.close()).collect();
        let pending = waiters.iter().filter(|waiter| !waiter.is_closed()).count();
        if pending > 0 {
            warn!(
                "Group {} closing with {} partitions still in use",
                self.name, pending
            );
        }
        self.entries.clear();
        waiters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Checksum, RecordFlags};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn ids() -> impl FnMut() -> u64 {
        let counter = AtomicU64::new(0);
        move || counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn append(entry: &Arc<TimeEntry>, data: &[u8]) {
        entry
            .append(&[data], Checksum::of(data), RecordFlags::empty())
            .unwrap();
    }

    #[test]
    fn test_validate_group_name() {
        for name in ["logs", "a", "foo.bar", "foo-bar_1", "A.B.C", "x."] {
            assert!(validate_group_name(name).is_ok(), "{} should be valid", name);
        }
        for name in ["", ".hidden", "..", "a/b", "a b", "ä", "../etc", "foo\0"] {
            assert!(
                matches!(
                    validate_group_name(name),
                    Err(ZangetsuError::InvalidGroupName(_))
                ),
                "{:?} should be invalid",
                name
            );
        }
    }

    #[test]
    fn test_get_or_create_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let mut group = Group::new(temp_dir.path(), "logs", SyncMode::None).unwrap();
        let mut next_id = ids();

        let entry = group.get_or_create(18_000, &mut next_id).unwrap();
        assert!(temp_dir.path().join("logs/18000/data").is_file());
        assert_eq!(entry.day_timestamp(), 18_000);
        assert_eq!(group.len(), 1);

        let again = group.get_or_create(18_000, &mut next_id).unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_get_or_create_picks_up_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("logs/18000")).unwrap();
        fs::write(temp_dir.path().join("logs/18000/data"), [0u8; 40]).unwrap();

        let mut group = Group::new(temp_dir.path(), "logs", SyncMode::None).unwrap();
        let entry = group.get_or_create(18_000, ids()).unwrap();
        assert_eq!(entry.written_size(), 40);
    }

    #[test]
    fn test_remove_partition() {
        let temp_dir = TempDir::new().unwrap();
        let mut group = Group::new(temp_dir.path(), "logs", SyncMode::None).unwrap();
        let mut next_id = ids();
        let entry = group.get_or_create(18_000, &mut next_id).unwrap();
        append(&entry, b"hello");
        group.get_or_create(18_001, &mut next_id).unwrap();

        let waiter = group.remove(18_000).unwrap().unwrap();
        assert!(waiter.is_closed());
        assert!(entry.is_closed());
        assert!(group.get(18_000).is_none());
        assert!(!temp_dir.path().join("logs/18000").exists());
        assert!(temp_dir.path().join("logs/18001").exists());

        assert!(group.remove(18_000).unwrap().is_none());
    }

    #[test]
    fn test_remove_all() {
        let temp_dir = TempDir::new().unwrap();
        let mut group = Group::new(temp_dir.path(), "logs", SyncMode::None).unwrap();
        let mut next_id = ids();
        let first = group.get_or_create(18_000, &mut next_id).unwrap();
        let second = group.get_or_create(18_001, &mut next_id).unwrap();
        let lease = second.read_lease().unwrap();

        let waiters = group.remove_all().unwrap();
        assert_eq!(waiters.len(), 2);
        assert!(first.is_closed());
        assert!(second.is_closing());
        assert!(!temp_dir.path().join("logs").exists());

        drop(lease);
        assert!(second.is_closed());
    }

    #[test]
    fn test_remove_all_without_directory() {
        let temp_dir = TempDir::new().unwrap();
        let group = Group::new(temp_dir.path(), "logs", SyncMode::None).unwrap();
        assert!(group.remove_all().unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_hidden_and_foreign_entries() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("logs/18000")).unwrap();
        fs::write(root.join("logs/18000/data"), [0u8; 62]).unwrap();
        fs::create_dir_all(root.join("logs/18001")).unwrap();
        fs::create_dir_all(root.join("logs/._18002-0")).unwrap();
        fs::create_dir_all(root.join("logs/notes")).unwrap();
        fs::create_dir_all(root.join("logs/018003")).unwrap();
        fs::write(root.join("logs/18004"), b"not a directory").unwrap();

        let group = Group::load(root, "logs", SyncMode::None, ids()).unwrap();
        let days: Vec<u64> = group.entries().map(|(day, _)| day).collect();
        assert_eq!(days, vec![18_000]);
        assert_eq!(group.get(18_000).unwrap().written_size(), 62);
    }

    #[test]
    fn test_load_leaves_partition_without_data_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("logs/18001")).unwrap();

        let mut group = Group::load(root, "logs", SyncMode::None, ids()).unwrap();
        assert!(group.is_empty());
        assert!(!root.join("logs/18001/data").exists());

        let entry = group.get_or_create(18_001, ids()).unwrap();
        assert_eq!(entry.written_size(), 0);
        assert!(root.join("logs/18001/data").is_file());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Group::new(temp_dir.path(), "../escape", SyncMode::None).is_err());
    }
}
