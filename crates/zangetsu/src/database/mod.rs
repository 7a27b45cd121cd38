//! The database: every group, the quiescence lock, and sync-and-evict.
//!
//! # Architecture
//!
//! - [`Database`] is a cheap, cloneable handle over shared state.
//! - Adds resolve (or create) the partition and take a write lease on it,
//!   then wait for an add permit from the quiescence lock, then run the
//!   append on the blocking pool. While the lock is held, the lease keeps
//!   the partition alive but the write itself waits.
//! - Every appended partition joins the dirty set. Sync-and-evict runs on a
//!   timer and whenever the unevicted byte count crosses the configured
//!   threshold. It takes the lock, then syncs and evicts the dirty
//!   partitions in parallel.
//! - Mutations are published to per-database [`Subscription`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use zangetsu::{Database, DatabaseConfig};
//! use zangetsu::record::{Checksum, RecordFlags};
//!
//! let db = Database::open("/var/lib/zangetsu", DatabaseConfig::default())?;
//! db.start();
//!
//! let data = Bytes::from_static(b"hello");
//! let outcome = db
//!     .add("logs", 18000, vec![data.clone()], Checksum::of(&data), RecordFlags::empty())
//!     .await?;
//! let record = db.get("logs", 18000, outcome.offset).await?;
//! ```

pub mod events;
pub mod lock;
pub mod toc;

pub use events::{MutationEvent, Subscription};
pub use lock::{DatabaseLock, LockMode};
pub use toc::{PartitionInfo, TableOfContents};

use crate::config::DatabaseConfig;
use crate::error::{Result, ZangetsuError};
use crate::record::codec;
use crate::record::{Checksum, RecordFlags};
use crate::storage::{layout, validate_group_name, AppendOutcome, Group, Record, TimeEntry};
use bytes::{Bytes, BytesMut};
use events::EventHub;
use lock::QuiescenceLock;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

struct DatabaseState {
    groups: BTreeMap<String, Group>,
    reloading: bool,
    dirty: HashMap<u64, Arc<TimeEntry>>,
    unevicted_bytes: u64,
}

struct DatabaseInner {
    path: PathBuf,
    config: DatabaseConfig,
    state: Mutex<DatabaseState>,
    quiescence: Arc<QuiescenceLock>,
    events: Arc<EventHub>,
    next_object_id: AtomicU64,
    evicting: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseInner {
    fn lock_state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn next_object_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Some(timer) = self.lock_timer().take() {
            timer.abort();
        }
    }
}

/// Handle to an open database. Clones share the same state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens the database at `path`, creating the directory if needed, and
    /// loads the partition index from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or scanned.
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let db = Self {
            inner: Arc::new(DatabaseInner {
                path,
                config,
                state: Mutex::new(DatabaseState {
                    groups: BTreeMap::new(),
                    reloading: false,
                    dirty: HashMap::new(),
                    unevicted_bytes: 0,
                }),
                quiescence: QuiescenceLock::new(),
                events: Arc::new(EventHub::default()),
                next_object_id: AtomicU64::new(0),
                evicting: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        };
        db.reload()?;
        Ok(db)
    }

    /// Root directory.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Rebuilds the in-memory index from the directory tree.
    ///
    /// Walks `<db>/<group>/<day>/data`, taking each partition's size from the
    /// file on disk. Hidden and malformed directories are skipped. Previously
    /// loaded partitions are closed.
    ///
    /// # Errors
    ///
    /// Returns [`ZangetsuError::ReloadInProgress`] if another reload is
    /// running, or an I/O error from the scan.
    pub fn reload(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if state.reloading {
                return Err(ZangetsuError::ReloadInProgress);
            }
            state.reloading = true;
        }

        let scanned = self.scan_groups();

        let mut state = self.inner.lock_state();
        state.reloading = false;
        let groups = scanned?;

        let previous = std::mem::replace(&mut state.groups, groups);
        state.dirty.clear();
        state.unevicted_bytes = 0;
        let partitions: usize = state.groups.values().map(Group::len).sum();
        drop(state);

        for (_, mut group) in previous {
            group.close();
        }

        info!(
            "Loaded database {} ({} partitions)",
            self.inner.path.display(),
            partitions
        );
        Ok(())
    }

    fn scan_groups(&self) -> Result<BTreeMap<String, Group>> {
        let mut groups = BTreeMap::new();
        let sync_mode = self.inner.config.sync_mode;

        for dir_entry in fs::read_dir(&self.inner.path)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };

            if layout::is_hidden(name) {
                if name.starts_with(layout::HIDDEN_PREFIX) {
                    info!("Purging stale group {}", dir_entry.path().display());
                    layout::remove_in_background(dir_entry.path());
                }
                continue;
            }
            if !dir_entry.file_type()?.is_dir() || validate_group_name(name).is_err() {
                debug!("Skipping {}", dir_entry.path().display());
                continue;
            }

            let group = Group::load(&self.inner.path, name, sync_mode, || {
                self.inner.next_object_id()
            })?;
            groups.insert(name.to_string(), group);
        }

        Ok(groups)
    }

    /// Starts the periodic sync-and-evict timer. Must run inside a tokio
    /// runtime. Calling it again restarts the timer.
    pub fn start(&self) {
        let weak: Weak<DatabaseInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sync_and_evict_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let db = Database { inner };
                if let Err(err) = db.sync_and_evict().await {
                    warn!("Periodic sync-and-evict failed: {}", err);
                }
            }
        });

        if let Some(previous) = self.inner.lock_timer().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the timer, flushes dirty partitions, and closes every partition.
    ///
    /// Waits until every partition has released its file handle.
    pub async fn close(&self) -> Result<()> {
        if let Some(timer) = self.inner.lock_timer().take() {
            timer.abort();
        }

        let flushed = self.sync_and_evict().await;

        let groups = std::mem::take(&mut self.inner.lock_state().groups);
        let mut waiters = Vec::new();
        for (_, mut group) in groups {
            waiters.extend(group.close());
        }
        for waiter in waiters {
            waiter.wait().await;
        }

        info!("Closed database {}", self.inner.path.display());
        flushed
    }

    /// Appends one record to `(group, day)`.
    ///
    /// `buffers` are written back to back as a single payload and `checksum`
    /// must be their CRC32. The partition is created on first use. While the
    /// database is locked the write waits for the unlock.
    ///
    /// Once the write is admitted it runs to completion on its own task, so
    /// dropping the returned future does not stop the write, its dirty-set
    /// bookkeeping, or the `Added` event.
    ///
    /// # Errors
    ///
    /// - [`ZangetsuError::TooLarge`] or [`ZangetsuError::InvalidGroupName`]
    ///   before anything is touched
    /// - [`ZangetsuError::ReloadInProgress`] during a reload
    /// - [`ZangetsuError::IoError`] if the write fails
    pub async fn add(
        &self,
        group: &str,
        day: u64,
        buffers: Vec<Bytes>,
        checksum: Checksum,
        flags: RecordFlags,
    ) -> Result<AppendOutcome> {
        let data_size: usize = buffers.iter().map(Bytes::len).sum();
        codec::validate_data_size(data_size)?;
        validate_group_name(group)?;

        let lease = {
            let mut state = self.inner.lock_state();
            if state.reloading {
                return Err(ZangetsuError::ReloadInProgress);
            }
            let entry = match state.groups.get_mut(group) {
                Some(existing) => existing.get_or_create(day, || self.inner.next_object_id())?,
                None => {
                    let mut created =
                        Group::new(&self.inner.path, group, self.inner.config.sync_mode)?;
                    let entry = created.get_or_create(day, || self.inner.next_object_id())?;
                    state.groups.insert(group.to_string(), created);
                    entry
                }
            };
            entry.write_lease()?
        };

        let permit = self.inner.quiescence.begin_add().await?;

        let db = self.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            db.inner.events.emit_with(|| MutationEvent::Adding {
                group: group.clone(),
                day,
            });

            let entry = Arc::clone(lease.entry());
            let (outcome, buffers) = tokio::task::spawn_blocking(move || {
                let outcome = lease.append(&buffers, checksum, flags);
                (outcome, buffers)
            })
            .await
            .map_err(|err| {
                ZangetsuError::InvariantViolation(format!("append task failed: {}", err))
            })?;
            let outcome = outcome?;

            db.register_growth(&entry, outcome.size);

            db.inner.events.emit_with(|| MutationEvent::Added {
                group,
                day,
                offset: outcome.offset,
                size: outcome.size,
                data: concat(buffers),
                flags,
            });

            drop(permit);
            Ok::<_, ZangetsuError>(outcome)
        })
        .await
        .map_err(|err| ZangetsuError::InvariantViolation(format!("add task failed: {}", err)))?
    }

    /// Reads the record at `offset` in `(group, day)`.
    ///
    /// # Errors
    ///
    /// - [`ZangetsuError::NotFound`] if the group or partition does not exist
    /// - [`ZangetsuError::InvalidOffset`] / [`ZangetsuError::CorruptedRecord`]
    ///   from the partition read
    pub async fn get(&self, group: &str, day: u64, offset: u64) -> Result<Record> {
        let not_found = || ZangetsuError::NotFound {
            group: group.to_string(),
            day,
        };

        let entry = self.find_time_entry(group, day).ok_or_else(not_found)?;
        let lease = match entry.read_lease() {
            Ok(lease) => lease,
            Err(ZangetsuError::Closed) => return Err(not_found()),
            Err(err) => return Err(err),
        };

        tokio::task::spawn_blocking(move || lease.read(offset))
            .await
            .map_err(|err| ZangetsuError::InvariantViolation(format!("read task failed: {}", err)))?
    }

    /// Returns the partition for `(group, day)`, if loaded.
    pub fn find_time_entry(&self, group: &str, day: u64) -> Option<Arc<TimeEntry>> {
        let state = self.inner.lock_state();
        state.groups.get(group)?.get(day).cloned()
    }

    /// Removes a whole group (`day == None`) or one partition.
    ///
    /// Removing something that does not exist is a no-op. Removal is not
    /// blocked by the quiescence lock.
    ///
    /// # Errors
    ///
    /// Returns [`ZangetsuError::InvalidGroupName`] for an invalid name or an
    /// I/O error if the directory cannot be renamed away.
    pub fn remove(&self, group: &str, day: Option<u64>) -> Result<()> {
        validate_group_name(group)?;

        let removed = {
            let mut state = self.inner.lock_state();
            if state.reloading {
                return Err(ZangetsuError::ReloadInProgress);
            }
            match day {
                None => match state.groups.remove(group) {
                    Some(existing) => {
                        existing.remove_all()?;
                        true
                    }
                    None => false,
                },
                Some(day) => match state.groups.get_mut(group) {
                    Some(existing) => existing.remove(day)?.is_some(),
                    None => false,
                },
            }
        };

        if removed {
            match day {
                Some(day) => info!("Removed partition {}/{}", group, day),
                None => info!("Removed group {}", group),
            }
            self.inner.events.emit_with(|| MutationEvent::Removed {
                group: group.to_string(),
                day,
            });
        }
        Ok(())
    }

    /// Removes one partition. Same as `remove(group, Some(day))`.
    pub fn remove_one(&self, group: &str, day: u64) -> Result<()> {
        self.remove(group, Some(day))
    }

    /// Waits until no add is in flight and returns the quiescence lock.
    ///
    /// Adds issued while the lock is held are queued and run after it is
    /// released. Lockers are served in arrival order.
    pub async fn lock(&self) -> Result<DatabaseLock> {
        self.inner.quiescence.lock().await
    }

    /// Current lock state.
    pub fn lock_mode(&self) -> LockMode {
        self.inner.quiescence.mode()
    }

    /// Number of adds waiting for the lock to be released.
    pub fn queued_adds(&self) -> usize {
        self.inner.quiescence.queued_adds()
    }

    /// Syncs and evicts every dirty partition under the quiescence lock.
    ///
    /// Returns immediately if a pass is already running. Closed partitions
    /// are skipped.
    pub async fn sync_and_evict(&self) -> Result<()> {
        if self.inner.evicting.swap(true, Ordering::SeqCst) {
            debug!("Sync-and-evict already running");
            return Ok(());
        }
        let _running = EvictingGuard(&self.inner.evicting);

        let lock = self.lock().await?;

        let (entries, bytes) = {
            let mut state = self.inner.lock_state();
            let entries: Vec<_> = state.dirty.drain().map(|(_, entry)| entry).collect();
            let bytes = std::mem::take(&mut state.unevicted_bytes);
            (entries, bytes)
        };
        let count = entries.len();

        let mut tasks = JoinSet::new();
        for entry in entries {
            tasks.spawn_blocking(move || {
                let lease = match entry.write_lease() {
                    Ok(lease) => lease,
                    Err(ZangetsuError::Closed) => return Ok(()),
                    Err(err) => return Err(err),
                };
                lease.sync()?;
                lease.evict()
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|err| {
                ZangetsuError::InvariantViolation(format!("sync task failed: {}", err))
            });
            if let Err(err) = result.and_then(|inner| inner) {
                warn!("Failed to sync and evict partition: {}", err);
                first_error.get_or_insert(err);
            }
        }

        drop(lock);

        if count > 0 {
            info!(
                "Synced and evicted {} partitions ({} bytes)",
                count, bytes
            );
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Bytes appended since the last sync-and-evict.
    pub fn unevicted_bytes(&self) -> u64 {
        self.inner.lock_state().unevicted_bytes
    }

    /// Number of partitions appended to since the last sync-and-evict.
    pub fn dirty_partitions(&self) -> usize {
        self.inner.lock_state().dirty.len()
    }

    /// Snapshot of every partition's written size.
    pub fn to_table_of_contents(&self) -> TableOfContents {
        let state = self.inner.lock_state();
        let mut toc = TableOfContents::new();
        for (name, group) in &state.groups {
            toc.insert_group(name);
            for (day, entry) in group.entries() {
                toc.insert(name, day, entry.written_size());
            }
        }
        toc
    }

    /// Subscribes to mutation events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    fn register_growth(&self, entry: &Arc<TimeEntry>, size: u64) {
        let over_threshold = {
            let mut state = self.inner.lock_state();
            state
                .dirty
                .entry(entry.object_id())
                .or_insert_with(|| Arc::clone(entry));
            state.unevicted_bytes += size;
            state.unevicted_bytes >= self.inner.config.max_unevicted_bytes
        };

        if over_threshold && !self.inner.evicting.load(Ordering::SeqCst) {
            let db = self.clone();
            tokio::spawn(async move {
                if let Err(err) = db.sync_and_evict().await {
                    warn!("Sync-and-evict failed: {}", err);
                }
            });
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

struct EvictingGuard<'a>(&'a AtomicBool);

impl Drop for EvictingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn concat(mut buffers: Vec<Bytes>) -> Bytes {
    if buffers.len() <= 1 {
        return buffers.pop().unwrap_or_default();
    }
    let mut joined = BytesMut::with_capacity(buffers.iter().map(Bytes::len).sum());
    for buf in &buffers {
        joined.extend_from_slice(buf);
    }
    joined.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn create_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig::default().with_sync_mode(SyncMode::None);
        let db = Database::open(temp_dir.path(), config).unwrap();
        (temp_dir, db)
    }

    async fn add(db: &Database, group: &str, day: u64, data: &'static [u8]) -> AppendOutcome {
        db.add(
            group,
            day,
            vec![Bytes::from_static(data)],
            Checksum::of(data),
            RecordFlags::empty(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_basic_append_and_get() {
        let (_temp_dir, db) = create_test_db();

        let outcome = add(&db, "logs", 18_000, b"hello").await;
        assert_eq!(outcome.offset, 0);

        let record = db.get("logs", 18_000, 0).await.unwrap();
        assert_eq!(&record.data[..], b"hello");
        assert!(!record.is_corrupted());
    }

    #[tokio::test]
    async fn test_multi_buffer_add() {
        let (_temp_dir, db) = create_test_db();
        let buffers = vec![Bytes::from_static(b"hel"), Bytes::from_static(b"lo")];
        let checksum = Checksum::of_chunks(&buffers);
        db.add("logs", 18_000, buffers, checksum, RecordFlags::empty())
            .await
            .unwrap();
        assert_eq!(&db.get("logs", 18_000, 0).await.unwrap().data[..], b"hello");
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;

        assert!(matches!(
            db.get("missing", 18_000, 0).await,
            Err(ZangetsuError::NotFound { .. })
        ));
        assert!(matches!(
            db.get("logs", 17_999, 0).await,
            Err(ZangetsuError::NotFound { .. })
        ));
        assert!(matches!(
            db.get("logs", 18_000, 34).await,
            Err(ZangetsuError::InvalidOffset { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_add_rejected() {
        let (temp_dir, db) = create_test_db();
        let data = Bytes::from(vec![0u8; 600 * 1024]);
        let checksum = Checksum::of(&data);

        let err = db
            .add("logs", 18_000, vec![data], checksum, RecordFlags::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, ZangetsuError::TooLarge { .. }));
        assert!(!temp_dir.path().join("logs").exists());
        assert!(db.to_table_of_contents().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_group_name() {
        let (_temp_dir, db) = create_test_db();
        let err = db
            .add(
                "../etc",
                18_000,
                vec![Bytes::from_static(b"x")],
                Checksum::of(b"x"),
                RecordFlags::empty(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ZangetsuError::InvalidGroupName(_)));
        assert!(db.remove(".hidden", None).is_err());
    }

    #[tokio::test]
    async fn test_remove_group_and_partition() {
        let (temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"a").await;
        add(&db, "logs", 18_001, b"b").await;
        add(&db, "metrics", 18_000, b"c").await;

        db.remove_one("logs", 18_000).unwrap();
        let toc = db.to_table_of_contents();
        assert_eq!(toc.size("logs", 18_000), None);
        assert_eq!(toc.size("logs", 18_001), Some(30));
        assert!(!temp_dir.path().join("logs/18000").exists());

        db.remove("metrics", None).unwrap();
        assert!(!db.to_table_of_contents().contains_group("metrics"));
        assert!(!temp_dir.path().join("metrics").exists());

        db.remove("nonexistent", None).unwrap();
        db.remove("logs", Some(12_345)).unwrap();
    }

    #[tokio::test]
    async fn test_add_after_remove_starts_fresh() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;
        db.remove("logs", None).unwrap();
        let outcome = add(&db, "logs", 18_000, b"again").await;
        assert_eq!(outcome.offset, 0);
    }

    #[tokio::test]
    async fn test_toc_idempotent() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;
        add(&db, "logs", 18_001, b"world!").await;
        assert_eq!(db.to_table_of_contents(), db.to_table_of_contents());
        assert_eq!(db.to_table_of_contents().size("logs", 18_001), Some(35));
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (_temp_dir, db) = create_test_db();
        let mut events = db.subscribe();

        add(&db, "logs", 18_000, b"hello").await;
        db.remove("logs", Some(18_000)).unwrap();

        assert_eq!(
            events.recv().await,
            Some(MutationEvent::Adding {
                group: "logs".into(),
                day: 18_000
            })
        );
        assert_eq!(
            events.recv().await,
            Some(MutationEvent::Added {
                group: "logs".into(),
                day: 18_000,
                offset: 0,
                size: 34,
                data: Bytes::from_static(b"hello"),
                flags: RecordFlags::empty(),
            })
        );
        assert_eq!(
            events.recv().await,
            Some(MutationEvent::Removed {
                group: "logs".into(),
                day: Some(18_000)
            })
        );
    }

    #[tokio::test]
    async fn test_lock_defers_adds() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"first").await;
        let entry = db.find_time_entry("logs", 18_000).unwrap();
        let size_before = entry.data_file_size();

        let lock = db.lock().await.unwrap();
        let pending = {
            let db = db.clone();
            tokio::spawn(async move { add(&db, "logs", 18_000, b"second").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.queued_adds(), 1);
        assert_eq!(entry.data_file_size(), size_before);
        assert_eq!(entry.write_operations(), 1);

        lock.unlock();
        let outcome = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
        assert_eq!(outcome.offset, size_before);
        assert_eq!(db.lock_mode(), LockMode::Normal);
    }

    #[tokio::test]
    async fn test_cancelled_add_still_completes() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"first").await;
        let entry = db.find_time_entry("logs", 18_000).unwrap();
        let mut events = db.subscribe();

        let held = entry.hold_appends();
        let pending = {
            let db = db.clone();
            tokio::spawn(async move { add(&db, "logs", 18_000, b"second").await })
        };
        assert_eq!(
            events.recv().await,
            Some(MutationEvent::Adding {
                group: "logs".into(),
                day: 18_000
            })
        );
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        let locker = {
            let db = db.clone();
            tokio::spawn(async move { db.lock().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.lock_mode(), LockMode::Locking);
        assert!(!locker.is_finished());
        assert_eq!(entry.written_size(), 34);

        drop(held);
        let lock = timeout(Duration::from_secs(5), locker).await.unwrap().unwrap();
        assert_eq!(entry.written_size(), 69);
        assert_eq!(db.dirty_partitions(), 1);
        assert_eq!(db.unevicted_bytes(), 69);
        drop(lock);

        assert_eq!(
            events.recv().await,
            Some(MutationEvent::Added {
                group: "logs".into(),
                day: 18_000,
                offset: 34,
                size: 35,
                data: Bytes::from_static(b"second"),
                flags: RecordFlags::empty(),
            })
        );
    }

    #[tokio::test]
    async fn test_failed_partition_open_leaves_no_group() {
        let (temp_dir, db) = create_test_db();
        fs::write(temp_dir.path().join("logs"), b"not a directory").unwrap();

        let data = Bytes::from_static(b"hello");
        let err = db
            .add("logs", 18_000, vec![data.clone()], Checksum::of(&data), RecordFlags::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, ZangetsuError::IoError(_)));
        assert!(db.to_table_of_contents().is_empty());
        assert!(db.find_time_entry("logs", 18_000).is_none());
    }

    #[tokio::test]
    async fn test_remove_not_blocked_by_lock() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;
        let lock = db.lock().await.unwrap();
        db.remove("logs", None).unwrap();
        assert!(db.to_table_of_contents().is_empty());
        drop(lock);
    }

    #[tokio::test]
    async fn test_sync_and_evict_clears_dirty_set() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;
        add(&db, "logs", 18_001, b"world").await;
        assert_eq!(db.dirty_partitions(), 2);
        assert_eq!(db.unevicted_bytes(), 68);

        db.sync_and_evict().await.unwrap();
        assert_eq!(db.dirty_partitions(), 0);
        assert_eq!(db.unevicted_bytes(), 0);
        assert_eq!(db.lock_mode(), LockMode::Normal);
    }

    #[tokio::test]
    async fn test_sync_and_evict_skips_removed_partitions() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;
        db.remove("logs", None).unwrap();
        db.sync_and_evict().await.unwrap();
        assert_eq!(db.dirty_partitions(), 0);
    }

    #[tokio::test]
    async fn test_threshold_triggers_sync_and_evict() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig::default()
            .with_sync_mode(SyncMode::None)
            .with_max_unevicted_bytes(100);
        let db = Database::open(temp_dir.path(), config).unwrap();

        for _ in 0..4 {
            add(&db, "logs", 18_000, b"0123456789").await;
        }

        timeout(Duration::from_secs(5), async {
            while db.unevicted_bytes() >= 100 || db.dirty_partitions() > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig::default()
            .with_sync_mode(SyncMode::None)
            .with_sync_and_evict_interval(Duration::from_secs(10));
        let db = Database::open(temp_dir.path(), config).unwrap();
        db.start();

        add(&db, "logs", 18_000, b"hello").await;
        assert_eq!(db.dirty_partitions(), 1);

        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if db.dirty_partitions() == 0 {
                break;
            }
        }
        assert_eq!(db.dirty_partitions(), 0);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_rebuilds_index() {
        let (temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;
        add(&db, "logs", 18_001, b"world").await;

        fs::create_dir_all(temp_dir.path().join(".tmp")).unwrap();
        fs::create_dir_all(temp_dir.path().join("._old-0/18000")).unwrap();
        fs::write(temp_dir.path().join("stray-file"), b"x").unwrap();

        db.reload().unwrap();
        let toc = db.to_table_of_contents();
        assert_eq!(toc.size("logs", 18_000), Some(34));
        assert_eq!(toc.size("logs", 18_001), Some(34));
        assert_eq!(toc.groups().count(), 1);

        let outcome = add(&db, "logs", 18_000, b"again").await;
        assert_eq!(outcome.offset, 34);
    }

    #[tokio::test]
    async fn test_close_releases_partitions() {
        let (_temp_dir, db) = create_test_db();
        add(&db, "logs", 18_000, b"hello").await;
        let entry = db.find_time_entry("logs", 18_000).unwrap();

        db.close().await.unwrap();
        assert!(entry.is_closed());
        assert!(db.to_table_of_contents().is_empty());
    }

    #[test]
    fn test_concat() {
        assert_eq!(concat(vec![]), Bytes::new());
        assert_eq!(concat(vec![Bytes::from_static(b"ab")]), Bytes::from_static(b"ab"));
        assert_eq!(
            concat(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]),
            Bytes::from_static(b"abcd")
        );
    }
}
