//! A single (group, day) partition backed by one append-only data file.
//!
//! # Architecture
//!
//! - Every file operation runs under a lease. [`ReadLease`] and
//!   [`WriteLease`] bump the entry's read/write counters on acquisition
//!   and drop them on release, so [`TimeEntry::close`] can wait for all
//!   in-flight work to drain.
//! - Appends are serialized per entry and written positionally at a
//!   reserved offset. `data_file_size` grows by the record size before the
//!   write is issued; `written_size` only advances once the whole record is
//!   on disk, so readers never observe a partial record.
//! - A failed append rolls the reservation back and truncates whatever
//!   partial bytes it left behind.
//!
//! # Example
//!
//! ```rust,ignore
//! use zangetsu::record::{Checksum, RecordFlags};
//! use zangetsu::storage::TimeEntry;
//!
//! let entry = TimeEntry::open(1, 18000, "db/logs/18000/data", SyncMode::default())?;
//! let outcome = entry.append(&[b"hello"], Checksum::of(b"hello"), RecordFlags::empty())?;
//! let record = entry.read(outcome.offset)?;
//! assert_eq!(&record.data[..], b"hello");
//! ```

use crate::config::SyncMode;
use crate::error::{Result, ZangetsuError};
use crate::record::codec::{self, RecordFlags, FOOTER_SIZE, HEADER_SIZE, RECORD_OVERHEAD};
use crate::record::Checksum;
use crate::storage::layout;
use bytes::Bytes;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Offset of the record's first header byte.
    pub offset: u64,
    /// Total on-disk size of the record.
    pub size: u64,
}

/// A record read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Offset of the record.
    pub offset: u64,
    /// Payload bytes.
    pub data: Bytes,
    /// Flags from the record header.
    pub flags: RecordFlags,
    /// Total on-disk size of the record.
    pub size: u64,
    /// Offset of the following record.
    pub next_offset: u64,
}

impl Record {
    /// Whether the record was stored with the corruption flag.
    pub fn is_corrupted(&self) -> bool {
        self.flags.is_corrupted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum LeaseKind {
    Read,
    Write,
}

struct EntryState {
    file: Option<Arc<File>>,
    data_file_size: u64,
    written_size: u64,
    reading: usize,
    writing: usize,
    lifecycle: Lifecycle,
}

impl EntryState {
    fn idle(&self) -> bool {
        self.reading == 0 && self.writing == 0
    }
}

/// One partition's data file and its read/write bookkeeping.
pub struct TimeEntry {
    object_id: u64,
    day: u64,
    path: PathBuf,
    sync_mode: SyncMode,
    append_lock: Mutex<()>,
    state: Mutex<EntryState>,
    closed_tx: watch::Sender<bool>,
    #[cfg(test)]
    fail_next_write: AtomicBool,
}

impl TimeEntry {
    /// Opens (creating if needed) the data file at `path`.
    ///
    /// The existing file length becomes both `written_size` and
    /// `data_file_size`. The parent directory must already exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or stat'ed.
    pub fn open(
        object_id: u64,
        day: u64,
        path: impl AsRef<Path>,
        sync_mode: SyncMode,
    ) -> Result<Arc<Self>> {
        Self::open_with(object_id, day, path.as_ref(), sync_mode, true)
    }

    /// Opens the data file at `path`, which must already exist.
    ///
    /// # Errors
    ///
    /// Returns an I/O error of kind `NotFound` if there is no such file.
    pub fn open_existing(
        object_id: u64,
        day: u64,
        path: impl AsRef<Path>,
        sync_mode: SyncMode,
    ) -> Result<Arc<Self>> {
        Self::open_with(object_id, day, path.as_ref(), sync_mode, false)
    }

    fn open_with(
        object_id: u64,
        day: u64,
        path: &Path,
        sync_mode: SyncMode,
        create: bool,
    ) -> Result<Arc<Self>> {
        let path = path.to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;
        let size = file.metadata()?.len();

        debug!("Opened time entry {} ({} bytes)", path.display(), size);

        let (closed_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            object_id,
            day,
            path,
            sync_mode,
            append_lock: Mutex::new(()),
            state: Mutex::new(EntryState {
                file: Some(Arc::new(file)),
                data_file_size: size,
                written_size: size,
                reading: 0,
                writing: 0,
                lifecycle: Lifecycle::Open,
            }),
            closed_tx,
            #[cfg(test)]
            fail_next_write: AtomicBool::new(false),
        }))
    }

    /// Identity of this entry within its database.
    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    /// Day timestamp of the partition.
    pub fn day_timestamp(&self) -> u64 {
        self.day
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes fully appended and visible to readers.
    pub fn written_size(&self) -> u64 {
        self.lock_state().written_size
    }

    /// Bytes allocated, including appends still in flight.
    pub fn data_file_size(&self) -> u64 {
        self.lock_state().data_file_size
    }

    /// Number of read leases currently held.
    pub fn read_operations(&self) -> usize {
        self.lock_state().reading
    }

    /// Number of write leases currently held.
    pub fn write_operations(&self) -> usize {
        self.lock_state().writing
    }

    /// Whether a close was requested but is waiting for operations to drain.
    pub fn is_closing(&self) -> bool {
        self.lock_state().lifecycle == Lifecycle::Closing
    }

    /// Whether the file handle has been released.
    pub fn is_closed(&self) -> bool {
        self.lock_state().lifecycle == Lifecycle::Closed
    }

    /// Acquires a read lease.
    ///
    /// # Errors
    ///
    /// Returns [`ZangetsuError::Closed`] once a close has been requested.
    pub fn read_lease(self: &Arc<Self>) -> Result<ReadLease> {
        let file = self.acquire(LeaseKind::Read)?;
        Ok(ReadLease {
            entry: Arc::clone(self),
            file,
        })
    }

    /// Acquires a write lease.
    ///
    /// # Errors
    ///
    /// Returns [`ZangetsuError::Closed`] once a close has been requested.
    pub fn write_lease(self: &Arc<Self>) -> Result<WriteLease> {
        let file = self.acquire(LeaseKind::Write)?;
        Ok(WriteLease {
            entry: Arc::clone(self),
            file,
        })
    }

    /// Appends one record made of `buffers` under a short-lived write lease.
    ///
    /// See [`WriteLease::append`].
    pub fn append<B: AsRef<[u8]>>(
        self: &Arc<Self>,
        buffers: &[B],
        checksum: Checksum,
        flags: RecordFlags,
    ) -> Result<AppendOutcome> {
        self.write_lease()?.append(buffers, checksum, flags)
    }

    /// Reads the record at `offset` under a short-lived read lease.
    ///
    /// See [`ReadLease::read`].
    pub fn read(self: &Arc<Self>, offset: u64) -> Result<Record> {
        self.read_lease()?.read(offset)
    }

    /// Starts a forward iteration at `start`.
    ///
    /// The returned iterator holds a read lease until it is exhausted,
    /// stopped, or dropped.
    pub fn iter(self: &Arc<Self>, start: u64) -> Result<RecordIter> {
        Ok(self.read_lease()?.into_iter_from(start))
    }

    /// Persists `[0, written_size)` to stable storage.
    pub fn sync(self: &Arc<Self>) -> Result<()> {
        self.write_lease()?.sync()
    }

    /// Drops cached pages for `[0, written_size)`.
    pub fn evict(self: &Arc<Self>) -> Result<()> {
        self.write_lease()?.evict()
    }

    /// Requests the entry to close.
    ///
    /// Idempotent. Closes immediately when no lease is held; otherwise the
    /// entry becomes `closing` and closes when the last lease is released.
    /// No new lease can be acquired after this call.
    pub fn close(&self) -> CloseWaiter {
        let waiter = CloseWaiter {
            rx: self.closed_tx.subscribe(),
        };

        let closed_now = {
            let mut state = self.lock_state();
            match state.lifecycle {
                Lifecycle::Open if state.idle() => {
                    Self::finish_close(&mut state);
                    true
                }
                Lifecycle::Open => {
                    debug!(
                        "Closing {} after {} reads and {} writes drain",
                        self.path.display(),
                        state.reading,
                        state.writing
                    );
                    state.lifecycle = Lifecycle::Closing;
                    false
                }
                Lifecycle::Closing | Lifecycle::Closed => false,
            }
        };

        if closed_now {
            self.closed_tx.send_replace(true);
        }
        waiter
    }

    #[cfg(test)]
    pub(crate) fn hold_appends(&self) -> MutexGuard<'_, ()> {
        self.append_lock.lock().unwrap_or_else(|err| err.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn inject_write_failure(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> std::io::Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            ));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn take_injected_failure(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn acquire(&self, kind: LeaseKind) -> Result<Arc<File>> {
        let mut state = self.lock_state();
        if state.lifecycle != Lifecycle::Open {
            return Err(ZangetsuError::Closed);
        }
        let file = match &state.file {
            Some(file) => Arc::clone(file),
            None => {
                return Err(ZangetsuError::InvariantViolation(
                    "open time entry has no file handle".into(),
                ))
            }
        };
        match kind {
            LeaseKind::Read => state.reading += 1,
            LeaseKind::Write => state.writing += 1,
        }
        Ok(file)
    }

    fn release(&self, kind: LeaseKind) {
        let closed_now = {
            let mut state = self.lock_state();
            match kind {
                LeaseKind::Read => {
                    assert!(state.reading > 0, "read operation count underflow");
                    state.reading -= 1;
                }
                LeaseKind::Write => {
                    assert!(state.writing > 0, "write operation count underflow");
                    state.writing -= 1;
                }
            }
            if state.lifecycle == Lifecycle::Closing && state.idle() {
                Self::finish_close(&mut state);
                true
            } else {
                false
            }
        };

        if closed_now {
            debug!("Closed {}", self.path.display());
            self.closed_tx.send_replace(true);
        }
    }

    fn finish_close(state: &mut EntryState) {
        debug_assert!(state.idle());
        state.lifecycle = Lifecycle::Closed;
        state.file = None;
    }
}

impl fmt::Debug for TimeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("TimeEntry")
            .field("object_id", &self.object_id)
            .field("day", &self.day)
            .field("path", &self.path)
            .field("written_size", &state.written_size)
            .field("data_file_size", &state.data_file_size)
            .field("lifecycle", &state.lifecycle)
            .finish()
    }
}

/// Resolves once a [`TimeEntry`] has released its file handle.
#[derive(Debug)]
pub struct CloseWaiter {
    rx: watch::Receiver<bool>,
}

impl CloseWaiter {
    /// Whether the entry has closed.
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the entry has closed.
    pub async fn wait(mut self) {
        // A dropped sender means the entry itself is gone.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

/// Scoped permission to read a [`TimeEntry`].
pub struct ReadLease {
    entry: Arc<TimeEntry>,
    file: Arc<File>,
}

impl ReadLease {
    /// The leased entry.
    pub fn entry(&self) -> &Arc<TimeEntry> {
        &self.entry
    }

    /// Reads and validates the record at `offset`.
    ///
    /// # Errors
    ///
    /// - [`ZangetsuError::InvalidOffset`] if no complete record can start at
    ///   `offset` within `written_size`
    /// - [`ZangetsuError::CorruptedRecord`] if the framing or checksum does
    ///   not validate
    pub fn read(&self, offset: u64) -> Result<Record> {
        let written_size = self.entry.written_size();
        let fits = offset
            .checked_add(RECORD_OVERHEAD as u64)
            .is_some_and(|end| end <= written_size);
        if !fits {
            return Err(ZangetsuError::InvalidOffset {
                offset,
                written_size,
            });
        }

        let mut header = [0u8; HEADER_SIZE];
        layout::read_exact_at(&self.file, &mut header, offset)?;
        let header = codec::decode_header(&header)?;

        let size = header.record_size();
        if offset + size > written_size {
            return Err(ZangetsuError::CorruptedRecord(format!(
                "record at {} extends past written size {}",
                offset, written_size
            )));
        }

        let data_size = header.data_size as usize;
        let mut body = vec![0u8; data_size + FOOTER_SIZE];
        layout::read_exact_at(&self.file, &mut body, offset + HEADER_SIZE as u64)?;
        codec::decode_footer(&body[data_size..], &body[..data_size])?;
        body.truncate(data_size);

        Ok(Record {
            offset,
            data: Bytes::from(body),
            flags: header.flags,
            size,
            next_offset: offset + size,
        })
    }

    /// Turns the lease into a forward iterator starting at `start`.
    pub fn into_iter_from(self, start: u64) -> RecordIter {
        RecordIter {
            lease: Some(self),
            offset: start,
        }
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        self.entry.release(LeaseKind::Read);
    }
}

impl fmt::Debug for ReadLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLease")
            .field("entry", &self.entry.path)
            .finish()
    }
}

/// Scoped permission to write to a [`TimeEntry`].
pub struct WriteLease {
    entry: Arc<TimeEntry>,
    file: Arc<File>,
}

impl WriteLease {
    /// The leased entry.
    pub fn entry(&self) -> &Arc<TimeEntry> {
        &self.entry
    }

    /// Appends one record whose payload is the concatenation of `buffers`.
    ///
    /// `checksum` must be the CRC32 of the concatenated payload.
    ///
    /// # Errors
    ///
    /// - [`ZangetsuError::TooLarge`] if the payload is 512 KiB or more; the
    ///   file is untouched
    /// - [`ZangetsuError::IoError`] if the write fails; the reservation is
    ///   rolled back and `written_size` is unchanged
    pub fn append<B: AsRef<[u8]>>(
        &self,
        buffers: &[B],
        checksum: Checksum,
        flags: RecordFlags,
    ) -> Result<AppendOutcome> {
        let data_size: usize = buffers.iter().map(|buf| buf.as_ref().len()).sum();
        let (header, footer) = codec::encode(data_size, flags, checksum)?;
        let size = codec::record_size(data_size);

        let _serial = self
            .entry
            .append_lock
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let offset = {
            let mut state = self.entry.lock_state();
            let offset = state.data_file_size;
            state.data_file_size += size;
            offset
        };

        match self.write_record(offset, &header, buffers, &footer) {
            Ok(()) => {
                let mut state = self.entry.lock_state();
                state.written_size = offset + size;
                debug_assert!(state.written_size <= state.data_file_size);
                Ok(AppendOutcome { offset, size })
            }
            Err(err) => {
                self.entry.lock_state().data_file_size -= size;
                if let Err(truncate_err) = self.file.set_len(offset) {
                    warn!(
                        "Failed to truncate {} back to {} after failed append: {}",
                        self.entry.path.display(),
                        offset,
                        truncate_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Persists `[0, written_size)` according to the entry's sync mode.
    pub fn sync(&self) -> Result<()> {
        match self.entry.sync_mode {
            SyncMode::Fsync => self.file.sync_all()?,
            SyncMode::Fdatasync => self.file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }

    /// Advises the OS to drop cached pages for `[0, written_size)`.
    pub fn evict(&self) -> Result<()> {
        let written_size = self.entry.written_size();
        layout::evict_page_cache(&self.file, written_size)?;
        Ok(())
    }

    fn write_record<B: AsRef<[u8]>>(
        &self,
        offset: u64,
        header: &[u8],
        buffers: &[B],
        footer: &[u8],
    ) -> Result<()> {
        let mut position = offset;
        layout::write_all_at(&self.file, header, position)?;
        position += header.len() as u64;

        self.entry.take_injected_failure()?;

        for buf in buffers {
            let buf = buf.as_ref();
            layout::write_all_at(&self.file, buf, position)?;
            position += buf.len() as u64;
        }
        layout::write_all_at(&self.file, footer, position)?;
        Ok(())
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.entry.release(LeaseKind::Write);
    }
}

impl fmt::Debug for WriteLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLease")
            .field("entry", &self.entry.path)
            .finish()
    }
}

/// Forward iterator over the records of a [`TimeEntry`].
///
/// Yields `None` at the end of the written data and `Some(Err(_))` on a
/// read failure, after which it is exhausted.
#[derive(Debug)]
pub struct RecordIter {
    lease: Option<ReadLease>,
    offset: u64,
}

impl RecordIter {
    /// Offset of the next record to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Ends the iteration and releases the read lease. Idempotent.
    pub fn stop(&mut self) {
        self.lease = None;
    }

    /// Whether the iteration has ended.
    pub fn is_stopped(&self) -> bool {
        self.lease.is_none()
    }
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let lease = self.lease.as_ref()?;
        if self.offset >= lease.entry.written_size() {
            self.stop();
            return None;
        }

        match lease.read(self.offset) {
            Ok(record) => {
                self.offset = record.next_offset;
                Some(Ok(record))
            }
            Err(err) => {
                self.stop();
                Some(Err(err))
            }
        }
    }
}
