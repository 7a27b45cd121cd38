//! Master-side replication session for one connected slave.
//!
//! # Architecture
//!
//! A session walks through these states:
//!
//! - `BackgroundSynchronizing`: fetch the slave's table of contents, then
//!   repeatedly diff it against the local one and process the resulting
//!   prunes and fills until a diff comes back empty. Adds keep running.
//! - `LockedSynchronizing`: take the database lock, subscribe to mutation
//!   events, and run one more diff. With adds held back, this brings the
//!   slave fully up to date. A `ping` confirms the slave processed
//!   everything before the lock is released.
//! - `Ready`: forward every mutation event as it happens.
//! - `Disconnected`: terminal. Reached on peer close or any failure.
//!
//! Work is a FIFO queue of prunes and fills. A fill holds a read lease on
//! its partition, so a queued fill keeps the partition readable until it
//! is processed or the session ends.
//!
//! Each record is sent as `add` + payload + `results`, and the slave's
//! partition size is advanced only after it confirms the record. Events
//! from concurrent adds may arrive out of order; a record that does not
//! start exactly at the slave's size is not sent from the event but
//! streamed from the partition file instead.

use super::connection::Connection;
use super::diff::{plan_synchronization, PlannedWork};
use super::protocol::{Command, Reply, Status};
use crate::config::ReplicationConfig;
use crate::database::{Database, MutationEvent, TableOfContents};
use crate::error::{Result, ZangetsuError};
use crate::record::RecordFlags;
use crate::storage::layout::day_start;
use crate::storage::{ReadLease, Record, RecordIter};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`ReplicaSlave`] session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Created, not yet running.
    Uninitialized,
    /// Catching up while adds continue.
    BackgroundSynchronizing,
    /// Catching up under the database lock.
    LockedSynchronizing,
    /// Forwarding mutations as they happen.
    Ready,
    /// Session ended.
    Disconnected,
}

enum FillSource {
    /// Read records from the partition file, starting at the slave's size.
    Stream,
    /// Send one record carried by an `Added` event.
    Record {
        offset: u64,
        size: u64,
        data: Bytes,
        flags: RecordFlags,
    },
}

enum WorkItem {
    Prune {
        group: String,
        day: Option<u64>,
    },
    Fill {
        group: String,
        day: u64,
        lease: ReadLease,
        source: FillSource,
    },
}

enum Wake {
    Event(Option<MutationEvent>),
    Closed(Result<()>),
}

/// Replicates a [`Database`] to one slave over `S`.
pub struct ReplicaSlave<S> {
    id: u64,
    database: Database,
    config: ReplicationConfig,
    conn: Connection<S>,
    remote: TableOfContents,
    queue: VecDeque<WorkItem>,
    state: watch::Sender<ReplicaState>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicaSlave<S> {
    /// Creates a session over a connection whose handshake already
    /// completed.
    pub fn new(id: u64, database: Database, conn: Connection<S>, config: ReplicationConfig) -> Self {
        let (state, _) = watch::channel(ReplicaState::Uninitialized);
        Self {
            id,
            database,
            config,
            conn,
            remote: TableOfContents::new(),
            queue: VecDeque::new(),
            state,
        }
    }

    /// Session id used in log messages.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ReplicaState {
        *self.state.borrow()
    }

    /// Observes state changes. Keeps working after [`run`](Self::run)
    /// consumed the session.
    pub fn watch_state(&self) -> watch::Receiver<ReplicaState> {
        self.state.subscribe()
    }

    /// Runs the session until the slave disconnects or a step fails.
    ///
    /// On return all queued work is dropped, releasing its leases, and the
    /// event subscription is gone.
    ///
    /// # Errors
    ///
    /// - [`ZangetsuError::Protocol`] on an error reply or unexpected message
    /// - [`ZangetsuError::Timeout`] if the slave stops replying
    /// - [`ZangetsuError::InvariantViolation`] if the slave is still behind
    ///   after locked synchronization
    pub async fn run(mut self) -> Result<()> {
        let result = self.replicate().await;
        self.queue.clear();
        self.set_state(ReplicaState::Disconnected);
        match &result {
            Ok(()) => info!("Replica {} disconnected", self.id),
            Err(err) => error!("Replica {} session aborted: {}", self.id, err),
        }
        result
    }

    async fn replicate(&mut self) -> Result<()> {
        self.set_state(ReplicaState::BackgroundSynchronizing);
        self.remote = self.request(&Command::GetToc).await?;
        info!(
            "Replica {} has {} partitions",
            self.id,
            self.remote.partitions().count()
        );

        loop {
            self.schedule_synchronization();
            if self.queue.is_empty() {
                break;
            }
            self.process_queue().await?;
        }

        self.set_state(ReplicaState::LockedSynchronizing);
        let lock = self.database.lock().await?;
        let mut events = self.database.subscribe();
        self.schedule_synchronization();
        self.process_queue().await?;
        self.verify_synchronized()?;
        self.expect_ok(&Command::Ping { sleep: None }).await?;
        self.set_state(ReplicaState::Ready);
        lock.unlock();
        info!("Replica {} is in sync", self.id);

        loop {
            let wake = tokio::select! {
                event = events.recv() => Wake::Event(event),
                closed = self.conn.wait_for_eof() => Wake::Closed(closed),
            };
            match wake {
                Wake::Event(Some(event)) => self.schedule_event(event),
                Wake::Event(None) => return Ok(()),
                Wake::Closed(result) => return result,
            }
            while let Some(event) = events.try_recv() {
                self.schedule_event(event);
            }
            self.process_queue().await?;
        }
    }

    fn set_state(&self, state: ReplicaState) {
        debug!("Replica {} -> {:?}", self.id, state);
        self.state.send_replace(state);
    }

    fn lease(&self, group: &str, day: u64) -> Option<ReadLease> {
        self.database.find_time_entry(group, day)?.read_lease().ok()
    }

    fn schedule_synchronization(&mut self) {
        let local = self.database.to_table_of_contents();
        for work in plan_synchronization(&local, &self.remote) {
            match work {
                PlannedWork::Prune { group, day } => {
                    self.queue.push_back(WorkItem::Prune { group, day });
                }
                PlannedWork::Fill { group, day } => match self.lease(&group, day) {
                    Some(lease) => self.queue.push_back(WorkItem::Fill {
                        group,
                        day,
                        lease,
                        source: FillSource::Stream,
                    }),
                    None => debug!("Skipping fill of {}/{}: partition is gone", group, day),
                },
            }
        }
    }

    fn schedule_event(&mut self, event: MutationEvent) {
        match event {
            MutationEvent::Adding { .. } => {}
            MutationEvent::Added {
                group,
                day,
                offset,
                size,
                data,
                flags,
            } => match self.lease(&group, day) {
                Some(lease) => self.queue.push_back(WorkItem::Fill {
                    group,
                    day,
                    lease,
                    source: FillSource::Record {
                        offset,
                        size,
                        data,
                        flags,
                    },
                }),
                None => debug!("Dropping add to {}/{}: partition is gone", group, day),
            },
            MutationEvent::Removed { group, day } => {
                self.queue.push_back(WorkItem::Prune { group, day });
            }
        }
    }

    fn verify_synchronized(&self) -> Result<()> {
        let local = self.database.to_table_of_contents();
        let pending = plan_synchronization(&local, &self.remote);
        if let Some(fill) = pending.iter().find(|work| work.is_fill()) {
            return Err(ZangetsuError::InvariantViolation(format!(
                "replica {} still behind after locked synchronization: {:?}",
                self.id, fill
            )));
        }
        if !pending.is_empty() {
            // Removals that raced the locked diff; their events are queued.
            debug!("Replica {}: {} prunes left to events", self.id, pending.len());
        }
        Ok(())
    }

    async fn process_queue(&mut self) -> Result<()> {
        while let Some(item) = self.queue.pop_front() {
            self.process(item).await?;
        }
        Ok(())
    }

    async fn process(&mut self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Prune { group, day } => self.prune(&group, day).await,
            WorkItem::Fill {
                group,
                day,
                lease,
                source: FillSource::Stream,
            } => self.fill(&group, day, lease).await,
            WorkItem::Fill {
                group,
                day,
                lease,
                source:
                    FillSource::Record {
                        offset,
                        size,
                        data,
                        flags,
                    },
            } => {
                let remote_size = self.remote.size(&group, day).unwrap_or(0);
                if offset + size <= remote_size {
                    debug!(
                        "Replica {} already has {}/{} at {}",
                        self.id, group, day, offset
                    );
                    Ok(())
                } else if offset == remote_size {
                    self.send_record(&group, day, &data, flags, size).await
                } else {
                    self.fill(&group, day, lease).await
                }
            }
        }
    }

    async fn prune(&mut self, group: &str, day: Option<u64>) -> Result<()> {
        let command = match day {
            None => Command::Remove {
                group: group.to_string(),
                timestamp: None,
            },
            Some(day) => Command::RemoveOne {
                group: group.to_string(),
                day_timestamp: day,
            },
        };
        self.expect_ok(&command).await?;

        match day {
            None => {
                self.remote.remove_group(group);
                debug!("Replica {}: pruned {}", self.id, group);
            }
            Some(day) => {
                self.remote.remove_partition(group, day);
                debug!("Replica {}: pruned {}/{}", self.id, group, day);
            }
        }
        Ok(())
    }

    /// Streams every record past the slave's size. If that size is not a
    /// record boundary the slave's partition is pruned and refilled.
    async fn fill(&mut self, group: &str, day: u64, lease: ReadLease) -> Result<()> {
        let entry = Arc::clone(lease.entry());
        let mut start = self.remote.size(group, day).unwrap_or(0);
        let mut records = lease.into_iter_from(start);
        let mut sent = 0usize;

        loop {
            let (next, rest) = next_record(records).await?;
            records = rest;
            match next {
                None => break,
                Some(Ok(record)) => {
                    self.send_record(group, day, &record.data, record.flags, record.size)
                        .await?;
                    sent += 1;
                }
                Some(Err(err)) if sent == 0 && start > 0 && is_misaligned(&err) => {
                    warn!(
                        "Replica {}: size {} of {}/{} is not a record boundary ({}), refilling",
                        self.id, start, group, day, err
                    );
                    self.prune(group, Some(day)).await?;
                    start = 0;
                    match entry.read_lease() {
                        Ok(lease) => records = lease.into_iter_from(0),
                        Err(_) => return Ok(()),
                    }
                }
                Some(Err(err)) => return Err(err),
            }
        }

        if sent > 0 {
            debug!(
                "Replica {}: sent {} records of {}/{}",
                self.id, sent, group, day
            );
        }
        Ok(())
    }

    async fn send_record(
        &mut self,
        group: &str,
        day: u64,
        data: &[u8],
        flags: RecordFlags,
        size: u64,
    ) -> Result<()> {
        let remote_size = self.remote.size(group, day).unwrap_or(0);

        let add = Command::add(group, day_start(day), data.len() as u64, 0, flags);
        let reply: Reply = self
            .exchange(Some((&add, data)), &Command::Results { discard: false })
            .await?;
        check_reply(&reply)?;

        if let Some(result) = reply.results.as_ref().and_then(|results| results.get(&0)) {
            if result.status != Status::Ok {
                return Err(ZangetsuError::Protocol(format!(
                    "replica failed to store record for {}/{}: {}",
                    group,
                    day,
                    result.message.as_deref().unwrap_or("no message")
                )));
            }
            if let Some(offset) = result.offset.filter(|&offset| offset != remote_size) {
                return Err(ZangetsuError::Protocol(format!(
                    "replica stored record for {}/{} at {}, expected {}",
                    group, day, offset, remote_size
                )));
            }
        }

        self.remote.insert(group, day, remote_size + size);
        Ok(())
    }

    async fn expect_ok(&mut self, command: &Command) -> Result<()> {
        let reply: Reply = self.request(command).await?;
        check_reply(&reply)
    }

    async fn request<T: DeserializeOwned>(&mut self, command: &Command) -> Result<T> {
        self.exchange(None, command).await
    }

    /// Writes an optional `add` with its payload, then `command`, and reads
    /// the reply. The reply timeout bounds the writes as well as the read.
    async fn exchange<T: DeserializeOwned>(
        &mut self,
        record: Option<(&Command, &[u8])>,
        command: &Command,
    ) -> Result<T> {
        let conn = &mut self.conn;
        let round_trip = async move {
            if let Some((add, data)) = record {
                conn.send(add).await?;
                conn.send_bytes(data).await?;
            }
            conn.send(command).await?;
            conn.flush().await?;
            conn.receive::<T>().await
        };

        match tokio::time::timeout(self.config.reply_timeout, round_trip).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(ZangetsuError::Protocol(
                "replica closed the connection".into(),
            )),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ZangetsuError::Timeout(format!(
                "replica {} did not reply within {:?}",
                self.id, self.config.reply_timeout
            ))),
        }
    }
}

fn check_reply(reply: &Reply) -> Result<()> {
    if reply.is_ok() {
        return Ok(());
    }
    Err(ZangetsuError::Protocol(format!(
        "replica replied with an error: {}",
        reply.message.as_deref().unwrap_or("no message")
    )))
}

fn is_misaligned(err: &ZangetsuError) -> bool {
    matches!(
        err,
        ZangetsuError::CorruptedRecord(_) | ZangetsuError::InvalidOffset { .. }
    )
}

async fn next_record(mut records: RecordIter) -> Result<(Option<Result<Record>>, RecordIter)> {
    tokio::task::spawn_blocking(move || {
        let next = records.next();
        (next, records)
    })
    .await
    .map_err(|err| ZangetsuError::InvariantViolation(format!("read task failed: {}", err)))
}
