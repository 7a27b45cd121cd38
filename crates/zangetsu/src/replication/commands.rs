//! Applies protocol commands to a local database.
//!
//! This is the receiving end of replication and of the plain client
//! protocol. `add` results are not replied to individually: they are kept
//! under the caller's opid until a `results` command collects them.

use super::connection::Connection;
use super::protocol::{AddResult, Command, Reply};
use crate::database::Database;
use crate::error::{Result, ZangetsuError};
use crate::record::codec::MAX_DATA_SIZE;
use crate::record::{Checksum, RecordFlags};
use crate::storage::layout::day_of;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Executes commands against a [`Database`] for one connection.
#[derive(Debug)]
pub struct CommandProcessor {
    database: Database,
    results: BTreeMap<u64, AddResult>,
}

impl CommandProcessor {
    /// Creates a processor with no pending results.
    pub fn new(database: Database) -> Self {
        Self {
            database,
            results: BTreeMap::new(),
        }
    }

    /// Number of add results not yet collected.
    pub fn pending_results(&self) -> usize {
        self.results.len()
    }

    /// Serves commands until the peer closes the connection.
    ///
    /// # Errors
    ///
    /// Protocol violations and I/O failures end the loop. Failed database
    /// operations are reported to the peer and do not.
    pub async fn serve<S>(&mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(command) = conn.receive::<Command>().await? {
            self.handle(command, conn).await?;
            conn.flush().await?;
        }
        debug!("Peer closed the connection");
        Ok(())
    }

    /// Executes one command, reading its payload from and queueing its reply
    /// on `conn`. The reply is not flushed.
    pub async fn handle<S>(&mut self, command: Command, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match command {
            Command::GetToc => conn.send(&self.database.to_table_of_contents()).await,

            Command::Remove { group, timestamp } => {
                let result = self.database.remove(&group, timestamp.map(day_of));
                conn.send(&status_reply(result)).await
            }

            Command::RemoveOne {
                group,
                day_timestamp,
            } => {
                let result = self.database.remove_one(&group, day_timestamp);
                conn.send(&status_reply(result)).await
            }

            Command::Add {
                group,
                timestamp,
                size,
                opid,
                corrupted,
            } => {
                self.add(conn, &group, timestamp, size, opid, corrupted)
                    .await
            }

            Command::Results { discard } => {
                let results = std::mem::take(&mut self.results);
                let reply = if discard {
                    Reply::ok()
                } else {
                    Reply {
                        results: Some(results),
                        ..Reply::ok()
                    }
                };
                conn.send(&reply).await
            }

            Command::Get {
                group,
                timestamp,
                offset,
            } => match self.database.get(&group, day_of(timestamp), offset).await {
                Ok(record) => {
                    conn.send(&Reply {
                        size: Some(record.data.len() as u64),
                        corrupted: Some(record.is_corrupted()),
                        ..Reply::ok()
                    })
                    .await?;
                    conn.send_bytes(&record.data).await
                }
                Err(err) => {
                    conn.send(&Reply::error(format!("Cannot get requested data: {}", err)))
                        .await
                }
            },

            Command::Ping { sleep } => {
                if let Some(millis) = sleep {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                conn.send(&Reply::ok()).await
            }
        }
    }

    async fn add<S>(
        &mut self,
        conn: &mut Connection<S>,
        group: &str,
        timestamp: u64,
        size: u64,
        opid: u64,
        corrupted: bool,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if size >= MAX_DATA_SIZE as u64 {
            return Err(ZangetsuError::Protocol(format!(
                "add payload of {} bytes exceeds the maximum of {}",
                size, MAX_DATA_SIZE
            )));
        }
        let data = Bytes::from(conn.receive_bytes(size as usize).await?);

        if self.results.contains_key(&opid) {
            return Err(ZangetsuError::Protocol(format!(
                "opid {} was already used",
                opid
            )));
        }

        let day = day_of(timestamp);
        let checksum = Checksum::of(&data);
        let flags = RecordFlags::empty().with_corrupted(corrupted);
        let result = match self.database.add(group, day, vec![data], checksum, flags).await {
            Ok(outcome) => AddResult::stored(outcome.offset),
            Err(err) => {
                warn!("Add to {}/{} failed: {}", group, day, err);
                AddResult::failed(err.to_string())
            }
        };
        self.results.insert(opid, result);
        Ok(())
    }
}

fn status_reply(result: Result<()>) -> Reply {
    match result {
        Ok(()) => Reply::ok(),
        Err(err) => Reply::error(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, SyncMode};
    use crate::database::TableOfContents;
    use crate::replication::protocol::Status;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    const DAY: u64 = 18_000;
    const TIMESTAMP: u64 = DAY * 86_400 + 3_600;

    struct Harness {
        _temp_dir: TempDir,
        db: Database,
        client: Connection<DuplexStream>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    fn create_test_harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(
            temp_dir.path(),
            DatabaseConfig::default().with_sync_mode(SyncMode::None),
        )
        .unwrap();
        let (client, server) = duplex(64 * 1024);
        let mut processor = CommandProcessor::new(db.clone());
        let server = tokio::spawn(async move {
            let mut conn = Connection::new(server);
            processor.serve(&mut conn).await
        });
        Harness {
            _temp_dir: temp_dir,
            db,
            client: Connection::new(client),
            server,
        }
    }

    impl Harness {
        async fn request<T: serde::de::DeserializeOwned>(&mut self, command: &Command) -> T {
            self.client.send(command).await.unwrap();
            self.client.flush().await.unwrap();
            self.client.receive().await.unwrap().unwrap()
        }

        async fn add(&mut self, opid: u64, data: &[u8]) {
            self.client
                .send(&Command::add("logs", TIMESTAMP, data.len() as u64, opid, RecordFlags::empty()))
                .await
                .unwrap();
            self.client.send_bytes(data).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_add_then_results() {
        let mut h = create_test_harness();
        h.add(0, b"hello").await;
        h.add(1, b"world").await;

        let reply: Reply = h.request(&Command::Results { discard: false }).await;
        assert!(reply.is_ok());
        let results = reply.results.unwrap();
        assert_eq!(results[&0], AddResult::stored(0));
        assert_eq!(results[&1], AddResult::stored(34));

        let reply: Reply = h.request(&Command::Results { discard: false }).await;
        assert_eq!(reply.results.unwrap().len(), 0);

        let record = h.db.get("logs", DAY, 34).await.unwrap();
        assert_eq!(&record.data[..], b"world");
    }

    #[tokio::test]
    async fn test_corrupted_flag_stored() {
        let mut h = create_test_harness();
        h.client
            .send(&Command::add("logs", TIMESTAMP, 3, 7, RecordFlags::CORRUPTED))
            .await
            .unwrap();
        h.client.send_bytes(b"bad").await.unwrap();
        let _: Reply = h.request(&Command::Results { discard: true }).await;

        let record = h.db.get("logs", DAY, 0).await.unwrap();
        assert!(record.is_corrupted());
        assert_eq!(&record.data[..], b"bad");
    }

    #[tokio::test]
    async fn test_failed_add_reported_in_results() {
        let mut h = create_test_harness();
        h.client
            .send(&Command::add(".hidden", TIMESTAMP, 1, 0, RecordFlags::empty()))
            .await
            .unwrap();
        h.client.send_bytes(b"x").await.unwrap();

        let reply: Reply = h.request(&Command::Results { discard: false }).await;
        let results = reply.results.unwrap();
        assert_eq!(results[&0].status, Status::Error);
        assert!(h.db.to_table_of_contents().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_opid_ends_session() {
        let mut h = create_test_harness();
        h.add(3, b"a").await;
        h.add(3, b"b").await;
        h.client.flush().await.unwrap();

        let result = h.server.await.unwrap();
        assert!(matches!(result, Err(ZangetsuError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_add_ends_session() {
        let mut h = create_test_harness();
        h.client
            .send(&Command::add("logs", TIMESTAMP, MAX_DATA_SIZE as u64, 0, RecordFlags::empty()))
            .await
            .unwrap();
        h.client.flush().await.unwrap();

        let result = h.server.await.unwrap();
        assert!(matches!(result, Err(ZangetsuError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_get() {
        let mut h = create_test_harness();
        h.add(0, b"hello").await;
        let _: Reply = h.request(&Command::Results { discard: true }).await;

        let reply: Reply = h
            .request(&Command::Get {
                group: "logs".into(),
                timestamp: TIMESTAMP,
                offset: 0,
            })
            .await;
        assert_eq!(reply.size, Some(5));
        assert_eq!(reply.corrupted, Some(false));
        assert_eq!(h.client.receive_bytes(5).await.unwrap(), b"hello");

        let reply: Reply = h
            .request(&Command::Get {
                group: "logs".into(),
                timestamp: TIMESTAMP,
                offset: 3,
            })
            .await;
        assert_eq!(reply.status, Status::Error);
        assert!(reply
            .message
            .unwrap()
            .starts_with("Cannot get requested data: "));

        let reply: Reply = h
            .request(&Command::Get {
                group: "missing".into(),
                timestamp: TIMESTAMP,
                offset: 0,
            })
            .await;
        assert_eq!(reply.status, Status::Error);
    }

    #[tokio::test]
    async fn test_get_toc_and_remove() {
        let mut h = create_test_harness();
        h.add(0, b"hello").await;
        h.client
            .send(&Command::add("logs", TIMESTAMP + 86_400, 5, 1, RecordFlags::empty()))
            .await
            .unwrap();
        h.client.send_bytes(b"world").await.unwrap();
        let _: Reply = h.request(&Command::Results { discard: true }).await;

        let toc: TableOfContents = h.request(&Command::GetToc).await;
        assert_eq!(toc.size("logs", DAY), Some(34));
        assert_eq!(toc.size("logs", DAY + 1), Some(34));

        let reply: Reply = h
            .request(&Command::Remove {
                group: "logs".into(),
                timestamp: Some(TIMESTAMP),
            })
            .await;
        assert!(reply.is_ok());
        assert_eq!(h.db.to_table_of_contents().size("logs", DAY), None);

        let reply: Reply = h
            .request(&Command::RemoveOne {
                group: "logs".into(),
                day_timestamp: DAY + 1,
            })
            .await;
        assert!(reply.is_ok());
        assert!(h.db.to_table_of_contents().contains_group("logs"));

        let reply: Reply = h
            .request(&Command::Remove {
                group: "logs".into(),
                timestamp: None,
            })
            .await;
        assert!(reply.is_ok());
        assert!(h.db.to_table_of_contents().is_empty());

        let reply: Reply = h
            .request(&Command::Remove {
                group: "../x".into(),
                timestamp: None,
            })
            .await;
        assert_eq!(reply.status, Status::Error);
    }

    #[tokio::test]
    async fn test_ping() {
        let mut h = create_test_harness();
        let reply: Reply = h.request(&Command::Ping { sleep: None }).await;
        assert!(reply.is_ok());
        let reply: Reply = h.request(&Command::Ping { sleep: Some(10) }).await;
        assert!(reply.is_ok());

        drop(h.client);
        h.server.await.unwrap().unwrap();
    }
}
