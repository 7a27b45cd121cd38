//! Zangetsu - Time-Partitioned Append-Only Storage Engine
//!
//! This crate stores opaque binary records in per-day partitions of named
//! groups and replicates them from a master to any number of slaves.
//!
//! # Components
//!
//! - [`Database`]: groups, the quiescence lock, sync-and-evict, mutation events
//! - [`storage::TimeEntry`]: one append-only data file with leased access
//! - [`record`]: the checksummed on-disk record framing
//! - [`replication`]: push replication to slaves and the slave-side link
//! - [`server::Server`]: TCP front end for clients and replica slaves
//!
//! # Example
//!
//! ```rust,ignore
//! use zangetsu::{Database, DatabaseConfig, ReplicationConfig};
//! use zangetsu::server::Server;
//!
//! let db = Database::open("/var/lib/zangetsu", DatabaseConfig::default())?;
//! db.start();
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = Server::bind(("0.0.0.0", 6420), db.clone(), ReplicationConfig::default()).await?;
//! tokio::spawn(server.serve(shutdown_rx));
//!
//! // ...
//!
//! shutdown_tx.send(true)?;
//! db.close().await?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod database;
pub mod error;
pub mod record;
pub mod replication;
pub mod server;
pub mod storage;

pub use config::{DatabaseConfig, ReplicationConfig, SyncMode};
pub use database::{Database, DatabaseLock, LockMode, MutationEvent, Subscription, TableOfContents};
pub use error::{Result, ZangetsuError};
pub use record::{Checksum, RecordFlags};
pub use storage::{AppendOutcome, Record};
