//! Master/slave replication.
//!
//! # Architecture
//!
//! - [`protocol`]: JSON messages of the wire protocol
//! - [`connection`]: framing of JSON lines and raw payload bytes
//! - [`diff`]: plans the prunes and fills that bring a slave up to date
//! - [`replica_slave`]: master-side session pushing changes to one slave
//! - [`commands`]: applies commands to a database (the slave side)
//! - [`master_link`]: slave-side connection loop with reconnects
//!
//! Replication is push-based. The master asks the slave for its table of
//! contents, prunes what the slave has and the master does not, appends the
//! records the slave is missing, and then forwards every mutation as it
//! happens. The slave never initiates anything beyond the handshake.
//!
//! # Example
//!
//! ```rust,ignore
//! use zangetsu::replication::MasterLink;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let link = MasterLink::new(slave_db, "master.local:6420", ReplicationConfig::default());
//! tokio::spawn(link.run(shutdown_rx));
//! ```

pub mod commands;
pub mod connection;
pub mod diff;
pub mod master_link;
pub mod protocol;
pub mod replica_slave;

pub use commands::CommandProcessor;
pub use connection::Connection;
pub use diff::{plan_synchronization, PlannedWork};
pub use master_link::MasterLink;
pub use protocol::{
    AddResult, Command, HandshakeReply, Identify, Reply, Role, ServerHello, Status,
    PROTOCOL_MAJOR, PROTOCOL_MINOR, REPLICA_SLAVE_IDENTITY,
};
pub use replica_slave::{ReplicaSlave, ReplicaState};
