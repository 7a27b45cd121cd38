//! Slave-side connection to a master.
//!
//! The slave connects, checks the master's hello, identifies itself as a
//! replica slave, and from then on executes whatever the master sends. When
//! the connection ends for any reason it waits `reconnect_delay` and starts
//! over with a full handshake; the master re-synchronizes from the slave's
//! table of contents each time.

use super::commands::CommandProcessor;
use super::connection::Connection;
use super::protocol::{
    HandshakeReply, Identify, Role, ServerHello, Status, PROTOCOL_MAJOR, REPLICA_SLAVE_IDENTITY,
};
use crate::config::ReplicationConfig;
use crate::database::Database;
use crate::error::{Result, ZangetsuError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{info, warn};

/// Keeps a slave database replicating from one master.
#[derive(Debug, Clone)]
pub struct MasterLink {
    database: Database,
    master_addr: String,
    config: ReplicationConfig,
}

impl MasterLink {
    /// Creates a link to the master at `master_addr` (`host:port`).
    pub fn new(database: Database, master_addr: impl Into<String>, config: ReplicationConfig) -> Self {
        Self {
            database,
            master_addr: master_addr.into(),
            config,
        }
    }

    /// Address of the master.
    pub fn master_addr(&self) -> &str {
        &self.master_addr
    }

    /// Replicates until `shutdown` becomes `true` or its sender is dropped,
    /// reconnecting after every disconnect.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                result = self.connect_and_replicate() => match result {
                    Ok(()) => info!("Master {} closed the connection", self.master_addr),
                    Err(err) => warn!("Replication from {} failed: {}", self.master_addr, err),
                },
                _ = shutdown.changed() => break,
            }

            info!(
                "Reconnecting to {} in {:?}",
                self.master_addr, self.config.reconnect_delay
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Stopped replicating from {}", self.master_addr);
    }

    async fn connect_and_replicate(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.master_addr).await?;
        stream.set_nodelay(true)?;
        self.replicate(stream).await
    }

    /// Runs one replication session over an established stream.
    ///
    /// # Errors
    ///
    /// [`ZangetsuError::Protocol`] if the peer is not a compatible master
    /// or rejects the slave; otherwise whatever ends command processing.
    pub async fn replicate<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut conn = Connection::new(stream);

        let hello: ServerHello = conn
            .receive()
            .await?
            .ok_or_else(|| ZangetsuError::Protocol("master closed before its hello".into()))?;
        if hello.protocol_major != PROTOCOL_MAJOR {
            return Err(ZangetsuError::Protocol(format!(
                "unsupported protocol version {}.{}",
                hello.protocol_major, hello.protocol_minor
            )));
        }
        if hello.role != Role::Master {
            return Err(ZangetsuError::Protocol(format!(
                "{} is not a master",
                hello.server_name
            )));
        }

        conn.send(&Identify {
            identity: REPLICA_SLAVE_IDENTITY.to_string(),
        })
        .await?;
        conn.flush().await?;

        let reply: HandshakeReply = conn
            .receive()
            .await?
            .ok_or_else(|| ZangetsuError::Protocol("master closed during handshake".into()))?;
        if reply.status != Status::Ok {
            return Err(ZangetsuError::Protocol(format!(
                "master rejected replica: {}",
                reply.message.as_deref().unwrap_or("no message")
            )));
        }

        info!(
            "Replicating from {} ({})",
            self.master_addr, hello.server_name
        );
        CommandProcessor::new(self.database.clone())
            .serve(&mut conn)
            .await
    }
}
