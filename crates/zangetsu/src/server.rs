//! TCP front end.
//!
//! Every connection starts with a [`ServerHello`]. The client answers with
//! an [`Identify`]: replica slaves get a [`ReplicaSlave`] session, any other
//! client gets a [`CommandProcessor`].

use crate::config::ReplicationConfig;
use crate::database::Database;
use crate::error::{Result, ZangetsuError};
use crate::replication::{
    CommandProcessor, Connection, HandshakeReply, Identify, ReplicaSlave, Role, ServerHello,
    Status, PROTOCOL_MAJOR, PROTOCOL_MINOR, REPLICA_SLAVE_IDENTITY,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Accepts clients and replica slaves for one [`Database`].
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
}

impl Server {
    /// Binds a listener. The server announces itself as a master.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        database: Database,
        config: ReplicationConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(ConnectionHandler::new(database, config, Role::Master)),
        })
    }

    /// Sets the announced role. A slave server does not accept replica
    /// slaves of its own.
    pub fn with_role(mut self, role: Role) -> Self {
        let handler = ConnectionHandler::new(
            self.handler.database.clone(),
            self.handler.config.clone(),
            role,
        );
        self.handler = Arc::new(handler);
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` becomes `true` or its sender is
    /// dropped. Open connections are aborted on shutdown.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        let mut connections = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("Accept failed: {}", err);
                            continue;
                        }
                    };
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!("Cannot set TCP_NODELAY for {}: {}", peer, err);
                    }
                    let handler = Arc::clone(&self.handler);
                    connections.spawn(async move {
                        if let Err(err) = handler.handle(stream).await {
                            warn!("Connection from {} ended: {}", peer, err);
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        connections.shutdown().await;
        info!("Server stopped");
        Ok(())
    }
}

/// Runs the handshake and dispatches one connection.
#[derive(Debug)]
pub struct ConnectionHandler {
    database: Database,
    config: ReplicationConfig,
    role: Role,
    next_id: AtomicU64,
}

impl ConnectionHandler {
    /// Creates a handler announcing `role`.
    pub fn new(database: Database, config: ReplicationConfig, role: Role) -> Self {
        Self {
            database,
            config,
            role,
            next_id: AtomicU64::new(0),
        }
    }

    /// Serves one connection to completion.
    pub async fn handle<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut conn = Connection::new(stream);

        conn.send(&ServerHello {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            server_name: self.config.server_name.clone(),
            role: self.role,
        })
        .await?;
        conn.flush().await?;

        let Some(identify) = conn.receive::<Identify>().await? else {
            debug!("Connection {} closed before identifying", id);
            return Ok(());
        };

        if identify.identity == REPLICA_SLAVE_IDENTITY {
            if self.role != Role::Master {
                conn.send(&HandshakeReply {
                    status: Status::Error,
                    your_role: None,
                    my_role: Some(self.role),
                    message: Some("this server is not a master".into()),
                })
                .await?;
                conn.flush().await?;
                return Err(ZangetsuError::Protocol(
                    "replica slave connected to a non-master".into(),
                ));
            }

            conn.send(&HandshakeReply {
                status: Status::Ok,
                your_role: Some(Role::Slave),
                my_role: Some(Role::Master),
                message: None,
            })
            .await?;
            conn.flush().await?;
            info!("Replica {} connected", id);
            return ReplicaSlave::new(id, self.database.clone(), conn, self.config.clone())
                .run()
                .await;
        }

        conn.send(&HandshakeReply {
            status: Status::Ok,
            your_role: None,
            my_role: Some(self.role),
            message: None,
        })
        .await?;
        conn.flush().await?;
        debug!("Client {} connected as {:?}", id, identify.identity);
        CommandProcessor::new(self.database.clone())
            .serve(&mut conn)
            .await
    }
}
