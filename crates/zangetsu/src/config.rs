//! Database and replication configuration.

use std::time::Duration;

/// Default TCP port for the server and for replication.
pub const DEFAULT_PORT: u16 = 6420;

/// Default unevicted byte count that triggers an early sync-and-evict (64 MiB).
pub const DEFAULT_MAX_UNEVICTED_BYTES: u64 = 64 * 1024 * 1024;

/// Default period of the sync-and-evict timer.
pub const DEFAULT_SYNC_AND_EVICT_INTERVAL: Duration = Duration::from_secs(10);

/// Default delay between reconnect attempts to a master.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default time to wait for a reply from the remote side.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Server name announced in the handshake.
pub const DEFAULT_SERVER_NAME: &str = "Zangetsu/1.0";

/// How [`TimeEntry::sync`](crate::storage::TimeEntry) persists data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `fsync`: data and metadata.
    Fsync,
    /// `fdatasync`: data, skipping metadata that is not needed to read it back.
    #[default]
    Fdatasync,
    /// No sync (testing only).
    None,
}

/// Configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Unevicted bytes after which an add triggers sync-and-evict.
    ///
    /// Default: 64 MiB.
    pub max_unevicted_bytes: u64,

    /// Period of the background sync-and-evict timer.
    ///
    /// Default: 10 seconds.
    pub sync_and_evict_interval: Duration,

    /// Durability of partition syncs.
    pub sync_mode: SyncMode,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_unevicted_bytes: DEFAULT_MAX_UNEVICTED_BYTES,
            sync_and_evict_interval: DEFAULT_SYNC_AND_EVICT_INTERVAL,
            sync_mode: SyncMode::default(),
        }
    }
}

impl DatabaseConfig {
    /// Sets the unevicted byte threshold.
    pub fn with_max_unevicted_bytes(mut self, bytes: u64) -> Self {
        self.max_unevicted_bytes = bytes;
        self
    }

    /// Sets the sync-and-evict timer period.
    pub fn with_sync_and_evict_interval(mut self, interval: Duration) -> Self {
        self.sync_and_evict_interval = interval;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }
}

/// Configuration for replication sessions and master links.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Delay before a slave reconnects to its master after a failure.
    pub reconnect_delay: Duration,
    /// Maximum wait for each reply from the remote side.
    pub reply_timeout: Duration,
    /// Name announced in the server hello.
    pub server_name: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

impl ReplicationConfig {
    /// Sets the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Sets the announced server name.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_unevicted_bytes, 64 * 1024 * 1024);
        assert_eq!(config.sync_and_evict_interval, Duration::from_secs(10));
        assert_eq!(config.sync_mode, SyncMode::Fdatasync);
    }

    #[test]
    fn test_builders() {
        let config = DatabaseConfig::default()
            .with_max_unevicted_bytes(1024)
            .with_sync_mode(SyncMode::None);
        assert_eq!(config.max_unevicted_bytes, 1024);
        assert_eq!(config.sync_mode, SyncMode::None);

        let replication = ReplicationConfig::default().with_reconnect_delay(Duration::from_millis(50));
        assert_eq!(replication.reconnect_delay, Duration::from_millis(50));
        assert_eq!(replication.server_name, "Zangetsu/1.0");
    }
}
