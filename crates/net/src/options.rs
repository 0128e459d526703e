//! Client options and their defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::events::DiagnosticLevel;

/// Default deadline for bounded waits.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default watchdog window for socket reads.
pub const DEFAULT_READ_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Default watchdog window for messages from the distributed parent.
pub const DEFAULT_DISTRIBUTED_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between distributed status broadcasts.
pub const DEFAULT_STATUS_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Default cap on distinct peer message connections.
pub const DEFAULT_CONCURRENT_PEER_MESSAGE_CONNECTIONS: usize = 500;

/// Default cap on child distributed connections.
pub const DEFAULT_CONCURRENT_DISTRIBUTED_CHILDREN: usize = 25;

/// Tunable behavior of the client core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Default deadline for bounded waits.
    pub message_timeout: Duration,

    /// Cap on distinct peer message connections.
    pub concurrent_peer_message_connections: usize,

    /// Cap on child distributed connections.
    pub concurrent_distributed_children: usize,

    /// Deadline for establishing a TCP connection.
    pub connect_timeout: Duration,

    /// A socket is force-disconnected when a pending read sees no bytes for
    /// this long.
    pub read_inactivity_timeout: Duration,

    /// The distributed parent is dropped when it stays silent for this long.
    pub distributed_inactivity_timeout: Duration,

    /// Interval between distributed status broadcasts.
    pub status_broadcast_interval: Duration,

    /// Port the listener binds; `0` picks an ephemeral port.
    pub listen_port: u16,

    /// Reply to private messages automatically.
    pub auto_acknowledge_private_messages: bool,

    /// Diagnostics below this level are dropped.
    pub minimum_diagnostic_level: DiagnosticLevel,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            concurrent_peer_message_connections: DEFAULT_CONCURRENT_PEER_MESSAGE_CONNECTIONS,
            concurrent_distributed_children: DEFAULT_CONCURRENT_DISTRIBUTED_CHILDREN,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_inactivity_timeout: DEFAULT_READ_INACTIVITY_TIMEOUT,
            distributed_inactivity_timeout: DEFAULT_DISTRIBUTED_INACTIVITY_TIMEOUT,
            status_broadcast_interval: DEFAULT_STATUS_BROADCAST_INTERVAL,
            listen_port: 2234,
            auto_acknowledge_private_messages: true,
            minimum_diagnostic_level: DiagnosticLevel::Info,
        }
    }
}
