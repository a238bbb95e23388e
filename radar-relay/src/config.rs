use std::{net::SocketAddr, time::Duration};

use crate::handshake::DEFAULT_SUPPORTED_VERSIONS;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7228";
pub const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:7229";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the broker needs to start. The CLI converts its arguments into
/// this; tests build it directly.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Newline-delimited JSON listener.
    pub listen: SocketAddr,
    /// HTTP listener serving the WebSocket routes and `/health`.
    pub http_listen: SocketAddr,
    pub supported_versions: Vec<u32>,
    /// How long a connection may stay in the handshake.
    pub handshake_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// How long a closing connection may spend flushing queued frames before
    /// its writer is aborted.
    pub writer_drain_timeout: Duration,
    /// Per-session viewer cap. `None` means unlimited.
    pub max_viewers: Option<usize>,
}

impl BrokerConfig {
    /// Both listeners on ephemeral loopback ports.
    pub fn local_ephemeral() -> Self {
        let any_port = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            listen: any_port,
            http_listen: any_port,
            ..Self::default()
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7228)),
            http_listen: SocketAddr::from(([127, 0, 0, 1], 7229)),
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            writer_drain_timeout: DEFAULT_WRITER_DRAIN_TIMEOUT,
            max_viewers: None,
        }
    }
}
