use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{config::BrokerConfig, transport::Endpoint};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the session broker.
    Broker(BrokerArgs),
    /// Attach to a session and print every radar state as a JSON line.
    Subscribe(SubscribeArgs),
    /// Create a session and feed it synthetic radar states.
    PublishDemo(PublishArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Address for newline-delimited JSON clients. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7228")]
    pub listen: SocketAddr,

    /// Address for WebSocket clients (`/publish`, `/subscribe`) and `/health`.
    #[arg(long, default_value = "127.0.0.1:7229")]
    pub http_listen: SocketAddr,

    /// Protocol version to accept. Repeat to accept several.
    #[arg(long = "supported-version", default_values_t = [1u32, 2])]
    pub supported_versions: Vec<u32>,

    /// Seconds a new connection may take to complete the handshake.
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Frames buffered per connection before deliveries are dropped.
    #[arg(long, default_value_t = 64)]
    pub queue_capacity: usize,

    /// Maximum viewers per session. Unlimited when omitted.
    #[arg(long)]
    pub max_viewers: Option<usize>,
}

impl From<BrokerArgs> for BrokerConfig {
    fn from(args: BrokerArgs) -> Self {
        Self {
            listen: args.listen,
            http_listen: args.http_listen,
            supported_versions: args.supported_versions,
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            queue_capacity: args.queue_capacity,
            max_viewers: args.max_viewers,
            ..Self::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SubscribeArgs {
    /// Broker to connect to: `host:port` for TCP or a `ws://` URL.
    #[arg(long, default_value = "127.0.0.1:7228")]
    pub endpoint: Endpoint,

    /// Session to watch.
    #[arg(long)]
    pub session: String,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    /// Broker to connect to: `host:port` for TCP or a `ws://` URL.
    #[arg(long, default_value = "127.0.0.1:7228")]
    pub endpoint: Endpoint,

    /// Map name reported in every state.
    #[arg(long, default_value = "de_dust2")]
    pub world: String,

    /// Number of synthetic players.
    #[arg(long, default_value_t = 5)]
    pub players: usize,

    /// Milliseconds between states.
    #[arg(long, default_value_t = 50)]
    pub interval_ms: u64,
}
