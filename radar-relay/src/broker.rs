use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::BrokerConfig,
    connection::serve_connection,
    handshake::VersionPolicy,
    http,
    registry::{ConnectionId, SessionRegistry},
    transport::Transport,
};

/// How long the HTTP listener may take to wind down after shutdown.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Broker {
    tcp: TcpListener,
    http: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let tcp = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let http = TcpListener::bind(config.http_listen)
            .await
            .with_context(|| format!("failed to bind {}", config.http_listen))?;

        Ok(Self {
            tcp,
            http,
            state: Arc::new(BrokerState::new(config)),
        })
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn state(&self) -> Arc<BrokerState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { tcp, http, state } = self;
        let http_server = tokio::spawn(http::serve(http, Arc::clone(&state)));
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = tcp.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        match timeout(HTTP_SHUTDOWN_GRACE, http_server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(error = ?err, "http listener failed"),
            Ok(Err(err)) => warn!(error = ?err, "http listener task panicked"),
            Err(_) => warn!("http listener did not stop in time"),
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &Arc<BrokerState>) {
    info!("broker shutting down");
    let closed = state.registry.close_all("broker shutting down").await;
    if closed > 0 {
        info!(sessions = closed, "closed active sessions");
    }
    state.shutdown.cancel();
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<BrokerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<BrokerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = serve_connection(Transport::tcp(stream), state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

/// State shared by every connection task of one broker.
pub struct BrokerState {
    registry: SessionRegistry,
    versions: VersionPolicy,
    config: BrokerConfig,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.max_viewers),
            versions: VersionPolicy::new(config.supported_versions.iter().copied()),
            config,
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn versions(&self) -> &VersionPolicy {
        &self.versions
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A token cancelled either by the broker shutting down or by the
    /// connection itself.
    pub(crate) fn connection_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
