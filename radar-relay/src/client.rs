//! Viewer-side client.
//!
//! [`SubscriberClient`] walks the [`ClientState`] machine: open the transport,
//! negotiate the protocol version, attach to a session, then hand every
//! received state to a [`RadarFeed`]. The presentation layer watches the
//! state through [`SubscriberClient::watch_state`], the session's audience
//! through [`SubscriberClient::watch_view_count`], and drains the feed.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    select,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cli::SubscribeArgs,
    handshake::{ClientState, PROTOCOL_VERSION, interpret_reply},
    message::{ClientMessage, HandshakeMessage, ServerMessage, WireMessage, decode, encode},
    radar::RadarState,
    transport::{Endpoint, FrameSink, FrameStream, Transport},
};

/// Default number of undelivered states a [`RadarFeed`] buffers.
pub const DEFAULT_FEED_CAPACITY: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("client was already started (state: {0})")]
    AlreadyStarted(ClientState),
}

pub struct SubscriberClient {
    endpoint: Endpoint,
    state: Arc<watch::Sender<ClientState>>,
    viewers: Arc<watch::Sender<usize>>,
    closer: CancellationToken,
}

impl SubscriberClient {
    pub fn new(endpoint: Endpoint) -> Self {
        let (state, _) = watch::channel(ClientState::New);
        let (viewers, _) = watch::channel(0);
        Self {
            endpoint,
            state: Arc::new(state),
            viewers: Arc::new(viewers),
            closer: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Viewers attached to the session, as last reported by the broker.
    pub fn view_count(&self) -> usize {
        *self.viewers.borrow()
    }

    pub fn watch_view_count(&self) -> watch::Receiver<usize> {
        self.viewers.subscribe()
    }

    /// Starts the connection driver on the current Tokio runtime and returns
    /// the feed of received states. A client connects at most once.
    pub fn connect(&self, session_id: impl Into<String>) -> Result<RadarFeed, ClientError> {
        if !advance(&self.state, ClientState::Connecting) {
            return Err(ClientError::AlreadyStarted(self.state()));
        }

        let (updates, feed) = mpsc::channel(DEFAULT_FEED_CAPACITY);
        let driver = Driver {
            endpoint: self.endpoint.clone(),
            session_id: session_id.into(),
            state: Arc::clone(&self.state),
            viewers: Arc::clone(&self.viewers),
            closer: self.closer.clone(),
            updates,
        };
        tokio::spawn(driver.run());

        Ok(RadarFeed { updates: feed })
    }

    /// Tears the connection down. Calling it again, or on a client that
    /// already failed, does nothing.
    pub fn close(&self) {
        self.closer.cancel();
        advance(&self.state, ClientState::Disconnected);
    }
}

impl Drop for SubscriberClient {
    fn drop(&mut self) {
        self.closer.cancel();
    }
}

/// Radar states received from the broker, oldest first. Dropping the feed
/// detaches the client from its session.
#[derive(Debug)]
pub struct RadarFeed {
    updates: mpsc::Receiver<Arc<RadarState>>,
}

impl RadarFeed {
    /// The next state, or `None` once the client has stopped.
    pub async fn recv(&mut self) -> Option<Arc<RadarState>> {
        self.updates.recv().await
    }
}

impl Stream for RadarFeed {
    type Item = Arc<RadarState>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

fn advance(state: &watch::Sender<ClientState>, next: ClientState) -> bool {
    let label = next.to_string();
    let changed = state.send_if_modified(|current| current.transition(next));
    if changed {
        debug!(state = %label, "client state changed");
    }
    changed
}

/// Why the session loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    SessionClosed,
    FeedDropped,
    Cancelled,
}

struct Driver {
    endpoint: Endpoint,
    session_id: String,
    state: Arc<watch::Sender<ClientState>>,
    viewers: Arc<watch::Sender<usize>>,
    closer: CancellationToken,
    updates: mpsc::Sender<Arc<RadarState>>,
}

impl Driver {
    async fn run(self) {
        let opened = select! {
            _ = self.closer.cancelled() => return,
            opened = self.endpoint.open() => opened,
        };
        let Transport {
            mut frames,
            mut sink,
            ..
        } = match opened {
            Ok(transport) => transport,
            Err(err) => {
                self.fail(format!("failed to connect to {}: {err}", self.endpoint));
                return;
            }
        };

        if !advance(&self.state, ClientState::Handshaking) {
            let _ = sink.close().await;
            return;
        }

        match self.session(&mut frames, &mut sink).await {
            Ok(Exit::SessionClosed) => {
                info!(session = %self.session_id, "session closed by publisher");
                advance(&self.state, ClientState::Disconnected);
            }
            Ok(exit) => {
                debug!(?exit, "leaving session");
                let _ = send(&mut sink, &ClientMessage::Disconnect {
                    reason: "viewer closed".to_string(),
                })
                .await;
                advance(&self.state, ClientState::Disconnected);
            }
            Err(reason) => self.fail(reason),
        }

        if let Err(err) = sink.close().await {
            debug!(error = ?err, "failed to close transport cleanly");
        }
    }

    async fn session(&self, frames: &mut FrameStream, sink: &mut FrameSink) -> Result<Exit, String> {
        send(sink, &HandshakeMessage::RequestInitialize {
            client_version: PROTOCOL_VERSION,
        })
        .await?;

        loop {
            let frame = select! {
                _ = self.closer.cancelled() => return Ok(Exit::Cancelled),
                _ = self.updates.closed() => return Ok(Exit::FeedDropped),
                frame = frames.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(format!("transport error: {err}")),
                None => return Err("connection closed by server".to_string()),
            };

            let current = self.state.borrow().clone();
            match current {
                ClientState::Handshaking => {
                    let version = interpret_reply(&frame)?;
                    debug!(version, "handshake accepted");
                    if !advance(&self.state, ClientState::Initializing) {
                        return Ok(Exit::Cancelled);
                    }
                    send(sink, &ClientMessage::InitializeSubscribe {
                        session_id: self.session_id.clone(),
                    })
                    .await?;
                }
                ClientState::Initializing | ClientState::Connected => {
                    if let Some(exit) = self.handle_session_frame(&frame)? {
                        return Ok(exit);
                    }
                }
                _ => return Ok(Exit::Cancelled),
            }
        }
    }

    fn handle_session_frame(&self, frame: &str) -> Result<Option<Exit>, String> {
        let message = match decode::<ServerMessage>(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring undecodable frame");
                return Ok(None);
            }
        };

        match message {
            ServerMessage::ResponseSubscribeSuccess {} => {
                info!(session = %self.session_id, "subscribed");
                if !advance(&self.state, ClientState::Connected) {
                    return Ok(Some(Exit::Cancelled));
                }
            }
            ServerMessage::NotifyRadarState { state } => {
                let state = match state.to_state() {
                    Ok(state) => Arc::new(state),
                    Err(err) => {
                        warn!(error = %err, "ignoring unreadable radar state");
                        return Ok(None);
                    }
                };
                match self.updates.try_send(state) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("radar feed full, dropping state");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return Ok(Some(Exit::FeedDropped));
                    }
                }
            }
            ServerMessage::NotifyViewCount { viewers } => {
                debug!(viewers, "view count changed");
                self.viewers.send_replace(viewers);
            }
            ServerMessage::NotifySessionClosed {} => return Ok(Some(Exit::SessionClosed)),
            ServerMessage::ResponseSessionInvalidId {} => {
                return Err("session does not exist".to_string());
            }
            ServerMessage::ResponseInvalidClientState {} => {
                return Err("broker rejected the subscribe request as out of order".to_string());
            }
            ServerMessage::ResponseError { error } => return Err(error),
            other => debug!(kind = other.kind(), "ignoring message"),
        }
        Ok(None)
    }

    fn fail(&self, reason: String) {
        warn!(session = %self.session_id, %reason, "viewer connection failed");
        advance(&self.state, ClientState::failed(reason));
    }
}

async fn send<T: WireMessage>(sink: &mut FrameSink, message: &T) -> Result<(), String> {
    let frame = encode(message).map_err(|err| err.to_string())?;
    sink.send(frame)
        .await
        .map_err(|err| format!("failed to send `{}`: {err}", message.kind()))
}

/// Runs the `subscribe` subcommand: prints each received state as one JSON
/// line on stdout until the session ends or ctrl-c is pressed.
pub async fn run(args: SubscribeArgs) -> anyhow::Result<()> {
    let client = SubscriberClient::new(args.endpoint);
    let mut feed = client.connect(args.session)?;
    let mut states = client.watch_state();

    loop {
        select! {
            update = feed.recv() => match update {
                Some(state) => write_stdout(&serde_json::to_string(&*state)?).await?,
                None => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!(%state, "viewer state");
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                client.close();
                break;
            }
        }
    }

    match client.state() {
        ClientState::Failed { reason } => anyhow::bail!(reason),
        _ => Ok(()),
    }
}

async fn write_stdout(line: &str) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
