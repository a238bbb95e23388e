//! Per-connection protocol driver.
//!
//! Each accepted socket, TCP or WebSocket, gets one task running
//! [`serve_connection`] plus one writer task draining its outbound queue. The
//! task owns the connection's [`Role`]; the registry only ever sees a
//! [`Peer`] handle.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio::{
    select,
    time::{Instant, sleep_until, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    broker::BrokerState,
    handshake::{self, HandshakeVerdict, PROTOCOL_VERSION},
    message::{ClientMessage, DecodeError, HandshakeMessage, ServerMessage, WireMessage, decode},
    radar::RadarPayload,
    registry::{ConnectionId, Outbox, Peer, RegistryError, SessionId},
    transport::{Transport, pump},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Handshaking,
    /// Handshake done; waiting for `initialize-publish` or
    /// `initialize-subscribe`.
    Unestablished,
    Publisher { session_id: SessionId },
    Subscriber { session_id: SessionId },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub async fn serve_connection(transport: Transport, state: Arc<BrokerState>) -> Result<()> {
    let Transport {
        mut frames,
        sink,
        peer: remote,
    } = transport;

    let id = state.next_connection_id();
    let closer = state.connection_token();
    let (peer, Outbox { queued, last }) =
        Peer::channel(id, state.config().queue_capacity, closer.clone());

    let mut writer = tokio::spawn({
        let closer = closer.clone();
        async move {
            if let Err(err) = pump(sink, queued, last).await {
                debug!(connection = id, error = ?err, "writer stopped");
                closer.cancel();
            }
        }
    });

    info!(connection = id, %remote, "connection opened");
    let mut connection = Connection {
        id,
        peer,
        role: Role::Handshaking,
        version: None,
        close_reason: "connection closed".to_string(),
        state,
    };
    let deadline = Instant::now() + connection.state.config().handshake_timeout;

    let result = loop {
        select! {
            _ = closer.cancelled() => break Ok(()),
            _ = sleep_until(deadline), if connection.role == Role::Handshaking => {
                warn!(connection = id, %remote, "handshake timed out");
                break Ok(());
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if connection.handle_frame(&frame).await == Flow::Close {
                        break Ok(());
                    }
                }
                Some(Err(err)) => break Err(anyhow::Error::new(err).context("failed to read frame")),
                None => break Ok(()),
            },
        }
    };

    let drain_timeout = connection.state.config().writer_drain_timeout;
    connection.release().await;
    info!(connection = id, %remote, reason = %connection.close_reason, "connection closed");
    drop(connection);

    // A peer that stopped reading keeps the writer parked in `send`.
    if timeout(drain_timeout, &mut writer).await.is_err() {
        warn!(connection = id, "gave up flushing outbound frames");
        writer.abort();
    }

    result
}

struct Connection {
    id: ConnectionId,
    peer: Peer,
    role: Role,
    version: Option<u32>,
    close_reason: String,
    state: Arc<BrokerState>,
}

impl Connection {
    async fn handle_frame(&mut self, frame: &str) -> Flow {
        if self.role == Role::Handshaking {
            self.handle_handshake(frame)
        } else {
            self.handle_command(frame).await
        }
    }

    fn handle_handshake(&mut self, frame: &str) -> Flow {
        let policy = self.state.versions();
        let verdict = handshake::evaluate(policy, frame);
        if let Some(reply) = verdict.reply(policy) {
            self.peer.send(&reply);
        }

        match &verdict {
            HandshakeVerdict::Accept { version } => {
                debug!(connection = self.id, version, "handshake accepted");
                self.version = Some(*version);
                self.role = Role::Unestablished;
            }
            HandshakeVerdict::Incompatible { requested } => {
                info!(
                    connection = self.id,
                    requested,
                    supported = ?policy.supported(),
                    "incompatible protocol version"
                );
                self.close_reason = format!("incompatible protocol version {requested}");
            }
            HandshakeVerdict::Invalid { message } => {
                warn!(connection = self.id, %message, "invalid handshake");
                self.close_reason = message.clone();
            }
            HandshakeVerdict::PrematureCommand { kind } => {
                debug!(connection = self.id, %kind, "command received before handshake");
                self.peer.send(&ServerMessage::ResponseInvalidClientState {});
            }
        }

        if verdict.is_fatal() {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    async fn handle_command(&mut self, frame: &str) -> Flow {
        let message = match decode::<ClientMessage>(frame) {
            Ok(message) => message,
            Err(DecodeError::UnknownMessageType(kind))
                if HandshakeMessage::TYPES.contains(&kind.as_str()) =>
            {
                debug!(connection = self.id, %kind, "handshake frame after handshake");
                self.peer.send(&ServerMessage::ResponseInvalidClientState {});
                return Flow::Continue;
            }
            Err(err) => {
                debug!(connection = self.id, error = %err, "undecodable frame");
                self.peer.send(&ServerMessage::ResponseError {
                    error: err.to_string(),
                });
                return Flow::Continue;
            }
        };

        match (self.role.clone(), message) {
            (Role::Unestablished, ClientMessage::InitializePublish {}) => {
                self.start_publishing().await
            }
            (Role::Unestablished, ClientMessage::InitializeSubscribe { session_id }) => {
                self.start_subscribing(session_id).await
            }
            (Role::Publisher { session_id }, ClientMessage::NotifyRadarState { state }) => {
                self.forward_state(&session_id, state).await
            }
            (_, ClientMessage::Disconnect { reason }) => {
                debug!(connection = self.id, %reason, "client disconnected");
                self.close_reason = reason;
                Flow::Close
            }
            (role, message) => {
                debug!(
                    connection = self.id,
                    kind = message.kind(),
                    ?role,
                    "command not valid in current role"
                );
                self.peer.send(&ServerMessage::ResponseInvalidClientState {});
                Flow::Continue
            }
        }
    }

    async fn start_publishing(&mut self) -> Flow {
        match self.state.registry().create_session(self.peer.clone()).await {
            Ok(session_id) => {
                self.peer.send(&ServerMessage::ResponseInitializePublish {
                    session_id: session_id.clone(),
                    version: self.version.unwrap_or(PROTOCOL_VERSION),
                });
                self.role = Role::Publisher { session_id };
            }
            Err(err) => {
                self.peer.send(&ServerMessage::ResponseError {
                    error: err.to_string(),
                });
            }
        }
        Flow::Continue
    }

    async fn start_subscribing(&mut self, session_id: SessionId) -> Flow {
        match self
            .state
            .registry()
            .attach_subscriber(&session_id, self.peer.clone())
            .await
        {
            Ok(()) => {
                self.role = Role::Subscriber { session_id };
                Flow::Continue
            }
            Err(RegistryError::SessionNotFound(_)) => {
                debug!(connection = self.id, session = %session_id, "unknown session");
                self.peer.send(&ServerMessage::ResponseSessionInvalidId {});
                self.close_reason = format!("unknown session {session_id}");
                Flow::Close
            }
            Err(err) => {
                self.peer.send(&ServerMessage::ResponseError {
                    error: err.to_string(),
                });
                Flow::Continue
            }
        }
    }

    /// Hands `state` to the registry. A successful update gets no
    /// `response-success`: at one state per tick, acks would double the
    /// traffic on the publisher's socket. Only failures are answered.
    async fn forward_state(&mut self, session_id: &str, state: RadarPayload) -> Flow {
        if let Err(err) = self
            .state
            .registry()
            .publish_update(session_id, self.id, state)
            .await
        {
            warn!(connection = self.id, error = %err, "failed to publish state");
            self.peer.send(&ServerMessage::ResponseError {
                error: err.to_string(),
            });
        }
        Flow::Continue
    }

    /// Gives up whatever registry membership the connection holds. Safe to
    /// call more than once.
    async fn release(&mut self) {
        match std::mem::replace(&mut self.role, Role::Closed) {
            Role::Publisher { session_id } => {
                self.state
                    .registry()
                    .close_session(&session_id, &self.close_reason)
                    .await;
            }
            Role::Subscriber { session_id } => {
                self.state
                    .registry()
                    .detach_subscriber(&session_id, self.id)
                    .await;
            }
            Role::Handshaking | Role::Unestablished | Role::Closed => {}
        }
    }
}
