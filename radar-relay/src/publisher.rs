use std::{io, time::Duration};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    cli::PublishArgs,
    generator::{DemoGenerator, RadarGenerator},
    handshake::{PROTOCOL_VERSION, interpret_reply},
    message::{
        ClientMessage, EncodeError, HandshakeMessage, ServerMessage, WireMessage, decode, encode,
    },
    radar::{RadarPayload, RadarState},
    transport::{Endpoint, FrameSink, FrameStream, Transport},
};

/// How long [`RadarPublisher::connect`] waits for a session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames that may wait for the socket before [`RadarPublisher::publish`]
/// starts refusing states.
pub const PUBLISH_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to connect to {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Handshake(String),
    #[error("broker refused to create a session: {0}")]
    Rejected(String),
    #[error("no session after {0:?}")]
    Timeout(Duration),
    #[error("broker closed the connection")]
    ConnectionClosed,
    #[error("transport error")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("state is not valid JSON")]
    InvalidState(#[source] serde_json::Error),
    #[error("outbound queue is full")]
    QueueFull,
    #[error("publisher is closed")]
    Closed,
}

/// The data-source side of a session.
pub struct RadarPublisher {
    session_id: String,
    version: u32,
    outbound: mpsc::Sender<String>,
    view_count: watch::Receiver<usize>,
    task: JoinHandle<()>,
}

impl RadarPublisher {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, PublishError> {
        Self::connect_with_timeout(endpoint, CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        endpoint: &Endpoint,
        limit: Duration,
    ) -> Result<Self, PublishError> {
        timeout(limit, Self::establish(endpoint))
            .await
            .map_err(|_| PublishError::Timeout(limit))?
    }

    async fn establish(endpoint: &Endpoint) -> Result<Self, PublishError> {
        let Transport {
            mut frames,
            mut sink,
            ..
        } = endpoint
            .open()
            .await
            .map_err(|source| PublishError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;

        sink.send(encode(&HandshakeMessage::RequestInitialize {
            client_version: PROTOCOL_VERSION,
        })?)
        .await?;
        let version = interpret_reply(&next_frame(&mut frames).await?)
            .map_err(PublishError::Handshake)?;

        sink.send(encode(&ClientMessage::InitializePublish {})?).await?;
        let session_id = loop {
            let frame = next_frame(&mut frames).await?;
            match decode::<ServerMessage>(&frame) {
                Ok(ServerMessage::ResponseInitializePublish { session_id, .. }) => break session_id,
                Ok(ServerMessage::ResponseError { error }) => {
                    return Err(PublishError::Rejected(error));
                }
                Ok(ServerMessage::ResponseInvalidClientState {}) => {
                    return Err(PublishError::Rejected("invalid client state".to_string()));
                }
                Ok(other) => debug!(kind = other.kind(), "ignoring message before session"),
                Err(err) => return Err(PublishError::Rejected(err.to_string())),
            }
        };
        info!(session = %session_id, version, "session created");

        let (outbound, queued) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        let (viewers, view_count) = watch::channel(0);
        let task = tokio::spawn(drive(frames, sink, queued, viewers));

        Ok(Self {
            session_id,
            version,
            outbound,
            view_count,
            task,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Protocol version agreed with the broker.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Queues `state` for every subscriber of the session. Never waits: a
    /// full queue rejects the state with [`PublishError::QueueFull`].
    pub fn publish(&self, state: RadarState) -> Result<(), PublishError> {
        let state = RadarPayload::from_state(&state).map_err(PublishError::InvalidState)?;
        let frame = encode(&ClientMessage::NotifyRadarState { state })?;
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    /// Viewer count last reported by the broker.
    pub fn view_count(&self) -> usize {
        *self.view_count.borrow()
    }

    pub fn watch_view_count(&self) -> watch::Receiver<usize> {
        self.view_count.clone()
    }

    /// Ends the session. Subscribers are told the session closed.
    pub async fn close(self, reason: &str) -> Result<(), PublishError> {
        let Self {
            session_id,
            outbound,
            task,
            ..
        } = self;

        let frame = encode(&ClientMessage::Disconnect {
            reason: reason.to_string(),
        })?;
        let sent = outbound.send(frame).await;
        drop(outbound);

        if timeout(CONNECT_TIMEOUT, task).await.is_err() {
            warn!(session = %session_id, "publisher connection did not close in time");
        }
        info!(session = %session_id, %reason, "session closed");
        sent.map_err(|_| PublishError::Closed)
    }
}

/// Runs the `publish-demo` subcommand: creates a session and publishes a
/// [`DemoGenerator`] state every tick until ctrl-c or the broker goes away.
pub async fn run_demo(args: PublishArgs) -> anyhow::Result<()> {
    let publisher = RadarPublisher::connect(&args.endpoint)
        .await
        .with_context(|| format!("failed to start publishing to {}", args.endpoint))?;
    info!("publishing session {}", publisher.session_id());

    let mut generator = DemoGenerator::new(args.world, args.players);
    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut viewers = publisher.watch_view_count();

    loop {
        select! {
            _ = ticker.tick() => {
                match publisher.publish(generator.generate_state()?) {
                    Ok(()) => {}
                    Err(PublishError::QueueFull) => debug!("broker is slow, skipping state"),
                    Err(err) => return Err(err).context("session ended"),
                }
            }
            changed = viewers.changed() => {
                if changed.is_err() {
                    anyhow::bail!("broker closed the connection");
                }
                let count = *viewers.borrow_and_update();
                info!(viewers = count, "view count");
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    publisher.close("publisher stopped").await?;
    Ok(())
}

async fn next_frame(frames: &mut FrameStream) -> Result<String, PublishError> {
    match frames.next().await {
        Some(frame) => Ok(frame?),
        None => Err(PublishError::ConnectionClosed),
    }
}

async fn drive(
    mut frames: FrameStream,
    mut sink: FrameSink,
    mut queued: mpsc::Receiver<String>,
    viewers: watch::Sender<usize>,
) {
    loop {
        select! {
            frame = queued.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(frame).await {
                        warn!(error = ?err, "failed to send to broker");
                        break;
                    }
                }
                None => {
                    if let Err(err) = sink.close().await {
                        debug!(error = ?err, "failed to close transport cleanly");
                    }
                    break;
                }
            },
            inbound = frames.next() => match inbound {
                Some(Ok(frame)) => handle_inbound(&frame, &viewers),
                Some(Err(err)) => {
                    warn!(error = ?err, "connection to broker failed");
                    break;
                }
                None => {
                    info!("broker closed the connection");
                    break;
                }
            },
        }
    }
}

fn handle_inbound(frame: &str, viewers: &watch::Sender<usize>) {
    match decode::<ServerMessage>(frame) {
        Ok(ServerMessage::NotifyViewCount { viewers: count }) => {
            debug!(viewers = count, "view count changed");
            viewers.send_replace(count);
        }
        Ok(ServerMessage::ResponseError { error }) => warn!(%error, "broker reported an error"),
        Ok(other) => debug!(kind = other.kind(), "ignoring message"),
        Err(err) => warn!(error = %err, "ignoring undecodable frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn view_counts_are_tracked() {
        let (viewers, count) = watch::channel(0);
        let frame = encode(&ServerMessage::NotifyViewCount { viewers: 4 }).expect("encode");
        handle_inbound(&frame, &viewers);
        handle_inbound("garbage", &viewers);
        assert_eq!(*count.borrow(), 4);
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = Endpoint::Tcp(listener.local_addr().expect("addr"));
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let result =
            RadarPublisher::connect_with_timeout(&endpoint, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(PublishError::Timeout(_))));
    }

    #[tokio::test]
    async fn incompatible_broker_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = Endpoint::Tcp(listener.local_addr().expect("addr"));
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut transport = Transport::tcp(stream);
            let _ = transport.frames.next().await;
            let _ = transport
                .sink
                .send(
                    encode(&HandshakeMessage::ResponseIncompatible {
                        supported_versions: vec![1],
                    })
                    .expect("encode"),
                )
                .await;
        });

        let result = RadarPublisher::connect(&endpoint).await;
        assert!(matches!(result, Err(PublishError::Handshake(_))), "{:?}", result.err());
    }
}
