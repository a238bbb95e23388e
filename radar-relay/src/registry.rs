use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    message::{ServerMessage, WireMessage, encode},
    radar::RadarPayload,
};

pub type ConnectionId = u64;
pub type SessionId = String;

/// Length of generated session ids. Ids use nanoid's URL-safe alphabet, so
/// they embed directly in a `/session/<id>` path.
pub const SESSION_ID_LENGTH: usize = 12;

/// The registry's view of a connection: a bounded outbound queue, a slot for
/// the frame written just before the socket closes, and a way to ask the
/// connection to close.
#[derive(Debug, Clone)]
pub struct Peer {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
    last: Arc<watch::Sender<Option<String>>>,
    closer: CancellationToken,
}

/// The receiving half of a [`Peer`], owned by the connection's writer.
#[derive(Debug)]
pub struct Outbox {
    pub queued: mpsc::Receiver<String>,
    /// Written after `queued` is drained and every sender is gone.
    pub last: watch::Receiver<Option<String>>,
}

impl Peer {
    pub fn channel(id: ConnectionId, capacity: usize, closer: CancellationToken) -> (Self, Outbox) {
        let (outbound, queued) = mpsc::channel(capacity.max(1));
        let (last, last_rx) = watch::channel(None);
        let peer = Self {
            id,
            outbound,
            last: Arc::new(last),
            closer,
        };
        (
            peer,
            Outbox {
                queued,
                last: last_rx,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `message` without waiting. Returns whether it was queued.
    pub fn send<T: WireMessage>(&self, message: &T) -> bool {
        match encode(message) {
            Ok(frame) => self.send_frame(frame),
            Err(err) => {
                error!(connection = self.id, error = ?err, "dropping frame");
                false
            }
        }
    }

    pub fn send_frame(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = self.id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = self.id, "outbound queue closed, dropping frame");
                false
            }
        }
    }

    /// Sets the frame the writer sends after everything already queued. It
    /// does not take a queue slot, so a full queue cannot crowd it out.
    pub fn send_last<T: WireMessage>(&self, message: &T) -> bool {
        match encode(message) {
            Ok(frame) => {
                self.last.send_replace(Some(frame));
                true
            }
            Err(err) => {
                error!(connection = self.id, error = ?err, "dropping final frame");
                false
            }
        }
    }

    /// Asks the owning connection task to shut down once its queue drains.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} already publishes a session")]
    AlreadyPublishing(ConnectionId),
    #[error("session {0} does not exist")]
    SessionNotFound(SessionId),
    #[error("session {session} reached its limit of {limit} viewers")]
    SessionFull { session: SessionId, limit: usize },
    #[error("connection {connection} does not own session {session}")]
    NotOwner {
        connection: ConnectionId,
        session: SessionId,
    },
    #[error("state for session {0} could not be encoded")]
    Unencodable(SessionId),
}

struct Session {
    publisher: Peer,
    subscribers: HashMap<ConnectionId, Peer>,
    last_state: Option<RadarPayload>,
}

impl Session {
    /// Tells the publisher and every subscriber how many viewers are attached.
    fn notify_view_count(&self) {
        let message = ServerMessage::NotifyViewCount {
            viewers: self.subscribers.len(),
        };
        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = ?err, "failed to encode view count");
                return;
            }
        };

        self.publisher.send_frame(frame.clone());
        for subscriber in self.subscribers.values() {
            subscriber.send_frame(frame.clone());
        }
    }
}

/// Sessions keyed by id. Every operation holds one registry-wide lock, so
/// operations on the same session are linearizable. Fan-out never waits on a
/// subscriber: deliveries go through [`Peer::send_frame`].
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
    max_viewers: Option<usize>,
}

impl SessionRegistry {
    pub fn new(max_viewers: Option<usize>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_viewers,
        }
    }

    pub async fn create_session(&self, publisher: Peer) -> Result<SessionId, RegistryError> {
        let mut sessions = self.sessions.lock().await;

        if sessions
            .values()
            .any(|session| session.publisher.id() == publisher.id())
        {
            return Err(RegistryError::AlreadyPublishing(publisher.id()));
        }

        let session_id = loop {
            let candidate = nanoid::nanoid!(SESSION_ID_LENGTH);
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        info!(session = %session_id, publisher = publisher.id(), "session created");
        sessions.insert(
            session_id.clone(),
            Session {
                publisher,
                subscribers: HashMap::new(),
                last_state: None,
            },
        );

        Ok(session_id)
    }

    /// Adds `subscriber` to the session's fan-out set. The subscriber first
    /// receives the last known state, if any, then `response-subscribe-success`,
    /// then the new view count along with everyone else in the session.
    pub async fn attach_subscriber(
        &self,
        session_id: &str,
        subscriber: Peer,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;

        if let Some(limit) = self.max_viewers {
            if session.subscribers.len() >= limit {
                return Err(RegistryError::SessionFull {
                    session: session_id.to_string(),
                    limit,
                });
            }
        }

        if let Some(state) = &session.last_state {
            subscriber.send(&ServerMessage::NotifyRadarState {
                state: state.clone(),
            });
        }
        subscriber.send(&ServerMessage::ResponseSubscribeSuccess {});

        info!(session = %session_id, subscriber = subscriber.id(), "subscriber attached");
        session.subscribers.insert(subscriber.id(), subscriber);
        session.notify_view_count();

        Ok(())
    }

    /// Stores `state` as the session's latest and forwards it, unchanged, to
    /// every subscriber. Returns the number of subscribers it was queued for.
    pub async fn publish_update(
        &self,
        session_id: &str,
        publisher: ConnectionId,
        state: RadarPayload,
    ) -> Result<usize, RegistryError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;

        if session.publisher.id() != publisher {
            return Err(RegistryError::NotOwner {
                connection: publisher,
                session: session_id.to_string(),
            });
        }

        let frame = encode(&ServerMessage::NotifyRadarState {
            state: state.clone(),
        })
        .map_err(|err| {
            error!(session = %session_id, error = ?err, "failed to encode state");
            RegistryError::Unencodable(session_id.to_string())
        })?;
        session.last_state = Some(state);

        let delivered = session
            .subscribers
            .values()
            .filter(|subscriber| subscriber.send_frame(frame.clone()))
            .count();

        debug!(
            session = %session_id,
            delivered,
            subscribers = session.subscribers.len(),
            "state forwarded"
        );
        Ok(delivered)
    }

    /// Notifies every subscriber with `notify-session-closed`, closes all
    /// member connections and forgets the session. Returns the number of
    /// subscribers that were attached, or `None` if the session was already
    /// gone.
    pub async fn close_session(&self, session_id: &str, reason: &str) -> Option<usize> {
        let session = self.sessions.lock().await.remove(session_id)?;
        Some(shut_down(session_id, session, reason))
    }

    /// Removes one subscriber. Returns whether it was attached.
    pub async fn detach_subscriber(&self, session_id: &str, subscriber: ConnectionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };

        if session.subscribers.remove(&subscriber).is_none() {
            return false;
        }

        info!(session = %session_id, subscriber, "subscriber detached");
        session.notify_view_count();
        true
    }

    /// Closes every session. Returns how many were closed.
    pub async fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<(SessionId, Session)> = self.sessions.lock().await.drain().collect();
        let count = drained.len();
        for (session_id, session) in drained {
            shut_down(&session_id, session, reason);
        }
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn viewer_count(&self, session_id: &str) -> Option<usize> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|session| session.subscribers.len())
    }
}

fn shut_down(session_id: &str, session: Session, reason: &str) -> usize {
    let Session {
        publisher,
        subscribers,
        ..
    } = session;

    for subscriber in subscribers.values() {
        subscriber.send_last(&ServerMessage::NotifySessionClosed {});
        subscriber.close();
    }
    publisher.close();

    info!(
        session = %session_id,
        subscribers = subscribers.len(),
        reason,
        "session closed"
    );
    subscribers.len()
}
