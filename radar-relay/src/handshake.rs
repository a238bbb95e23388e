//! Protocol version negotiation.
//!
//! Every connection opens with `request-initialize{clientVersion}`. The broker
//! answers with `response-success` only for versions it explicitly supports;
//! anything else ends the connection so that publishers and viewers speaking
//! different protocol revisions never exchange session traffic.
//!
//! The server side is a pure function of the policy and one frame
//! ([`evaluate`]). The viewer side is the [`ClientState`] machine driven by
//! [`crate::client::SubscriberClient`].

use std::fmt;

use crate::message::{ClientMessage, DecodeError, HandshakeMessage, WireMessage, decode};

/// Protocol revision spoken by the clients in this crate.
pub const PROTOCOL_VERSION: u32 = 2;

/// Revisions the broker accepts unless configured otherwise.
pub const DEFAULT_SUPPORTED_VERSIONS: &[u32] = &[1, 2];

/// The set of protocol versions a broker accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPolicy {
    supported: Vec<u32>,
}

impl VersionPolicy {
    pub fn new(versions: impl IntoIterator<Item = u32>) -> Self {
        let mut supported: Vec<u32> = versions.into_iter().collect();
        supported.sort_unstable();
        supported.dedup();
        Self { supported }
    }

    pub fn supports(&self, version: u32) -> bool {
        self.supported.binary_search(&version).is_ok()
    }

    /// Supported versions in ascending order.
    pub fn supported(&self) -> &[u32] {
        &self.supported
    }
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPORTED_VERSIONS.iter().copied())
    }
}

/// What the broker does with a frame received while a connection is still
/// handshaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeVerdict {
    /// Reply `response-success` and start accepting session commands.
    Accept { version: u32 },
    /// Reply `response-incompatible` and close.
    Incompatible { requested: u32 },
    /// Reply `response-generic-failure` and close.
    Invalid { message: String },
    /// A session command arrived too early. Reply
    /// `response-invalid-client-state` and keep waiting for the handshake.
    PrematureCommand { kind: String },
}

impl HandshakeVerdict {
    /// The handshake reply for this verdict, if it has one.
    pub fn reply(&self, policy: &VersionPolicy) -> Option<HandshakeMessage> {
        match self {
            Self::Accept { version } => Some(HandshakeMessage::ResponseSuccess {
                server_version: *version,
            }),
            Self::Incompatible { .. } => Some(HandshakeMessage::ResponseIncompatible {
                supported_versions: policy.supported().to_vec(),
            }),
            Self::Invalid { message } => Some(HandshakeMessage::ResponseGenericFailure {
                message: message.clone(),
            }),
            Self::PrematureCommand { .. } => None,
        }
    }

    /// Whether the broker closes the connection after replying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Incompatible { .. } | Self::Invalid { .. })
    }
}

pub fn evaluate(policy: &VersionPolicy, frame: &str) -> HandshakeVerdict {
    match decode::<HandshakeMessage>(frame) {
        Ok(HandshakeMessage::RequestInitialize { client_version }) => {
            if policy.supports(client_version) {
                HandshakeVerdict::Accept {
                    version: client_version,
                }
            } else {
                HandshakeVerdict::Incompatible {
                    requested: client_version,
                }
            }
        }
        Ok(other) => HandshakeVerdict::Invalid {
            message: format!("unexpected `{}` during handshake", other.kind()),
        },
        Err(DecodeError::UnknownMessageType(kind)) if ClientMessage::TYPES.contains(&kind.as_str()) => {
            HandshakeVerdict::PrematureCommand { kind }
        }
        Err(err) => HandshakeVerdict::Invalid {
            message: err.to_string(),
        },
    }
}

/// Interprets the broker's answer to our `request-initialize`.
///
/// Returns the negotiated version, or a human readable reason the handshake
/// failed.
pub fn interpret_reply(frame: &str) -> Result<u32, String> {
    match decode::<HandshakeMessage>(frame) {
        Ok(HandshakeMessage::ResponseSuccess { server_version }) => Ok(server_version),
        Ok(HandshakeMessage::ResponseIncompatible { supported_versions }) => Err(format!(
            "server does not support protocol version {PROTOCOL_VERSION} (supported: {supported_versions:?})"
        )),
        Ok(HandshakeMessage::ResponseGenericFailure { message }) => {
            Err(format!("handshake failed: {message}"))
        }
        Ok(other) => Err(format!("unexpected `{}` during handshake", other.kind())),
        Err(err) => Err(format!("invalid handshake response: {err}")),
    }
}

/// Viewer-side connection lifecycle.
///
/// `New -> Connecting -> Handshaking -> Initializing -> Connected ->
/// Disconnected`, with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    New,
    Connecting,
    Handshaking,
    Initializing,
    Connected,
    Disconnected,
    Failed { reason: String },
}

impl ClientState {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed { .. })
    }

    pub fn can_transition_to(&self, next: &ClientState) -> bool {
        use ClientState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed { .. }) | (_, Disconnected) => true,
            (New, Connecting)
            | (Connecting, Handshaking)
            | (Handshaking, Initializing)
            | (Initializing, Connected) => true,
            _ => false,
        }
    }

    /// Moves to `next` if the transition is legal. Returns whether the state
    /// changed.
    pub fn transition(&mut self, next: ClientState) -> bool {
        if !self.can_transition_to(&next) {
            return false;
        }
        *self = next;
        true
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Connecting => f.write_str("connecting"),
            Self::Handshaking => f.write_str("handshaking"),
            Self::Initializing => f.write_str("initializing"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ServerMessage, encode};

    fn encoded<T: WireMessage>(message: &T) -> String {
        encode(message).expect("encode message")
    }

    fn request(version: u32) -> String {
        encoded(&HandshakeMessage::RequestInitialize {
            client_version: version,
        })
    }

    #[test]
    fn accepts_supported_version_and_echoes_it() {
        let policy = VersionPolicy::new([1, 2]);
        let verdict = evaluate(&policy, &request(2));

        assert_eq!(verdict, HandshakeVerdict::Accept { version: 2 });
        assert_eq!(
            verdict.reply(&policy),
            Some(HandshakeMessage::ResponseSuccess { server_version: 2 })
        );
        assert!(!verdict.is_fatal());
    }

    #[test]
    fn rejects_unsupported_version_with_supported_list() {
        let policy = VersionPolicy::new([1]);
        let verdict = evaluate(&policy, &request(2));

        assert_eq!(verdict, HandshakeVerdict::Incompatible { requested: 2 });
        assert_eq!(
            verdict.reply(&policy),
            Some(HandshakeMessage::ResponseIncompatible {
                supported_versions: vec![1]
            })
        );
        assert!(verdict.is_fatal());
    }

    #[test]
    fn session_command_before_handshake_is_premature() {
        let policy = VersionPolicy::default();
        let frame = encoded(&ClientMessage::InitializeSubscribe {
            session_id: "abc".into(),
        });

        let verdict = evaluate(&policy, &frame);
        assert_eq!(
            verdict,
            HandshakeVerdict::PrematureCommand {
                kind: "initialize-subscribe".into()
            }
        );
        assert_eq!(verdict.reply(&policy), None);
        assert!(!verdict.is_fatal());
    }

    #[test]
    fn garbage_and_server_frames_are_invalid() {
        let policy = VersionPolicy::default();

        assert!(matches!(
            evaluate(&policy, "{{{"),
            HandshakeVerdict::Invalid { .. }
        ));
        assert!(matches!(
            evaluate(&policy, r#"{"type":"who-knows","payload":{}}"#),
            HandshakeVerdict::Invalid { .. }
        ));
        let server_frame = encoded(&HandshakeMessage::ResponseSuccess { server_version: 2 });
        assert!(matches!(
            evaluate(&policy, &server_frame),
            HandshakeVerdict::Invalid { .. }
        ));
    }

    #[test]
    fn policy_sorts_and_dedups() {
        let policy = VersionPolicy::new([3, 1, 3, 2]);
        assert_eq!(policy.supported(), &[1, 2, 3]);
        assert!(policy.supports(3));
        assert!(!policy.supports(4));
    }

    #[test]
    fn interprets_server_replies() {
        assert_eq!(
            interpret_reply(&encoded(&HandshakeMessage::ResponseSuccess { server_version: 2 })),
            Ok(2)
        );

        let incompatible = interpret_reply(&encoded(&HandshakeMessage::ResponseIncompatible {
            supported_versions: vec![1],
        }))
        .expect_err("incompatible reply fails");
        assert!(incompatible.contains("[1]"), "{incompatible}");

        let failure = interpret_reply(&encoded(&HandshakeMessage::ResponseGenericFailure {
            message: "bad request".into(),
        }))
        .expect_err("generic failure fails");
        assert!(failure.contains("bad request"), "{failure}");

        // A session frame sent in place of a handshake reply.
        assert!(interpret_reply(&encoded(&ServerMessage::ResponseInvalidClientState {})).is_err());
    }

    #[test]
    fn client_state_follows_the_happy_path() {
        let path = [
            ClientState::New,
            ClientState::Connecting,
            ClientState::Handshaking,
            ClientState::Initializing,
            ClientState::Connected,
            ClientState::Disconnected,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(&pair[1]),
                "{} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn client_state_rejects_skips_and_terminal_exits() {
        assert!(!ClientState::New.can_transition_to(&ClientState::Connected));
        assert!(!ClientState::Handshaking.can_transition_to(&ClientState::Connected));
        assert!(!ClientState::Disconnected.can_transition_to(&ClientState::failed("late")));
        assert!(!ClientState::failed("x").can_transition_to(&ClientState::Disconnected));
        assert!(ClientState::Initializing.can_transition_to(&ClientState::failed("boom")));
    }

    #[test]
    fn transition_applies_only_legal_moves() {
        let mut state = ClientState::New;
        assert!(!state.transition(ClientState::Connected));
        assert_eq!(state, ClientState::New);

        assert!(state.transition(ClientState::Connecting));
        assert!(state.transition(ClientState::failed("refused")));
        assert!(!state.transition(ClientState::Disconnected));
        assert_eq!(state, ClientState::failed("refused"));
    }
}
