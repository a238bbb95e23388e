use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::radar::RadarPayload;

const TYPE_FIELD: &str = "type";
const PAYLOAD_FIELD: &str = "payload";

/// A closed family of frames sharing the `{ type, payload }` envelope.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Every discriminant the family defines.
    const TYPES: &'static [&'static str];

    fn kind(&self) -> &'static str;
}

#[derive(Debug, Error)]
#[error("failed to encode `{kind}`")]
pub struct EncodeError {
    kind: &'static str,
    #[source]
    source: serde_json::Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not a JSON object: {0}")]
    Malformed(String),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("invalid payload for `{kind}`: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Version negotiation exchanged before any session traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum HandshakeMessage {
    RequestInitialize { client_version: u32 },
    ResponseSuccess { server_version: u32 },
    ResponseIncompatible { supported_versions: Vec<u32> },
    ResponseGenericFailure { message: String },
}

impl WireMessage for HandshakeMessage {
    const TYPES: &'static [&'static str] = &[
        "request-initialize",
        "response-success",
        "response-incompatible",
        "response-generic-failure",
    ];

    fn kind(&self) -> &'static str {
        match self {
            Self::RequestInitialize { .. } => "request-initialize",
            Self::ResponseSuccess { .. } => "response-success",
            Self::ResponseIncompatible { .. } => "response-incompatible",
            Self::ResponseGenericFailure { .. } => "response-generic-failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    InitializePublish {},
    InitializeSubscribe { session_id: String },
    NotifyRadarState { state: RadarPayload },
    Disconnect { reason: String },
}

impl WireMessage for ClientMessage {
    const TYPES: &'static [&'static str] = &[
        "initialize-publish",
        "initialize-subscribe",
        "notify-radar-state",
        "disconnect",
    ];

    fn kind(&self) -> &'static str {
        match self {
            Self::InitializePublish {} => "initialize-publish",
            Self::InitializeSubscribe { .. } => "initialize-subscribe",
            Self::NotifyRadarState { .. } => "notify-radar-state",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    ResponseSuccess {},
    ResponseError { error: String },
    ResponseInvalidClientState {},
    ResponseInitializePublish { session_id: String, version: u32 },
    ResponseSubscribeSuccess {},
    ResponseSessionInvalidId {},
    NotifyRadarState { state: RadarPayload },
    NotifyViewCount { viewers: usize },
    NotifySessionClosed {},
}

impl WireMessage for ServerMessage {
    const TYPES: &'static [&'static str] = &[
        "response-success",
        "response-error",
        "response-invalid-client-state",
        "response-initialize-publish",
        "response-subscribe-success",
        "response-session-invalid-id",
        "notify-radar-state",
        "notify-view-count",
        "notify-session-closed",
    ];

    fn kind(&self) -> &'static str {
        match self {
            Self::ResponseSuccess {} => "response-success",
            Self::ResponseError { .. } => "response-error",
            Self::ResponseInvalidClientState {} => "response-invalid-client-state",
            Self::ResponseInitializePublish { .. } => "response-initialize-publish",
            Self::ResponseSubscribeSuccess {} => "response-subscribe-success",
            Self::ResponseSessionInvalidId {} => "response-session-invalid-id",
            Self::NotifyRadarState { .. } => "notify-radar-state",
            Self::NotifyViewCount { .. } => "notify-view-count",
            Self::NotifySessionClosed {} => "notify-session-closed",
        }
    }
}

/// Serializes `message` as one frame. The families hold only strings,
/// numbers, sequences, string-keyed structs and raw JSON, so this fails only
/// if a payload's `Serialize` impl does.
pub fn encode<T: WireMessage>(message: &T) -> Result<String, EncodeError> {
    serde_json::to_string(message).map_err(|source| EncodeError {
        kind: message.kind(),
        source,
    })
}

/// Parses one frame into a message of family `T`. Payload text is handed to
/// the message unparsed, so raw fields such as [`RadarPayload`] keep the
/// exact bytes they arrived with.
pub fn decode<T: WireMessage>(frame: &str) -> Result<T, DecodeError> {
    let fields: HashMap<String, &RawValue> =
        serde_json::from_str(frame).map_err(|err| DecodeError::Malformed(err.to_string()))?;

    let kind = fields
        .get(TYPE_FIELD)
        .and_then(|raw| serde_json::from_str::<String>(raw.get()).ok())
        .ok_or(DecodeError::MissingType)?;
    if !T::TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownMessageType(kind));
    }

    // Payload-less variants may omit the field entirely.
    let payload = fields.get(PAYLOAD_FIELD).map_or("{}", |raw| raw.get());
    let envelope = format!(
        r#"{{"{TYPE_FIELD}":{},"{PAYLOAD_FIELD}":{payload}}}"#,
        serde_json::Value::String(kind.clone())
    );

    serde_json::from_str(&envelope).map_err(|err| DecodeError::InvalidPayload {
        kind,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::{C4State, RadarBombInfo, RadarPlayerInfo, RadarState};
    use serde_json::{Value, json};

    fn sample_state() -> RadarState {
        RadarState {
            world_name: "de_dust2".into(),
            players: vec![RadarPlayerInfo {
                controller_entity_id: 1,
                team_id: 2,
                player_health: 87,
                player_has_defuser: false,
                player_name: "bob".into(),
                weapon: 7,
                player_flashtime: 0.5,
                position: [10.0, -20.0, 3.5],
                rotation: 180.0,
            }],
            bomb: Some(RadarBombInfo {
                position: [0.0, 1.0, 2.0],
                state: C4State::Dropped,
                bomb_site: None,
            }),
        }
    }

    fn sample_payload() -> RadarPayload {
        RadarPayload::from_state(&sample_state()).expect("encode sample state")
    }

    fn all_handshake_messages() -> Vec<HandshakeMessage> {
        vec![
            HandshakeMessage::RequestInitialize { client_version: 2 },
            HandshakeMessage::ResponseSuccess { server_version: 2 },
            HandshakeMessage::ResponseIncompatible {
                supported_versions: vec![1, 2],
            },
            HandshakeMessage::ResponseGenericFailure {
                message: "nope".into(),
            },
        ]
    }

    fn all_client_messages() -> Vec<ClientMessage> {
        vec![
            ClientMessage::InitializePublish {},
            ClientMessage::InitializeSubscribe {
                session_id: "abc".into(),
            },
            ClientMessage::NotifyRadarState {
                state: sample_payload(),
            },
            ClientMessage::Disconnect {
                reason: "bye".into(),
            },
        ]
    }

    fn all_server_messages() -> Vec<ServerMessage> {
        vec![
            ServerMessage::ResponseSuccess {},
            ServerMessage::ResponseError {
                error: "boom".into(),
            },
            ServerMessage::ResponseInvalidClientState {},
            ServerMessage::ResponseInitializePublish {
                session_id: "abc".into(),
                version: 2,
            },
            ServerMessage::ResponseSubscribeSuccess {},
            ServerMessage::ResponseSessionInvalidId {},
            ServerMessage::NotifyRadarState {
                state: sample_payload(),
            },
            ServerMessage::NotifyViewCount { viewers: 3 },
            ServerMessage::NotifySessionClosed {},
        ]
    }

    fn assert_family_roundtrips<T>(messages: Vec<T>)
    where
        T: WireMessage + PartialEq + std::fmt::Debug,
    {
        assert_eq!(messages.len(), T::TYPES.len(), "every variant is sampled");
        for message in messages {
            let frame = encode(&message).expect("encode message");
            let value: Value = serde_json::from_str(&frame).expect("frame is json");
            assert_eq!(value["type"], message.kind());
            assert!(value["payload"].is_object(), "payload missing in {frame}");
            assert!(T::TYPES.contains(&message.kind()));

            let decoded = decode::<T>(&frame).expect("decode encoded frame");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn every_message_type_roundtrips() {
        assert_family_roundtrips(all_handshake_messages());
        assert_family_roundtrips(all_client_messages());
        assert_family_roundtrips(all_server_messages());
    }

    #[test]
    fn handshake_payload_fields_are_camel_case() {
        let frame = encode(&HandshakeMessage::ResponseIncompatible {
            supported_versions: vec![1],
        })
        .expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("frame is json");
        assert_eq!(
            value,
            json!({ "type": "response-incompatible", "payload": { "supportedVersions": [1] } })
        );
    }

    #[test]
    fn session_payload_keeps_snake_case_session_id() {
        let frame = encode(&ServerMessage::ResponseInitializePublish {
            session_id: "xyz".into(),
            version: 2,
        })
        .expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("frame is json");
        assert_eq!(value["payload"]["session_id"], "xyz");
    }

    #[test]
    fn missing_payload_is_accepted_for_empty_variants() {
        let message = decode::<ServerMessage>(r#"{"type":"notify-session-closed"}"#)
            .expect("decode without payload");
        assert_eq!(message, ServerMessage::NotifySessionClosed {});
    }

    #[test]
    fn rejects_non_json_frames() {
        assert!(matches!(
            decode::<ClientMessage>("not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode::<ClientMessage>("[1, 2]"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_frames_without_discriminant() {
        assert_eq!(
            decode::<ClientMessage>(r#"{"payload":{}}"#),
            Err(DecodeError::MissingType)
        );
        assert_eq!(
            decode::<ClientMessage>(r#"{"type":5,"payload":{}}"#),
            Err(DecodeError::MissingType)
        );
    }

    #[test]
    fn reports_unknown_discriminant() {
        assert_eq!(
            decode::<ClientMessage>(r#"{"type":"request-initialize","payload":{"clientVersion":2}}"#),
            Err(DecodeError::UnknownMessageType("request-initialize".into()))
        );
    }

    #[test]
    fn reports_bad_payload_for_known_discriminant() {
        let result = decode::<ClientMessage>(r#"{"type":"initialize-subscribe","payload":{}}"#);
        assert!(matches!(
            result,
            Err(DecodeError::InvalidPayload { kind, .. }) if kind == "initialize-subscribe"
        ));
    }

    #[test]
    fn ignores_legacy_version_field_on_publish() {
        let message =
            decode::<ClientMessage>(r#"{"type":"initialize-publish","payload":{"version":1}}"#)
                .expect("decode legacy publish");
        assert_eq!(message, ClientMessage::InitializePublish {});
    }

    #[test]
    fn radar_state_text_survives_decode_and_encode() {
        let state = r#"{"worldName":"de_dust2","players":[{"rotation":0.123456789,"position":[1.123456789,2,3],"playerArmor":50}],"bomb":{"state":{"variant":"Planted"}},"localControllerEntityId":1}"#;
        let frame = format!(r#"{{"type":"notify-radar-state","payload":{{"state":{state}}}}}"#);

        let ClientMessage::NotifyRadarState { state: payload } =
            decode::<ClientMessage>(&frame).expect("decode opaque state")
        else {
            panic!("wrong variant");
        };
        assert_eq!(payload.as_str(), state);

        let forwarded = encode(&ServerMessage::NotifyRadarState { state: payload }).expect("encode");
        assert_eq!(
            forwarded,
            format!(r#"{{"type":"notify-radar-state","payload":{{"state":{state}}}}}"#)
        );
    }

    #[test]
    fn type_may_follow_payload() {
        let message = decode::<ServerMessage>(r#"{"payload":{"viewers":2},"type":"notify-view-count"}"#)
            .expect("decode reordered frame");
        assert_eq!(message, ServerMessage::NotifyViewCount { viewers: 2 });
    }
}
