//! Game-state payload carried by `notify-radar-state`.
//!
//! Field names are camelCase on the wire because the browser viewer consumes
//! them directly. The broker never looks inside these values: it carries the
//! JSON text of each state as a [`RadarPayload`], stores the latest one per
//! session and forwards it byte for byte. Only the publisher and the viewer
//! convert between payloads and [`RadarState`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// The JSON text of one state, exactly as the publisher sent it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RadarPayload(Arc<RawValue>);

impl RadarPayload {
    pub fn from_state(state: &RadarState) -> serde_json::Result<Self> {
        serde_json::value::to_raw_value(state).map(|raw| Self(Arc::from(raw)))
    }

    /// Parses the payload into the typed state the viewer renders.
    pub fn to_state(&self) -> serde_json::Result<RadarState> {
        serde_json::from_str(self.0.get())
    }

    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for RadarPayload {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RadarState {
    pub world_name: String,
    pub players: Vec<RadarPlayerInfo>,
    pub bomb: Option<RadarBombInfo>,
}

impl RadarState {
    /// A state for `world_name` with no players and no bomb.
    pub fn empty(world_name: impl Into<String>) -> Self {
        Self {
            world_name: world_name.into(),
            players: Vec::new(),
            bomb: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RadarPlayerInfo {
    pub controller_entity_id: u32,
    pub team_id: u8,

    pub player_health: i32,
    pub player_has_defuser: bool,
    pub player_name: String,
    pub weapon: u16,
    pub player_flashtime: f32,

    pub position: [f32; 3],
    pub rotation: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RadarBombInfo {
    pub position: [f32; 3],
    pub state: C4State,

    /// Planted bomb site, 0 = A and 1 = B.
    pub bomb_site: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "variant", rename_all_fields = "camelCase")]
pub enum C4State {
    Dropped,
    Carried,

    /// Bomb is planted and ticking.
    Active {
        /// Seconds until detonation.
        time_detonation: f32,
        defuse: Option<BombDefuser>,
    },

    Detonated,
    Defused,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BombDefuser {
    /// Seconds left until the defuse completes.
    pub time_remaining: f32,
    pub player_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_uses_viewer_field_names() {
        let state = RadarState {
            world_name: "de_mirage".into(),
            players: vec![RadarPlayerInfo {
                controller_entity_id: 7,
                team_id: 3,
                player_health: 100,
                player_has_defuser: true,
                player_name: "alice".into(),
                weapon: 9,
                player_flashtime: 0.0,
                position: [1.0, 2.0, 3.0],
                rotation: 90.0,
            }],
            bomb: Some(RadarBombInfo {
                position: [4.0, 5.0, 6.0],
                state: C4State::Active {
                    time_detonation: 30.5,
                    defuse: Some(BombDefuser {
                        time_remaining: 5.0,
                        player_name: "alice".into(),
                    }),
                },
                bomb_site: Some(1),
            }),
        };

        let value = serde_json::to_value(&state).expect("serialize state");
        assert_eq!(value["worldName"], "de_mirage");
        assert_eq!(value["players"][0]["controllerEntityId"], 7);
        assert_eq!(value["players"][0]["playerHasDefuser"], true);
        assert_eq!(value["bomb"]["bombSite"], 1);
        assert_eq!(value["bomb"]["state"]["variant"], "Active");
        assert_eq!(value["bomb"]["state"]["timeDetonation"], 30.5);
        assert_eq!(value["bomb"]["state"]["defuse"]["timeRemaining"], 5.0);
    }

    #[test]
    fn payload_keeps_the_exact_text() {
        let text = r#"{"worldName":"de_nuke", "players":[],"bomb":null,"rotation":0.123456789,"extra":{"a":1}}"#;
        let payload: RadarPayload = serde_json::from_str(text).expect("parse payload");
        assert_eq!(payload.as_str(), text);
        assert_eq!(serde_json::to_string(&payload).expect("serialize"), text);

        let state = payload.to_state().expect("typed state");
        assert_eq!(state, RadarState::empty("de_nuke"));
    }

    #[test]
    fn payload_from_state_roundtrips() {
        let state = RadarState::empty("de_train");
        let payload = RadarPayload::from_state(&state).expect("encode state");
        assert_eq!(payload.to_state().expect("decode state"), state);
    }

    #[test]
    fn unit_bomb_states_parse_from_variant_tag() {
        let bomb: RadarBombInfo = serde_json::from_value(json!({
            "position": [0.0, 0.0, 0.0],
            "state": { "variant": "Carried" },
            "bombSite": null,
        }))
        .expect("parse bomb");

        assert_eq!(bomb.state, C4State::Carried);
        assert_eq!(bomb.bomb_site, None);
    }
}
