use std::f32::consts::TAU;

use crate::radar::{C4State, RadarBombInfo, RadarPlayerInfo, RadarState};

/// A source of radar snapshots for a publisher.
pub trait RadarGenerator: Send {
    fn generate_state(&mut self) -> anyhow::Result<RadarState>;
}

/// Synthetic players running laps around the map origin. Useful for trying
/// the broker without a game.
#[derive(Debug, Clone)]
pub struct DemoGenerator {
    world_name: String,
    players: usize,
    radius: f32,
    /// Radians advanced per generated state.
    step: f32,
    tick: u64,
}

impl DemoGenerator {
    pub fn new(world_name: impl Into<String>, players: usize) -> Self {
        Self {
            world_name: world_name.into(),
            players,
            radius: 1200.0,
            step: TAU / 200.0,
            tick: 0,
        }
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    fn player(&self, index: usize) -> RadarPlayerInfo {
        let offset = TAU * index as f32 / self.players.max(1) as f32;
        let angle = offset + self.step * self.tick as f32;
        let team_id = if index % 2 == 0 { 2 } else { 3 };

        RadarPlayerInfo {
            controller_entity_id: index as u32 + 1,
            team_id,
            player_health: 100 - (self.tick % 100) as i32,
            player_has_defuser: team_id == 3,
            player_name: format!("bot-{}", index + 1),
            weapon: 7,
            player_flashtime: 0.0,
            position: [self.radius * angle.cos(), self.radius * angle.sin(), 0.0],
            rotation: (angle.to_degrees() + 90.0) % 360.0,
        }
    }
}

impl RadarGenerator for DemoGenerator {
    fn generate_state(&mut self) -> anyhow::Result<RadarState> {
        let players: Vec<RadarPlayerInfo> = (0..self.players).map(|index| self.player(index)).collect();
        let bomb = players.first().map(|carrier| RadarBombInfo {
            position: carrier.position,
            state: C4State::Carried,
            bomb_site: None,
        });

        self.tick = self.tick.wrapping_add(1);
        Ok(RadarState {
            world_name: self.world_name.clone(),
            players,
            bomb,
        })
    }
}
