//! Client-side replica of the shared world.
//!
//! [`RemoteWorld`] folds the packets relayed by the server into the state a
//! renderer draws: every other player's latest vitals and the projectiles
//! still in flight. The local player is owned by the caller and never
//! tracked here.

use log::{debug, info};
use shared::{Packet, ProjectileSpawn, Vec2, Vitals, STARTING_HEALTH};
use std::collections::HashMap;
use std::time::SystemTime;

/// Something the caller may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    PlayerJoined(String),
    PlayerMoved(String),
    PlayerLeft(String),
    ProjectileFired(ProjectileSpawn),
    /// `init_world` replaced the set of known players.
    Synced(usize),
    /// The server is going away; the caller should disconnect.
    ServerShutdown,
}

/// Every other player's latest vitals plus the projectiles in flight.
#[derive(Debug, Default)]
pub struct RemoteWorld {
    local_name: String,
    players: HashMap<String, Vitals>,
    projectiles: Vec<ProjectileSpawn>,
}

impl RemoteWorld {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            ..Self::default()
        }
    }

    /// Applies one received packet. Packets that only matter during the
    /// handshake are ignored.
    pub fn apply(&mut self, packet: Packet) -> Option<WorldEvent> {
        match packet {
            Packet::Vitals(vitals) => {
                if vitals.name == self.local_name {
                    return None;
                }
                let name = vitals.name.clone();
                self.players.insert(name.clone(), vitals);
                Some(WorldEvent::PlayerMoved(name))
            }
            Packet::UserJoined { name } => {
                if name == self.local_name {
                    return None;
                }
                info!("{} joined the game!", name);
                // placeholder until their first vitals report arrives
                self.players
                    .entry(name.clone())
                    .or_insert_with(|| Vitals::new(name.clone(), 0.0, 0.0, 0.0, STARTING_HEALTH));
                Some(WorldEvent::PlayerJoined(name))
            }
            Packet::InitWorld(entries) => {
                self.players = entries
                    .into_iter()
                    .filter(|vitals| vitals.name != self.local_name)
                    .map(|vitals| (vitals.name.clone(), vitals))
                    .collect();
                Some(WorldEvent::Synced(self.players.len()))
            }
            Packet::Disconnect { name } => {
                info!("{} left the game!", name);
                self.players.remove(&name);
                Some(WorldEvent::PlayerLeft(name))
            }
            Packet::CreateProjectile(spawn) => {
                self.prune(SystemTime::now());
                self.projectiles.push(spawn.clone());
                Some(WorldEvent::ProjectileFired(spawn))
            }
            Packet::ServerShutdown => {
                info!("Server is shutting down");
                Some(WorldEvent::ServerShutdown)
            }
            other => {
                debug!("Ignoring {} outside of the handshake", other.kind());
                None
            }
        }
    }

    pub fn players(&self) -> &HashMap<String, Vitals> {
        &self.players
    }

    pub fn player(&self, name: &str) -> Option<&Vitals> {
        self.players.get(name)
    }

    /// Drops expired projectiles and returns the current position of each
    /// remaining one.
    pub fn live_projectiles(&mut self, now: SystemTime) -> Vec<Vec2> {
        self.prune(now);
        self.projectiles
            .iter()
            .filter_map(|projectile| projectile.position_at(now))
            .collect()
    }

    fn prune(&mut self, now: SystemTime) {
        self.projectiles.retain(|projectile| !projectile.is_expired(now));
    }
}
