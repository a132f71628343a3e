//! Registry of known players and their live connections.
//!
//! This module is the server's directory of users:
//! - Registration with username validation and a randomized spawn point
//! - Reconnection under an existing name once the previous connection is gone
//! - Last-known vitals per player
//! - Fan-out of frames to every connected player
//!
//! Every operation runs under a single reader/writer lock that is held only
//! for the map access itself. Callers receive cloned [`User`] snapshots, never
//! references into the map, and frames are delivered through
//! [`ConnectionHandle`]s after the lock has been released.

use crate::connection::{ConnectionHandle, ConnectionId};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{validate_username, Packet, UsernameError, Vitals, STARTING_HEALTH, WORLD_SIZE};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;

/// Why a registry operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidUsername(#[from] UsernameError),
    #[error("username already taken")]
    UsernameTaken,
    #[error("user not found")]
    UserNotFound,
    #[error("user already connected")]
    AlreadyConnected,
}

/// A player record.
///
/// Records outlive their connections: disconnecting only clears the handle,
/// so the same name can connect again later.
#[derive(Debug, Clone)]
pub struct User {
    /// Unique username, fixed at registration.
    pub name: String,
    /// Last reported vitals; the spawn point until the first report.
    pub vitals: Vitals,
    /// Live connection, `None` while the player is away.
    connection: Option<ConnectionHandle>,
}

impl User {
    /// Whether a live connection is bound to this player.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The bound connection, if any.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients whose queue was full or closed.
    pub failed: usize,
}

/// Directory of every player known to the server.
///
/// Usernames are unique and at most one live connection is bound to each
/// name. Spawn points are drawn from the registry's own generator.
pub struct UserRegistry {
    users: RwLock<HashMap<String, User>>,
    rng: Mutex<StdRng>,
}

impl UserRegistry {
    /// Creates an empty registry with an entropy-seeded spawn generator.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates a registry whose spawn positions are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Registers a new player bound to `connection`.
    ///
    /// Validation, the uniqueness check and the insert all happen under one
    /// write lock, so two concurrent registrations of the same name cannot
    /// both succeed.
    pub async fn create(
        &self,
        name: &str,
        connection: ConnectionHandle,
    ) -> Result<User, RegistryError> {
        validate_username(name)?;

        let mut users = self.users.write().await;
        if users.contains_key(name) {
            return Err(RegistryError::UsernameTaken);
        }

        let user = User {
            name: name.to_string(),
            vitals: self.spawn_vitals(name),
            connection: Some(connection),
        };
        users.insert(user.name.clone(), user.clone());

        info!(
            "User {} registered at ({}, {})",
            user.name, user.vitals.x, user.vitals.y
        );
        Ok(user)
    }

    /// Binds `connection` to an existing, currently disconnected player.
    pub async fn connect(
        &self,
        name: &str,
        connection: ConnectionHandle,
    ) -> Result<User, RegistryError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(name).ok_or(RegistryError::UserNotFound)?;

        // refuse rather than kick the client that is already playing
        if user.connection.is_some() {
            return Err(RegistryError::AlreadyConnected);
        }

        user.connection = Some(connection);
        info!("User {} reconnected", user.name);
        Ok(user.clone())
    }

    /// Clears the player's connection if it is still `connection`, then tells
    /// every other connected player that they left.
    ///
    /// Returns false when there was nothing to clear, in which case no notice
    /// is sent. Repeated calls for the same connection are therefore harmless.
    pub async fn disconnect(&self, name: &str, connection: ConnectionId) -> bool {
        let cleared = {
            let mut users = self.users.write().await;
            match users.get_mut(name) {
                Some(user) if user.connection.as_ref().map(|c| c.id()) == Some(connection) => {
                    user.connection = None;
                    true
                }
                _ => false,
            }
        };

        if cleared {
            info!("User {} disconnected", name);
            self.broadcast(
                &Packet::Disconnect {
                    name: name.to_string(),
                },
                &[name],
            )
            .await;
        }

        cleared
    }

    /// Replaces the stored vitals of a player. The stored name is kept.
    pub async fn update(&self, name: &str, vitals: Vitals) -> Result<(), RegistryError> {
        let mut users = self.users.write().await;
        let user = users.get_mut(name).ok_or(RegistryError::UserNotFound)?;
        user.vitals = vitals.attributed_to(name);
        Ok(())
    }

    /// Sends `packet` to every connected player not named in `exclude`.
    ///
    /// Recipients are snapshotted under the read lock and served after it is
    /// released. A failing recipient is logged and skipped.
    pub async fn broadcast(&self, packet: &Packet, exclude: &[&str]) -> BroadcastReport {
        let recipients: Vec<(String, ConnectionHandle)> = {
            let users = self.users.read().await;
            users
                .values()
                .filter(|user| !exclude.contains(&user.name.as_str()))
                .filter_map(|user| {
                    user.connection
                        .clone()
                        .map(|connection| (user.name.clone(), connection))
                })
                .collect()
        };

        let message = packet.to_message();
        let mut report = BroadcastReport::default();
        for (name, connection) in recipients {
            match connection.send_message(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Failed to deliver {} to {}: {}", message.kind, name, e);
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Broadcast {}: {} delivered, {} failed",
            message.kind, report.delivered, report.failed
        );
        report
    }

    /// Snapshot of one player record.
    pub async fn get(&self, name: &str) -> Option<User> {
        self.users.read().await.get(name).cloned()
    }

    /// Whether `name` exists and has a live connection.
    pub async fn is_connected(&self, name: &str) -> bool {
        self.users
            .read()
            .await
            .get(name)
            .is_some_and(User::is_connected)
    }

    /// Vitals of every connected player not named in `exclude`, ordered by
    /// name.
    pub async fn connected_vitals(&self, exclude: &[&str]) -> Vec<Vitals> {
        let mut vitals: Vec<Vitals> = {
            let users = self.users.read().await;
            users
                .values()
                .filter(|user| user.is_connected() && !exclude.contains(&user.name.as_str()))
                .map(|user| user.vitals.clone())
                .collect()
        };
        vitals.sort_by(|a, b| a.name.cmp(&b.name));
        vitals
    }

    /// Name to vitals of every connected player, for renderers.
    pub async fn connected_snapshot(&self) -> HashMap<String, Vitals> {
        self.users
            .read()
            .await
            .values()
            .filter(|user| user.is_connected())
            .map(|user| (user.name.clone(), user.vitals.clone()))
            .collect()
    }

    /// Number of known players, connected or not.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    /// Number of players with a live connection.
    pub async fn connected_count(&self) -> usize {
        self.users
            .read()
            .await
            .values()
            .filter(|user| user.is_connected())
            .count()
    }

    fn spawn_vitals(&self, name: &str) -> Vitals {
        let (x, y) = match self.rng.lock() {
            Ok(mut rng) => (rng.gen_range(0..WORLD_SIZE), rng.gen_range(0..WORLD_SIZE)),
            // a poisoned generator still holds a usable state
            Err(poisoned) => {
                let mut rng = poisoned.into_inner();
                (rng.gen_range(0..WORLD_SIZE), rng.gen_range(0..WORLD_SIZE))
            }
        };
        Vitals::new(name, f64::from(x), f64::from(y), 0.0, STARTING_HEALTH)
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
