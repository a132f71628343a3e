//! Registry of projectiles that are still in flight.

use log::{debug, warn};
use shared::ProjectileSpawn;
use std::collections::VecDeque;
use std::time::SystemTime;
use tokio::sync::RwLock;

/// Upper bound on stored projectiles. Recording past it evicts the oldest.
pub const MAX_TRACKED_PROJECTILES: usize = 1024;

/// A projectile together with the player who fired it.
#[derive(Debug, Clone, PartialEq)]
pub struct Projectile {
    pub owner: String,
    pub spawn: ProjectileSpawn,
}

/// Projectiles reported by clients, kept until their TTL runs out.
///
/// Positions are never stored; they are derived from each spawn on demand.
/// Expiry is judged against the server clock, never a client's spawn time.
#[derive(Debug, Default)]
pub struct ProjectileRegistry {
    projectiles: RwLock<VecDeque<Projectile>>,
}

impl ProjectileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a projectile, first dropping any that have expired by now.
    pub async fn record(&self, owner: &str, spawn: ProjectileSpawn) {
        self.record_at(owner, spawn, SystemTime::now()).await;
    }

    async fn record_at(&self, owner: &str, spawn: ProjectileSpawn, now: SystemTime) {
        let mut projectiles = self.projectiles.write().await;
        let before = projectiles.len();
        projectiles.retain(|p| !p.spawn.is_expired(now));
        if projectiles.len() < before {
            debug!("Pruned {} expired projectiles", before - projectiles.len());
        }

        if projectiles.len() >= MAX_TRACKED_PROJECTILES {
            if let Some(evicted) = projectiles.pop_front() {
                warn!(
                    "Projectile registry full, evicting one fired by {}",
                    evicted.owner
                );
            }
        }

        projectiles.push_back(Projectile {
            owner: owner.to_string(),
            spawn,
        });
    }

    /// Prunes everything expired at `now` and returns what is left, oldest
    /// first.
    pub async fn live(&self, now: SystemTime) -> Vec<Projectile> {
        let mut projectiles = self.projectiles.write().await;
        projectiles.retain(|p| !p.spawn.is_expired(now));
        projectiles.iter().cloned().collect()
    }

    /// Number of stored projectiles, including any not yet pruned.
    pub async fn len(&self) -> usize {
        self.projectiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.projectiles.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Vec2, MAX_PROJECTILE_TTL};
    use std::time::{Duration, UNIX_EPOCH};

    fn epoch(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn spawn_at(time: SystemTime) -> ProjectileSpawn {
        ProjectileSpawn::new(time, Vec2::ZERO, Duration::from_secs(5), Vec2::new(10.0, 0.0))
    }

    #[tokio::test]
    async fn test_record_and_live() {
        let registry = ProjectileRegistry::new();
        registry.record_at("alice", spawn_at(epoch(100)), epoch(100)).await;
        registry.record_at("bobby", spawn_at(epoch(101)), epoch(101)).await;

        let live = registry.live(epoch(102)).await;
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].owner, "alice");
        assert_eq!(live[1].owner, "bobby");
    }

    #[tokio::test]
    async fn test_live_prunes_expired() {
        let registry = ProjectileRegistry::new();
        registry.record_at("alice", spawn_at(epoch(100)), epoch(100)).await;
        registry.record_at("bobby", spawn_at(epoch(103)), epoch(103)).await;

        let live = registry.live(epoch(106)).await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].owner, "bobby");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_record_prunes_by_server_clock() {
        let registry = ProjectileRegistry::new();
        registry.record_at("alice", spawn_at(epoch(100)), epoch(100)).await;
        registry.record_at("bobby", spawn_at(epoch(101)), epoch(200)).await;

        assert_eq!(registry.len().await, 1);
        assert!(!registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_future_spawn_time_keeps_others() {
        let registry = ProjectileRegistry::new();
        let now = SystemTime::now();
        registry.record("alice", spawn_at(now)).await;
        registry
            .record("bobby", spawn_at(now + Duration::from_secs(10)))
            .await;

        let owners: Vec<String> = registry
            .live(now + Duration::from_secs(1))
            .await
            .into_iter()
            .map(|p| p.owner)
            .collect();
        assert_eq!(owners, vec!["alice".to_string(), "bobby".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_is_bounded() {
        let registry = ProjectileRegistry::new();
        let now = SystemTime::now();
        for i in 0..MAX_TRACKED_PROJECTILES + 500 {
            let spawn = ProjectileSpawn::new(
                now + Duration::from_secs(3600),
                Vec2::new(i as f64, 0.0),
                MAX_PROJECTILE_TTL,
                Vec2::ZERO,
            );
            registry.record_at("alice", spawn, now).await;
        }

        assert_eq!(registry.len().await, MAX_TRACKED_PROJECTILES);
        let live = registry.live(now).await;
        assert_eq!(live[0].spawn.start.x, 500.0);
    }
}
