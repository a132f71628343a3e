//! Projectile kinematics.
//!
//! A projectile is fully described by where and when it was fired and how
//! fast it travels. Its position at any instant is derived from those values,
//! so there is no per-frame state to drift between clients.

use std::time::{Duration, SystemTime};

pub const DEFAULT_PROJECTILE_TTL: Duration = Duration::from_secs(5);
/// Longest lifetime a projectile may be announced with.
pub const MAX_PROJECTILE_TTL: Duration = Duration::from_secs(60);

/// Represents a vector in 2D world space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Returns the unit direction vector for an angle in radians.
    pub fn from_angle(radians: f64) -> Self {
        Self {
            x: radians.cos(),
            y: radians.sin(),
        }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn scale(&self, scalar: f64) -> Vec2 {
        Vec2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    pub fn add(&self, other: &Vec2) -> Vec2 {
        Vec2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }
}

/// A replicated projectile as carried by a `create_projectile` frame.
///
/// Velocity is expressed in world units per second.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectileSpawn {
    pub spawn_time: SystemTime,
    pub start: Vec2,
    pub ttl: Duration,
    pub velocity: Vec2,
}

impl ProjectileSpawn {
    pub fn new(spawn_time: SystemTime, start: Vec2, ttl: Duration, velocity: Vec2) -> Self {
        Self {
            spawn_time,
            start,
            ttl,
            velocity,
        }
    }

    /// Fires a projectile from `origin` towards `rotation` at `speed`.
    pub fn fired(origin: Vec2, rotation: f64, speed: f64, spawn_time: SystemTime) -> Self {
        Self::new(
            spawn_time,
            origin,
            DEFAULT_PROJECTILE_TTL,
            Vec2::from_angle(rotation).scale(speed),
        )
    }

    /// Position `elapsed` after spawning, or `None` once the TTL has passed.
    pub fn position_after(&self, elapsed: Duration) -> Option<Vec2> {
        if elapsed > self.ttl {
            return None;
        }
        Some(self.start.add(&self.velocity.scale(elapsed.as_secs_f64())))
    }

    /// Position at wall-clock time `now`.
    ///
    /// A `now` earlier than the spawn time (clock skew between peers) is
    /// clamped to the starting position.
    pub fn position_at(&self, now: SystemTime) -> Option<Vec2> {
        self.position_after(self.elapsed_at(now))
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.elapsed_at(now) > self.ttl
    }

    pub fn expires_at(&self) -> SystemTime {
        self.spawn_time + self.ttl
    }

    fn elapsed_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.spawn_time).unwrap_or(Duration::ZERO)
    }
}
