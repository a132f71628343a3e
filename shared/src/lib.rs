//! Types shared between the game server and its clients: the line-oriented
//! wire codec with its bounded frame reader, the replicated vitals of a
//! player, and projectile kinematics.

pub mod codec;
pub mod framing;
pub mod projectile;

use std::fmt;
use thiserror::Error;

pub use codec::{Message, Packet, ProtocolError, Welcome};
pub use framing::{read_frame, FrameRead, MAX_FRAME_LENGTH};
pub use projectile::{ProjectileSpawn, Vec2, DEFAULT_PROJECTILE_TTL, MAX_PROJECTILE_TTL};

pub const MIN_USERNAME_LENGTH: usize = 5;
pub const MAX_USERNAME_LENGTH: usize = 12;

/// Spawn coordinates are drawn from `0..WORLD_SIZE` on both axes.
pub const WORLD_SIZE: u32 = 8000;
pub const STARTING_HEALTH: u64 = 100;

/// The minimal replicated state of a player.
#[derive(Debug, Clone, PartialEq)]
pub struct Vitals {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
    pub health: u64,
}

impl Vitals {
    pub fn new(name: impl Into<String>, x: f64, y: f64, rotation: f64, health: u64) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            rotation,
            health,
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    /// Returns a copy of these vitals attributed to another player.
    pub fn attributed_to(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsernameError {
    #[error("username must have a minimum length of 5 characters")]
    TooShort,
    #[error("username length must not exceed 12 characters")]
    TooLong,
    #[error("username can only contain letters, numbers, underscores and hyphens")]
    InvalidCharacter(char),
}

/// Checks a username against the length and charset rules.
///
/// Length is counted in characters. Letters and digits may be any Unicode
/// alphanumeric; the only punctuation allowed is `_` and `-`, which keeps
/// names free of the payload delimiters `|` and `/`.
pub fn validate_username(name: &str) -> Result<(), UsernameError> {
    let length = name.chars().count();
    if length < MIN_USERNAME_LENGTH {
        return Err(UsernameError::TooShort);
    }
    if length > MAX_USERNAME_LENGTH {
        return Err(UsernameError::TooLong);
    }

    match name
        .chars()
        .find(|c| !c.is_alphanumeric() && *c != '_' && *c != '-')
    {
        Some(c) => Err(UsernameError::InvalidCharacter(c)),
        None => Ok(()),
    }
}

/// Folds a textual world seed into the integer seed the terrain generator
/// consumes.
pub fn seed_number(seed: &str) -> i64 {
    seed.chars().map(|c| c as i64).sum()
}

/// Which request opened a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Register,
    Connect,
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinMode::Register => write!(f, "register"),
            JoinMode::Connect => write!(f, "connect"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_length_bounds() {
        assert_eq!(validate_username("abc"), Err(UsernameError::TooShort));
        assert_eq!(validate_username("abcd"), Err(UsernameError::TooShort));
        assert!(validate_username("abcde").is_ok());
        assert!(validate_username("abcdefghijkl").is_ok());
        assert_eq!(
            validate_username("abcdefghijklm"),
            Err(UsernameError::TooLong)
        );
    }

    #[test]
    fn test_username_charset() {
        assert!(validate_username("player_1").is_ok());
        assert!(validate_username("big-bob99").is_ok());
        assert_eq!(
            validate_username("bad|name"),
            Err(UsernameError::InvalidCharacter('|'))
        );
        assert_eq!(
            validate_username("with space"),
            Err(UsernameError::InvalidCharacter(' '))
        );
        assert_eq!(
            validate_username("slash/name"),
            Err(UsernameError::InvalidCharacter('/'))
        );
    }

    #[test]
    fn test_username_length_counts_characters() {
        // five characters, ten bytes
        assert!(validate_username("ééééé").is_ok());
    }

    #[test]
    fn test_username_error_messages() {
        assert_eq!(
            UsernameError::TooShort.to_string(),
            "username must have a minimum length of 5 characters"
        );
        assert_eq!(
            UsernameError::TooLong.to_string(),
            "username length must not exceed 12 characters"
        );
    }

    #[test]
    fn test_seed_number() {
        assert_eq!(seed_number(""), 0);
        assert_eq!(seed_number("a"), 97);
        assert_eq!(seed_number("ab"), 97 + 98);
        assert_eq!(seed_number("ab"), seed_number("ba"));
    }

    #[test]
    fn test_vitals_attribution() {
        let vitals = Vitals::new("mallory", 1.0, 2.0, 0.5, 80);
        let attributed = vitals.attributed_to("alice");
        assert_eq!(attributed.name, "alice");
        assert_eq!(attributed.x, 1.0);
        assert_eq!(attributed.y, 2.0);
        assert_eq!(attributed.rotation, 0.5);
        assert_eq!(attributed.health, 80);
    }
}
