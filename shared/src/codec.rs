//! Line-oriented wire codec.
//!
//! Every frame on the wire is a JSON envelope `{"t":"<kind>","v":"<payload>"}`
//! terminated by a single newline. JSON string escaping guarantees that the
//! payload never contains a raw newline, so readers split the stream on
//! `\n` without any length prefix.
//!
//! Payloads are kind-specific and made of `|`-delimited scalar fields (see
//! [`Packet`] for the catalogue). [`Message`] is the raw envelope; [`Packet`]
//! is the validated, strongly typed form the rest of the system works with.

use crate::projectile::{ProjectileSpawn, Vec2, MAX_PROJECTILE_TTL};
use crate::Vitals;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const FRAME_DELIMITER: u8 = b'\n';
pub const FIELD_DELIMITER: char = '|';
/// Separates the vitals entries of an `init_world` payload.
pub const ENTRY_DELIMITER: char = '/';

/// Wire tags for every message kind.
pub mod kind {
    pub const REGISTER: &str = "register";
    pub const CONNECT: &str = "connect";
    pub const REGISTER_SUCCESS: &str = "register_success";
    pub const CONNECT_SUCCESS: &str = "connect_success";
    pub const REGISTER_FAILURE: &str = "register_failure";
    pub const CONNECT_FAILURE: &str = "connect_failure";
    pub const VITALS: &str = "vitals";
    pub const CREATE_PROJECTILE: &str = "create_projectile";
    pub const USER_JOINED: &str = "user_joined";
    pub const DISCONNECT: &str = "disconnect";
    pub const DISCONNECTED: &str = "disconnected";
    pub const INIT_WORLD: &str = "init_world";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

const VITALS_FIELDS: usize = 5;
const WELCOME_FIELDS: usize = 6;
const PROJECTILE_FIELDS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame envelope: {0}")]
    MalformedEnvelope(String),
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: String, reason: String },
    #[error("unsupported message type supplied: {0}")]
    UnsupportedKind(String),
}

fn malformed(kind: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedPayload {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

/// The raw two-field envelope exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "v", default)]
    pub payload: String,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Renders the envelope as one newline-terminated frame.
    pub fn pack(&self) -> Vec<u8> {
        // A struct of two strings always serializes.
        let mut frame = serde_json::to_vec(self).unwrap_or_default();
        frame.push(FRAME_DELIMITER);
        frame
    }

    /// Parses one frame. A trailing delimiter (`\n` or `\r\n`) is ignored.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        let line = frame.trim_end_matches(['\n', '\r']);
        serde_json::from_str(line).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }
}

/// Payload of a `register_success` / `connect_success` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    pub seed: String,
    pub vitals: Vitals,
}

/// The message catalogue.
///
/// | kind | payload |
/// |---|---|
/// | `register` / `connect` | username |
/// | `register_success` / `connect_success` | `seed\|name\|x\|y\|rot\|health` |
/// | `register_failure` / `connect_failure` | error text |
/// | `vitals` | `name\|x\|y\|rot\|health` |
/// | `create_projectile` | `spawnTime\|startX\|startY\|ttl\|velX\|velY` |
/// | `user_joined` / `disconnect` | username |
/// | `disconnected` | empty |
/// | `init_world` | `/`-joined vitals entries |
/// | `server_shutdown` | empty |
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Register { name: String },
    Connect { name: String },
    RegisterSuccess(Welcome),
    ConnectSuccess(Welcome),
    RegisterFailure { reason: String },
    ConnectFailure { reason: String },
    Vitals(Vitals),
    CreateProjectile(ProjectileSpawn),
    UserJoined { name: String },
    Disconnect { name: String },
    Disconnected,
    InitWorld(Vec<Vitals>),
    ServerShutdown,
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Register { .. } => kind::REGISTER,
            Packet::Connect { .. } => kind::CONNECT,
            Packet::RegisterSuccess(_) => kind::REGISTER_SUCCESS,
            Packet::ConnectSuccess(_) => kind::CONNECT_SUCCESS,
            Packet::RegisterFailure { .. } => kind::REGISTER_FAILURE,
            Packet::ConnectFailure { .. } => kind::CONNECT_FAILURE,
            Packet::Vitals(_) => kind::VITALS,
            Packet::CreateProjectile(_) => kind::CREATE_PROJECTILE,
            Packet::UserJoined { .. } => kind::USER_JOINED,
            Packet::Disconnect { .. } => kind::DISCONNECT,
            Packet::Disconnected => kind::DISCONNECTED,
            Packet::InitWorld(_) => kind::INIT_WORLD,
            Packet::ServerShutdown => kind::SERVER_SHUTDOWN,
        }
    }

    /// Encodes the packet into its wire envelope.
    pub fn to_message(&self) -> Message {
        let payload = match self {
            Packet::Register { name }
            | Packet::Connect { name }
            | Packet::UserJoined { name }
            | Packet::Disconnect { name } => name.clone(),
            Packet::RegisterSuccess(welcome) | Packet::ConnectSuccess(welcome) => {
                format!(
                    "{}{FIELD_DELIMITER}{}",
                    welcome.seed,
                    encode_vitals(&welcome.vitals)
                )
            }
            Packet::RegisterFailure { reason } | Packet::ConnectFailure { reason } => {
                reason.clone()
            }
            Packet::Vitals(vitals) => encode_vitals(vitals),
            Packet::CreateProjectile(spawn) => encode_projectile(spawn),
            Packet::InitWorld(entries) => entries
                .iter()
                .map(encode_vitals)
                .collect::<Vec<_>>()
                .join(&ENTRY_DELIMITER.to_string()),
            Packet::Disconnected | Packet::ServerShutdown => String::new(),
        };

        Message::new(self.kind(), payload)
    }

    /// Shorthand for `to_message().pack()`.
    pub fn pack(&self) -> Vec<u8> {
        self.to_message().pack()
    }

    /// Decodes and validates an envelope according to its kind.
    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let payload = message.payload.as_str();
        let packet = match message.kind.as_str() {
            kind::REGISTER => Packet::Register {
                name: payload.to_string(),
            },
            kind::CONNECT => Packet::Connect {
                name: payload.to_string(),
            },
            kind::REGISTER_SUCCESS => {
                Packet::RegisterSuccess(decode_welcome(kind::REGISTER_SUCCESS, payload)?)
            }
            kind::CONNECT_SUCCESS => {
                Packet::ConnectSuccess(decode_welcome(kind::CONNECT_SUCCESS, payload)?)
            }
            kind::REGISTER_FAILURE => Packet::RegisterFailure {
                reason: payload.to_string(),
            },
            kind::CONNECT_FAILURE => Packet::ConnectFailure {
                reason: payload.to_string(),
            },
            kind::VITALS => {
                let fields: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
                Packet::Vitals(decode_vitals(kind::VITALS, &fields)?)
            }
            kind::CREATE_PROJECTILE => {
                Packet::CreateProjectile(decode_projectile(kind::CREATE_PROJECTILE, payload)?)
            }
            kind::USER_JOINED => Packet::UserJoined {
                name: payload.to_string(),
            },
            kind::DISCONNECT => Packet::Disconnect {
                name: payload.to_string(),
            },
            kind::DISCONNECTED => Packet::Disconnected,
            kind::INIT_WORLD => Packet::InitWorld(decode_init_world(payload)?),
            kind::SERVER_SHUTDOWN => Packet::ServerShutdown,
            other => return Err(ProtocolError::UnsupportedKind(other.to_string())),
        };

        Ok(packet)
    }

    /// Parses one raw frame straight into a packet.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        Self::from_message(&Message::from_frame(frame)?)
    }
}

impl From<&Packet> for Message {
    fn from(packet: &Packet) -> Self {
        packet.to_message()
    }
}

impl TryFrom<&Message> for Packet {
    type Error = ProtocolError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        Packet::from_message(message)
    }
}

fn encode_vitals(vitals: &Vitals) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        vitals.name, vitals.x, vitals.y, vitals.rotation, vitals.health
    )
}

fn encode_projectile(spawn: &ProjectileSpawn) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        encode_time(spawn.spawn_time),
        spawn.start.x,
        spawn.start.y,
        encode_duration(spawn.ttl),
        spawn.velocity.x,
        spawn.velocity.y
    )
}

fn decode_vitals(kind: &str, fields: &[&str]) -> Result<Vitals, ProtocolError> {
    if fields.len() != VITALS_FIELDS {
        return Err(malformed(
            kind,
            format!(
                "incorrect vitals component count: expected {VITALS_FIELDS}, got {}",
                fields.len()
            ),
        ));
    }

    Ok(Vitals {
        name: fields[0].to_string(),
        x: parse_float(kind, "x", fields[1])?,
        y: parse_float(kind, "y", fields[2])?,
        rotation: parse_float(kind, "rot", fields[3])?,
        health: fields[4]
            .parse::<u64>()
            .map_err(|e| malformed(kind, format!("failed to parse health: {e}")))?,
    })
}

fn decode_welcome(kind: &str, payload: &str) -> Result<Welcome, ProtocolError> {
    let fields: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
    if fields.len() != WELCOME_FIELDS {
        return Err(malformed(
            kind,
            format!(
                "incorrect {kind} component count: expected {WELCOME_FIELDS}, got {}",
                fields.len()
            ),
        ));
    }

    Ok(Welcome {
        seed: fields[0].to_string(),
        vitals: decode_vitals(kind, &fields[1..])?,
    })
}

fn decode_projectile(kind: &str, payload: &str) -> Result<ProjectileSpawn, ProtocolError> {
    let fields: Vec<&str> = payload.split(FIELD_DELIMITER).collect();
    if fields.len() != PROJECTILE_FIELDS {
        return Err(malformed(
            kind,
            format!(
                "incorrect create_projectile component count: expected {PROJECTILE_FIELDS}, got {}",
                fields.len()
            ),
        ));
    }

    let nanos = fields[0]
        .parse::<i64>()
        .map_err(|e| malformed(kind, format!("failed to parse spawnTime: {e}")))?;

    let ttl = parse_duration(kind, fields[3])?;
    if ttl > MAX_PROJECTILE_TTL {
        return Err(malformed(
            kind,
            format!("ttl {ttl:?} exceeds maximum of {MAX_PROJECTILE_TTL:?}"),
        ));
    }

    Ok(ProjectileSpawn {
        spawn_time: decode_time(kind, nanos)?,
        start: Vec2::new(
            parse_float(kind, "startX", fields[1])?,
            parse_float(kind, "startY", fields[2])?,
        ),
        ttl,
        velocity: Vec2::new(
            parse_float(kind, "velX", fields[4])?,
            parse_float(kind, "velY", fields[5])?,
        ),
    })
}

fn decode_init_world(payload: &str) -> Result<Vec<Vitals>, ProtocolError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    payload
        .split(ENTRY_DELIMITER)
        .map(|entry| {
            let fields: Vec<&str> = entry.split(FIELD_DELIMITER).collect();
            decode_vitals(kind::INIT_WORLD, &fields)
        })
        .collect()
}

fn parse_float(kind: &str, field: &str, text: &str) -> Result<f64, ProtocolError> {
    let value = text
        .parse::<f64>()
        .map_err(|e| malformed(kind, format!("failed to parse {field}: {e}")))?;
    if !value.is_finite() {
        return Err(malformed(kind, format!("{field} is not finite")));
    }
    Ok(value)
}

/// Nanoseconds relative to the Unix epoch; negative before it.
fn encode_time(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

fn decode_time(kind: &str, nanos: i64) -> Result<SystemTime, ProtocolError> {
    let offset = Duration::from_nanos(nanos.unsigned_abs());
    let time = if nanos >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    time.ok_or_else(|| malformed(kind, "spawnTime out of range"))
}

fn encode_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else {
        format!("{nanos}ns")
    }
}

/// Accepts an unsigned integer followed by `ns`, `us`, `ms` or `s`.
fn parse_duration(kind: &str, text: &str) -> Result<Duration, ProtocolError> {
    let (digits, unit_nanos) = if let Some(digits) = text.strip_suffix("ns") {
        (digits, 1)
    } else if let Some(digits) = text.strip_suffix("us") {
        (digits, 1_000)
    } else if let Some(digits) = text.strip_suffix("ms") {
        (digits, 1_000_000)
    } else if let Some(digits) = text.strip_suffix('s') {
        (digits, 1_000_000_000)
    } else {
        return Err(malformed(kind, format!("ttl has no unit: {text:?}")));
    };

    let value = digits
        .parse::<u64>()
        .map_err(|e| malformed(kind, format!("failed to parse ttl: {e}")))?;
    let nanos = u128::from(value) * unit_nanos;
    let secs = u64::try_from(nanos / 1_000_000_000)
        .map_err(|_| malformed(kind, "ttl out of range"))?;

    Ok(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}
