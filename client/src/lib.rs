//! # Arena Client Library
//!
//! The client side of the multiplayer synchronization layer. A game front
//! end uses it to reach the server, claim or resume a player name, report
//! its own player's vitals and projectiles, and follow what everyone else is
//! doing.
//!
//! ## Module Organization
//!
//! ### Transport Module (`transport`)
//! The TCP connection itself. A background task decodes received frames
//! into a bounded queue of packets which the game loop drains with a
//! non-blocking `poll`, so a slow network never stalls a frame. Writes give up after a run of
//! consecutive failures.
//!
//! ### Session Module (`session`)
//! The `register` / `connect` handshake. A successful join yields the world
//! seed for terrain generation and the vitals the server assigned.
//!
//! ### World Module (`world`)
//! A replica of the other players and the projectiles in flight, built from
//! the frames the server relays. Projectile positions are derived from their
//! spawn parameters on demand.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::session::Session;
//! use client::transport::{Poll, Transport};
//! use client::world::RemoteWorld;
//! use shared::JoinMode;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Transport::start("127.0.0.1:8080").await?;
//!     let mut session =
//!         Session::join(&transport, JoinMode::Register, "player1", Duration::from_secs(5)).await?;
//!
//!     let mut world = RemoteWorld::new(session.name());
//!     for packet in session.take_backlog() {
//!         world.apply(packet);
//!     }
//!
//!     while let Poll::Packet(packet) = transport.poll() {
//!         world.apply(packet);
//!     }
//!     transport.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod session;
pub mod transport;
pub mod world;
