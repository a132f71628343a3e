//! # Arena Server Library
//!
//! The server side of the multiplayer synchronization layer. It keeps the
//! directory of players, relays what each client reports about itself to
//! everyone else, and tells joiners which world seed to generate terrain
//! from.
//!
//! ## Core Responsibilities
//!
//! ### Session Handling
//! Every TCP connection starts unauthenticated. A `register` frame creates a
//! new player under a validated, unique name; a `connect` frame resumes an
//! existing player that is not currently connected. Either way the client
//! receives its own vitals and the world seed, followed by an `init_world`
//! snapshot of the other connected players.
//!
//! ### Relaying
//! Clients self-report their position, orientation and health. The server
//! stores the latest report per player, attributes it to the sender's
//! authenticated name, and fans it out to every other connected player.
//! Projectiles are relayed the same way and remembered until they expire.
//!
//! ### Lifecycle
//! A player leaves with an explicit `disconnect` or by dropping the socket.
//! Both paths release the player's connection exactly once and notify the
//! remaining players. Records survive, so the same name can reconnect.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! One accept-loop task spawns a handler task per socket; each handler also
//! owns a writer task. Handlers only cooperate through the registries.
//!
//! ### No I/O Under Locks
//! Registries guard their maps with `tokio::sync::RwLock` held only for the
//! map operation. Sending to a player enqueues onto that connection's bounded
//! outbound queue, so a stalled client never blocks registration or fan-out
//! to others.
//!
//! ## Module Organization
//!
//! - `connection`: connection handles and the per-connection writer task
//! - `registry`: the user registry and broadcast
//! - `projectiles`: live projectile bookkeeping
//! - `handler`: the per-connection protocol state machine
//! - `network`: the TCP listener, world seed and shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::start("127.0.0.1:8080", None).await?;
//!     println!("listening on {}", server.local_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod handler;
pub mod network;
pub mod projectiles;
pub mod registry;
