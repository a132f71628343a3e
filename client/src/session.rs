//! Joining the shared world.

use crate::transport::{Transport, TransportError};
use log::{debug, info, warn};
use shared::{seed_number, JoinMode, Packet, Vitals, Welcome};
use std::time::Duration;
use tokio::time::Instant;

/// An accepted `register` or `connect` request.
#[derive(Debug, Clone)]
pub struct Session {
    mode: JoinMode,
    welcome: Welcome,
    backlog: Vec<Packet>,
}

impl Session {
    /// Sends the join request for `name` and waits for the server's verdict.
    ///
    /// World updates can reach the client before its own welcome; those are
    /// kept and handed out by [`Session::take_backlog`] in arrival order.
    pub async fn join(
        transport: &Transport,
        mode: JoinMode,
        name: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let request = match mode {
            JoinMode::Register => Packet::Register {
                name: name.to_string(),
            },
            JoinMode::Connect => Packet::Connect {
                name: name.to_string(),
            },
        };
        transport.send_packet(&request).await?;
        info!("Sent {} request for {}", mode, name);

        let deadline = Instant::now() + timeout;
        let mut backlog = Vec::new();

        loop {
            let packet = match tokio::time::timeout_at(deadline, transport.recv()).await {
                Ok(Some(packet)) => packet,
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => return Err(TransportError::HandshakeTimeout(timeout)),
            };

            match (mode, packet) {
                (JoinMode::Register, Packet::RegisterSuccess(welcome))
                | (JoinMode::Connect, Packet::ConnectSuccess(welcome)) => {
                    info!(
                        "Joined as {} at ({}, {}), world seed {}",
                        welcome.vitals.name, welcome.vitals.x, welcome.vitals.y, welcome.seed
                    );
                    return Ok(Self {
                        mode,
                        welcome,
                        backlog,
                    });
                }
                (JoinMode::Register, Packet::RegisterFailure { reason })
                | (JoinMode::Connect, Packet::ConnectFailure { reason }) => {
                    warn!("Server rejected {} as {}: {}", mode, name, reason);
                    return Err(TransportError::Rejected(reason));
                }
                (_, Packet::ServerShutdown) => return Err(TransportError::Closed),
                (_, other) => {
                    debug!("Buffering {} received before the welcome", other.kind());
                    backlog.push(other);
                }
            }
        }
    }

    /// Whether this session registered or resumed its player.
    pub fn mode(&self) -> JoinMode {
        self.mode
    }

    /// The player's own name.
    pub fn name(&self) -> &str {
        &self.welcome.vitals.name
    }

    /// The terrain seed text as sent by the server.
    pub fn seed(&self) -> &str {
        &self.welcome.seed
    }

    /// The integer seed for terrain generation.
    pub fn world_seed(&self) -> i64 {
        seed_number(&self.welcome.seed)
    }

    /// Own vitals as assigned by the server.
    pub fn vitals(&self) -> &Vitals {
        &self.welcome.vitals
    }

    /// Packets that arrived before the welcome, oldest first. Later calls
    /// return nothing.
    pub fn take_backlog(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.backlog)
    }
}
