//! TCP listener and server lifecycle.

use crate::connection::ConnectionId;
use crate::handler::{ConnectionHandler, ServerContext};
use crate::projectiles::ProjectileRegistry;
use crate::registry::UserRegistry;
use log::{debug, error, info};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::codec::FIELD_DELIMITER;
use shared::Packet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SEED_LENGTH: usize = 16;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("world seed must not contain {0:?}")]
    InvalidSeed(char),
}

/// Generates a fresh alphanumeric world seed.
pub fn random_seed() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SEED_LENGTH)
        .map(char::from)
        .collect()
}

pub struct Server;

impl Server {
    /// Binds `addr` and starts accepting players in the background.
    ///
    /// A `None` seed picks a random one. The seed travels inside
    /// `|`-delimited welcome payloads, so it may not contain `|` itself.
    pub async fn start(addr: &str, seed: Option<String>) -> Result<ServerHandle, ServerError> {
        let seed = seed.unwrap_or_else(random_seed);
        if seed.contains(FIELD_DELIMITER) {
            return Err(ServerError::InvalidSeed(FIELD_DELIMITER));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!("Server listening on {} with world seed {}", local_addr, seed);

        let (stop_tx, stop_rx) = watch::channel(false);
        let context = ServerContext::new(
            Arc::new(UserRegistry::new()),
            Arc::new(ProjectileRegistry::new()),
            seed,
            stop_rx,
        );
        let accept_task = tokio::spawn(accept_loop(listener, context.clone()));

        Ok(ServerHandle {
            local_addr,
            context,
            stop_tx,
            stopped: AtomicBool::new(false),
            accept_task,
        })
    }
}

/// Accepts connections until the stop signal is raised, spawning one handler
/// task per socket. The listener is closed when this returns.
async fn accept_loop(listener: TcpListener, context: ServerContext) {
    let mut stop = context.shutdown.clone();
    let mut next_id: u64 = 0;

    loop {
        if *stop.borrow_and_update() {
            break;
        }

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    next_id += 1;
                    let id = ConnectionId::new(next_id);
                    info!("Client {} connected from {}", id, addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    tokio::spawn(ConnectionHandler::serve(stream, id, context.clone()));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    info!("Accept loop stopped");
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    context: ServerContext,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn seed(&self) -> &str {
        &self.context.seed
    }

    pub fn registry(&self) -> Arc<UserRegistry> {
        Arc::clone(&self.context.registry)
    }

    pub fn projectiles(&self) -> Arc<ProjectileRegistry> {
        Arc::clone(&self.context.projectiles)
    }

    /// Tells every connected player the server is going away, then stops
    /// accepting. Later calls do nothing.
    ///
    /// Open sessions are not torn down here; their handlers observe the stop
    /// signal and unwind after the notice has been queued.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let report = self
            .context
            .registry
            .broadcast(&Packet::ServerShutdown, &[])
            .await;
        info!(
            "Shutting down, notified {} players ({} unreachable)",
            report.delivered, report.failed
        );

        // send_replace succeeds even with no receivers left
        self.stop_tx.send_replace(true);
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        if let Err(e) = self.accept_task.await {
            error!("Accept loop failed: {}", e);
        }
    }
}
