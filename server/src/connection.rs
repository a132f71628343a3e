//! Live connection handles and the per-connection writer task.
//!
//! A [`ConnectionHandle`] is what the user registry stores for a connected
//! player. Sending through it only enqueues onto a bounded outbound queue;
//! the socket write happens on the connection's writer task, so callers
//! holding a registry lock never wait on the network.

use log::{debug, error};
use shared::{Message, Packet};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frames a slow client may fall behind by before sends to it start failing.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Identifies one accepted socket for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("outbound queue for {0} is full")]
    QueueFull(SocketAddr),
    #[error("connection to {0} is closed")]
    Closed(SocketAddr),
}

/// Cloneable sending side of one client connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    addr: SocketAddr,
    tx: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Creates a handle together with the queue its writer task drains.
    pub fn new(id: ConnectionId, addr: SocketAddr) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self { id, addr, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.send_message(packet.to_message())
    }

    /// Enqueues a frame without waiting.
    pub fn send_message(&self, message: Message) -> Result<(), ConnectionError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::QueueFull(self.addr),
            TrySendError::Closed(_) => ConnectionError::Closed(self.addr),
        })
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drains the outbound queue onto `writer` until every handle is dropped or
/// a write fails, then shuts the writer down.
///
/// Frames that are already queued are written back to back and flushed
/// together.
pub async fn write_outbound<W>(writer: W, mut outbound: mpsc::Receiver<Message>, addr: SocketAddr)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(message) = outbound.recv().await {
        let mut batch = vec![message];
        while let Ok(next) = outbound.try_recv() {
            batch.push(next);
        }

        for message in &batch {
            if let Err(e) = writer.write_all(&message.pack()).await {
                error!("Failed to write \"{}\" to {}: {}", message.kind, addr, e);
                return;
            }
            debug!("Sent {} to {}", message.kind, addr);
        }

        if let Err(e) = writer.flush().await {
            error!("Failed to flush frames to {}: {}", addr, e);
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down writer for {}: {}", addr, e);
    }
}
