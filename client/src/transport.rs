//! TCP transport between a game client and the server.
//!
//! A background receive task reads newline-delimited frames, decodes them
//! into [`Packet`]s and pushes them onto a bounded inbound queue that the
//! game loop drains without blocking through [`Transport::poll`]. Frames that
//! fail to decode are logged and dropped there. Writes happen on the caller's
//! task and give up as soon as the transport is disconnected.

use log::{debug, error, info, warn};
use shared::{read_frame, FrameRead, Message, Packet, MAX_FRAME_LENGTH};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Duration;

/// Consecutive write failures tolerated before the transport gives up.
pub const MAX_SEND_FAILURES: u32 = 10;
pub const INBOUND_QUEUE_CAPACITY: usize = 2048;

/// Failures surfaced by [`Transport`] and the join handshake.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("not connected")]
    NotConnected,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("no reply from server within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("connection closed by server")]
    Closed,
}

/// Result of a non-blocking [`Transport::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    /// The oldest decoded packet.
    Packet(Packet),
    /// Nothing queued right now.
    Empty,
    /// The receive task has ended and the queue is drained.
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A client's connection to the server.
///
/// Safe to share between tasks: sends serialize on the writer, and
/// [`Transport::disconnect`] may run concurrently with a send or a read.
pub struct Transport {
    addr: String,
    writer: Mutex<Option<BoxedWriter>>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    failures: AtomicU32,
    disconnected: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Transport {
    /// Dials `addr` and starts the receive task.
    pub async fn start(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connection {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        info!("Connected to server at {}", addr);

        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(reader, writer, addr))
    }

    /// Builds a transport over an already established byte stream.
    pub fn from_parts<R, W>(reader: R, writer: W, addr: &str) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(receive_loop(reader, inbound_tx, stop_rx, addr.to_string()));

        Self {
            addr: addr.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            inbound: Mutex::new(inbound_rx),
            failures: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// The address this transport was created for.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// False once [`Transport::disconnect`] has run, explicitly or after too
    /// many failed writes.
    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    /// Writes one frame.
    ///
    /// Each failed write counts towards [`MAX_SEND_FAILURES`]; reaching it
    /// disconnects the transport. A successful write resets the count.
    ///
    /// A write stalled on a peer that stopped reading is abandoned with
    /// [`TransportError::NotConnected`] once the transport disconnects.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow_and_update() {
            return Err(TransportError::NotConnected);
        }

        let frame = message.pack();
        let result = {
            let mut writer = tokio::select! {
                writer = self.writer.lock() => writer,
                _ = stop.changed() => return Err(TransportError::NotConnected),
            };
            let Some(stream) = writer.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            tokio::select! {
                written = stream.write_all(&frame) => written,
                _ = stop.changed() => {
                    debug!("Abandoned {} to {} on disconnect", message.kind, self.addr);
                    return Err(TransportError::NotConnected);
                }
            }
        };

        match result {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                debug!("Sent {} to {}", message.kind, self.addr);
                Ok(())
            }
            Err(source) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Failed to send {} ({}/{}): {}",
                    message.kind, failures, MAX_SEND_FAILURES, source
                );
                if failures >= MAX_SEND_FAILURES {
                    error!("Too many failed writes to {}, disconnecting", self.addr);
                    self.disconnect().await;
                }
                Err(TransportError::Connection {
                    addr: self.addr.clone(),
                    source,
                })
            }
        }
    }

    /// Encodes and writes one packet.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        self.send(&packet.to_message()).await
    }

    /// Takes one queued packet without waiting.
    pub fn poll(&self) -> Poll {
        let Ok(mut inbound) = self.inbound.try_lock() else {
            return Poll::Empty;
        };
        match inbound.try_recv() {
            Ok(packet) => Poll::Packet(packet),
            Err(TryRecvError::Empty) => Poll::Empty,
            Err(TryRecvError::Disconnected) => Poll::Closed,
        }
    }

    /// Waits for the next packet. `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<Packet> {
        self.inbound.lock().await.recv().await
    }

    /// Stops the receive task and closes the connection. Later calls do
    /// nothing.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_tx.send_replace(true);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Failed to shut down connection to {}: {}", self.addr, e);
            }
        }
        info!("Disconnected from {}", self.addr);
    }
}

/// Reads frames until EOF, a read error or the stop signal, queueing every
/// one that decodes.
async fn receive_loop<R>(
    reader: R,
    inbound: mpsc::Sender<Packet>,
    mut stop: watch::Receiver<bool>,
    addr: String,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let read = tokio::select! {
            _ = stop.changed() => break,
            read = read_frame(&mut reader, &mut buf, MAX_FRAME_LENGTH) => read,
        };

        match read {
            Ok(FrameRead::Eof) => {
                info!("Server at {} closed the connection", addr);
                break;
            }
            Ok(FrameRead::Oversized) => {
                warn!("Dropping frame over {} bytes from {}", MAX_FRAME_LENGTH, addr);
            }
            Ok(FrameRead::Frame) => {
                let packet = match std::str::from_utf8(&buf) {
                    Ok(frame) if frame.trim().is_empty() => continue,
                    Ok(frame) => Packet::from_frame(frame),
                    Err(e) => {
                        warn!("Dropping non UTF-8 frame: {}", e);
                        continue;
                    }
                };

                match packet {
                    Ok(packet) => {
                        tokio::select! {
                            _ = stop.changed() => break,
                            sent = inbound.send(packet) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("Dropping bad frame from {}: {}", addr, e),
                }
            }
            Err(e) => {
                error!("Failed to read from {}: {}", addr, e);
                break;
            }
        }
    }

    debug!("Receive loop for {} stopped", addr);
}
