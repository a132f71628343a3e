//! Per-connection protocol state machine.
//!
//! Each accepted socket gets one [`ConnectionHandler`] that walks through
//! three states:
//!
//! - **Unauthenticated**: only `register` and `connect` are accepted
//! - **Established**: gameplay frames (`vitals`, `create_projectile`,
//!   `disconnect`) are applied to the registries and fanned out
//! - **Terminated**: the player left; the handler stops reading
//!
//! Frames are processed strictly in arrival order by the handler's own task.
//! Malformed or unexpected frames are logged and skipped; they never end the
//! session.

use crate::connection::{write_outbound, ConnectionHandle, ConnectionId};
use crate::projectiles::ProjectileRegistry;
use crate::registry::UserRegistry;
use log::{debug, error, info, warn};
use shared::{read_frame, FrameRead, JoinMode, Message, Packet, Welcome, MAX_FRAME_LENGTH};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long a finished session waits for its queued frames to be written.
pub const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state every handler works against.
#[derive(Clone)]
pub struct ServerContext {
    /// Every known player and its live connection, if any.
    pub registry: Arc<UserRegistry>,
    /// Projectiles still in flight.
    pub projectiles: Arc<ProjectileRegistry>,
    /// Terrain seed handed to every player that joins.
    pub seed: Arc<str>,
    /// Flips to `true` once the server starts shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl ServerContext {
    pub fn new(
        registry: Arc<UserRegistry>,
        projectiles: Arc<ProjectileRegistry>,
        seed: impl Into<Arc<str>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            projectiles,
            seed: seed.into(),
            shutdown,
        }
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `register` or `connect`.
    Unauthenticated,
    /// Bound to the player `name` in the registry.
    Established { name: String },
    /// The player left or the stream ended. Nothing more is processed.
    Terminated,
}

/// Protocol state for one accepted socket.
///
/// The handler owns the outbound [`ConnectionHandle`] for its socket and
/// applies every inbound frame to the shared [`ServerContext`].
pub struct ConnectionHandler {
    connection: ConnectionHandle,
    context: ServerContext,
    state: SessionState,
}

impl ConnectionHandler {
    /// Creates an unauthenticated handler for `connection`.
    pub fn new(connection: ConnectionHandle, context: ServerContext) -> Self {
        Self {
            connection,
            context,
            state: SessionState::Unauthenticated,
        }
    }

    /// Drives one accepted socket until the player leaves, the peer closes,
    /// or the server stops.
    pub async fn serve(stream: TcpStream, id: ConnectionId, context: ServerContext) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping connection {} without a peer address: {}", id, e);
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let (connection, outbound) = ConnectionHandle::new(id, addr);
        let writer_task = tokio::spawn(write_outbound(writer, outbound, addr));

        let mut handler = ConnectionHandler::new(connection, context);
        handler.run(BufReader::new(reader)).await;

        // the writer drains what is queued once the last handle is gone
        drop(handler);
        await_writer(writer_task, addr, WRITER_FLUSH_TIMEOUT).await;
        info!("Connection {} from {} closed", id, addr);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn addr(&self) -> SocketAddr {
        self.connection.addr()
    }

    /// Reads frames until the session ends, then releases the player's
    /// connection in the registry.
    pub async fn run<R>(&mut self, reader: R)
    where
        R: AsyncBufRead + Unpin,
    {
        self.read_frames(reader).await;
        self.finish().await;
    }

    async fn read_frames<R>(&mut self, mut reader: R)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut shutdown = self.context.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return;
        }

        let mut buf = Vec::new();
        while self.state != SessionState::Terminated {
            let read = tokio::select! {
                read = read_frame(&mut reader, &mut buf, MAX_FRAME_LENGTH) => read,
                _ = shutdown.changed() => {
                    debug!("Server stopping, closing session with {}", self.addr());
                    break;
                }
            };

            match read {
                Ok(FrameRead::Eof) => {
                    debug!("{} closed the connection", self.addr());
                    break;
                }
                Ok(FrameRead::Oversized) => warn!(
                    "Dropping frame over {} bytes from {}",
                    MAX_FRAME_LENGTH,
                    self.addr()
                ),
                Ok(FrameRead::Frame) => match std::str::from_utf8(&buf) {
                    Ok(frame) if frame.trim().is_empty() => {}
                    Ok(frame) => {
                        let frame = frame.to_string();
                        self.handle_frame(&frame).await;
                    }
                    Err(e) => warn!("Dropping non UTF-8 frame from {}: {}", self.addr(), e),
                },
                Err(e) => {
                    error!("Failed to read from {}: {}", self.addr(), e);
                    break;
                }
            }
        }
    }

    /// Decodes one frame and applies it. Undecodable frames are dropped.
    pub async fn handle_frame(&mut self, frame: &str) {
        let packet = Message::from_frame(frame).and_then(|message| Packet::from_message(&message));
        match packet {
            Ok(packet) => self.handle_packet(packet).await,
            Err(e) => warn!("Dropping frame from {}: {}", self.addr(), e),
        }
    }

    /// Applies one decoded packet according to the current state.
    pub async fn handle_packet(&mut self, packet: Packet) {
        debug!("Received {} from {}", packet.kind(), self.addr());
        match &self.state {
            SessionState::Unauthenticated => self.handle_unauthenticated(packet).await,
            SessionState::Established { name } => {
                let name = name.clone();
                self.handle_established(&name, packet).await;
            }
            SessionState::Terminated => {
                debug!("Ignoring {} on a terminated session", packet.kind());
            }
        }
    }

    async fn handle_unauthenticated(&mut self, packet: Packet) {
        match packet {
            Packet::Register { name } => self.establish(JoinMode::Register, &name).await,
            Packet::Connect { name } => self.establish(JoinMode::Connect, &name).await,
            other => warn!(
                "Dropping {} from unauthenticated client {}",
                other.kind(),
                self.addr()
            ),
        }
    }

    async fn establish(&mut self, mode: JoinMode, name: &str) {
        let registry = Arc::clone(&self.context.registry);
        let result = match mode {
            JoinMode::Register => registry.create(name, self.connection.clone()).await,
            JoinMode::Connect => registry.connect(name, self.connection.clone()).await,
        };

        let user = match result {
            Ok(user) => user,
            Err(e) => {
                warn!("Client {} failed to {} as {}: {}", self.addr(), mode, name, e);
                let reply = match mode {
                    JoinMode::Register => Packet::RegisterFailure {
                        reason: format!("failed to create user: {e}"),
                    },
                    JoinMode::Connect => Packet::ConnectFailure {
                        reason: format!("failed to connect existing user: {e}"),
                    },
                };
                self.reply(&reply);
                return;
            }
        };

        let welcome = Welcome {
            seed: self.context.seed.to_string(),
            vitals: user.vitals.clone(),
        };
        self.reply(&match mode {
            JoinMode::Register => Packet::RegisterSuccess(welcome),
            JoinMode::Connect => Packet::ConnectSuccess(welcome),
        });
        self.state = SessionState::Established {
            name: user.name.clone(),
        };
        info!(
            "Client {} from {} joined as {}",
            self.connection.id(),
            self.addr(),
            user.name
        );

        registry
            .broadcast(
                &Packet::UserJoined {
                    name: user.name.clone(),
                },
                &[user.name.as_str()],
            )
            .await;

        let others = registry.connected_vitals(&[user.name.as_str()]).await;
        if !others.is_empty() {
            self.reply(&Packet::InitWorld(others));
        }
    }

    async fn handle_established(&mut self, name: &str, packet: Packet) {
        match packet {
            Packet::Vitals(vitals) => {
                let vitals = vitals.attributed_to(name);
                if let Err(e) = self.context.registry.update(name, vitals.clone()).await {
                    warn!("Failed to update vitals of {}: {}", name, e);
                    return;
                }
                self.context
                    .registry
                    .broadcast(&Packet::Vitals(vitals), &[name])
                    .await;
            }
            Packet::CreateProjectile(spawn) => {
                self.context.projectiles.record(name, spawn.clone()).await;
                self.context
                    .registry
                    .broadcast(&Packet::CreateProjectile(spawn), &[name])
                    .await;
            }
            Packet::Disconnect { .. } => {
                self.terminate(name).await;
                self.reply(&Packet::Disconnected);
            }
            other => warn!("Ignoring {} from established user {}", other.kind(), name),
        }
    }

    async fn terminate(&mut self, name: &str) {
        self.context
            .registry
            .disconnect(name, self.connection.id())
            .await;
        self.state = SessionState::Terminated;
    }

    /// Releases the registry binding if the session ended without an explicit
    /// `disconnect`.
    async fn finish(&mut self) {
        if let SessionState::Established { name } = &self.state {
            let name = name.clone();
            self.terminate(&name).await;
        }
        self.state = SessionState::Terminated;
    }

    fn reply(&self, packet: &Packet) {
        if let Err(e) = self.connection.send(packet) {
            warn!("Failed to queue {} for {}: {}", packet.kind(), self.addr(), e);
        }
    }
}

/// Waits up to `limit` for the writer task to flush and close its socket.
/// A writer stuck on a peer that stopped reading is aborted instead.
///
/// Returns whether the writer finished on its own.
pub async fn await_writer(
    mut writer_task: JoinHandle<()>,
    addr: SocketAddr,
    limit: Duration,
) -> bool {
    match tokio::time::timeout(limit, &mut writer_task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Writer task for {} failed: {}", addr, e);
            true
        }
        Err(_) => {
            warn!("Writer for {} did not flush within {:?}, aborting", addr, limit);
            writer_task.abort();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ProjectileSpawn, Vec2, Vitals};
    use std::time::SystemTime;
    use tokio::sync::mpsc;

    struct Harness {
        context: ServerContext,
        _stop: watch::Sender<bool>,
        next_id: u64,
    }

    impl Harness {
        fn new() -> Self {
            let (stop, shutdown) = watch::channel(false);
            let context = ServerContext::new(
                Arc::new(UserRegistry::with_seed(7)),
                Arc::new(ProjectileRegistry::new()),
                "worldseed",
                shutdown,
            );
            Self {
                context,
                _stop: stop,
                next_id: 0,
            }
        }

        fn handler(&mut self) -> (ConnectionHandler, mpsc::Receiver<Message>) {
            self.next_id += 1;
            let addr = format!("127.0.0.1:{}", 9000 + self.next_id).parse().unwrap();
            let (connection, rx) = ConnectionHandle::new(ConnectionId::new(self.next_id), addr);
            (ConnectionHandler::new(connection, self.context.clone()), rx)
        }

        async fn joined(&mut self, name: &str) -> (ConnectionHandler, mpsc::Receiver<Message>) {
            let (mut handler, mut rx) = self.handler();
            handler
                .handle_packet(Packet::Register {
                    name: name.to_string(),
                })
                .await;
            assert!(matches!(handler.state(), SessionState::Established { .. }));
            drain(&mut rx);
            (handler, rx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(message) = rx.try_recv() {
            packets.push(Packet::from_message(&message).unwrap());
        }
        packets
    }

    #[tokio::test]
    async fn test_register_rejects_short_name() {
        let mut harness = Harness::new();
        let (mut handler, mut rx) = harness.handler();

        handler
            .handle_frame(r#"{"t":"register","v":"abc"}"#)
            .await;

        assert_eq!(handler.state(), &SessionState::Unauthenticated);
        match drain(&mut rx).as_slice() {
            [Packet::RegisterFailure { reason }] => {
                assert!(reason.starts_with("failed to create user"));
                assert!(reason.contains("minimum length of 5"));
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_success_then_world_sync() {
        let mut harness = Harness::new();
        let (_alice, mut alice_rx) = harness.joined("alice").await;
        let (mut bobby, mut bobby_rx) = harness.handler();

        bobby
            .handle_packet(Packet::Register {
                name: "bobby".to_string(),
            })
            .await;

        let replies = drain(&mut bobby_rx);
        assert_eq!(replies.len(), 2);
        match &replies[0] {
            Packet::RegisterSuccess(welcome) => {
                assert_eq!(welcome.seed, "worldseed");
                assert_eq!(welcome.vitals.name, "bobby");
            }
            other => panic!("expected register_success, got {:?}", other),
        }
        match &replies[1] {
            Packet::InitWorld(others) => {
                assert_eq!(others.len(), 1);
                assert_eq!(others[0].name, "alice");
            }
            other => panic!("expected init_world, got {:?}", other),
        }

        assert_eq!(
            drain(&mut alice_rx),
            vec![Packet::UserJoined {
                name: "bobby".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_first_player_gets_no_init_world() {
        let mut harness = Harness::new();
        let (mut handler, mut rx) = harness.handler();
        handler
            .handle_packet(Packet::Register {
                name: "loner".to_string(),
            })
            .await;

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], Packet::RegisterSuccess(_)));
    }

    #[tokio::test]
    async fn test_gameplay_frames_dropped_before_auth() {
        let mut harness = Harness::new();
        let (mut handler, mut rx) = harness.handler();

        handler
            .handle_packet(Packet::Vitals(Vitals::new("alice", 1.0, 1.0, 0.0, 100)))
            .await;
        handler.handle_frame("not json at all").await;
        handler.handle_frame(r#"{"t":"teleport","v":"x"}"#).await;

        assert_eq!(handler.state(), &SessionState::Unauthenticated);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_vitals_fan_out_without_echo() {
        let mut harness = Harness::new();
        let (mut alice, mut alice_rx) = harness.joined("alice").await;
        let (_bobby, mut bobby_rx) = harness.joined("bobby").await;
        drain(&mut alice_rx);

        alice
            .handle_frame(r#"{"t":"vitals","v":"alice|100|200|0|100"}"#)
            .await;

        assert_eq!(
            drain(&mut bobby_rx),
            vec![Packet::Vitals(Vitals::new("alice", 100.0, 200.0, 0.0, 100))]
        );
        assert!(drain(&mut alice_rx).is_empty());

        let stored = harness.context.registry.get("alice").await.unwrap();
        assert_eq!(stored.vitals, Vitals::new("alice", 100.0, 200.0, 0.0, 100));
    }

    #[tokio::test]
    async fn test_vitals_attributed_to_sender() {
        let mut harness = Harness::new();
        let (mut alice, _alice_rx) = harness.joined("alice").await;
        let (_bobby, mut bobby_rx) = harness.joined("bobby").await;

        alice
            .handle_packet(Packet::Vitals(Vitals::new("bobby", 5.0, 5.0, 0.0, 0)))
            .await;

        assert_eq!(
            drain(&mut bobby_rx),
            vec![Packet::Vitals(Vitals::new("alice", 5.0, 5.0, 0.0, 0))]
        );
        let bobby = harness.context.registry.get("bobby").await.unwrap();
        assert_ne!(bobby.vitals.health, 0);
    }

    #[tokio::test]
    async fn test_malformed_vitals_keep_session() {
        let mut harness = Harness::new();
        let (mut alice, _alice_rx) = harness.joined("alice").await;
        let (_bobby, mut bobby_rx) = harness.joined("bobby").await;

        alice
            .handle_frame(r#"{"t":"vitals","v":"alice|1|2"}"#)
            .await;
        alice
            .handle_frame(r#"{"t":"vitals","v":"alice|one|2|0|100"}"#)
            .await;

        assert!(matches!(alice.state(), SessionState::Established { .. }));
        assert!(drain(&mut bobby_rx).is_empty());
    }

    #[tokio::test]
    async fn test_projectile_recorded_and_broadcast() {
        let mut harness = Harness::new();
        let (mut alice, mut alice_rx) = harness.joined("alice").await;
        let (_bobby, mut bobby_rx) = harness.joined("bobby").await;
        drain(&mut alice_rx);

        let spawn = ProjectileSpawn::new(
            SystemTime::now(),
            Vec2::new(1.0, 2.0),
            Duration::from_secs(5),
            Vec2::new(10.0, 0.0),
        );
        alice
            .handle_packet(Packet::CreateProjectile(spawn.clone()))
            .await;

        assert_eq!(drain(&mut bobby_rx), vec![Packet::CreateProjectile(spawn)]);
        assert!(drain(&mut alice_rx).is_empty());

        let live = harness.context.projectiles.live(SystemTime::now()).await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].owner, "alice");
    }

    #[tokio::test]
    async fn test_explicit_disconnect() {
        let mut harness = Harness::new();
        let (mut alice, mut alice_rx) = harness.joined("alice").await;
        let (_bobby, mut bobby_rx) = harness.joined("bobby").await;
        drain(&mut alice_rx);

        alice
            .handle_packet(Packet::Disconnect {
                name: "alice".to_string(),
            })
            .await;

        assert_eq!(alice.state(), &SessionState::Terminated);
        assert_eq!(drain(&mut alice_rx), vec![Packet::Disconnected]);
        assert_eq!(
            drain(&mut bobby_rx),
            vec![Packet::Disconnect {
                name: "alice".to_string()
            }]
        );
        assert!(!harness.context.registry.is_connected("alice").await);
        assert!(harness.context.registry.get("alice").await.is_some());
    }

    #[tokio::test]
    async fn test_register_ignored_once_established() {
        let mut harness = Harness::new();
        let (mut alice, mut alice_rx) = harness.joined("alice").await;

        alice
            .handle_packet(Packet::Register {
                name: "another".to_string(),
            })
            .await;

        assert!(drain(&mut alice_rx).is_empty());
        assert!(harness.context.registry.get("another").await.is_none());
    }

    #[tokio::test]
    async fn test_stream_close_cleans_up() {
        let mut harness = Harness::new();
        let (_bobby, mut bobby_rx) = harness.joined("bobby").await;
        let (mut alice, _alice_rx) = harness.handler();

        let input: &[u8] = b"{\"t\":\"register\",\"v\":\"alice\"}\n\ngarbage\n";
        alice.run(BufReader::new(input)).await;

        assert_eq!(alice.state(), &SessionState::Terminated);
        assert!(!harness.context.registry.is_connected("alice").await);
        assert_eq!(
            drain(&mut bobby_rx),
            vec![
                Packet::UserJoined {
                    name: "alice".to_string()
                },
                Packet::Disconnect {
                    name: "alice".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_dropped_session_continues() {
        let mut harness = Harness::new();
        let (_bobby, mut bobby_rx) = harness.joined("bobby").await;
        let (mut alice, _alice_rx) = harness.handler();

        let mut input = b"{\"t\":\"register\",\"v\":\"alice\"}\n".to_vec();
        input.extend(std::iter::repeat(b'x').take(MAX_FRAME_LENGTH + 100));
        input.extend_from_slice(b"\n{\"t\":\"vitals\",\"v\":\"alice|3|4|0|90\"}\n");
        alice.run(BufReader::new(&input[..])).await;

        assert_eq!(
            drain(&mut bobby_rx),
            vec![
                Packet::UserJoined {
                    name: "alice".to_string()
                },
                Packet::Vitals(Vitals::new("alice", 3.0, 4.0, 0.0, 90)),
                Packet::Disconnect {
                    name: "alice".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_await_writer_aborts_stalled_flush() {
        let addr: SocketAddr = "127.0.0.1:9200".parse().unwrap();
        // the peer end stays open but is never read
        let (socket, _peer) = tokio::io::duplex(64);
        let (connection, outbound) = ConnectionHandle::new(ConnectionId::new(1), addr);
        let writer_task = tokio::spawn(write_outbound(socket, outbound, addr));

        connection
            .send_message(Message::new("vitals", "x".repeat(4096)))
            .unwrap();
        drop(connection);

        let flushed = tokio::time::timeout(
            Duration::from_secs(2),
            await_writer(writer_task, addr, Duration::from_millis(100)),
        )
        .await
        .expect("stalled writer should be given up on");
        assert!(!flushed);
    }

    #[tokio::test]
    async fn test_await_writer_reports_clean_flush() {
        let addr: SocketAddr = "127.0.0.1:9201".parse().unwrap();
        let (socket, _peer) = tokio::io::duplex(1024);
        let (connection, outbound) = ConnectionHandle::new(ConnectionId::new(1), addr);
        let writer_task = tokio::spawn(write_outbound(socket, outbound, addr));

        connection.send(&Packet::Disconnected).unwrap();
        drop(connection);

        assert!(await_writer(writer_task, addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_reconnect_through_connect() {
        let mut harness = Harness::new();
        let (mut first, _first_rx) = harness.joined("alice").await;
        first
            .handle_packet(Packet::Disconnect {
                name: "alice".to_string(),
            })
            .await;

        let (mut second, mut second_rx) = harness.handler();
        second
            .handle_packet(Packet::Connect {
                name: "alice".to_string(),
            })
            .await;

        assert!(matches!(second.state(), SessionState::Established { .. }));
        match drain(&mut second_rx).as_slice() {
            [Packet::ConnectSuccess(welcome)] => assert_eq!(welcome.vitals.name, "alice"),
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let mut harness = Harness::new();
        let (_alice, _alice_rx) = harness.joined("alice").await;
        let (mut other, mut other_rx) = harness.handler();

        other
            .handle_packet(Packet::Connect {
                name: "alice".to_string(),
            })
            .await;
        other
            .handle_packet(Packet::Connect {
                name: "nobody".to_string(),
            })
            .await;

        let reasons: Vec<String> = drain(&mut other_rx)
            .into_iter()
            .map(|packet| match packet {
                Packet::ConnectFailure { reason } => reason,
                other => panic!("expected connect_failure, got {:?}", other),
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                "failed to connect existing user: user already connected".to_string(),
                "failed to connect existing user: user not found".to_string(),
            ]
        );
        assert_eq!(other.state(), &SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let (stop, shutdown) = watch::channel(false);
        let context = ServerContext::new(
            Arc::new(UserRegistry::with_seed(7)),
            Arc::new(ProjectileRegistry::new()),
            "worldseed",
            shutdown,
        );
        let addr = "127.0.0.1:9100".parse().unwrap();
        let (connection, _rx) = ConnectionHandle::new(ConnectionId::new(1), addr);
        let mut handler = ConnectionHandler::new(connection, context.clone());
        handler
            .handle_packet(Packet::Register {
                name: "alice".to_string(),
            })
            .await;

        // a reader that never yields data
        let (_client, server_side) = tokio::io::duplex(64);
        stop.send(true).unwrap();
        handler.run(BufReader::new(server_side)).await;

        assert_eq!(handler.state(), &SessionState::Terminated);
        assert!(!context.registry.is_connected("alice").await);
    }
}
