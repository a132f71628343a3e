use clap::Parser;
use client::session::Session;
use client::transport::{Poll, Transport};
use client::world::{RemoteWorld, WorldEvent};
use log::{debug, info, warn};
use shared::{JoinMode, Packet, ProjectileSpawn, Vitals};
use std::time::{Duration, SystemTime};
use tokio::time::{interval, MissedTickBehavior};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Radius of the circle the bot walks, in world units.
const WALK_RADIUS: f64 = 200.0;
/// Angular speed of the walk, in radians per second.
const WALK_SPEED: f64 = 0.5;
const PROJECTILE_SPEED: f64 = 400.0;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Player name
    #[arg(short, long)]
    name: String,

    /// Register a new player instead of resuming an existing one
    #[arg(short, long)]
    register: bool,

    /// Vitals reports per second
    #[arg(long, default_value = "10")]
    rate: u32,

    /// Seconds between projectile spawns
    #[arg(long, default_value = "2")]
    fire_every: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mode = if args.register {
        JoinMode::Register
    } else {
        JoinMode::Connect
    };

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    let transport = Transport::start(&args.server).await?;
    let mut session = Session::join(&transport, mode, &args.name, JOIN_TIMEOUT).await?;
    info!(
        "Terrain seed {} ({})",
        session.seed(),
        session.world_seed()
    );

    let mut world = RemoteWorld::new(session.name());
    for packet in session.take_backlog() {
        world.apply(packet);
    }

    let result = run(&transport, &session, &mut world, &args).await;
    transport.disconnect().await;
    result
}

/// Walks the player in a circle around its spawn point, reporting vitals and
/// firing along the walking direction, until Ctrl+C or server shutdown.
async fn run(
    transport: &Transport,
    session: &Session,
    world: &mut RemoteWorld,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let spawn = session.vitals().clone();
    let centre = spawn.position();

    let mut report = interval(Duration::from_secs_f64(1.0 / f64::from(args.rate.max(1))));
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut fire = interval(Duration::from_secs(args.fire_every.max(1)));
    fire.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = tokio::time::Instant::now();
    let mut vitals = spawn;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving the game...");
                transport
                    .send_packet(&Packet::Disconnect { name: vitals.name.clone() })
                    .await?;
                return Ok(());
            }
            _ = report.tick() => {
                let angle = started.elapsed().as_secs_f64() * WALK_SPEED;
                vitals.x = centre.x + WALK_RADIUS * angle.cos();
                vitals.y = centre.y + WALK_RADIUS * angle.sin();
                vitals.rotation = angle + std::f64::consts::FRAC_PI_2;
                if let Err(e) = transport.send_packet(&Packet::Vitals(vitals.clone())).await {
                    warn!("Failed to report vitals: {}", e);
                }
            }
            _ = fire.tick() => {
                let projectile = ProjectileSpawn::fired(
                    vitals.position(),
                    vitals.rotation,
                    PROJECTILE_SPEED,
                    SystemTime::now(),
                );
                if let Err(e) = transport.send_packet(&Packet::CreateProjectile(projectile)).await {
                    warn!("Failed to fire: {}", e);
                }
            }
        }

        loop {
            match transport.poll() {
                Poll::Packet(packet) => {
                    if let Some(event) = world.apply(packet) {
                        if log_event(&event, world) {
                            return Ok(());
                        }
                    }
                }
                Poll::Empty => break,
                Poll::Closed => {
                    warn!("Connection to server lost");
                    return Ok(());
                }
            }
        }
    }
}

/// Logs an event; returns true when the session should end.
fn log_event(event: &WorldEvent, world: &mut RemoteWorld) -> bool {
    match event {
        WorldEvent::Synced(count) => info!("{} other players in the world", count),
        WorldEvent::PlayerMoved(name) => {
            if let Some(Vitals { x, y, health, .. }) = world.player(name) {
                debug!("{} at ({:.1}, {:.1}) health {}", name, x, y, health);
            }
        }
        WorldEvent::ProjectileFired(_) => {
            let live = world.live_projectiles(SystemTime::now()).len();
            debug!("{} projectiles in flight", live);
        }
        WorldEvent::ServerShutdown => return true,
        WorldEvent::PlayerJoined(_) | WorldEvent::PlayerLeft(_) => {}
    }
    false
}
