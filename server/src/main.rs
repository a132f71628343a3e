use clap::Parser;
use log::info;
use server::network::Server;
use std::time::Duration;

/// Time allowed for queued shutdown notices to reach clients before exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// World seed handed to every joining client (random if omitted)
    #[arg(short, long)]
    seed: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting server on {}", address);
    let server = Server::start(&address, args.seed).await?;
    info!("World seed: {}", server.seed());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    server.shutdown().await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    server.wait().await;

    Ok(())
}
