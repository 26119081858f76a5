use clap::Parser;
use client::{Client, ClientConfig};
use log::{error, info, warn};
use shared::{CommandType, DEFAULT_PARALLELISM, DEFAULT_PORT, GLOBAL};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Primary channel address of the server
    #[arg(short = 's', long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    server: SocketAddr,

    /// Sub-connections to open, primary included; must match the server
    #[arg(short, long, default_value_t = DEFAULT_PARALLELISM)]
    parallelism: usize,

    #[arg(short, long, default_value = "Player")]
    username: String,

    /// Rejoin a session this username was part of before
    #[arg(long)]
    rejoin: bool,

    /// Seconds to wait for the world download
    #[arg(long, default_value = "30")]
    join_timeout: u64,

    /// Send one sync command once playing
    #[arg(long)]
    sync: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = ClientConfig::new(args.server, args.parallelism, &args.username);
    config.rejoining = args.rejoin;

    let mut client = Client::connect(config).await?;
    client
        .wait_playing(Duration::from_secs(args.join_timeout))
        .await?;

    if let Some(world) = client.session().world() {
        info!(
            "Playing from tick {} with {} logged commands",
            world.tick,
            world.command_count()
        );
    }
    if args.sync {
        client.send_command(CommandType::Sync, GLOBAL, Vec::new())?;
    }

    tokio::select! {
        _ = client.run() => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, leaving..."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    }

    match client.session().disconnect() {
        Some((_, message)) => warn!("{}", message),
        None => client.leave().await,
    }
    info!("Received {} live commands", client.session().commands().len());
    Ok(())
}
