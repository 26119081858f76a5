use clap::Parser;
use log::{error, info, warn};
use server::config::{ServerConfig, UnknownPacketPolicy};
use server::network::Server;
use server::sequencer::PartitionLogs;
use server::world::WorldStore;
use shared::codec::{Codec, IdentityCodec};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind every channel to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Primary channel port; parallel channels follow it
    #[arg(short, long)]
    port: Option<u16>,

    /// Simulation ticks per second
    #[arg(short, long)]
    tick_rate: Option<u32>,

    /// Sub-connections per client, primary included
    #[arg(long)]
    parallelism: Option<usize>,

    #[arg(short, long)]
    max_players: Option<usize>,

    /// Username of the player that uploads autosaves
    #[arg(long)]
    host_username: Option<String>,

    /// Save file to load on startup and write after each autosave
    #[arg(short, long)]
    save: Option<PathBuf>,

    /// Raw world blob used when no save file exists yet
    #[arg(short, long)]
    world: Option<PathBuf>,

    /// Minutes between autosaves; zero disables them
    #[arg(long, default_value = "0")]
    autosave_minutes: u64,

    /// Drop packets sent in the wrong state instead of disconnecting
    #[arg(long)]
    lenient_drop: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(max_players) = self.max_players {
            config.max_players = max_players;
        }
        if self.host_username.is_some() {
            config.host_username = self.host_username;
        }
        if self.save.is_some() {
            config.save_path = self.save;
        }
        if self.lenient_drop {
            config.unknown_packet_policy = UnknownPacketPolicy::Drop;
        }
        config.validate()?;
        Ok(config)
    }
}

fn load_world(
    config: &ServerConfig,
    world: Option<&PathBuf>,
) -> Result<(WorldStore, PartitionLogs), Box<dyn std::error::Error>> {
    if let Some(path) = &config.save_path {
        if path.exists() {
            return Ok(WorldStore::load(path)?);
        }
        info!("No save at {}, starting fresh", path.display());
    }

    let store = match world {
        Some(path) => {
            let raw = std::fs::read(path)?;
            info!("Loaded raw world from {} ({} bytes)", path.display(), raw.len());
            WorldStore::new(IdentityCodec.compress(&raw), Vec::new())
        }
        None => WorldStore::default(),
    };
    Ok((store, PartitionLogs::new()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let world_path = args.world.clone();
    let autosave_minutes = args.autosave_minutes;
    let config = args.into_config()?;

    if config.host_username.is_none() {
        warn!("No host username configured; autosaves cannot complete");
    }

    let (world, logs) = load_world(&config, world_path.as_ref())?;
    let server = Server::bind(config, world, logs).await?;
    let handle = server.handle();

    if autosave_minutes > 0 {
        let handle = handle.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(autosave_minutes * 60);
            let mut timer = tokio::time::interval(period);
            // The first tick fires immediately
            timer.tick().await;
            while handle.is_running() {
                timer.tick().await;
                handle.autosave();
            }
        });
    }

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    handle.stop();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    server.run().await?;
    Ok(())
}
