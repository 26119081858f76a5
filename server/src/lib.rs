//! # Session Server Library
//!
//! This library provides the authoritative session host for a deterministic
//! lockstep simulation. The server never simulates anything itself: it
//! stamps every command with the tick it was issued on, keeps the ordered
//! per-partition command logs, and makes sure every client sees the same
//! commands in the same order.
//!
//! ## Core Responsibilities
//!
//! ### Command Sequencing
//! Client commands are validated, stamped with the issuing player's faction
//! and the current tick, appended to the log of the partition they target
//! and broadcast to every playing client. The issuing client receives its
//! own command with a self-issued marker.
//!
//! ### Joining and Catch-up
//! A joining client receives the latest world save plus every command
//! logged since. The snapshot is striped over the parallel channels and the
//! client is added to the playing set in the same tick, so no command falls
//! between the snapshot and the live stream.
//!
//! ### Player Directory
//! Tracks connections, usernames, factions, latencies and the host player.
//! Faction online/offline commands are appended when the first player of a
//! faction starts playing and when the last one leaves.
//!
//! ## Architecture Design
//!
//! ### Single Tick Thread
//! All session state is owned by one tick loop. Listener and reader tasks
//! only forward packets through an inbox channel; other threads reach the
//! session through the action queue behind [`network::ServerHandle`].
//!
//! ### Multi-channel TCP
//! Each client opens one primary sub-connection and several parallel ones.
//! Small packets travel on the primary channel, large transfers are split
//! into chunks across the parallel channels and reassembled on the far side.
//!
//! ### Static Handler Table
//! Packet handlers are registered per connection state once at startup.
//! A packet arriving in a state without a handler is either dropped or
//! ends the connection, depending on configuration.
//!
//! ## Module Organization
//!
//! - `config`: server settings, JSON loading and validation
//! - `directory`: connected players and the username to faction map
//! - `sequencer`: tick counter, partition logs, autosave capture, id blocks
//! - `action_queue`: work queued for the tick thread
//! - `handlers`: the server packet handler table
//! - `transport`: TCP listeners and sub-connection grouping
//! - `network`: server context, tick loop and control handle
//! - `world`: world and partition blobs plus save files
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::sequencer::PartitionLogs;
//! use server::world::WorldStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host_username: Some("host".to_string()),
//!         ..ServerConfig::default()
//!     };
//!     let server = Server::bind(config, WorldStore::default(), PartitionLogs::new()).await?;
//!
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.stop();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod action_queue;
pub mod config;
pub mod directory;
pub mod handlers;
pub mod network;
pub mod sequencer;
pub mod transport;
pub mod world;

pub use config::{ServerConfig, UnknownPacketPolicy};
pub use network::{Server, ServerContext, ServerError, ServerHandle};
pub use world::WorldStore;
