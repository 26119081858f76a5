//! # Session Client Library
//!
//! This library provides a headless client for the lockstep session server.
//! It performs the multi-channel handshake, downloads the world snapshot and
//! collects the live command stream, leaving the simulation itself to the
//! embedding application.
//!
//! ## Architecture Overview
//!
//! ### Channels
//! A client opens one primary TCP sub-connection and a number of parallel
//! ones. Every socket announces itself with a shared random nonce so the
//! server can group them. Large transfers such as the world snapshot arrive
//! as chunks spread over the parallel channels and are reassembled before
//! they reach the packet handlers.
//!
//! ### Connection States
//! The client walks through joining, loading and playing. Handlers are
//! registered per state; a packet without a handler in the current state is
//! dropped, quietly while the client is rejoining a session it was part of.
//!
//! ### Command Stream
//! Commands received while the snapshot is still downloading are kept in
//! arrival order. They were appended after the snapshot was taken, so a
//! simulation replays the snapshot logs first and the live commands after.
//!
//! ## Module Organization
//!
//! - `config`: channel addresses, username and protocol settings
//! - `network`: connecting, reader tasks and the client handler table
//! - `session`: everything received from the server
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Client, ClientConfig};
//! use shared::{CommandType, GLOBAL};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("127.0.0.1:30502".parse()?, 9, "alice");
//!     let mut client = Client::connect(config).await?;
//!     client.wait_playing(Duration::from_secs(10)).await?;
//!
//!     client.send_command(CommandType::GlobalTimeSpeed, GLOBAL, vec![1])?;
//!     client.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
pub mod session;

pub use config::ClientConfig;
pub use network::{Client, ClientError};
pub use session::{ClientSession, LoadedWorld, ReceivedCommand};
