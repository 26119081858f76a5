//! # Shared Session Protocol
//!
//! Types and algorithms used by both ends of a lockstep session: the
//! parallel transfer multiplexer, the scheduled command record, id blocks,
//! the connection state machine and the packet layer.
//!
//! ## Module Organization
//!
//! - `wire`: little-endian byte writer/reader for fixed-layout records
//! - `framing`: length-delimited frames on each sub-connection
//! - `multiplex`: striping of large payloads over parallel channels
//! - `link`: the outbound queues and reassembly state of one connection
//! - `command`: scheduled commands and their delivery marker
//! - `id_block`: disjoint entity id ranges
//! - `state`: connection states, the transition function, handler tables
//! - `packets`: packet ids and bodies
//! - `disconnect`: disconnect reasons and user-facing messages
//! - `codec`: compression boundary for opaque blobs

pub mod codec;
pub mod command;
pub mod disconnect;
pub mod error;
pub mod framing;
pub mod id_block;
pub mod link;
pub mod multiplex;
pub mod packets;
pub mod state;
pub mod wire;

pub use command::{CommandType, DeliveryMarker, ScheduledCommand, GLOBAL, NO_FACTION};
pub use disconnect::DisconnectReason;
pub use error::{HandlerError, MultiplexError, PacketError, TransportError, WireError};
pub use id_block::IdBlock;
pub use link::{ChannelWriter, Link};
pub use multiplex::{ChannelSink, ChunkFraming, Delivery, ParallelReceiver, ParallelSender};
pub use packets::PacketId;
pub use state::{Connection, ConnectionState, StateEvent, StateKind};

/// Human-readable release version sent during the handshake
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol revision; both ends must agree exactly
pub const PROTOCOL_VERSION: i32 = 1;

/// Default base port; parallel channel `i` listens on `DEFAULT_PORT + 1 + i`
pub const DEFAULT_PORT: u16 = 30502;

/// Sub-connections per logical connection: one primary plus eight parallel
pub const DEFAULT_PARALLELISM: usize = 9;

/// Simulation ticks per second
pub const TICKS_PER_SECOND: u32 = 60;
