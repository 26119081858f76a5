//! Packet identifiers and bodies
//!
//! Every packet is one id byte followed by its body. Structured bodies are
//! bincode-encoded serde types; command records, id blocks and disconnect
//! reasons keep their fixed binary layouts.

use bincode::{deserialize, serialize};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PacketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketId {
    ClientHello = 0,
    ClientWorldReady = 1,
    ClientCommand = 2,
    ClientKeepAlive = 3,
    ClientIdBlockRequest = 4,
    ClientWorldUpload = 5,
    ClientLeave = 6,

    ServerJoinAccepted = 16,
    ServerWorldDataStart = 17,
    ServerWorldData = 18,
    ServerCommand = 19,
    ServerTimeControl = 20,
    ServerKeepAlive = 21,
    ServerPlayerList = 22,
    ServerIdBlock = 23,
    ServerNotification = 24,
    ServerDisconnectReason = 25,
}

impl PacketId {
    pub fn from_u8(value: u8) -> Result<Self, PacketError> {
        Ok(match value {
            0 => PacketId::ClientHello,
            1 => PacketId::ClientWorldReady,
            2 => PacketId::ClientCommand,
            3 => PacketId::ClientKeepAlive,
            4 => PacketId::ClientIdBlockRequest,
            5 => PacketId::ClientWorldUpload,
            6 => PacketId::ClientLeave,
            16 => PacketId::ServerJoinAccepted,
            17 => PacketId::ServerWorldDataStart,
            18 => PacketId::ServerWorldData,
            19 => PacketId::ServerCommand,
            20 => PacketId::ServerTimeControl,
            21 => PacketId::ServerKeepAlive,
            22 => PacketId::ServerPlayerList,
            23 => PacketId::ServerIdBlock,
            24 => PacketId::ServerNotification,
            25 => PacketId::ServerDisconnectReason,
            _ => return Err(PacketError::UnknownId(value)),
        })
    }

    pub fn is_server_bound(self) -> bool {
        (self as u8) < 16
    }
}

/// First frame on every sub-connection
///
/// Sub-connections carrying the same nonce belong to one logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHello {
    pub nonce: u64,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol: i32,
    pub version: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_type: u8,
    pub partition_id: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBlockRequest {
    pub partition_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBlob {
    pub partition_id: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLog {
    pub partition_id: i32,
    /// Serialized [`crate::command::ScheduledCommand`] records in log order
    pub commands: Vec<Vec<u8>>,
}

/// Fresh save data uploaded by the host after an autosave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldUpload {
    pub world: Vec<u8>,
    pub session: Vec<u8>,
    pub partitions: Vec<PartitionBlob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAccepted {
    pub player_id: i32,
    pub faction_id: i32,
}

/// Everything a joining client needs to rebuild the simulation
///
/// `world`, `session` and each partition blob are compressed by the
/// configured codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldData {
    pub faction_id: i32,
    pub tick: i32,
    pub world: Vec<u8>,
    pub session: Vec<u8>,
    pub partition_logs: Vec<PartitionLog>,
    pub partition_data: Vec<PartitionBlob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeControl {
    pub tick: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub player_id: i32,
    pub username: String,
    pub latency_ms: i32,
    pub faction_id: i32,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerList {
    List(Vec<PlayerEntry>),
    Add(PlayerEntry),
    Remove { player_id: i32 },
    /// `(player_id, latency_ms)` for every playing player
    Latencies(Vec<(i32, i32)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub key: String,
    pub args: Vec<String>,
}

/// Prefixes `body` with the packet id byte
pub fn encode_packet(id: PacketId, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + body.len());
    packet.push(id as u8);
    packet.extend_from_slice(body);
    packet
}

/// Encodes a structured body with bincode and prefixes the id byte
pub fn encode_message<T: Serialize>(id: PacketId, body: &T) -> Result<Vec<u8>, PacketError> {
    let bytes = serialize(body).map_err(|e| PacketError::Body {
        id,
        message: e.to_string(),
    })?;
    Ok(encode_packet(id, &bytes))
}

pub fn split_packet(data: &[u8]) -> Result<(PacketId, &[u8]), PacketError> {
    let (&id, body) = data.split_first().ok_or(PacketError::Empty)?;
    Ok((PacketId::from_u8(id)?, body))
}

pub fn decode_body<T: DeserializeOwned>(id: PacketId, body: &[u8]) -> Result<T, PacketError> {
    deserialize(body).map_err(|e| PacketError::Body {
        id,
        message: e.to_string(),
    })
}
