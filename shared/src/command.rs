//! Scheduled simulation commands
//!
//! A command is stamped with the server tick it was issued on and appended
//! to the log of the partition it targets. The record layout is fixed:
//!
//! ```text
//! commandType:u8 | issuingTick:i32 | factionId:i32 | partitionId:i32 | payloadLen:i32 | payload
//! ```
//!
//! When a record is sent to a client one delivery marker byte is appended
//! (`1` for the client that issued it, `0` for everyone else). The marker is
//! never part of the stored log.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::wire::{ByteReader, ByteWriter};

/// Faction id of commands that do not belong to any faction
pub const NO_FACTION: i32 = -1;

/// Partition id of commands that apply to the whole simulation
pub const GLOBAL: i32 = -1;

/// Trailing byte telling a client whether it issued the command itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMarker {
    Remote = 0,
    SelfIssued = 1,
}

impl DeliveryMarker {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(DeliveryMarker::Remote),
            1 => Ok(DeliveryMarker::SelfIssued),
            _ => Err(WireError::InvalidTag {
                kind: "delivery marker",
                value,
            }),
        }
    }
}

/// Kinds of command carried by the log
///
/// The simulation interprets the payloads; the session layer only cares
/// about which kinds a client may issue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandType {
    Sync = 0,
    Designator = 1,
    GlobalTimeSpeed = 2,
    PartitionTimeSpeed = 3,
    CreatePartition = 4,
    DestroyPartition = 5,
    FactionOnline = 6,
    FactionOffline = 7,
    Autosave = 8,
}

impl CommandType {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => CommandType::Sync,
            1 => CommandType::Designator,
            2 => CommandType::GlobalTimeSpeed,
            3 => CommandType::PartitionTimeSpeed,
            4 => CommandType::CreatePartition,
            5 => CommandType::DestroyPartition,
            6 => CommandType::FactionOnline,
            7 => CommandType::FactionOffline,
            8 => CommandType::Autosave,
            _ => {
                return Err(WireError::InvalidTag {
                    kind: "command type",
                    value,
                })
            }
        })
    }

    /// Whether the server alone may append this kind
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            CommandType::FactionOnline | CommandType::FactionOffline | CommandType::Autosave
        )
    }
}

/// One entry of a partition's command log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCommand {
    pub command_type: CommandType,
    pub tick: i32,
    pub faction_id: i32,
    pub partition_id: i32,
    pub payload: Vec<u8>,
}

impl ScheduledCommand {
    pub fn new(
        command_type: CommandType,
        tick: i32,
        faction_id: i32,
        partition_id: i32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            command_type,
            tick,
            faction_id,
            partition_id,
            payload,
        }
    }

    pub fn is_global(&self) -> bool {
        self.partition_id == GLOBAL
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = ByteWriter::with_capacity(17 + self.payload.len());
        writer.write_u8(self.command_type as u8);
        writer.write_i32(self.tick);
        writer.write_i32(self.faction_id);
        writer.write_i32(self.partition_id);
        writer.write_prefixed_bytes(&self.payload)?;
        Ok(writer.into_bytes())
    }

    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let command_type = CommandType::from_u8(reader.read_u8()?)?;
        let tick = reader.read_i32()?;
        let faction_id = reader.read_i32()?;
        let partition_id = reader.read_i32()?;
        let payload = reader.read_prefixed_bytes()?;
        Ok(Self {
            command_type,
            tick,
            faction_id,
            partition_id,
            payload,
        })
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        Self::read(&mut ByteReader::new(data))
    }
}

/// Appends the delivery marker to a serialized record
pub fn with_marker(record: &[u8], marker: DeliveryMarker) -> Vec<u8> {
    let mut framed = Vec::with_capacity(record.len() + 1);
    framed.extend_from_slice(record);
    framed.push(marker as u8);
    framed
}

/// Splits a wire record into the command and its delivery marker
pub fn read_marked(data: &[u8]) -> Result<(ScheduledCommand, DeliveryMarker), WireError> {
    let mut reader = ByteReader::new(data);
    let command = ScheduledCommand::read(&mut reader)?;
    let marker = DeliveryMarker::from_u8(reader.read_u8()?)?;
    Ok((command, marker))
}
