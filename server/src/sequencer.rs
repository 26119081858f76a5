//! Authoritative command log
//!
//! The sequencer owns the server tick, the per-partition command logs and
//! the entity id allocator. It is only ever touched from the tick thread,
//! which is what makes the tick stamps in a partition's log non-decreasing.

use log::{info, warn};
use shared::command::with_marker;
use shared::packets::{encode_packet, PacketId};
use shared::{CommandType, DeliveryMarker, IdBlock, ScheduledCommand, TransportError, WireError};
use std::collections::BTreeMap;
use thiserror::Error;

/// Serialized command records per partition id, in append order
pub type PartitionLogs = BTreeMap<i32, Vec<Vec<u8>>>;

/// The next block would run past the largest entity id
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("id space exhausted: block of {block_size} at {next} overflows")]
pub struct IdSpaceExhausted {
    pub next: i32,
    pub block_size: i32,
}

/// A connection that receives command broadcasts
pub trait Recipient {
    fn username(&self) -> &str;
    fn deliver(&self, packet: Vec<u8>) -> Result<(), TransportError>;
}

pub struct CommandSequencer {
    tick: i32,
    logs: PartitionLogs,
    /// Commands appended since the last autosave began
    capture: Option<PartitionLogs>,
    next_unique_id: i32,
}

impl Default for CommandSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSequencer {
    pub fn new() -> Self {
        Self {
            tick: 0,
            logs: BTreeMap::new(),
            capture: None,
            next_unique_id: 0,
        }
    }

    /// Starts from logs loaded with a saved world
    pub fn with_logs(logs: PartitionLogs) -> Self {
        Self {
            logs,
            ..Self::new()
        }
    }

    pub fn tick(&self) -> i32 {
        self.tick
    }

    pub fn advance_tick(&mut self) -> i32 {
        self.tick += 1;
        self.tick
    }

    pub fn logs(&self) -> &PartitionLogs {
        &self.logs
    }

    pub fn partition_log(&self, partition_id: i32) -> &[Vec<u8>] {
        self.logs
            .get(&partition_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn decoded_log(&self, partition_id: i32) -> Result<Vec<ScheduledCommand>, WireError> {
        self.partition_log(partition_id)
            .iter()
            .map(|record| ScheduledCommand::deserialize(record))
            .collect()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Stamps a command with the current tick and appends it to its
    /// partition log (and to the capture buffer while an autosave is open)
    ///
    /// Returns the serialized record.
    pub fn append(
        &mut self,
        command_type: CommandType,
        faction_id: i32,
        partition_id: i32,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, WireError> {
        let command =
            ScheduledCommand::new(command_type, self.tick, faction_id, partition_id, payload);
        let record = command.serialize()?;

        self.logs
            .entry(partition_id)
            .or_default()
            .push(record.clone());
        if let Some(capture) = &mut self.capture {
            capture.entry(partition_id).or_default().push(record.clone());
        }

        Ok(record)
    }

    /// Appends a command and sends it to every recipient
    ///
    /// The recipient whose username equals `source` gets the record with the
    /// self marker; everyone else gets the remote marker. A recipient that
    /// cannot be reached is logged and skipped. Returns how many recipients
    /// the command was handed to.
    pub fn send_command<'r, R>(
        &mut self,
        command_type: CommandType,
        faction_id: i32,
        partition_id: i32,
        payload: Vec<u8>,
        source: Option<&str>,
        recipients: impl IntoIterator<Item = &'r R>,
    ) -> Result<usize, WireError>
    where
        R: Recipient + 'r,
    {
        let record = self.append(command_type, faction_id, partition_id, payload)?;

        let remote = encode_packet(
            PacketId::ServerCommand,
            &with_marker(&record, DeliveryMarker::Remote),
        );
        let own = encode_packet(
            PacketId::ServerCommand,
            &with_marker(&record, DeliveryMarker::SelfIssued),
        );

        let mut delivered = 0;
        for recipient in recipients {
            let packet = if source == Some(recipient.username()) {
                own.clone()
            } else {
                remote.clone()
            };
            match recipient.deliver(packet) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to deliver {:?} command to {}: {}",
                    command_type,
                    recipient.username(),
                    e
                ),
            }
        }

        Ok(delivered)
    }

    /// Hands out the next disjoint id range
    ///
    /// Once the id space cannot hold another block every further request
    /// fails; blocks already handed out stay valid.
    pub fn next_id_block(
        &mut self,
        block_size: i32,
        partition_id: i32,
    ) -> Result<IdBlock, IdSpaceExhausted> {
        let block_start = self.next_unique_id;
        self.next_unique_id = block_start
            .checked_add(block_size)
            .ok_or(IdSpaceExhausted {
                next: block_start,
                block_size,
            })?;
        info!(
            "New id block {} of size {} for partition {}",
            block_start, block_size, partition_id
        );
        Ok(IdBlock::for_partition(block_start, block_size, partition_id))
    }

    /// Opens a fresh capture buffer
    ///
    /// Called right after the autosave command itself was appended, so the
    /// buffer holds exactly the commands the upcoming save will not contain.
    pub fn begin_capture(&mut self) {
        self.capture = Some(BTreeMap::new());
    }

    /// Replaces the logs with the capture buffer and closes it
    ///
    /// Returns false when no autosave was in progress.
    pub fn complete_capture(&mut self) -> bool {
        match self.capture.take() {
            Some(capture) => {
                self.logs = capture;
                true
            }
            None => false,
        }
    }
}
