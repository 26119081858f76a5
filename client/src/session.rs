//! Client-side session data
//!
//! Everything the client learned from the server: the world snapshot it
//! joined with, every live command received since, the player list and the
//! id blocks it was granted. The embedding simulation replays the snapshot
//! logs first and the live commands after them.

use log::{debug, info};
use shared::codec::{Codec, CodecError};
use shared::command::read_marked;
use shared::disconnect::user_message;
use shared::packets::{Notification, PlayerEntry, PlayerList, WorldData};
use shared::{DeliveryMarker, DisconnectReason, IdBlock, ScheduledCommand, WireError};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorldLoadError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("partition {partition_id} log: {source}")]
    Log {
        partition_id: i32,
        source: WireError,
    },
}

/// A command as it arrived on the live stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub command: ScheduledCommand,
    pub marker: DeliveryMarker,
}

impl ReceivedCommand {
    pub fn is_self_issued(&self) -> bool {
        self.marker == DeliveryMarker::SelfIssued
    }
}

/// Decompressed snapshot the client joined with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedWorld {
    pub tick: i32,
    pub faction_id: i32,
    pub world: Vec<u8>,
    pub session: Vec<u8>,
    pub partitions: BTreeMap<i32, Vec<u8>>,
    pub logs: BTreeMap<i32, Vec<ScheduledCommand>>,
}

impl LoadedWorld {
    pub fn decode(data: WorldData, codec: &dyn Codec) -> Result<Self, WorldLoadError> {
        let mut logs = BTreeMap::new();
        for log in data.partition_logs {
            let commands = log
                .commands
                .iter()
                .map(|record| ScheduledCommand::deserialize(record))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| WorldLoadError::Log {
                    partition_id: log.partition_id,
                    source,
                })?;
            logs.insert(log.partition_id, commands);
        }

        let mut partitions = BTreeMap::new();
        for blob in data.partition_data {
            partitions.insert(blob.partition_id, codec.decompress(&blob.data)?);
        }

        Ok(Self {
            tick: data.tick,
            faction_id: data.faction_id,
            world: codec.decompress(&data.world)?,
            session: codec.decompress(&data.session)?,
            partitions,
            logs,
        })
    }

    /// Number of logged commands across every partition
    pub fn command_count(&self) -> usize {
        self.logs.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
pub struct ClientSession {
    pub player_id: Option<i32>,
    pub faction_id: Option<i32>,
    /// Latest tick announced by the server
    pub server_tick: i32,
    pub last_keep_alive: Option<i32>,
    world: Option<LoadedWorld>,
    commands: Vec<ReceivedCommand>,
    players: BTreeMap<i32, PlayerEntry>,
    id_blocks: Vec<IdBlock>,
    notifications: Vec<Notification>,
    disconnect: Option<(DisconnectReason, String)>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_join_accepted(&mut self, player_id: i32, faction_id: i32) {
        self.player_id = Some(player_id);
        self.faction_id = Some(faction_id);
    }

    pub fn on_world_loaded(&mut self, world: LoadedWorld) {
        info!(
            "Loaded world at tick {} ({} bytes, {} partitions, {} logged commands)",
            world.tick,
            world.world.len(),
            world.partitions.len(),
            world.command_count()
        );
        self.server_tick = self.server_tick.max(world.tick);
        self.faction_id = Some(world.faction_id);
        self.world = Some(world);
    }

    pub fn world(&self) -> Option<&LoadedWorld> {
        self.world.as_ref()
    }

    /// Records one command from the live stream
    ///
    /// Commands that arrive while the snapshot is still downloading were
    /// appended after it was taken, so they simply queue behind it.
    pub fn on_command(&mut self, data: &[u8]) -> Result<&ReceivedCommand, WireError> {
        let (command, marker) = read_marked(data)?;
        debug!(
            "Command {:?} for partition {} at tick {} ({:?})",
            command.command_type, command.partition_id, command.tick, marker
        );
        self.commands.push(ReceivedCommand { command, marker });
        Ok(&self.commands[self.commands.len() - 1])
    }

    pub fn commands(&self) -> &[ReceivedCommand] {
        &self.commands
    }

    /// Removes and returns the live commands received so far
    pub fn drain_commands(&mut self) -> Vec<ReceivedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn on_time_control(&mut self, tick: i32) {
        self.server_tick = self.server_tick.max(tick);
    }

    pub fn on_player_list(&mut self, update: PlayerList) {
        match update {
            PlayerList::List(entries) => {
                self.players = entries.into_iter().map(|e| (e.player_id, e)).collect();
            }
            PlayerList::Add(entry) => {
                self.players.insert(entry.player_id, entry);
            }
            PlayerList::Remove { player_id } => {
                self.players.remove(&player_id);
            }
            PlayerList::Latencies(latencies) => {
                for (player_id, latency_ms) in latencies {
                    if let Some(entry) = self.players.get_mut(&player_id) {
                        entry.latency_ms = latency_ms;
                    }
                }
            }
        }
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerEntry> {
        self.players.values()
    }

    pub fn player(&self, player_id: i32) -> Option<&PlayerEntry> {
        self.players.get(&player_id)
    }

    pub fn on_id_block(&mut self, block: IdBlock) {
        info!(
            "Received id block {}..{} for partition {}",
            block.block_start + 1,
            block.block_start + block.block_size,
            block.partition_id
        );
        self.id_blocks.push(block);
    }

    /// Most recent id block granted for `partition_id`
    pub fn id_block_mut(&mut self, partition_id: i32) -> Option<&mut IdBlock> {
        self.id_blocks
            .iter_mut()
            .rev()
            .find(|b| b.partition_id == partition_id)
    }

    pub fn id_blocks(&self) -> &[IdBlock] {
        &self.id_blocks
    }

    pub fn on_notification(&mut self, notification: Notification) {
        info!("{} {}", notification.key, notification.args.join(" "));
        self.notifications.push(notification);
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn on_disconnect(&mut self, reason: DisconnectReason, data: &[u8]) {
        if self.disconnect.is_none() {
            self.disconnect = Some((reason, user_message(reason, data)));
        }
    }

    /// Reason and user-facing message of the disconnect, if any
    pub fn disconnect(&self) -> Option<(DisconnectReason, &str)> {
        self.disconnect
            .as_ref()
            .map(|(reason, message)| (*reason, message.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::codec::IdentityCodec;
    use shared::command::with_marker;
    use shared::packets::{PartitionBlob, PartitionLog};
    use shared::CommandType;

    fn entry(player_id: i32, username: &str) -> PlayerEntry {
        PlayerEntry {
            player_id,
            username: username.to_string(),
            latency_ms: 0,
            faction_id: 1,
            is_host: false,
        }
    }

    #[test]
    fn test_world_decode() {
        let command = ScheduledCommand::new(CommandType::Designator, 3, 1, 0, vec![9]);
        let data = WorldData {
            faction_id: 2,
            tick: 40,
            world: vec![1, 2],
            session: vec![3],
            partition_logs: vec![PartitionLog {
                partition_id: 0,
                commands: vec![command.serialize().unwrap()],
            }],
            partition_data: vec![PartitionBlob {
                partition_id: 0,
                data: vec![7],
            }],
        };

        let world = LoadedWorld::decode(data, &IdentityCodec).unwrap();
        assert_eq!(world.tick, 40);
        assert_eq!(world.world, vec![1, 2]);
        assert_eq!(world.logs[&0], vec![command]);
        assert_eq!(world.partitions[&0], vec![7]);
        assert_eq!(world.command_count(), 1);
    }

    #[test]
    fn test_world_decode_rejects_bad_log() {
        let data = WorldData {
            faction_id: 1,
            tick: 0,
            world: vec![],
            session: vec![],
            partition_logs: vec![PartitionLog {
                partition_id: 5,
                commands: vec![vec![200]],
            }],
            partition_data: vec![],
        };
        assert!(matches!(
            LoadedWorld::decode(data, &IdentityCodec),
            Err(WorldLoadError::Log { partition_id: 5, .. })
        ));
    }

    #[test]
    fn test_commands_keep_arrival_order_and_marker() {
        let mut session = ClientSession::new();
        let first = ScheduledCommand::new(CommandType::Designator, 1, 1, 0, vec![1]);
        let second = ScheduledCommand::new(CommandType::Sync, 2, 1, -1, vec![]);

        session
            .on_command(&with_marker(&first.serialize().unwrap(), DeliveryMarker::SelfIssued))
            .unwrap();
        session
            .on_command(&with_marker(&second.serialize().unwrap(), DeliveryMarker::Remote))
            .unwrap();
        assert!(session.on_command(&[1, 2]).is_err());

        let commands = session.drain_commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].is_self_issued());
        assert_eq!(commands[1].command, second);
        assert!(session.commands().is_empty());
    }

    #[test]
    fn test_player_list_updates() {
        let mut session = ClientSession::new();
        session.on_player_list(PlayerList::List(vec![entry(0, "host"), entry(1, "guest")]));
        session.on_player_list(PlayerList::Add(entry(2, "late")));
        session.on_player_list(PlayerList::Remove { player_id: 1 });
        session.on_player_list(PlayerList::Latencies(vec![(0, 15), (9, 99)]));

        let names: Vec<&str> = session.players().map(|p| p.username.as_str()).collect();
        assert_eq!(names, vec!["host", "late"]);
        assert_eq!(session.player(0).unwrap().latency_ms, 15);
    }

    #[test]
    fn test_latest_id_block_per_partition() {
        let mut session = ClientSession::new();
        session.on_id_block(IdBlock::for_partition(0, 10, 3));
        session.on_id_block(IdBlock::for_partition(10, 10, 3));
        assert_eq!(session.id_block_mut(3).unwrap().next_id(), 11);
        assert!(session.id_block_mut(4).is_none());
    }

    #[test]
    fn test_first_disconnect_reason_wins() {
        let mut session = ClientSession::new();
        session.on_disconnect(DisconnectReason::ServerFull, &[]);
        session.on_disconnect(DisconnectReason::NetFailed, &[]);
        let (reason, message) = session.disconnect().unwrap();
        assert_eq!(reason, DisconnectReason::ServerFull);
        assert_eq!(message, "Server is full");
    }
}
