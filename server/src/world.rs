//! World and partition blobs held for joining clients
//!
//! The server never looks inside these blobs. It keeps whatever the host
//! last uploaded, already compressed, and hands it out verbatim.

use log::info;
use serde::{Deserialize, Serialize};
use shared::packets::{PartitionBlob, PartitionLog, WorldData, WorldUpload};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::sequencer::PartitionLogs;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("save file io: {0}")]
    Io(#[from] std::io::Error),

    #[error("save file encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldStore {
    world: Vec<u8>,
    session: Vec<u8>,
    partitions: BTreeMap<i32, Vec<u8>>,
}

/// On-disk layout of a save
#[derive(Debug, Serialize, Deserialize)]
struct SaveFile {
    world: Vec<u8>,
    session: Vec<u8>,
    partitions: Vec<PartitionBlob>,
    logs: Vec<PartitionLog>,
}

impl WorldStore {
    pub fn new(world: Vec<u8>, session: Vec<u8>) -> Self {
        Self {
            world,
            session,
            partitions: BTreeMap::new(),
        }
    }

    pub fn world(&self) -> &[u8] {
        &self.world
    }

    pub fn session(&self) -> &[u8] {
        &self.session
    }

    pub fn partition(&self, partition_id: i32) -> Option<&[u8]> {
        self.partitions.get(&partition_id).map(Vec::as_slice)
    }

    pub fn set_partition(&mut self, partition_id: i32, data: Vec<u8>) {
        self.partitions.insert(partition_id, data);
    }

    /// Replaces every blob with the host's upload
    pub fn replace(&mut self, upload: WorldUpload) {
        self.world = upload.world;
        self.session = upload.session;
        self.partitions = upload
            .partitions
            .into_iter()
            .map(|blob| (blob.partition_id, blob.data))
            .collect();
    }

    /// Builds the world data packet body for a joining client
    pub fn world_data(&self, faction_id: i32, tick: i32, logs: &PartitionLogs) -> WorldData {
        WorldData {
            faction_id,
            tick,
            world: self.world.clone(),
            session: self.session.clone(),
            partition_logs: logs
                .iter()
                .map(|(&partition_id, commands)| PartitionLog {
                    partition_id,
                    commands: commands.clone(),
                })
                .collect(),
            partition_data: self
                .partitions
                .iter()
                .map(|(&partition_id, data)| PartitionBlob {
                    partition_id,
                    data: data.clone(),
                })
                .collect(),
        }
    }

    /// Encodes the blobs and the logs that follow them
    pub fn to_save_bytes(&self, logs: &PartitionLogs) -> Result<Vec<u8>, SaveError> {
        let data = self.world_data(shared::NO_FACTION, 0, logs);
        let save = SaveFile {
            world: data.world,
            session: data.session,
            partitions: data.partition_data,
            logs: data.partition_logs,
        };
        Ok(bincode::serialize(&save)?)
    }

    pub fn from_save_bytes(bytes: &[u8]) -> Result<(Self, PartitionLogs), SaveError> {
        let save: SaveFile = bincode::deserialize(bytes)?;
        let store = Self {
            world: save.world,
            session: save.session,
            partitions: save
                .partitions
                .into_iter()
                .map(|blob| (blob.partition_id, blob.data))
                .collect(),
        };
        let logs = save
            .logs
            .into_iter()
            .map(|log| (log.partition_id, log.commands))
            .collect();
        Ok((store, logs))
    }

    pub fn save(&self, logs: &PartitionLogs, path: &Path) -> Result<(), SaveError> {
        let bytes = self.to_save_bytes(logs)?;
        std::fs::write(path, &bytes)?;
        info!("Saved world to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<(Self, PartitionLogs), SaveError> {
        let bytes = std::fs::read(path)?;
        let loaded = Self::from_save_bytes(&bytes)?;
        info!("Loaded world from {} ({} bytes)", path.display(), bytes.len());
        Ok(loaded)
    }
}
