use serde::{Deserialize, Serialize};

use crate::command::GLOBAL;
use crate::error::WireError;
use crate::wire::{ByteReader, ByteWriter};

/// Range of entity ids handed to one partition or subsystem
///
/// `next_id` returns `block_start + 1`, `block_start + 2`, and so on. It
/// never refuses to hand out an id: running past `block_size` is the
/// owner's responsibility, which it can detect with [`IdBlock::is_exhausted`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBlock {
    pub block_start: i32,
    pub block_size: i32,
    pub partition_id: i32,
    pub cursor: i32,
}

impl IdBlock {
    pub fn new(block_start: i32, block_size: i32) -> Self {
        Self::for_partition(block_start, block_size, GLOBAL)
    }

    pub fn for_partition(block_start: i32, block_size: i32, partition_id: i32) -> Self {
        Self {
            block_start,
            block_size,
            partition_id,
            cursor: 0,
        }
    }

    pub fn next_id(&mut self) -> i32 {
        self.cursor += 1;
        self.block_start + self.cursor
    }

    pub fn remaining(&self) -> i32 {
        self.block_size - self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.block_size
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(16);
        writer.write_i32(self.block_start);
        writer.write_i32(self.block_size);
        writer.write_i32(self.partition_id);
        writer.write_i32(self.cursor);
        writer.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(data);
        Ok(Self {
            block_start: reader.read_i32()?,
            block_size: reader.read_i32()?,
            partition_id: reader.read_i32()?,
            cursor: reader.read_i32()?,
        })
    }
}
