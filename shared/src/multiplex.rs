//! Parallel transfer multiplexing
//!
//! A logical payload is striped over the parallel channels of a connection
//! (every sub-connection except the primary one) and stitched back together
//! on the receiving side regardless of the order in which the pieces arrive.
//!
//! ## Chunk layout
//!
//! Each chunk starts with the one byte index of the channel it travels on.
//! With [`ChunkFraming::Tagged`] a little-endian `u32` transfer id follows
//! the index byte; with [`ChunkFraming::Indexed`] the payload bytes follow
//! immediately. Concatenating the payload bytes of chunks `0..channels` in
//! index order reproduces the original payload exactly.
//!
//! ## Routing
//!
//! An inbound chunk joins the first open buffer that does not yet hold its
//! channel index (restricted to buffers of the same transfer id when the
//! framing is tagged). If there is no such buffer a new one is opened. A
//! buffer that has every channel index set is closed and its payload handed
//! back to the caller.

use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{MultiplexError, TransportError};

/// Highest number of parallel channels a transfer mask can describe
pub const MAX_PARALLEL_CHANNELS: usize = 32;

/// Delivery guarantee requested for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Delivery {
    #[default]
    ReliableOrdered,
    Unreliable,
}

impl Delivery {
    pub fn from_reliable(reliable: bool) -> Self {
        if reliable {
            Delivery::ReliableOrdered
        } else {
            Delivery::Unreliable
        }
    }
}

/// Chunk header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFraming {
    /// `{index:u8, bytes}`, routed by the missing-index rule alone
    Indexed,
    /// `{index:u8, transfer_id:u32, bytes}`, routed by transfer id first
    #[default]
    Tagged,
}

impl ChunkFraming {
    pub fn header_len(self) -> usize {
        match self {
            ChunkFraming::Indexed => 1,
            ChunkFraming::Tagged => 5,
        }
    }
}

/// One outbound lane of a connection
pub trait ChannelSink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>, delivery: Delivery) -> Result<(), TransportError>;
}

fn check_channel_count(channels: usize) -> Result<(), MultiplexError> {
    if channels == 0 || channels > MAX_PARALLEL_CHANNELS {
        return Err(MultiplexError::InvalidChannelCount(channels));
    }
    Ok(())
}

/// Mask value with the low `channels` bits set
pub fn full_mask(channels: usize) -> u32 {
    ((1u64 << channels) - 1) as u32
}

/// Splits `payload` into one framed chunk per channel
///
/// The first `channels - 1` chunks carry `len / channels` payload bytes each
/// and the last chunk carries the remainder.
pub fn split_payload(
    payload: &[u8],
    channels: usize,
    framing: ChunkFraming,
    transfer_id: u32,
) -> Result<Vec<Vec<u8>>, MultiplexError> {
    check_channel_count(channels)?;

    let part_size = payload.len() / channels;
    let mut chunks = Vec::with_capacity(channels);
    let mut position = 0;

    for index in 0..channels {
        let end = if index == channels - 1 {
            payload.len()
        } else {
            position + part_size
        };
        let part = &payload[position..end];
        position = end;

        let mut chunk = Vec::with_capacity(framing.header_len() + part.len());
        chunk.push(index as u8);
        if framing == ChunkFraming::Tagged {
            chunk.extend_from_slice(&transfer_id.to_le_bytes());
        }
        chunk.extend_from_slice(part);
        chunks.push(chunk);
    }

    Ok(chunks)
}

/// Stripes payloads over a fixed set of parallel channels
///
/// Channels are attached by index as their sub-connections come up; a send
/// is only possible once every slot is filled.
pub struct ParallelSender<S> {
    slots: Vec<Option<S>>,
    framing: ChunkFraming,
    next_transfer_id: AtomicU32,
}

impl<S: ChannelSink> ParallelSender<S> {
    pub fn new(channels: usize, framing: ChunkFraming) -> Self {
        Self {
            slots: (0..channels).map(|_| None).collect(),
            framing,
            next_transfer_id: AtomicU32::new(0),
        }
    }

    /// Attaches the sink for parallel channel `index`, replacing any previous one
    pub fn attach(&mut self, index: usize, sink: S) -> Result<(), MultiplexError> {
        let channels = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(MultiplexError::ChannelOutOfRange {
                index: index.min(u8::MAX as usize) as u8,
                channels,
            })?;
        *slot = Some(sink);
        Ok(())
    }

    /// Drops the sink of parallel channel `index`, if any
    pub fn detach(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }

    /// Drops every attached sink
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    pub fn attached_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when there is at least one channel and every channel is attached
    pub fn is_ready(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(Option::is_some)
    }

    /// Splits `payload` and sends one chunk over each parallel channel
    ///
    /// Returns the number of chunks handed to the channels.
    pub fn send(&self, payload: &[u8], delivery: Delivery) -> Result<usize, MultiplexError> {
        let transfer_id = self.next_transfer_id.fetch_add(1, Ordering::Relaxed);
        let chunks = split_payload(payload, self.slots.len(), self.framing, transfer_id)?;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let sink = self.slots[index]
                .as_ref()
                .ok_or(MultiplexError::ChannelMissing(index))?;
            sink.send_frame(chunk, delivery)?;
        }

        Ok(self.slots.len())
    }
}

/// Partially received transfer
#[derive(Debug, Clone)]
pub struct TransferBuffer {
    transfer_id: Option<u32>,
    mask: u32,
    chunks: Vec<Vec<u8>>,
    byte_count: usize,
}

impl TransferBuffer {
    pub fn new(channels: usize, transfer_id: Option<u32>) -> Self {
        Self {
            transfer_id,
            mask: 0,
            chunks: vec![Vec::new(); channels],
            byte_count: 0,
        }
    }

    pub fn transfer_id(&self) -> Option<u32> {
        self.transfer_id
    }

    pub fn has_index(&self, index: usize) -> bool {
        self.mask & (1 << index) != 0
    }

    /// Stores the payload bytes for `index` and marks it as arrived
    pub fn insert(&mut self, index: usize, bytes: &[u8]) {
        self.chunks[index] = bytes.to_vec();
        self.mask |= 1 << index;
        self.byte_count += bytes.len();
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn is_full(&self) -> bool {
        self.mask == full_mask(self.chunks.len())
    }

    /// Concatenates the chunks in ascending channel order
    pub fn into_payload(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.byte_count);
        for chunk in self.chunks {
            payload.extend_from_slice(&chunk);
        }
        payload
    }
}

/// Reassembles striped transfers arriving over parallel channels
///
/// Chunks for one connection may arrive on several socket tasks at once, so
/// the open buffers sit behind a single lock.
pub struct ParallelReceiver {
    channels: usize,
    framing: ChunkFraming,
    open: Mutex<Vec<TransferBuffer>>,
}

impl ParallelReceiver {
    pub fn new(channels: usize, framing: ChunkFraming) -> Result<Self, MultiplexError> {
        check_channel_count(channels)?;
        Ok(Self {
            channels,
            framing,
            open: Mutex::new(Vec::new()),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of transfers still waiting for chunks
    pub fn open_transfers(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Feeds one chunk in
    ///
    /// Returns the reassembled payload once the chunk completes a transfer.
    /// A malformed chunk is rejected without touching any open buffer.
    pub fn receive(&self, chunk: &[u8]) -> Result<Option<Vec<u8>>, MultiplexError> {
        let (&index_byte, _) = chunk.split_first().ok_or(MultiplexError::EmptyChunk)?;
        let index = index_byte as usize;
        if index >= self.channels {
            return Err(MultiplexError::ChannelOutOfRange {
                index: index_byte,
                channels: self.channels,
            });
        }

        let header_len = self.framing.header_len();
        if chunk.len() < header_len {
            return Err(MultiplexError::TruncatedHeader(chunk.len()));
        }
        let transfer_id = match self.framing {
            ChunkFraming::Indexed => None,
            ChunkFraming::Tagged => {
                let mut id = [0u8; 4];
                id.copy_from_slice(&chunk[1..5]);
                Some(u32::from_le_bytes(id))
            }
        };
        let bytes = &chunk[header_len..];

        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);

        let position = open
            .iter()
            .position(|buffer| buffer.transfer_id() == transfer_id && !buffer.has_index(index));

        let position = match position {
            Some(position) => position,
            None => {
                open.push(TransferBuffer::new(self.channels, transfer_id));
                open.len() - 1
            }
        };

        open[position].insert(index, bytes);
        if open[position].is_full() {
            let buffer = open.remove(position);
            debug!(
                "Parallel transfer complete: {} bytes over {} channels",
                buffer.byte_count(),
                self.channels
            );
            return Ok(Some(buffer.into_payload()));
        }

        Ok(None)
    }
}
