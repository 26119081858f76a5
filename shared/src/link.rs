//! One logical connection made of several sub-connections
//!
//! A [`Link`] owns the outbound side of every sub-connection of a peer: the
//! primary channel carries every ordered packet and the parallel channels
//! carry striped chunks of bulk transfers such as world snapshots. Each sub-connection has its own writer
//! task fed by an unbounded queue, so sending never blocks the caller.
//! Dropping the queue senders with [`Link::close`] lets the writer tasks
//! flush what is already queued and shut their sockets down.

use log::debug;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MultiplexError, TransportError};
use crate::framing::{write_frame, MAX_FRAME_SIZE};
use crate::multiplex::{ChannelSink, ChunkFraming, Delivery, ParallelReceiver, ParallelSender};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outbound queue of one sub-connection
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    channel: usize,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelWriter {
    pub fn new(channel: usize, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { channel, tx }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }
}

impl ChannelSink for ChannelWriter {
    // TCP sub-connections deliver every frame reliably and in order
    fn send_frame(&self, frame: Vec<u8>, _delivery: Delivery) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_SIZE as usize {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed(self.channel))
    }
}

/// Spawns the task that writes queued frames to one sub-connection
///
/// The task ends once every sender of the queue is gone and the queue is
/// drained, or on the first write error.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, channel: usize) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Write on channel {} failed: {}", channel, e);
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of channel {} failed: {}", channel, e);
        }
    })
}

pub struct Link {
    id: u64,
    remote: Mutex<Option<SocketAddr>>,
    primary: Mutex<Option<ChannelWriter>>,
    parallel: Mutex<ParallelSender<ChannelWriter>>,
    receiver: Option<ParallelReceiver>,
    striping_threshold: usize,
    writers: Mutex<Vec<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("remote", &*lock(&self.remote))
            .field("primary", &self.has_primary())
            .field("striping_ready", &self.is_striping_ready())
            .finish()
    }
}

impl Link {
    /// Creates a link with no sub-connection attached yet
    ///
    /// [`Link::send_striped`] uses the parallel channels for packets of at
    /// least `striping_threshold` bytes once all `parallel_channels` of them
    /// are attached.
    pub fn new(
        id: u64,
        parallel_channels: usize,
        framing: ChunkFraming,
        striping_threshold: usize,
    ) -> Result<Self, MultiplexError> {
        let receiver = if parallel_channels == 0 {
            None
        } else {
            Some(ParallelReceiver::new(parallel_channels, framing)?)
        };

        Ok(Self {
            id,
            remote: Mutex::new(None),
            primary: Mutex::new(None),
            parallel: Mutex::new(ParallelSender::new(parallel_channels, framing)),
            receiver,
            striping_threshold,
            writers: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *lock(&self.remote)
    }

    pub fn attach_primary(&self, writer: ChannelWriter, remote: SocketAddr) {
        *lock(&self.primary) = Some(writer);
        *lock(&self.remote) = Some(remote);
    }

    pub fn attach_parallel(&self, index: usize, writer: ChannelWriter) -> Result<(), MultiplexError> {
        lock(&self.parallel).attach(index, writer)
    }

    pub fn detach_parallel(&self, index: usize) {
        lock(&self.parallel).detach(index);
    }

    pub fn has_primary(&self) -> bool {
        lock(&self.primary).is_some()
    }

    pub fn is_striping_ready(&self) -> bool {
        lock(&self.parallel).is_ready()
    }

    pub fn parallel_channels(&self) -> usize {
        lock(&self.parallel).channel_count()
    }

    /// Sends one packet over the primary channel
    pub fn send(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.send_with(packet, Delivery::ReliableOrdered)
    }

    pub fn send_with(&self, packet: Vec<u8>, delivery: Delivery) -> Result<(), TransportError> {
        match &*lock(&self.primary) {
            Some(writer) => writer.send_frame(packet, delivery),
            None => Err(TransportError::ChannelClosed(0)),
        }
    }

    /// Stripes one bulk transfer over the parallel channels
    ///
    /// Striped packets are reassembled independently of the primary stream,
    /// so they carry no ordering relative to it. Only snapshot-style
    /// transfers go through here. Packets below the striping threshold, or
    /// sent while the parallel channels are not all attached, fall back to
    /// the primary channel.
    pub fn send_striped(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        if packet.len() >= self.striping_threshold {
            let parallel = lock(&self.parallel);
            if parallel.is_ready() {
                parallel.send(&packet, Delivery::ReliableOrdered)?;
                return Ok(());
            }
        }
        self.send(packet)
    }

    /// Feeds a chunk received on a parallel channel into reassembly
    pub fn receive_chunk(&self, chunk: &[u8]) -> Result<Option<Vec<u8>>, MultiplexError> {
        match &self.receiver {
            Some(receiver) => receiver.receive(chunk),
            None => Err(MultiplexError::InvalidChannelCount(0)),
        }
    }

    pub fn add_writer(&self, handle: JoinHandle<()>) {
        lock(&self.writers).push(handle);
    }

    pub fn add_reader(&self, handle: JoinHandle<()>) {
        lock(&self.readers).push(handle);
    }

    /// Drops every outbound queue; writer tasks flush and close their sockets
    pub fn close(&self) {
        *lock(&self.primary) = None;
        lock(&self.parallel).clear();
    }

    /// Waits up to `wait` for the writer tasks to finish
    ///
    /// Returns false if some writer was still busy when the time ran out.
    pub async fn flush(&self, wait: Duration) -> bool {
        let handles = std::mem::take(&mut *lock(&self.writers));
        let deadline = Instant::now() + wait;
        let mut finished = true;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
                finished = false;
            }
        }
        finished
    }

    /// Stops the reader tasks of every sub-connection
    pub fn abort_readers(&self) {
        for handle in lock(&self.readers).drain(..) {
            handle.abort();
        }
    }
}
