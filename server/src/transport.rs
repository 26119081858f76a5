//! TCP listeners and sub-connection grouping
//!
//! The server listens on one port per channel: the primary channel on the
//! base port and parallel channel `i` on `base + 1 + i`. Every accepted
//! socket first sends a [`ChannelHello`] naming its connection nonce and
//! channel index, which is how sockets are grouped into one [`Link`].
//!
//! Reader tasks never touch session state beyond the directory insert on
//! connect. Packets and disconnects go to the tick thread through the
//! [`ServerMessage`] inbox.

use log::{debug, error, info, warn};
use shared::framing::read_frame;
use shared::link::spawn_writer;
use shared::packets::ChannelHello;
use shared::{ChannelWriter, ChunkFraming, Link};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::directory::{ConnectionId, SharedDirectory};

/// How long a fresh socket may take to identify itself
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages sent from network tasks to the tick loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { conn: ConnectionId, data: Vec<u8> },
    Disconnected { conn: ConnectionId },
}

/// State shared by every listener task
pub struct Transport {
    parallel_channels: usize,
    framing: ChunkFraming,
    striping_threshold: usize,
    directory: SharedDirectory,
    inbox: mpsc::UnboundedSender<ServerMessage>,
    links: Mutex<HashMap<u64, Arc<Link>>>,
    next_conn_id: AtomicU64,
}

impl Transport {
    pub fn new(
        config: &ServerConfig,
        directory: SharedDirectory,
        inbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            parallel_channels: config.parallel_channels(),
            framing: config.chunk_framing,
            striping_threshold: config.striping_threshold,
            directory,
            inbox,
            links: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Returns the link for `nonce`, creating it on first sight
    fn link_for(&self, nonce: u64) -> Option<Arc<Link>> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = links.get(&nonce) {
            return Some(Arc::clone(link));
        }
        // Links dropped by the tick thread are only referenced from here
        links.retain(|_, link| Arc::strong_count(link) > 1);

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        match Link::new(id, self.parallel_channels, self.framing, self.striping_threshold) {
            Ok(link) => {
                let link = Arc::new(link);
                links.insert(nonce, Arc::clone(&link));
                Some(link)
            }
            Err(e) => {
                error!("Failed to create link: {}", e);
                None
            }
        }
    }

    fn forget(&self, nonce: u64) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&nonce);
    }

    fn notify(&self, message: ServerMessage) {
        if let Err(e) = self.inbox.send(message) {
            debug!("Tick loop is gone, dropping {:?}", e.0);
        }
    }
}

/// Binds one listener per channel
///
/// A base port of zero binds every channel to its own ephemeral port.
pub async fn bind_listeners(config: &ServerConfig) -> io::Result<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(config.parallelism);
    for channel in 0..config.parallelism {
        let port = if config.port == 0 {
            0
        } else {
            config.port + channel as u16
        };
        let listener = TcpListener::bind((config.host.as_str(), port)).await?;
        info!("Channel {} listening on {}", channel, listener.local_addr()?);
        listeners.push(listener);
    }
    Ok(listeners)
}

/// Spawns the accept loop of channel `channel`
pub fn spawn_listener(
    listener: TcpListener,
    channel: usize,
    transport: Arc<Transport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let transport = Arc::clone(&transport);
                    tokio::spawn(async move {
                        accept_sub_connection(stream, addr, channel, transport).await;
                    });
                }
                Err(e) => {
                    error!("Accept on channel {} failed: {}", channel, e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
}

async fn read_channel_hello(read_half: &mut OwnedReadHalf) -> Result<ChannelHello, String> {
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(read_half))
        .await
        .map_err(|_| "handshake timed out".to_string())?
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "closed before handshake".to_string())?;
    bincode::deserialize(&frame).map_err(|e| e.to_string())
}

async fn accept_sub_connection(
    stream: TcpStream,
    addr: SocketAddr,
    channel: usize,
    transport: Arc<Transport>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }
    let (mut read_half, write_half) = stream.into_split();

    let hello = match read_channel_hello(&mut read_half).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!("Rejected socket from {} on channel {}: {}", addr, channel, e);
            return;
        }
    };
    if hello.channel as usize != channel {
        warn!(
            "Socket from {} claims channel {} but arrived on channel {}",
            addr, hello.channel, channel
        );
        return;
    }

    let link = match transport.link_for(hello.nonce) {
        Some(link) => link,
        None => return,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = ChannelWriter::new(channel, tx);

    if channel == 0 {
        if link.has_primary() {
            warn!("Duplicate primary channel from {}", addr);
            return;
        }
        link.add_writer(spawn_writer(write_half, rx, channel));
        link.attach_primary(writer, addr);
        transport.directory.write().on_connected(Arc::clone(&link));

        let reader = tokio::spawn(read_primary(
            read_half,
            Arc::clone(&link),
            hello.nonce,
            Arc::clone(&transport),
        ));
        link.add_reader(reader);
    } else {
        let index = channel - 1;
        if let Err(e) = link.attach_parallel(index, writer) {
            warn!("Failed to attach channel {} for {}: {}", channel, addr, e);
            return;
        }
        link.add_writer(spawn_writer(write_half, rx, channel));
        debug!("Connection {} attached parallel channel {}", link.id(), index);

        let reader = tokio::spawn(read_parallel(
            read_half,
            Arc::clone(&link),
            index,
            hello.nonce,
            Arc::clone(&transport),
        ));
        link.add_reader(reader);
    }
}

async fn read_primary(
    mut read_half: OwnedReadHalf,
    link: Arc<Link>,
    nonce: u64,
    transport: Arc<Transport>,
) {
    let conn = link.id();
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(data)) => transport.notify(ServerMessage::PacketReceived { conn, data }),
            Ok(None) => break,
            Err(e) => {
                debug!("Read on connection {} failed: {}", conn, e);
                break;
            }
        }
    }
    transport.forget(nonce);
    transport.notify(ServerMessage::Disconnected { conn });
}

async fn read_parallel(
    mut read_half: OwnedReadHalf,
    link: Arc<Link>,
    index: usize,
    nonce: u64,
    transport: Arc<Transport>,
) {
    let conn = link.id();
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(chunk)) => match link.receive_chunk(&chunk) {
                Ok(Some(data)) => transport.notify(ServerMessage::PacketReceived { conn, data }),
                Ok(None) => {}
                Err(e) => warn!("Dropping bad chunk on connection {}: {}", conn, e),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Read on connection {} channel {} failed: {}", conn, index + 1, e);
                break;
            }
        }
    }
    link.detach_parallel(index);
    if !link.has_primary() {
        transport.forget(nonce);
    }
}
