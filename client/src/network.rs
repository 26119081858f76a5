use crate::config::ClientConfig;
use crate::session::{ClientSession, LoadedWorld};
use log::{debug, error, info, warn};
use shared::codec::{Codec, IdentityCodec};
use shared::disconnect::{decode_disconnect, user_message};
use shared::framing::{read_frame, write_frame};
use shared::link::spawn_writer;
use shared::packets::{
    decode_body, encode_message, encode_packet, ChannelHello, CommandRequest, Hello, IdBlockRequest,
    JoinAccepted, KeepAlive, Notification, PacketId, PartitionBlob, PlayerList, TimeControl,
    WorldData, WorldUpload,
};
use shared::state::{Dispatch, HandlerTable, LoadingStage};
use shared::{
    ChannelWriter, CommandType, Connection, ConnectionState, DisconnectReason, HandlerError,
    IdBlock, Link, MultiplexError, PacketError, StateEvent, StateKind, TransportError,
};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How long `leave` waits for queued frames to reach the sockets
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no channel addresses configured")]
    NoChannels,

    #[error("failed to connect channel {channel} ({addr}): {source}")]
    Connect {
        channel: usize,
        addr: SocketAddr,
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Multiplex(#[from] MultiplexError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Messages sent from reader tasks to the client
#[derive(Debug)]
enum ClientMessage {
    PacketReceived(Vec<u8>),
    Closed,
}

/// State the client handlers work on
pub struct ClientContext {
    pub conn: Connection<Arc<Link>>,
    pub session: ClientSession,
    codec: Box<dyn Codec>,
}

impl ClientContext {
    pub fn new(link: Arc<Link>, config: &ClientConfig, codec: Box<dyn Codec>) -> Self {
        let mut conn = Connection::new(link, ConnectionState::ClientJoining);
        conn.username = config.username.clone();
        conn.lenient = config.rejoining;
        Self {
            conn,
            session: ClientSession::new(),
            codec,
        }
    }

    fn send(&self, packet: Vec<u8>) -> Result<(), HandlerError> {
        self.conn
            .link
            .send(packet)
            .map_err(|e| HandlerError::Invalid(e.to_string()))
    }

    /// Ends the session locally; false if it had already ended
    fn end(&mut self, reason: DisconnectReason, data: &[u8]) -> bool {
        if !self.conn.disconnect(reason) {
            return false;
        }
        self.session.on_disconnect(reason, data);
        self.conn.link.close();
        true
    }
}

pub fn client_handlers() -> HandlerTable<ClientContext, ()> {
    let live = [StateKind::ClientLoading, StateKind::ClientPlaying];
    HandlerTable::new()
        .register(
            StateKind::ClientJoining,
            PacketId::ServerJoinAccepted,
            handle_join_accepted,
        )
        .register(
            StateKind::ClientLoading,
            PacketId::ServerWorldDataStart,
            handle_world_data_start,
        )
        .register(
            StateKind::ClientLoading,
            PacketId::ServerWorldData,
            handle_world_data,
        )
        .register_in(&live, PacketId::ServerCommand, handle_command)
        .register_in(&live, PacketId::ServerPlayerList, handle_player_list)
        .register_in(&live, PacketId::ServerNotification, handle_notification)
        .register_in(&live, PacketId::ServerTimeControl, handle_time_control)
        .register_in(&live, PacketId::ServerKeepAlive, handle_keep_alive)
        .register(StateKind::ClientPlaying, PacketId::ServerIdBlock, handle_id_block)
        .register_in(
            &[
                StateKind::ClientJoining,
                StateKind::ClientLoading,
                StateKind::ClientPlaying,
            ],
            PacketId::ServerDisconnectReason,
            handle_disconnect_reason,
        )
}

fn handle_join_accepted(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    let accepted: JoinAccepted = decode_body(PacketId::ServerJoinAccepted, body)?;
    info!(
        "Joined as player {} in faction {}",
        accepted.player_id, accepted.faction_id
    );
    ctx.session
        .on_join_accepted(accepted.player_id, accepted.faction_id);
    ctx.conn.apply(&StateEvent::HelloAccepted);
    Ok(())
}

fn handle_world_data_start(ctx: &mut ClientContext, _: (), _body: &[u8]) -> Result<(), HandlerError> {
    debug!("World data transfer started");
    ctx.conn.apply(&StateEvent::WorldDataStarted);
    ctx.conn.lenient = false;
    Ok(())
}

fn handle_world_data(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    // Striped data can overtake the start notice sent on the primary channel
    if ctx.conn.state()
        == &(ConnectionState::ClientLoading {
            stage: LoadingStage::Waiting,
        })
    {
        handle_world_data_start(ctx, (), &[])?;
    }

    let data: WorldData = decode_body(PacketId::ServerWorldData, body)?;
    let world = LoadedWorld::decode(data, ctx.codec.as_ref())
        .map_err(|e| HandlerError::Invalid(e.to_string()))?;
    ctx.session.on_world_loaded(world);
    ctx.conn.apply(&StateEvent::WorldDataLoaded);
    ctx.send(encode_packet(PacketId::ClientWorldReady, &[]))
}

fn handle_command(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    ctx.session.on_command(body)?;
    Ok(())
}

fn handle_player_list(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    let update: PlayerList = decode_body(PacketId::ServerPlayerList, body)?;
    ctx.session.on_player_list(update);
    Ok(())
}

fn handle_notification(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    let notification: Notification = decode_body(PacketId::ServerNotification, body)?;
    ctx.session.on_notification(notification);
    Ok(())
}

fn handle_time_control(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    let time: TimeControl = decode_body(PacketId::ServerTimeControl, body)?;
    ctx.session.on_time_control(time.tick);
    Ok(())
}

fn handle_keep_alive(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    let keep_alive: KeepAlive = decode_body(PacketId::ServerKeepAlive, body)?;
    ctx.session.last_keep_alive = Some(keep_alive.id);
    ctx.send(encode_message(PacketId::ClientKeepAlive, &keep_alive)?)
}

fn handle_id_block(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    let block = IdBlock::deserialize(body)?;
    ctx.session.on_id_block(block);
    Ok(())
}

fn handle_disconnect_reason(ctx: &mut ClientContext, _: (), body: &[u8]) -> Result<(), HandlerError> {
    let (reason, data) = decode_disconnect(body)?;
    info!("Disconnected: {}", user_message(reason, &data));
    ctx.end(reason, &data);
    Ok(())
}

/// Headless session client
pub struct Client {
    context: ClientContext,
    handlers: HandlerTable<ClientContext, ()>,
    inbox: mpsc::UnboundedReceiver<ClientMessage>,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with_codec(config, Box::new(IdentityCodec)).await
    }

    /// Opens every channel and sends the handshake
    ///
    /// Parallel channels connect before the primary one so the server can
    /// stripe the world data as soon as it accepts the handshake.
    pub async fn connect_with_codec(
        config: ClientConfig,
        codec: Box<dyn Codec>,
    ) -> Result<Self, ClientError> {
        let primary_addr = *config.addrs.first().ok_or(ClientError::NoChannels)?;
        let nonce: u64 = rand::random();
        let link = Arc::new(Link::new(
            nonce,
            config.parallel_channels(),
            config.framing,
            config.striping_threshold,
        )?);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        for (channel, addr) in config.addrs.iter().enumerate().skip(1) {
            let (read_half, write_half) = open_channel(*addr, nonce, channel).await?;
            let (tx, rx) = mpsc::unbounded_channel();
            link.attach_parallel(channel - 1, ChannelWriter::new(channel, tx))?;
            link.add_writer(spawn_writer(write_half, rx, channel));
            link.add_reader(tokio::spawn(read_parallel(
                read_half,
                Arc::clone(&link),
                inbox_tx.clone(),
            )));
        }

        let (read_half, write_half) = open_channel(primary_addr, nonce, 0).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        link.add_writer(spawn_writer(write_half, rx, 0));
        link.attach_primary(ChannelWriter::new(0, tx), primary_addr);
        link.add_reader(tokio::spawn(read_primary(read_half, inbox_tx)));

        info!(
            "Connecting to {} as {} over {} channels",
            primary_addr,
            config.username,
            config.addrs.len()
        );
        let hello = Hello {
            protocol: config.protocol,
            version: config.version.clone(),
            username: config.username.clone(),
        };
        link.send(encode_message(PacketId::ClientHello, &hello)?)?;

        Ok(Self {
            context: ClientContext::new(link, &config, codec),
            handlers: client_handlers(),
            inbox,
        })
    }

    pub fn state(&self) -> &ConnectionState {
        self.context.conn.state()
    }

    pub fn is_playing(&self) -> bool {
        self.context.conn.is_playing()
    }

    pub fn is_disconnected(&self) -> bool {
        self.context.conn.state().is_disconnected()
    }

    pub fn session(&self) -> &ClientSession {
        &self.context.session
    }

    pub fn session_mut(&mut self) -> &mut ClientSession {
        &mut self.context.session
    }

    /// Asks the server to append a command to the log of `partition_id`
    pub fn send_command(
        &self,
        command_type: CommandType,
        partition_id: i32,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        let request = CommandRequest {
            command_type: command_type as u8,
            partition_id,
            payload,
        };
        self.send(encode_message(PacketId::ClientCommand, &request)?)
    }

    pub fn request_id_block(&self, partition_id: i32) -> Result<(), ClientError> {
        let request = IdBlockRequest { partition_id };
        self.send(encode_message(PacketId::ClientIdBlockRequest, &request)?)
    }

    /// Uploads a fresh save after an autosave command; host only
    pub fn upload_world(
        &self,
        world: &[u8],
        session: &[u8],
        partitions: &BTreeMap<i32, Vec<u8>>,
    ) -> Result<(), ClientError> {
        let codec = self.context.codec.as_ref();
        let upload = WorldUpload {
            world: codec.compress(world),
            session: codec.compress(session),
            partitions: partitions
                .iter()
                .map(|(&partition_id, data)| PartitionBlob {
                    partition_id,
                    data: codec.compress(data),
                })
                .collect(),
        };
        let packet = encode_message(PacketId::ClientWorldUpload, &upload)?;
        self.ensure_connected()?;
        self.context.conn.link.send_striped(packet)?;
        Ok(())
    }

    fn send(&self, packet: Vec<u8>) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.context.conn.link.send(packet)?;
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.is_disconnected() {
            return Err(ClientError::Disconnected(self.disconnect_message()));
        }
        Ok(())
    }

    fn disconnect_message(&self) -> String {
        self.context
            .session
            .disconnect()
            .map(|(_, message)| message.to_string())
            .unwrap_or_else(|| "connection closed".to_string())
    }

    /// Tells the server we are leaving and closes every channel
    pub async fn leave(&mut self) {
        if self.is_disconnected() {
            return;
        }
        if let Err(e) = self.send(encode_packet(PacketId::ClientLeave, &[])) {
            debug!("Could not send leave: {}", e);
        }
        self.context.end(DisconnectReason::ClientLeft, &[]);
        if !self.context.conn.link.flush(FLUSH_TIMEOUT).await {
            warn!("Channels did not flush before leaving");
        }
        self.context.conn.link.abort_readers();
    }

    /// Handles every message that already arrived without waiting
    pub fn process_pending(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            self.handle_message(message);
        }
    }

    /// Waits for one message and handles it; false once the client is done
    pub async fn poll(&mut self) -> bool {
        if self.is_disconnected() {
            return false;
        }
        match self.inbox.recv().await {
            Some(message) => self.handle_message(message),
            None => self.handle_message(ClientMessage::Closed),
        }
        !self.is_disconnected()
    }

    /// Handles messages until `done` holds or `timeout` runs out
    pub async fn wait_until<F>(
        &mut self,
        what: &'static str,
        timeout: Duration,
        mut done: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&Client) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return Ok(());
            }
            if self.is_disconnected() {
                return Err(ClientError::Disconnected(self.disconnect_message()));
            }
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(message)) => self.handle_message(message),
                Ok(None) => self.handle_message(ClientMessage::Closed),
                Err(_) => return Err(ClientError::Timeout(what)),
            }
        }
    }

    pub async fn wait_playing(&mut self, timeout: Duration) -> Result<(), ClientError> {
        self.wait_until("world data", timeout, |client| client.is_playing())
            .await
    }

    /// Handles messages until the session ends
    pub async fn run(&mut self) {
        while self.poll().await {}
    }

    fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::PacketReceived(data) => self.handle_packet(&data),
            ClientMessage::Closed => {
                if self.context.end(DisconnectReason::NetFailed, &[]) {
                    warn!("Connection to server lost");
                }
            }
        }
    }

    fn handle_packet(&mut self, data: &[u8]) {
        let state = self.context.conn.kind();
        match self.handlers.dispatch(&mut self.context, (), state, data) {
            Ok(Dispatch::Handled(_)) => {}
            Ok(Dispatch::Unregistered(packet)) => {
                if self.context.conn.lenient {
                    debug!("Ignoring {:?} in {:?} while rejoining", packet, state);
                } else {
                    warn!("Dropping {:?} in {:?}", packet, state);
                }
            }
            Err(e) => {
                error!("Error handling packet from server: {}", e);
                let message = e.to_string();
                self.context
                    .end(DisconnectReason::Internal, message.as_bytes());
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.context.conn.link.close();
        self.context.conn.link.abort_readers();
    }
}

async fn open_channel(
    addr: SocketAddr,
    nonce: u64,
    channel: usize,
) -> Result<(OwnedReadHalf, OwnedWriteHalf), ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect {
            channel,
            addr,
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on channel {}: {}", channel, e);
    }
    let (read_half, mut write_half) = stream.into_split();

    let hello = ChannelHello {
        nonce,
        channel: u8::try_from(channel).map_err(|_| MultiplexError::InvalidChannelCount(channel))?,
    };
    write_frame(&mut write_half, &bincode::serialize(&hello)?).await?;
    Ok((read_half, write_half))
}

async fn read_primary(mut read_half: OwnedReadHalf, inbox: mpsc::UnboundedSender<ClientMessage>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(data)) => {
                if inbox.send(ClientMessage::PacketReceived(data)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Read on primary channel failed: {}", e);
                break;
            }
        }
    }
    let _ = inbox.send(ClientMessage::Closed);
}

async fn read_parallel(
    mut read_half: OwnedReadHalf,
    link: Arc<Link>,
    inbox: mpsc::UnboundedSender<ClientMessage>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(chunk)) => match link.receive_chunk(&chunk) {
                Ok(Some(data)) => {
                    if inbox.send(ClientMessage::PacketReceived(data)).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping bad chunk: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Read on parallel channel failed: {}", e);
                break;
            }
        }
    }
}
