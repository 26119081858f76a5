//! Server context, tick loop and control handle
//!
//! All session state lives in [`ServerContext`] and is only mutated from the
//! tick loop in [`Server::run`]. Network tasks feed it through the
//! [`ServerMessage`] inbox and other threads through the action queue
//! behind [`ServerHandle`].

use log::{debug, error, info, warn};
use shared::disconnect::encode_disconnect;
use shared::packets::{
    encode_message, encode_packet, KeepAlive, Notification, PacketId, PlayerList, TimeControl,
    WorldUpload,
};
use shared::state::{Dispatch, HandlerTable};
use shared::{
    CommandType, DisconnectReason, HandlerError, StateEvent, StateKind, WireError, GLOBAL,
    NO_FACTION,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::action_queue::{ActionError, ActionQueue};
use crate::config::{ConfigError, ServerConfig, UnknownPacketPolicy};
use crate::directory::{ConnectionId, SessionDirectory, SharedDirectory};
use crate::handlers::server_handlers;
use crate::sequencer::{CommandSequencer, PartitionLogs};
use crate::transport::{bind_listeners, spawn_listener, ServerMessage, Transport};
use crate::world::WorldStore;

/// How long shutdown waits for queued frames to reach the sockets
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listeners: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerActions = ActionQueue<ServerContext>;

/// Everything the tick thread owns
pub struct ServerContext {
    pub config: ServerConfig,
    pub directory: SharedDirectory,
    pub sequencer: CommandSequencer,
    pub world: WorldStore,
    actions: Arc<ServerActions>,
    keep_alive_id: i32,
    last_keep_alive: Instant,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        world: WorldStore,
        logs: PartitionLogs,
        directory: SharedDirectory,
        actions: Arc<ServerActions>,
    ) -> Self {
        Self {
            config,
            directory,
            sequencer: CommandSequencer::with_logs(logs),
            world,
            actions,
            keep_alive_id: 0,
            last_keep_alive: Instant::now(),
        }
    }

    pub fn tick(&self) -> i32 {
        self.sequencer.tick()
    }

    pub fn keep_alive_id(&self) -> i32 {
        self.keep_alive_id
    }

    /// Milliseconds since the last keepalive broadcast
    pub fn keep_alive_age_ms(&self) -> i32 {
        self.last_keep_alive.elapsed().as_millis().min(i32::MAX as u128) as i32
    }

    /// Queues work to run on the tick thread after the current inbox batch
    pub fn defer<F>(&self, action: F)
    where
        F: FnOnce(&mut ServerContext) -> Result<(), ActionError> + Send + 'static,
    {
        self.actions.enqueue(action);
    }

    /// Appends a command to the log and broadcasts it to every playing player
    pub fn send_command(
        &mut self,
        command_type: CommandType,
        faction_id: i32,
        partition_id: i32,
        payload: Vec<u8>,
        source: Option<&str>,
    ) -> Result<usize, WireError> {
        let directory = self.directory.read();
        let delivered = self.sequencer.send_command(
            command_type,
            faction_id,
            partition_id,
            payload,
            source,
            directory.playing_players(),
        )?;
        Ok(delivered)
    }

    /// Sends a packet to every playing player
    pub fn send_to_all(&self, packet: &[u8]) {
        self.send_to_all_except(packet, None);
    }

    pub fn send_to_all_except(&self, packet: &[u8], except: Option<ConnectionId>) {
        let directory = self.directory.read();
        for player in directory.playing_players() {
            if Some(player.conn_id()) == except {
                continue;
            }
            if let Err(e) = player.send(packet.to_vec()) {
                warn!("Failed to send to player {}: {}", player.id, e);
            }
        }
    }

    /// Sends a packet to one connection; false if it is gone
    pub fn send_to(&self, conn: ConnectionId, packet: Vec<u8>) -> bool {
        let directory = self.directory.read();
        match directory.get(conn) {
            Some(player) => match player.send(packet) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to send to player {}: {}", player.id, e);
                    false
                }
            },
            None => false,
        }
    }

    fn send_message<T: serde::Serialize>(&self, id: PacketId, body: &T) {
        match encode_message(id, body) {
            Ok(packet) => self.send_to_all(&packet),
            Err(e) => error!("Failed to encode {:?}: {}", id, e),
        }
    }

    pub fn send_notification(&self, key: &str, args: &[&str]) {
        let notification = Notification {
            key: key.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        self.send_message(PacketId::ServerNotification, &notification);
    }

    /// Tells the peer why it is being dropped, then drops it
    pub fn disconnect(&mut self, conn: ConnectionId, reason: DisconnectReason, data: Vec<u8>) {
        let link = self
            .directory
            .read()
            .get(conn)
            .map(|player| Arc::clone(&player.conn.link));
        let link = match link {
            Some(link) => link,
            None => return,
        };

        match encode_disconnect(reason, &data) {
            Ok(body) => {
                if let Err(e) = link.send(encode_packet(PacketId::ServerDisconnectReason, &body)) {
                    debug!("Could not send disconnect reason to {}: {}", conn, e);
                }
            }
            Err(e) => error!("Failed to encode disconnect reason: {}", e),
        }
        self.on_disconnected(conn, reason);
    }

    /// Removes a connection that is gone, whatever the cause
    ///
    /// Runs at most once per connection; later calls for the same id are
    /// no-ops.
    pub fn on_disconnected(&mut self, conn: ConnectionId, reason: DisconnectReason) {
        let departure = {
            let mut directory = self.directory.write();
            match directory.get_mut(conn) {
                Some(player) => {
                    if !player.conn.disconnect(reason) {
                        return;
                    }
                    player.conn.link.close();
                    player.conn.link.abort_readers();
                }
                None => return,
            }
            directory.remove(conn)
        };
        let departure = match departure {
            Some(departure) => departure,
            None => return,
        };

        info!(
            "Disconnected: player {} ({}) with reason {:?}",
            departure.player_id, departure.username, reason
        );

        if departure.was_playing {
            if departure.last_of_faction {
                let payload = departure.faction_id.to_le_bytes().to_vec();
                if let Err(e) = self.send_command(
                    CommandType::FactionOffline,
                    NO_FACTION,
                    GLOBAL,
                    payload,
                    None,
                ) {
                    error!("Failed to append faction offline command: {}", e);
                }
            }
            self.send_notification("PlayerDisconnected", &[&departure.username]);
            self.send_message(
                PacketId::ServerPlayerList,
                &PlayerList::Remove {
                    player_id: departure.player_id,
                },
            );
        }
    }

    /// Sends the world snapshot to a player whose handshake was accepted
    /// and moves it into the playing set
    ///
    /// The snapshot and the playing-set entry happen in the same tick, so
    /// every command appended later reaches the new player.
    pub fn stream_world(&mut self, conn: ConnectionId) -> Result<(), ActionError> {
        let tick = self.sequencer.tick();
        let (link, faction_id) = {
            let mut directory = self.directory.write();
            let faction_id = match directory.get(conn) {
                Some(player) => directory.player_faction(player),
                None => return Ok(()),
            };
            let player = match directory.get_mut(conn) {
                Some(player) => player,
                None => return Ok(()),
            };
            if !player.conn.apply(&StateEvent::WorldDataSent { tick }) {
                return Err(ActionError::new(format!(
                    "connection {} is not waiting for world data",
                    conn
                )));
            }
            player.conn.lenient = false;
            (Arc::clone(&player.conn.link), faction_id)
        };

        let start = encode_packet(PacketId::ServerWorldDataStart, &[]);
        let data = self.world.world_data(faction_id, tick, self.sequencer.logs());
        let packet = encode_message(PacketId::ServerWorldData, &data).map_err(ActionError::new)?;
        let size = packet.len();
        link.send(start)
            .and_then(|_| link.send_striped(packet))
            .map_err(ActionError::new)?;
        debug!("Sent {} bytes of world data to connection {}", size, conn);

        self.on_playing(conn, faction_id);
        Ok(())
    }

    fn on_playing(&mut self, conn: ConnectionId, faction_id: i32) {
        let (entry, first_of_faction, list) = {
            let directory = self.directory.read();
            let player = match directory.get(conn) {
                Some(player) => player,
                None => return,
            };
            (
                directory.entry(player),
                !directory.faction_is_playing(faction_id, Some(conn)),
                directory.player_entries(),
            )
        };

        info!("Player {} ({}) is now playing", entry.player_id, entry.username);

        if first_of_faction {
            if let Err(e) = self.send_command(
                CommandType::FactionOnline,
                NO_FACTION,
                GLOBAL,
                faction_id.to_le_bytes().to_vec(),
                None,
            ) {
                error!("Failed to append faction online command: {}", e);
            }
        }

        match encode_message(PacketId::ServerPlayerList, &PlayerList::Add(entry)) {
            Ok(packet) => self.send_to_all_except(&packet, Some(conn)),
            Err(e) => error!("Failed to encode player list: {}", e),
        }
        match encode_message(PacketId::ServerPlayerList, &PlayerList::List(list)) {
            Ok(packet) => {
                self.send_to(conn, packet);
            }
            Err(e) => error!("Failed to encode player list: {}", e),
        }
    }

    /// Marks the log position of an autosave and starts capturing the
    /// commands that follow it
    pub fn do_autosave(&mut self) -> Result<(), WireError> {
        self.send_command(CommandType::Autosave, NO_FACTION, GLOBAL, Vec::new(), None)?;
        self.sequencer.begin_capture();
        info!("Autosave requested at tick {}", self.sequencer.tick());
        Ok(())
    }

    /// Installs the host's fresh save and trims the logs down to the
    /// commands it does not contain yet
    pub fn complete_autosave(&mut self, upload: WorldUpload) {
        self.world.replace(upload);
        if !self.sequencer.complete_capture() {
            warn!("World upload without a pending autosave; keeping the full logs");
        }

        if let Some(path) = &self.config.save_path {
            if let Err(e) = self.world.save(self.sequencer.logs(), path) {
                error!("Failed to write save file {}: {}", path.display(), e);
            }
        }
    }

    /// Disconnects the player with `username`; false if nobody matched
    pub fn kick(&mut self, username: &str) -> bool {
        let conn = self
            .directory
            .read()
            .get_player(username)
            .map(|player| player.conn_id());
        match conn {
            Some(conn) => {
                self.disconnect(conn, DisconnectReason::Kick, Vec::new());
                true
            }
            None => false,
        }
    }

    /// Applies the reply to the most recent keepalive
    pub fn record_keep_alive(&mut self, conn: ConnectionId, id: i32) {
        if id != self.keep_alive_id {
            debug!("Stale keepalive {} from connection {}", id, conn);
            return;
        }
        let latency = self.keep_alive_age_ms();
        if let Some(player) = self.directory.write().get_mut(conn) {
            player.conn.latency_ms = latency;
        }
    }

    /// Per-tick broadcasts after the inbox and action queue ran
    pub fn advance(&mut self) {
        let tick = self.sequencer.tick();
        if tick % self.config.time_sync_interval == 0 {
            self.send_message(PacketId::ServerTimeControl, &TimeControl { tick });
        }

        let tick = self.sequencer.advance_tick();

        if tick % self.config.keep_alive_interval == 0 {
            let latencies = self.directory.read().latencies();
            self.send_message(PacketId::ServerPlayerList, &PlayerList::Latencies(latencies));

            self.keep_alive_id += 1;
            self.send_message(
                PacketId::ServerKeepAlive,
                &KeepAlive {
                    id: self.keep_alive_id,
                },
            );
            self.last_keep_alive = Instant::now();

            let silent = self.directory.read().timed_out(self.config.peer_timeout());
            for conn in silent {
                warn!("Connection {} timed out", conn);
                self.disconnect(conn, DisconnectReason::NetFailed, Vec::new());
            }
        }

        if tick % 60 == 0 {
            let directory = self.directory.read();
            if !directory.is_empty() {
                debug!(
                    "Tick {}: {} connections, {} playing",
                    tick,
                    directory.len(),
                    directory.playing_count()
                );
            }
        }
    }

    /// Applies the policy for a packet with no handler in `state`
    fn on_unregistered(&mut self, conn: ConnectionId, state: StateKind, packet: PacketId, lenient: bool) {
        if lenient {
            debug!(
                "Ignoring {:?} in {:?} from rejoining connection {}",
                packet, state, conn
            );
            return;
        }
        match self.config.unknown_packet_policy {
            UnknownPacketPolicy::Drop => {
                warn!("Dropping {:?} in {:?} from connection {}", packet, state, conn);
            }
            UnknownPacketPolicy::Disconnect => {
                let message = format!("packet {:?} is not valid in state {:?}", packet, state);
                warn!("Connection {}: {}", conn, message);
                self.disconnect(conn, DisconnectReason::Internal, message.into_bytes());
            }
        }
    }
}

/// Control surface usable from any thread
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    actions: Arc<ServerActions>,
    directory: SharedDirectory,
    addrs: Vec<SocketAddr>,
}

impl ServerHandle {
    /// Asks the tick loop to shut down at its next iteration
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs `action` on the tick thread during the next tick
    pub fn enqueue<F>(&self, action: F)
    where
        F: FnOnce(&mut ServerContext) -> Result<(), ActionError> + Send + 'static,
    {
        self.actions.enqueue(action);
    }

    pub fn autosave(&self) {
        self.enqueue(|ctx| ctx.do_autosave().map_err(ActionError::new));
    }

    pub fn kick(&self, username: &str) {
        let username = username.to_string();
        self.enqueue(move |ctx| {
            if ctx.kick(&username) {
                Ok(())
            } else {
                Err(ActionError::new(format!("no player named {}", username)))
            }
        });
    }

    /// Listening address of every channel, primary first
    pub fn channel_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn connection_count(&self) -> usize {
        self.directory.read().len()
    }

    pub fn playing_usernames(&self) -> Vec<String> {
        self.directory
            .read()
            .playing_players()
            .map(|p| p.username().to_string())
            .collect()
    }

    pub fn player_entries(&self) -> Vec<shared::packets::PlayerEntry> {
        self.directory.read().player_entries()
    }
}

/// Session server coordinating the listeners and the tick loop
pub struct Server {
    context: ServerContext,
    handlers: HandlerTable<ServerContext, ConnectionId>,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    actions: Arc<ServerActions>,
    running: Arc<AtomicBool>,
    listeners: Vec<JoinHandle<()>>,
    addrs: Vec<SocketAddr>,
}

impl Server {
    /// Binds every channel listener and starts accepting connections
    ///
    /// Nothing is processed until [`Server::run`] starts ticking.
    pub async fn bind(
        config: ServerConfig,
        world: WorldStore,
        logs: PartitionLogs,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listeners = bind_listeners(&config).await?;
        let addrs = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<Result<Vec<_>, _>>()?;

        let directory = SharedDirectory::new(SessionDirectory::new(
            config.max_players,
            config.host_username.clone(),
            config.default_faction_id,
        ));
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::new(&config, directory.clone(), inbox_tx));
        let listeners = listeners
            .into_iter()
            .enumerate()
            .map(|(channel, listener)| spawn_listener(listener, channel, Arc::clone(&transport)))
            .collect();

        let actions = Arc::new(ServerActions::new());
        let context = ServerContext::new(config, world, logs, directory, Arc::clone(&actions));

        Ok(Self {
            context,
            handlers: server_handlers(),
            inbox,
            actions,
            running: Arc::new(AtomicBool::new(true)),
            listeners,
            addrs,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: Arc::clone(&self.running),
            actions: Arc::clone(&self.actions),
            directory: self.context.directory.clone(),
            addrs: self.addrs.clone(),
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// Runs one tick: inbox, queued actions, then periodic broadcasts
    pub fn tick(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            self.handle_message(message);
        }
        self.actions.run(&mut self.context);
        self.context.advance();
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::PacketReceived { conn, data } => self.handle_packet(conn, &data),
            ServerMessage::Disconnected { conn } => {
                self.context
                    .on_disconnected(conn, DisconnectReason::ClientLeft);
            }
        }
    }

    fn handle_packet(&mut self, conn: ConnectionId, data: &[u8]) {
        let (state, lenient) = {
            let mut directory = self.context.directory.write();
            match directory.get_mut(conn) {
                Some(player) => {
                    player.touch();
                    (player.conn.kind(), player.conn.lenient)
                }
                None => {
                    debug!("Packet from unknown connection {}", conn);
                    return;
                }
            }
        };

        match self.handlers.dispatch(&mut self.context, conn, state, data) {
            Ok(Dispatch::Handled(_)) => {}
            Ok(Dispatch::Unregistered(packet)) => {
                self.context.on_unregistered(conn, state, packet, lenient);
            }
            Err(HandlerError::Rejected { reason, data }) => {
                info!("Rejecting connection {}: {:?}", conn, reason);
                self.context.disconnect(conn, reason, data);
            }
            Err(e) => {
                error!("Error handling packet from connection {}: {}", conn, e);
                self.context
                    .disconnect(conn, DisconnectReason::Internal, e.to_string().into_bytes());
            }
        }
    }

    /// Main loop; returns after [`ServerHandle::stop`] once shutdown is done
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut tick_interval = interval(self.context.config.tick_duration());
        info!(
            "Server started on {} with {} channels",
            self.addrs
                .first()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            self.addrs.len()
        );

        while self.running.load(Ordering::SeqCst) {
            tick_interval.tick().await;
            self.tick();
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Server shutting down");

        let links = self.context.directory.read().links();
        match encode_disconnect(DisconnectReason::ServerClosed, &[]) {
            Ok(body) => {
                let packet = encode_packet(PacketId::ServerDisconnectReason, &body);
                for link in &links {
                    if let Err(e) = link.send(packet.clone()) {
                        debug!("Could not send shutdown reason to {}: {}", link.id(), e);
                    }
                }
            }
            Err(e) => error!("Failed to encode disconnect reason: {}", e),
        }

        for link in &links {
            link.close();
        }
        for link in &links {
            if !link.flush(FLUSH_TIMEOUT).await {
                warn!("Connection {} did not flush before shutdown", link.id());
            }
            link.abort_readers();
        }
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        info!("Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::command::read_marked;
    use shared::packets::{decode_body, split_packet};
    use shared::{ChannelWriter, ChunkFraming, DeliveryMarker, Link};

    struct Peer {
        conn: ConnectionId,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl Peer {
        fn packets(&mut self) -> Vec<(PacketId, Vec<u8>)> {
            let mut packets = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                let (id, body) = split_packet(&frame).unwrap();
                packets.push((id, body.to_vec()));
            }
            packets
        }
    }

    fn context() -> ServerContext {
        let config = ServerConfig {
            parallelism: 1,
            ..ServerConfig::default()
        };
        let directory = SharedDirectory::new(SessionDirectory::new(8, None, 1));
        ServerContext::new(
            config,
            WorldStore::new(vec![1], vec![2]),
            PartitionLogs::new(),
            directory,
            Arc::new(ServerActions::new()),
        )
    }

    fn connect(ctx: &ServerContext, conn: ConnectionId) -> Peer {
        let link = Link::new(conn, 0, ChunkFraming::Tagged, usize::MAX).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        link.attach_primary(ChannelWriter::new(0, tx), "127.0.0.1:1".parse().unwrap());
        ctx.directory.write().on_connected(Arc::new(link));
        Peer { conn, rx }
    }

    fn play(ctx: &mut ServerContext, peer: &Peer, username: &str) {
        {
            let mut directory = ctx.directory.write();
            directory.resolve_faction(username);
            let player = directory.get_mut(peer.conn).unwrap();
            player.conn.username = username.to_string();
            player.conn.apply(&StateEvent::HelloAccepted);
        }
        ctx.stream_world(peer.conn).unwrap();
    }

    #[test]
    fn test_time_control_and_keepalive_schedule() {
        let mut ctx = context();
        let mut peer = connect(&ctx, 1);
        play(&mut ctx, &peer, "alice");
        peer.packets();

        for _ in 0..180 {
            ctx.advance();
        }
        assert_eq!(ctx.tick(), 180);

        let packets = peer.packets();
        let time_controls: Vec<i32> = packets
            .iter()
            .filter(|(id, _)| *id == PacketId::ServerTimeControl)
            .map(|(id, body)| decode_body::<TimeControl>(*id, body).unwrap().tick)
            .collect();
        assert_eq!(time_controls.len(), 60);
        assert_eq!(time_controls[0], 0);
        assert_eq!(time_controls[1], 3);

        let keep_alives: Vec<i32> = packets
            .iter()
            .filter(|(id, _)| *id == PacketId::ServerKeepAlive)
            .map(|(id, body)| decode_body::<KeepAlive>(*id, body).unwrap().id)
            .collect();
        assert_eq!(keep_alives, vec![1]);
        assert_eq!(ctx.keep_alive_id(), 1);
    }

    #[test]
    fn test_joining_player_gets_world_then_commands() {
        let mut ctx = context();
        let mut host = connect(&ctx, 1);
        play(&mut ctx, &host, "host");
        ctx.send_command(CommandType::Designator, 1, 0, vec![7], Some("host"))
            .unwrap();

        let mut guest = connect(&ctx, 2);
        play(&mut ctx, &guest, "guest");
        ctx.send_command(CommandType::Designator, 1, 0, vec![8], Some("host"))
            .unwrap();

        let packets = guest.packets();
        let ids: Vec<PacketId> = packets.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            ids,
            vec![
                PacketId::ServerWorldDataStart,
                PacketId::ServerWorldData,
                PacketId::ServerPlayerList,
                PacketId::ServerCommand,
            ]
        );
        let world: shared::packets::WorldData =
            decode_body(PacketId::ServerWorldData, &packets[1].1).unwrap();
        // FactionOnline plus the first designator
        assert_eq!(world.partition_logs.len(), 2);
        let (command, marker) = read_marked(&packets[3].1).unwrap();
        assert_eq!(command.payload, vec![8]);
        assert_eq!(marker, DeliveryMarker::Remote);

        let host_commands: Vec<DeliveryMarker> = host
            .packets()
            .iter()
            .filter(|(id, _)| *id == PacketId::ServerCommand)
            .map(|(_, body)| read_marked(body).unwrap().1)
            .collect();
        // FactionOnline, own designator, own designator
        assert_eq!(
            host_commands,
            vec![
                DeliveryMarker::Remote,
                DeliveryMarker::SelfIssued,
                DeliveryMarker::SelfIssued
            ]
        );
    }

    #[test]
    fn test_large_commands_stay_on_primary_in_order() {
        let mut ctx = context();
        let link = Link::new(1, 1, ChunkFraming::Tagged, 64).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (parallel_tx, mut parallel_rx) = mpsc::unbounded_channel();
        link.attach_primary(ChannelWriter::new(0, tx), "127.0.0.1:1".parse().unwrap());
        link.attach_parallel(0, ChannelWriter::new(1, parallel_tx))
            .unwrap();
        ctx.directory.write().on_connected(Arc::new(link));
        let mut peer = Peer { conn: 1, rx };
        play(&mut ctx, &peer, "alice");
        peer.packets();
        while parallel_rx.try_recv().is_ok() {}

        ctx.send_command(CommandType::Designator, 1, 0, vec![0xAB; 200], None)
            .unwrap();
        ctx.send_command(CommandType::Designator, 1, 0, vec![1], None)
            .unwrap();

        assert!(parallel_rx.try_recv().is_err());
        let payloads: Vec<Vec<u8>> = peer
            .packets()
            .iter()
            .filter(|(id, _)| *id == PacketId::ServerCommand)
            .map(|(_, body)| read_marked(body).unwrap().0.payload)
            .collect();
        assert_eq!(payloads, vec![vec![0xAB; 200], vec![1]]);
    }

    #[test]
    fn test_last_player_of_faction_goes_offline() {
        let mut ctx = context();
        let alice = connect(&ctx, 1);
        play(&mut ctx, &alice, "alice");
        let bob = connect(&ctx, 2);
        play(&mut ctx, &bob, "bob");

        ctx.on_disconnected(alice.conn, DisconnectReason::ClientLeft);
        ctx.on_disconnected(alice.conn, DisconnectReason::ClientLeft);
        ctx.on_disconnected(bob.conn, DisconnectReason::ClientLeft);

        let log = ctx.sequencer.decoded_log(GLOBAL).unwrap();
        let types: Vec<CommandType> = log.iter().map(|c| c.command_type).collect();
        assert_eq!(
            types,
            vec![CommandType::FactionOnline, CommandType::FactionOffline]
        );
        assert_eq!(log[1].payload, 1i32.to_le_bytes().to_vec());
        assert!(ctx.directory.read().is_empty());
    }

    #[test]
    fn test_autosave_window() {
        let mut ctx = context();
        let host = connect(&ctx, 1);
        play(&mut ctx, &host, "host");

        ctx.do_autosave().unwrap();
        ctx.sequencer.advance_tick();
        ctx.send_command(CommandType::Designator, 1, 4, vec![1], Some("host"))
            .unwrap();

        ctx.complete_autosave(WorldUpload {
            world: vec![42],
            session: vec![43],
            partitions: Vec::new(),
        });

        assert_eq!(ctx.world.world(), &[42]);
        assert!(ctx.sequencer.partition_log(GLOBAL).is_empty());
        assert_eq!(ctx.sequencer.partition_log(4).len(), 1);
    }

    #[test]
    fn test_kick_sends_reason() {
        let mut ctx = context();
        let mut peer = connect(&ctx, 1);
        play(&mut ctx, &peer, "alice");
        peer.packets();

        assert!(ctx.kick("alice"));
        assert!(!ctx.kick("alice"));

        let packets = peer.packets();
        let (id, body) = &packets[0];
        assert_eq!(*id, PacketId::ServerDisconnectReason);
        let (reason, _) = shared::disconnect::decode_disconnect(body).unwrap();
        assert_eq!(reason, DisconnectReason::Kick);
    }

    #[test]
    fn test_keep_alive_latency() {
        let mut ctx = context();
        let peer = connect(&ctx, 1);
        play(&mut ctx, &peer, "alice");
        for _ in 0..180 {
            ctx.advance();
        }

        ctx.record_keep_alive(peer.conn, 0);
        assert_eq!(ctx.directory.read().get(1).unwrap().conn.latency_ms, 0);

        std::thread::sleep(Duration::from_millis(5));
        ctx.record_keep_alive(peer.conn, 1);
        assert!(ctx.directory.read().get(1).unwrap().conn.latency_ms >= 5);
    }

    #[test]
    fn test_stream_world_requires_accepted_handshake() {
        let mut ctx = context();
        let peer = connect(&ctx, 1);
        assert!(ctx.stream_world(peer.conn).is_err());
        assert!(ctx.stream_world(99).is_ok());
    }
}
