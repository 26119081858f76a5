//! Player registry for one session
//!
//! This module tracks every connection the server has accepted, including:
//! - Player records keyed by connection id, in connection order
//! - The username to faction mapping, which outlives individual connections
//! - Which players are playing, and which player is the host
//! - Silence detection for peers that stopped answering keepalives
//!
//! Transport tasks add players as primary channels come up, so the
//! directory is shared behind a lock; everything else touches it from the
//! tick thread.

use log::info;
use shared::packets::PlayerEntry;
use shared::{Connection, ConnectionState, Link, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::sequencer::Recipient;

/// Transport-assigned id of a logical connection
pub type ConnectionId = u64;

/// A connected peer and its session data
#[derive(Debug)]
pub struct ServerPlayer {
    /// Player id announced to every client
    pub id: i32,
    pub conn: Connection<Arc<Link>>,
    /// Last time any packet arrived from this peer
    pub last_seen: Instant,
    pub id_blocks_issued: u32,
}

impl ServerPlayer {
    pub fn new(id: i32, link: Arc<Link>) -> Self {
        Self {
            id,
            conn: Connection::new(link, ConnectionState::server_initial()),
            last_seen: Instant::now(),
            id_blocks_issued: 0,
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn.link.id()
    }

    pub fn username(&self) -> &str {
        &self.conn.username
    }

    pub fn is_playing(&self) -> bool {
        self.conn.is_playing()
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Sends a packet on the primary channel, in order with everything
    /// else sent to this player
    pub fn send(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.conn.link.send(packet)
    }
}

impl Recipient for ServerPlayer {
    fn username(&self) -> &str {
        &self.conn.username
    }

    fn deliver(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.send(packet)
    }
}

/// What the rest of the server needs to know about a removed player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub player_id: i32,
    pub username: String,
    pub was_playing: bool,
    pub faction_id: i32,
    /// True when no other playing player shares the faction
    pub last_of_faction: bool,
}

pub struct SessionDirectory {
    players: Vec<ServerPlayer>,
    player_factions: HashMap<String, i32>,
    next_player_id: i32,
    max_players: usize,
    host_username: Option<String>,
    default_faction_id: i32,
}

impl SessionDirectory {
    pub fn new(max_players: usize, host_username: Option<String>, default_faction_id: i32) -> Self {
        Self {
            players: Vec::new(),
            player_factions: HashMap::new(),
            next_player_id: 0,
            max_players,
            host_username,
            default_faction_id,
        }
    }

    /// Registers the connection whose primary channel just came up
    ///
    /// The player starts out joining and does not count towards the player
    /// limit until its handshake is accepted.
    pub fn on_connected(&mut self, link: Arc<Link>) -> i32 {
        let player_id = self.next_player_id;
        self.next_player_id += 1;

        match link.remote_addr() {
            Some(addr) => info!("New connection {} (player {}) from {}", link.id(), player_id, addr),
            None => info!("New connection {} (player {})", link.id(), player_id),
        }
        self.players.push(ServerPlayer::new(player_id, link));
        player_id
    }

    /// Removes a player and reports what changed
    pub fn remove(&mut self, conn: ConnectionId) -> Option<Departure> {
        let index = self.players.iter().position(|p| p.conn_id() == conn)?;
        let player = self.players.remove(index);
        let faction_id = self.player_faction(&player);
        let was_playing = player.is_playing();
        let last_of_faction = was_playing && !self.faction_is_playing(faction_id, None);

        Some(Departure {
            player_id: player.id,
            username: player.conn.username,
            was_playing,
            faction_id,
            last_of_faction,
        })
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&ServerPlayer> {
        self.players.iter().find(|p| p.conn_id() == conn)
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut ServerPlayer> {
        self.players.iter_mut().find(|p| p.conn_id() == conn)
    }

    pub fn find_player<P>(&self, predicate: P) -> Option<&ServerPlayer>
    where
        P: Fn(&ServerPlayer) -> bool,
    {
        self.players.iter().find(|p| predicate(p))
    }

    pub fn get_player(&self, username: &str) -> Option<&ServerPlayer> {
        self.find_player(|p| p.username() == username)
    }

    pub fn players(&self) -> impl Iterator<Item = &ServerPlayer> {
        self.players.iter()
    }

    pub fn playing_players(&self) -> impl Iterator<Item = &ServerPlayer> {
        self.players.iter().filter(|p| p.is_playing())
    }

    pub fn playing_count(&self) -> usize {
        self.playing_players().count()
    }

    /// Players whose handshake has been accepted
    pub fn accepted_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| !p.conn.username.is_empty() && !p.conn.state().is_disconnected())
            .count()
    }

    pub fn is_full(&self) -> bool {
        self.accepted_count() >= self.max_players
    }

    pub fn is_username_online(&self, username: &str) -> bool {
        self.players
            .iter()
            .any(|p| p.username() == username && !p.conn.state().is_disconnected())
    }

    pub fn faction_of(&self, username: &str) -> Option<i32> {
        self.player_factions.get(username).copied()
    }

    /// Looks up the faction of `username`, recording the default faction
    /// for names seen for the first time
    ///
    /// The flag is true when the username was already known.
    pub fn resolve_faction(&mut self, username: &str) -> (i32, bool) {
        match self.player_factions.get(username) {
            Some(&faction) => (faction, true),
            None => {
                self.player_factions
                    .insert(username.to_string(), self.default_faction_id);
                (self.default_faction_id, false)
            }
        }
    }

    pub fn set_faction(&mut self, username: &str, faction_id: i32) {
        self.player_factions.insert(username.to_string(), faction_id);
    }

    pub fn player_faction(&self, player: &ServerPlayer) -> i32 {
        self.faction_of(player.username())
            .unwrap_or(self.default_faction_id)
    }

    pub fn is_host(&self, player: &ServerPlayer) -> bool {
        self.host_username.as_deref() == Some(player.username())
    }

    pub fn host_username(&self) -> Option<&str> {
        self.host_username.as_deref()
    }

    /// Whether some playing player other than `except` belongs to `faction_id`
    pub fn faction_is_playing(&self, faction_id: i32, except: Option<ConnectionId>) -> bool {
        self.playing_players()
            .filter(|p| Some(p.conn_id()) != except)
            .any(|p| self.player_faction(p) == faction_id)
    }

    pub fn entry(&self, player: &ServerPlayer) -> PlayerEntry {
        PlayerEntry {
            player_id: player.id,
            username: player.conn.username.clone(),
            latency_ms: player.conn.latency_ms,
            faction_id: self.player_faction(player),
            is_host: self.is_host(player),
        }
    }

    /// Player list entries of every playing player
    pub fn player_entries(&self) -> Vec<PlayerEntry> {
        self.playing_players().map(|p| self.entry(p)).collect()
    }

    pub fn latencies(&self) -> Vec<(i32, i32)> {
        self.playing_players()
            .map(|p| (p.id, p.conn.latency_ms))
            .collect()
    }

    /// Playing peers that have been silent for longer than `timeout`
    pub fn timed_out(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.playing_players()
            .filter(|p| p.is_timed_out(timeout))
            .map(ServerPlayer::conn_id)
            .collect()
    }

    pub fn links(&self) -> Vec<Arc<Link>> {
        self.players.iter().map(|p| Arc::clone(&p.conn.link)).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

/// Directory handle shared between transport tasks and the tick thread
#[derive(Clone)]
pub struct SharedDirectory(Arc<RwLock<SessionDirectory>>);

impl SharedDirectory {
    pub fn new(directory: SessionDirectory) -> Self {
        Self(Arc::new(RwLock::new(directory)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SessionDirectory> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SessionDirectory> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ChunkFraming, DisconnectReason, StateEvent};

    fn link(id: u64) -> Arc<Link> {
        Arc::new(Link::new(id, 2, ChunkFraming::Tagged, 1024).unwrap())
    }

    /// Connects a player and walks it through the handshake into playing
    fn join(directory: &mut SessionDirectory, conn: ConnectionId, username: &str) -> i32 {
        let id = directory.on_connected(link(conn));
        directory.resolve_faction(username);
        let player = directory.get_mut(conn).unwrap();
        player.conn.username = username.to_string();
        player.conn.apply(&StateEvent::HelloAccepted);
        player.conn.apply(&StateEvent::WorldDataSent { tick: 0 });
        id
    }

    #[test]
    fn test_player_ids_increase() {
        let mut directory = SessionDirectory::new(4, None, 1);
        assert_eq!(directory.on_connected(link(10)), 0);
        assert_eq!(directory.on_connected(link(11)), 1);
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.playing_count(), 0);
        assert_eq!(directory.accepted_count(), 0);
    }

    #[test]
    fn test_find_and_get_player() {
        let mut directory = SessionDirectory::new(4, Some("host".to_string()), 1);
        join(&mut directory, 1, "host");
        join(&mut directory, 2, "guest");

        let host = directory.get_player("host").unwrap();
        assert!(directory.is_host(host));
        assert!(!directory.is_host(directory.get_player("guest").unwrap()));
        assert!(directory.get_player("nobody").is_none());

        let found = directory.find_player(|p| p.id == 1).unwrap();
        assert_eq!(found.username(), "guest");
    }

    #[test]
    fn test_faction_mapping_survives_reconnect() {
        let mut directory = SessionDirectory::new(4, None, 1);
        assert_eq!(directory.resolve_faction("alice"), (1, false));
        directory.set_faction("alice", 5);
        assert_eq!(directory.resolve_faction("alice"), (5, true));

        join(&mut directory, 1, "alice");
        directory.remove(1);
        assert_eq!(directory.faction_of("alice"), Some(5));
    }

    #[test]
    fn test_last_of_faction_on_removal() {
        let mut directory = SessionDirectory::new(4, None, 1);
        join(&mut directory, 1, "alice");
        join(&mut directory, 2, "bob");
        directory.set_faction("carol", 2);
        join(&mut directory, 3, "carol");

        let first = directory.remove(1).unwrap();
        assert!(first.was_playing);
        assert_eq!(first.faction_id, 1);
        assert!(!first.last_of_faction);

        let second = directory.remove(2).unwrap();
        assert!(second.last_of_faction);

        let third = directory.remove(3).unwrap();
        assert_eq!(third.faction_id, 2);
        assert!(third.last_of_faction);

        assert!(directory.remove(3).is_none());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_joining_player_departure() {
        let mut directory = SessionDirectory::new(4, None, 1);
        directory.on_connected(link(1));
        let departure = directory.remove(1).unwrap();
        assert!(!departure.was_playing);
        assert!(!departure.last_of_faction);
    }

    #[test]
    fn test_capacity_counts_accepted_players() {
        let mut directory = SessionDirectory::new(1, None, 1);
        directory.on_connected(link(1));
        assert!(!directory.is_full());

        join(&mut directory, 2, "alice");
        assert!(directory.is_full());
        assert!(directory.is_username_online("alice"));

        directory
            .get_mut(2)
            .unwrap()
            .conn
            .disconnect(DisconnectReason::ClientLeft);
        assert!(!directory.is_full());
        assert!(!directory.is_username_online("alice"));
    }

    #[test]
    fn test_timeouts_only_cover_playing_peers() {
        let mut directory = SessionDirectory::new(4, None, 1);
        directory.on_connected(link(1));
        join(&mut directory, 2, "alice");

        for conn in [1, 2] {
            directory.get_mut(conn).unwrap().last_seen =
                Instant::now() - Duration::from_secs(10);
        }
        assert_eq!(directory.timed_out(Duration::from_secs(5)), vec![2]);

        directory.get_mut(2).unwrap().touch();
        assert!(directory.timed_out(Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_player_entries_and_latencies() {
        let mut directory = SessionDirectory::new(4, Some("alice".to_string()), 3);
        join(&mut directory, 1, "alice");
        directory.on_connected(link(2));
        directory.get_mut(1).unwrap().conn.latency_ms = 42;

        let entries = directory.player_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].username, "alice");
        assert_eq!(entries[0].faction_id, 3);
        assert!(entries[0].is_host);
        assert_eq!(directory.latencies(), vec![(0, 42)]);
    }

    #[test]
    fn test_shared_directory() {
        let shared = SharedDirectory::new(SessionDirectory::new(2, None, 1));
        let clone = shared.clone();
        clone.write().on_connected(link(7));
        assert_eq!(shared.read().len(), 1);
        assert!(shared.read().get(7).is_some());
    }
}
