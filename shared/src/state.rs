//! Connection state machine
//!
//! A connection is always in exactly one [`ConnectionState`]. Each variant
//! carries only the data that is meaningful while in it, and [`transition`]
//! is the single place that decides how an event moves a connection between
//! states. Which packets are accepted in which state is decided by a
//! [`HandlerTable`] built once when a server or client starts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::disconnect::DisconnectReason;
use crate::error::HandlerError;
use crate::packets::{split_packet, PacketId};

/// Field-less tag of a [`ConnectionState`], used as a handler table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    ServerJoining,
    ServerPlaying,
    ClientJoining,
    ClientLoading,
    ClientPlaying,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStage {
    AwaitingHello,
    /// Handshake accepted, world data not sent yet
    AwaitingWorld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingStage {
    Waiting,
    Downloading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    ServerJoining { stage: JoinStage },
    /// `ready` flips once the client reports its simulation caught up
    ServerPlaying { joined_tick: i32, ready: bool },
    ClientJoining,
    ClientLoading { stage: LoadingStage },
    ClientPlaying,
    Disconnected { reason: DisconnectReason },
}

impl ConnectionState {
    pub fn server_initial() -> Self {
        ConnectionState::ServerJoining {
            stage: JoinStage::AwaitingHello,
        }
    }

    pub fn kind(&self) -> StateKind {
        match self {
            ConnectionState::ServerJoining { .. } => StateKind::ServerJoining,
            ConnectionState::ServerPlaying { .. } => StateKind::ServerPlaying,
            ConnectionState::ClientJoining => StateKind::ClientJoining,
            ConnectionState::ClientLoading { .. } => StateKind::ClientLoading,
            ConnectionState::ClientPlaying => StateKind::ClientPlaying,
            ConnectionState::Disconnected { .. } => StateKind::Disconnected,
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(
            self,
            ConnectionState::ServerPlaying { .. } | ConnectionState::ClientPlaying
        )
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// Handshake accepted by the server
    HelloAccepted,
    /// Server sent the world snapshot taken at `tick`
    WorldDataSent { tick: i32 },
    /// Client saw the world data transfer announced
    WorldDataStarted,
    /// Client finished decoding the world data
    WorldDataLoaded,
    /// Client reported that its simulation caught up
    WorldReady,
    Disconnect(DisconnectReason),
}

/// Computes the state that follows `state` after `event`
///
/// Pairs with no defined transition leave the state as it is. Every state
/// moves to `Disconnected` on a disconnect, and `Disconnected` never leaves.
pub fn transition(state: &ConnectionState, event: &StateEvent) -> ConnectionState {
    use ConnectionState as S;
    use StateEvent as E;

    match (state, event) {
        (S::Disconnected { .. }, _) => state.clone(),
        (_, E::Disconnect(reason)) => S::Disconnected { reason: *reason },

        (
            S::ServerJoining {
                stage: JoinStage::AwaitingHello,
            },
            E::HelloAccepted,
        ) => S::ServerJoining {
            stage: JoinStage::AwaitingWorld,
        },
        (
            S::ServerJoining {
                stage: JoinStage::AwaitingWorld,
            },
            E::WorldDataSent { tick },
        ) => S::ServerPlaying {
            joined_tick: *tick,
            ready: false,
        },
        (
            S::ServerPlaying {
                joined_tick,
                ready: false,
            },
            E::WorldReady,
        ) => S::ServerPlaying {
            joined_tick: *joined_tick,
            ready: true,
        },

        (S::ClientJoining, E::HelloAccepted) => S::ClientLoading {
            stage: LoadingStage::Waiting,
        },
        (
            S::ClientLoading {
                stage: LoadingStage::Waiting,
            },
            E::WorldDataStarted,
        ) => S::ClientLoading {
            stage: LoadingStage::Downloading,
        },
        (
            S::ClientLoading {
                stage: LoadingStage::Downloading,
            },
            E::WorldDataLoaded,
        ) => S::ClientPlaying,

        _ => state.clone(),
    }
}

/// Per-connection session data shared by both ends
///
/// `link` is whatever the owning side uses to reach the remote peer.
#[derive(Debug)]
pub struct Connection<L> {
    pub link: L,
    pub username: String,
    pub latency_ms: i32,
    /// Relaxed validation while a known client rejoins
    pub lenient: bool,
    state: ConnectionState,
}

impl<L> Connection<L> {
    pub fn new(link: L, state: ConnectionState) -> Self {
        Self {
            link,
            username: String::new(),
            latency_ms: 0,
            lenient: false,
            state,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    /// Applies `event` and reports whether the state changed
    pub fn apply(&mut self, event: &StateEvent) -> bool {
        let next = transition(&self.state, event);
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Moves to `Disconnected`; false if the connection was already there
    pub fn disconnect(&mut self, reason: DisconnectReason) -> bool {
        self.apply(&StateEvent::Disconnect(reason))
    }
}

/// Packet handler: context, origin key, packet body
pub type Handler<C, K> = fn(&mut C, K, &[u8]) -> Result<(), HandlerError>;

/// Outcome of [`HandlerTable::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled(PacketId),
    /// No handler registered for this packet in the current state
    Unregistered(PacketId),
}

/// Static mapping from (state, packet) to handler
pub struct HandlerTable<C, K> {
    handlers: HashMap<(StateKind, PacketId), Handler<C, K>>,
}

impl<C, K> Default for HandlerTable<C, K> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C, K> HandlerTable<C, K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, state: StateKind, packet: PacketId, handler: Handler<C, K>) -> Self {
        self.handlers.insert((state, packet), handler);
        self
    }

    /// Registers the same handler for several states
    pub fn register_in(
        mut self,
        states: &[StateKind],
        packet: PacketId,
        handler: Handler<C, K>,
    ) -> Self {
        for &state in states {
            self.handlers.insert((state, packet), handler);
        }
        self
    }

    pub fn lookup(&self, state: StateKind, packet: PacketId) -> Option<Handler<C, K>> {
        self.handlers.get(&(state, packet)).copied()
    }

    pub fn accepts(&self, state: StateKind, packet: PacketId) -> bool {
        self.handlers.contains_key(&(state, packet))
    }

    /// Decodes the packet id and runs the handler registered for `state`
    pub fn dispatch(
        &self,
        context: &mut C,
        key: K,
        state: StateKind,
        packet: &[u8],
    ) -> Result<Dispatch, HandlerError> {
        let (id, body) = split_packet(packet)?;
        match self.lookup(state, id) {
            Some(handler) => {
                handler(context, key, body)?;
                Ok(Dispatch::Handled(id))
            }
            None => Ok(Dispatch::Unregistered(id)),
        }
    }
}
