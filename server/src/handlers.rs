//! Server packet handlers
//!
//! [`server_handlers`] builds the table once at startup. A handler only runs
//! for the state it is registered in; everything else goes through the
//! unknown-packet policy in the tick loop.

use log::{debug, info, warn};
use shared::disconnect::protocol_mismatch_data;
use shared::packets::{
    decode_body, encode_packet, encode_message, CommandRequest, Hello, IdBlockRequest, JoinAccepted,
    KeepAlive, PacketId, WorldUpload,
};
use shared::state::{HandlerTable, JoinStage};
use shared::{
    CommandType, ConnectionState, DisconnectReason, HandlerError, StateEvent, StateKind,
    PROTOCOL_VERSION, VERSION,
};

use crate::directory::ConnectionId;
use crate::network::ServerContext;

pub fn server_handlers() -> HandlerTable<ServerContext, ConnectionId> {
    HandlerTable::new()
        .register(StateKind::ServerJoining, PacketId::ClientHello, handle_hello)
        .register(
            StateKind::ServerPlaying,
            PacketId::ClientWorldReady,
            handle_world_ready,
        )
        .register(StateKind::ServerPlaying, PacketId::ClientCommand, handle_command)
        .register(
            StateKind::ServerPlaying,
            PacketId::ClientKeepAlive,
            handle_keep_alive,
        )
        .register(
            StateKind::ServerPlaying,
            PacketId::ClientIdBlockRequest,
            handle_id_block_request,
        )
        .register(
            StateKind::ServerPlaying,
            PacketId::ClientWorldUpload,
            handle_world_upload,
        )
        .register_in(
            &[StateKind::ServerJoining, StateKind::ServerPlaying],
            PacketId::ClientLeave,
            handle_leave,
        )
}

/// Checks length and allowed characters of a username
pub fn validate_username(username: &str, max_len: usize) -> Result<(), DisconnectReason> {
    let len = username.chars().count();
    if len == 0 || len > max_len {
        return Err(DisconnectReason::UsernameLength);
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DisconnectReason::UsernameChars);
    }
    Ok(())
}

fn unknown_connection(conn: ConnectionId) -> HandlerError {
    HandlerError::Invalid(format!("unknown connection {}", conn))
}

fn handle_hello(ctx: &mut ServerContext, conn: ConnectionId, body: &[u8]) -> Result<(), HandlerError> {
    let hello: Hello = decode_body(PacketId::ClientHello, body)?;

    if hello.protocol != PROTOCOL_VERSION {
        info!(
            "Connection {} runs protocol {} (version {}), expected {}",
            conn, hello.protocol, hello.version, PROTOCOL_VERSION
        );
        return Err(HandlerError::Rejected {
            reason: DisconnectReason::Protocol,
            data: protocol_mismatch_data(VERSION, PROTOCOL_VERSION)?,
        });
    }
    validate_username(&hello.username, ctx.config.max_username_len)
        .map_err(HandlerError::rejected)?;

    let (player_id, faction_id) = {
        let mut directory = ctx.directory.write();
        let state = directory
            .get(conn)
            .map(|p| p.conn.state().clone())
            .ok_or_else(|| unknown_connection(conn))?;
        if state
            != (ConnectionState::ServerJoining {
                stage: JoinStage::AwaitingHello,
            })
        {
            return Err(HandlerError::InvalidState {
                state: state.kind(),
                packet: PacketId::ClientHello,
            });
        }
        if directory.is_username_online(&hello.username) {
            return Err(HandlerError::rejected(DisconnectReason::UsernameAlreadyOnline));
        }
        if directory.is_full() {
            return Err(HandlerError::rejected(DisconnectReason::ServerFull));
        }

        let (faction_id, known) = directory.resolve_faction(&hello.username);
        let player = directory
            .get_mut(conn)
            .ok_or_else(|| unknown_connection(conn))?;
        player.conn.username = hello.username.clone();
        player.conn.lenient = known;
        player.conn.apply(&StateEvent::HelloAccepted);
        (player.id, faction_id)
    };

    info!(
        "Player {} joined as {} (faction {}, version {})",
        player_id, hello.username, faction_id, hello.version
    );

    let accepted = encode_message(
        PacketId::ServerJoinAccepted,
        &JoinAccepted {
            player_id,
            faction_id,
        },
    )?;
    ctx.send_to(conn, accepted);
    ctx.defer(move |ctx| ctx.stream_world(conn));
    Ok(())
}

fn handle_world_ready(
    ctx: &mut ServerContext,
    conn: ConnectionId,
    _body: &[u8],
) -> Result<(), HandlerError> {
    let username = {
        let mut directory = ctx.directory.write();
        let player = directory
            .get_mut(conn)
            .ok_or_else(|| unknown_connection(conn))?;
        if !player.conn.apply(&StateEvent::WorldReady) {
            return Err(HandlerError::Invalid("duplicate world ready".to_string()));
        }
        player.conn.username.clone()
    };

    info!("Player {} finished loading", username);
    ctx.send_notification("PlayerConnected", &[&username]);
    Ok(())
}

fn handle_command(ctx: &mut ServerContext, conn: ConnectionId, body: &[u8]) -> Result<(), HandlerError> {
    let request: CommandRequest = decode_body(PacketId::ClientCommand, body)?;
    let command_type = CommandType::from_u8(request.command_type)?;
    if command_type.is_server_only() {
        return Err(HandlerError::Invalid(format!(
            "{:?} commands are issued by the server only",
            command_type
        )));
    }

    let (username, faction_id) = {
        let directory = ctx.directory.read();
        let player = directory.get(conn).ok_or_else(|| unknown_connection(conn))?;
        (player.username().to_string(), directory.player_faction(player))
    };

    ctx.send_command(
        command_type,
        faction_id,
        request.partition_id,
        request.payload,
        Some(&username),
    )?;
    Ok(())
}

fn handle_keep_alive(ctx: &mut ServerContext, conn: ConnectionId, body: &[u8]) -> Result<(), HandlerError> {
    let keep_alive: KeepAlive = decode_body(PacketId::ClientKeepAlive, body)?;
    ctx.record_keep_alive(conn, keep_alive.id);
    Ok(())
}

fn handle_id_block_request(
    ctx: &mut ServerContext,
    conn: ConnectionId,
    body: &[u8],
) -> Result<(), HandlerError> {
    let request: IdBlockRequest = decode_body(PacketId::ClientIdBlockRequest, body)?;
    let limit = ctx.config.max_id_blocks_per_player;
    {
        let directory = ctx.directory.read();
        let player = directory.get(conn).ok_or_else(|| unknown_connection(conn))?;
        if player.id_blocks_issued >= limit {
            return Err(HandlerError::Invalid(format!(
                "player {} requested more than {} id blocks",
                player.id, limit
            )));
        }
    }

    let block = match ctx
        .sequencer
        .next_id_block(ctx.config.id_block_size, request.partition_id)
    {
        Ok(block) => block,
        Err(e) => {
            warn!("Refusing id block for connection {}: {}", conn, e);
            return Ok(());
        }
    };
    if let Some(player) = ctx.directory.write().get_mut(conn) {
        player.id_blocks_issued += 1;
    }
    debug!(
        "Connection {} received id block starting at {}",
        conn, block.block_start
    );
    ctx.send_to(conn, encode_packet(PacketId::ServerIdBlock, &block.serialize()));
    Ok(())
}

fn handle_world_upload(
    ctx: &mut ServerContext,
    conn: ConnectionId,
    body: &[u8],
) -> Result<(), HandlerError> {
    let is_host = {
        let directory = ctx.directory.read();
        let player = directory.get(conn).ok_or_else(|| unknown_connection(conn))?;
        directory.is_host(player)
    };
    if !is_host {
        return Err(HandlerError::Invalid(
            "world upload from a player that is not the host".to_string(),
        ));
    }

    let upload: WorldUpload = decode_body(PacketId::ClientWorldUpload, body)?;
    info!(
        "Host uploaded world data ({} bytes, {} partitions)",
        upload.world.len(),
        upload.partitions.len()
    );
    ctx.complete_autosave(upload);
    Ok(())
}

fn handle_leave(ctx: &mut ServerContext, conn: ConnectionId, _body: &[u8]) -> Result<(), HandlerError> {
    ctx.on_disconnected(conn, DisconnectReason::ClientLeft);
    Ok(())
}
