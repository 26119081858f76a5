//! Disconnect reasons
//!
//! A disconnect travels as one reason byte followed by a length-prefixed
//! byte string of reason-specific data. The remote end turns both into a
//! message for the user with [`user_message`].

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::wire::{ByteReader, ByteWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    Generic = 0,
    ConnectingFailed = 1,
    NetFailed = 2,
    ClientLeft = 3,
    /// Data: server version string, then the server protocol as `i32`
    Protocol = 4,
    UsernameLength = 5,
    UsernameChars = 6,
    UsernameAlreadyOnline = 7,
    ServerClosed = 8,
    ServerFull = 9,
    Kick = 10,
    /// Data: UTF-8 description of the packet error
    Internal = 11,
}

impl DisconnectReason {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => DisconnectReason::Generic,
            1 => DisconnectReason::ConnectingFailed,
            2 => DisconnectReason::NetFailed,
            3 => DisconnectReason::ClientLeft,
            4 => DisconnectReason::Protocol,
            5 => DisconnectReason::UsernameLength,
            6 => DisconnectReason::UsernameChars,
            7 => DisconnectReason::UsernameAlreadyOnline,
            8 => DisconnectReason::ServerClosed,
            9 => DisconnectReason::ServerFull,
            10 => DisconnectReason::Kick,
            11 => DisconnectReason::Internal,
            _ => {
                return Err(WireError::InvalidTag {
                    kind: "disconnect reason",
                    value,
                })
            }
        })
    }
}

/// Encodes a reason and its extra data
pub fn encode_disconnect(reason: DisconnectReason, data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut writer = ByteWriter::with_capacity(5 + data.len());
    writer.write_u8(reason as u8);
    writer.write_prefixed_bytes(data)?;
    Ok(writer.into_bytes())
}

pub fn decode_disconnect(bytes: &[u8]) -> Result<(DisconnectReason, Vec<u8>), WireError> {
    let mut reader = ByteReader::new(bytes);
    let reason = DisconnectReason::from_u8(reader.read_u8()?)?;
    let data = reader.read_prefixed_bytes()?;
    Ok((reason, data))
}

/// Extra data for [`DisconnectReason::Protocol`]
pub fn protocol_mismatch_data(version: &str, protocol: i32) -> Result<Vec<u8>, WireError> {
    let mut writer = ByteWriter::new();
    writer.write_prefixed_bytes(version.as_bytes())?;
    writer.write_i32(protocol);
    Ok(writer.into_bytes())
}

/// Builds the text shown to the user for a received disconnect
pub fn user_message(reason: DisconnectReason, data: &[u8]) -> String {
    match reason {
        DisconnectReason::Generic => "Disconnected".to_string(),
        DisconnectReason::ConnectingFailed => "Connection failed".to_string(),
        DisconnectReason::NetFailed => match data.first() {
            Some(code) => format!("Connection lost (transport code {})", code),
            None => "Connection lost".to_string(),
        },
        DisconnectReason::ClientLeft => "Client left".to_string(),
        DisconnectReason::Protocol => {
            let mut reader = ByteReader::new(data);
            match (reader.read_prefixed_bytes(), reader.read_i32()) {
                (Ok(version), Ok(protocol)) => format!(
                    "Protocol mismatch: server runs version {} (protocol {})",
                    String::from_utf8_lossy(&version),
                    protocol
                ),
                _ => "Protocol mismatch".to_string(),
            }
        }
        DisconnectReason::UsernameLength => "Username has an invalid length".to_string(),
        DisconnectReason::UsernameChars => "Username contains invalid characters".to_string(),
        DisconnectReason::UsernameAlreadyOnline => {
            "A player with this username is already online".to_string()
        }
        DisconnectReason::ServerClosed => "Server closed".to_string(),
        DisconnectReason::ServerFull => "Server is full".to_string(),
        DisconnectReason::Kick => "Kicked from the server".to_string(),
        DisconnectReason::Internal => {
            if data.is_empty() {
                "Internal error".to_string()
            } else {
                format!("Internal error: {}", String::from_utf8_lossy(data))
            }
        }
    }
}
