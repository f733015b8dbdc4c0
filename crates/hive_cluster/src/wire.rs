//! Datagram wire format.
//!
//! Every datagram carries a three byte header followed by the payload:
//!
//! ```text
//! ┌─────────┬──────────────────────┬──────────────────────┐
//! │ command │ sender id            │ payload              │
//! │ 1 byte  │ 2 bytes, BE signed   │ 0..=1021 bytes       │
//! └─────────┴──────────────────────┴──────────────────────┘
//! ```
//!
//! The [`HEARTBEAT_COMMAND`] payload is the sender's UUID: the
//! most-significant 64 bits followed by the least-significant 64 bits, both
//! big-endian.

use uuid::Uuid;

use crate::error::{ClusterError, Result};

/// Largest datagram the channel sends or accepts.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Command byte plus sender id.
pub const HEADER_SIZE: usize = 3;

/// Largest payload that fits in one datagram.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Reserved command carrying an identity heartbeat.
pub const HEARTBEAT_COMMAND: u8 = 0x00;

/// Length of a heartbeat payload.
pub const HEARTBEAT_PAYLOAD_SIZE: usize = 16;

/// Length of a complete heartbeat datagram.
pub const HEARTBEAT_PACKET_SIZE: usize = HEADER_SIZE + HEARTBEAT_PAYLOAD_SIZE;

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub sender_id: i16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn is_heartbeat(&self) -> bool {
        self.command == HEARTBEAT_COMMAND
    }

    /// The UUID carried by a heartbeat packet.
    pub fn heartbeat_uuid(&self) -> Result<Uuid> {
        decode_uuid(&self.payload)
    }
}

/// Encode a datagram. Fails when the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode(command: u8, sender_id: i16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ClusterError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(command);
    buf.extend_from_slice(&sender_id.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode a heartbeat announcing `uuid` under `sender_id`.
pub fn encode_heartbeat(sender_id: i16, uuid: &Uuid) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEARTBEAT_PACKET_SIZE);
    buf.push(HEARTBEAT_COMMAND);
    buf.extend_from_slice(&sender_id.to_be_bytes());
    // RFC 4122 byte order is the high half then the low half, big-endian.
    buf.extend_from_slice(uuid.as_bytes());
    buf
}

/// Decode a received datagram.
///
/// Heartbeats are validated here as well so that a malformed heartbeat
/// never reaches the membership table.
pub fn decode(data: &[u8]) -> Result<Packet> {
    if data.len() < HEADER_SIZE {
        return Err(ClusterError::PacketTooShort(data.len()));
    }
    if data.len() > MAX_PACKET_SIZE {
        return Err(ClusterError::PacketTooLong(data.len()));
    }
    let command = data[0];
    let sender_id = i16::from_be_bytes([data[1], data[2]]);
    let payload = &data[HEADER_SIZE..];
    if command == HEARTBEAT_COMMAND && payload.len() != HEARTBEAT_PAYLOAD_SIZE {
        return Err(ClusterError::InvalidHeartbeat(payload.len()));
    }
    Ok(Packet {
        command,
        sender_id,
        payload: payload.to_vec(),
    })
}

fn decode_uuid(payload: &[u8]) -> Result<Uuid> {
    let bytes: [u8; HEARTBEAT_PAYLOAD_SIZE] = payload
        .try_into()
        .map_err(|_| ClusterError::InvalidHeartbeat(payload.len()))?;
    Ok(Uuid::from_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
