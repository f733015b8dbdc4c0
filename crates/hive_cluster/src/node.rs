//! Cluster member descriptors and messages.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A member of the cluster as seen from this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Ephemeral node id, unique within the membership table.
    pub id: i16,
    /// Process-lifetime identity announced in heartbeats.
    pub uuid: Uuid,
    /// Source address of the member's datagrams.
    pub address: SocketAddr,
    /// Last time a heartbeat refreshed this entry.
    pub last_seen: Instant,
    /// Wall-clock time the member was first seen.
    pub joined_at: DateTime<Utc>,
    /// Datagrams accepted from this member.
    pub packets_in: u64,
    pub bytes_in: u64,
    /// Datagrams sent by this process. Multicast has no per-peer sends, so
    /// these stay zero on membership entries and are only filled in on
    /// [`MulticastChannel::local_node`](crate::MulticastChannel::local_node).
    pub packets_out: u64,
    pub bytes_out: u64,
}

impl Node {
    pub fn new(id: i16, uuid: Uuid, address: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            uuid,
            address,
            last_seen: now,
            joined_at: Utc::now(),
            packets_in: 0,
            bytes_in: 0,
            packets_out: 0,
            bytes_out: 0,
        }
    }

    pub(crate) fn record_inbound(&mut self, bytes: usize) {
        self.packets_in += 1;
        self.bytes_in += bytes as u64;
    }
}

/// Deterministic ordering used for membership snapshots: IP, port, then id.
pub fn compare_by_address(a: &Node, b: &Node) -> Ordering {
    a.address
        .ip()
        .cmp(&b.address.ip())
        .then_with(|| a.address.port().cmp(&b.address.port()))
        .then_with(|| a.id.cmp(&b.id))
}

/// An application message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }
}

/// An application message accepted from a known member.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub command: u8,
    pub payload: Vec<u8>,
    pub from: Node,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i16, addr: &str) -> Node {
        Node::new(id, Uuid::new_v4(), addr.parse().unwrap(), Instant::now())
    }

    #[test]
    fn test_address_ordering() {
        let mut nodes = vec![
            node(3, "10.0.0.2:4446"),
            node(1, "10.0.0.10:4446"),
            node(2, "10.0.0.2:4000"),
            node(4, "10.0.0.2:4000"),
        ];
        nodes.sort_by(compare_by_address);
        let ids: Vec<i16> = nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_record_inbound() {
        let mut n = node(1, "127.0.0.1:1");
        n.record_inbound(10);
        n.record_inbound(5);
        assert_eq!(n.packets_in, 2);
        assert_eq!(n.bytes_in, 15);
    }

    #[test]
    fn test_message_new() {
        let msg = Message::new(9, "clear");
        assert_eq!(msg.command, 9);
        assert_eq!(msg.payload, b"clear".to_vec());
    }
}
