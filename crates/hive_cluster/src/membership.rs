//! Membership table: the local view of live cluster members.
//!
//! Members are keyed by their ephemeral id. Heartbeats bind an id to a UUID
//! and address; application traffic is only accepted from an id whose
//! stored address matches the datagram source. Entries that stop
//! heartbeating are dropped by [`MembershipStore::expire`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::node::{Node, compare_by_address};
use crate::wire::HEARTBEAT_PACKET_SIZE;

/// What a heartbeat did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The id was already bound to this UUID; its timestamp was bumped.
    Refreshed,
    /// The id is new, or was taken over by a different UUID (`previous`).
    Joined { node: Node, previous: Option<Node> },
}

/// Storage for cluster members, shared by the reader and pinger threads.
pub trait MembershipStore: Send + Sync {
    /// Record a heartbeat from `id`/`uuid` received from `address`.
    fn observe_heartbeat(
        &self,
        id: i16,
        uuid: Uuid,
        address: SocketAddr,
        now: Instant,
    ) -> HeartbeatOutcome;

    /// Resolve the sender of an application datagram, counting `bytes`
    /// against it. `None` if the id is unknown or the address does not match.
    fn resolve(&self, id: i16, address: SocketAddr, bytes: usize) -> Option<Node>;

    /// Remove and return every member silent for at least `max_age`.
    fn expire(&self, now: Instant, max_age: Duration) -> Vec<Node>;

    /// Members ordered by address.
    fn snapshot(&self) -> Vec<Node>;

    fn get(&self, id: i16) -> Option<Node>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory membership table guarded by its own lock.
#[derive(Debug, Default)]
pub struct MembershipTable {
    nodes: Mutex<HashMap<i16, Node>>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MembershipStore for MembershipTable {
    fn observe_heartbeat(
        &self,
        id: i16,
        uuid: Uuid,
        address: SocketAddr,
        now: Instant,
    ) -> HeartbeatOutcome {
        let mut nodes = self.nodes.lock();
        if let Some(existing) = nodes.get_mut(&id) {
            if existing.uuid == uuid {
                existing.last_seen = now;
                if existing.address != address {
                    tracing::debug!(
                        "Node {id} moved from {} to {address}",
                        existing.address
                    );
                    existing.address = address;
                }
                existing.record_inbound(HEARTBEAT_PACKET_SIZE);
                return HeartbeatOutcome::Refreshed;
            }
        }

        let mut node = Node::new(id, uuid, address, now);
        node.record_inbound(HEARTBEAT_PACKET_SIZE);
        let previous = nodes.insert(id, node.clone());
        if let Some(prev) = &previous {
            tracing::info!(
                "Node id {id} reclaimed by {uuid} at {address} (was {} at {})",
                prev.uuid,
                prev.address
            );
        } else {
            tracing::info!("Node {id} ({uuid}) joined from {address}");
        }
        HeartbeatOutcome::Joined { node, previous }
    }

    fn resolve(&self, id: i16, address: SocketAddr, bytes: usize) -> Option<Node> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&id)?;
        if node.address != address {
            tracing::trace!(
                "Dropping packet claiming node {id} from {address} (bound to {})",
                node.address
            );
            return None;
        }
        node.record_inbound(bytes);
        Some(node.clone())
    }

    fn expire(&self, now: Instant, max_age: Duration) -> Vec<Node> {
        let mut nodes = self.nodes.lock();
        let stale: Vec<i16> = nodes
            .values()
            .filter(|n| now.saturating_duration_since(n.last_seen) >= max_age)
            .map(|n| n.id)
            .collect();
        let mut removed: Vec<Node> = stale.iter().filter_map(|id| nodes.remove(id)).collect();
        removed.sort_by(compare_by_address);
        for node in &removed {
            tracing::info!("Node {} ({}) timed out", node.id, node.uuid);
        }
        removed
    }

    fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.lock().values().cloned().collect();
        nodes.sort_by(compare_by_address);
        nodes
    }

    fn get(&self, id: i16) -> Option<Node> {
        self.nodes.lock().get(&id).cloned()
    }

    fn len(&self) -> usize {
        self.nodes.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
