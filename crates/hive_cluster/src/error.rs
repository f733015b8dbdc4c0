//! Cluster channel error types.

/// Errors that can occur in the hive_cluster crate.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A socket-level error (bind, join, send, receive).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization of the config failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An outbound payload does not fit in a single datagram.
    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// An inbound datagram is shorter than the fixed header.
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    /// An inbound datagram is longer than the packet cap.
    #[error("Packet too long: {0} bytes")]
    PacketTooLong(usize),

    /// A heartbeat carried a payload that is not a 16-byte UUID.
    #[error("Invalid heartbeat payload length: {0}")]
    InvalidHeartbeat(usize),

    /// No valid node id could be drawn from the random source.
    #[error("Failed to allocate a node id after {0} attempts")]
    IdentityExhausted(u32),

    /// No multicast group is configured.
    #[error("Channel has no multicast group configured")]
    NotConnected,

    /// The channel has been closed.
    #[error("Channel closed")]
    Closed,

    /// The requested transition is not valid from the current state.
    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    /// The configuration is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
