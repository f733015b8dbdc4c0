//! Channel configuration for a cluster member.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// Default multicast group shared by all cluster members.
pub const DEFAULT_GROUP: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 42, 99)), 4446);

/// Default outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default heartbeat-interval-to-timeout ratio.
pub const DEFAULT_TIMEOUT_RATIO: f64 = 2.5;

/// Largest multicast TTL / hop limit a socket accepts.
pub const MAX_TTL: u32 = 255;

/// Configuration consumed by the multicast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Multicast group address and port. `None` leaves the channel disconnected.
    #[serde(with = "opt_socket_addr_serde")]
    pub group: Option<SocketAddr>,

    /// Local IPv4 interface address used to join the group and send to it.
    pub interface: Option<IpAddr>,

    /// IPv6 interface index used for group membership (0 lets the OS choose).
    pub interface_index: u32,

    /// Multicast time-to-live / hop limit.
    pub ttl: u32,

    /// Receive timeout; bounds how long the reader blocks between checks.
    #[serde(with = "duration_ms_serde")]
    pub read_timeout: Duration,

    /// Send timeout on the outbound socket.
    #[serde(with = "duration_ms_serde")]
    pub write_timeout: Duration,

    /// Interval between forced heartbeats.
    #[serde(with = "duration_ms_serde")]
    pub heartbeat_interval: Duration,

    /// A peer is evicted after `heartbeat_interval * timeout_ratio` of silence.
    pub timeout_ratio: f64,

    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            group: Some(DEFAULT_GROUP),
            interface: None,
            interface_index: 0,
            ttl: 1,
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            timeout_ratio: DEFAULT_TIMEOUT_RATIO,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ChannelConfig {
    /// How long a peer may stay silent before the cleanup pass evicts it.
    pub fn node_timeout(&self) -> Duration {
        self.heartbeat_interval.mul_f64(self.timeout_ratio)
    }

    /// Check the values the I/O engine relies on.
    pub fn validate(&self) -> Result<()> {
        if let Some(group) = self.group {
            if !group.ip().is_multicast() {
                return Err(ClusterError::Config(format!(
                    "{} is not a multicast address",
                    group.ip()
                )));
            }
        }
        if !(1..=MAX_TTL).contains(&self.ttl) {
            return Err(ClusterError::Config(format!(
                "ttl must be between 1 and {MAX_TTL}, got {}",
                self.ttl
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ClusterError::Config("queue_capacity must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ClusterError::Config(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(ClusterError::Config("socket timeouts must be positive".into()));
        }
        if !self.timeout_ratio.is_finite() || self.timeout_ratio < 1.0 {
            return Err(ClusterError::Config(format!(
                "timeout_ratio must be >= 1.0, got {}",
                self.timeout_ratio
            )));
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing
    /// or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<ChannelConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &Option<SocketAddr>, s: S) -> Result<S::Ok, S::Error> {
        match addr {
            Some(addr) => s.serialize_some(&addr.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SocketAddr>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Rounds up so a sub-millisecond timeout never saves as zero.
    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let ms = dur.as_nanos().div_ceil(1_000_000);
        s.serialize_u64(u64::try_from(ms).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.group.unwrap().port(), 4446);
        assert_eq!(config.ttl, 1);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert!((config.timeout_ratio - 2.5).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_timeout() {
        let config = ChannelConfig {
            heartbeat_interval: Duration::from_millis(200),
            timeout_ratio: 2.5,
            ..ChannelConfig::default()
        };
        assert_eq!(config.node_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_unicast_group() {
        let config = ChannelConfig {
            group: Some("192.168.1.10:4446".parse().unwrap()),
            ..ChannelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ClusterError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_ratio_and_capacity() {
        let config = ChannelConfig {
            timeout_ratio: 0.5,
            ..ChannelConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ChannelConfig {
            queue_capacity: 0,
            ..ChannelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ttl_range() {
        for ttl in [0, MAX_TTL + 1, 300] {
            let config = ChannelConfig {
                ttl,
                ..ChannelConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ClusterError::Config(_))),
                "ttl {ttl} accepted"
            );
        }
        let config = ChannelConfig {
            ttl: MAX_TTL,
            ..ChannelConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sub_millisecond_timeout_survives_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");

        let original = ChannelConfig {
            read_timeout: Duration::from_micros(500),
            write_timeout: Duration::from_micros(1500),
            ..ChannelConfig::default()
        };
        original.save_to_file(&path).unwrap();

        let loaded = ChannelConfig::load_or_default(&path);
        assert_eq!(loaded.read_timeout, Duration::from_millis(1));
        assert_eq!(loaded.write_timeout, Duration::from_millis(2));
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_disconnected() {
        let config = ChannelConfig {
            group: None,
            ..ChannelConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = ChannelConfig::default();
        config.group = Some("[ff15::42]:5000".parse().unwrap());
        config.interface_index = 3;
        config.read_timeout = Duration::from_millis(250);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"ttl": 4, "group": null}"#).unwrap();
        assert_eq!(config.ttl, 4);
        assert!(config.group.is_none());
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cluster.json");

        let mut original = ChannelConfig::default();
        original.queue_capacity = 64;
        original.ttl = 8;
        original.save_to_file(&path).unwrap();

        let loaded = ChannelConfig::load_or_default(&path);
        assert_eq!(loaded.queue_capacity, 64);
        assert_eq!(loaded.ttl, 8);
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, "{not json").unwrap();

        let config = ChannelConfig::load_or_default(&path);
        assert_eq!(config, ChannelConfig::default());
    }
}
