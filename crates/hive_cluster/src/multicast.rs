//! UDP multicast transport.
//!
//! Two sockets are kept: an outbound socket bound to an ephemeral port that
//! sends to the group, and an inbound socket bound to the group port with
//! `SO_REUSEADDR` so several members can share a host. Both are built with
//! `socket2` (TTL, interface, reuse and timeouts are not reachable through
//! `std::net` before bind) and created on first use.
//!
//! A socket released by [`Transport::close`] or
//! [`Transport::reconfigure`] while another thread is blocked on it is not
//! an error: the blocked call reports "nothing received" and the next call
//! opens a fresh socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::config::ChannelConfig;
use crate::transport::{Transport, is_timeout, not_connected};

/// Socket-level subset of [`ChannelConfig`].
#[derive(Debug, Clone, PartialEq)]
struct SocketSettings {
    group: Option<SocketAddr>,
    interface: Option<IpAddr>,
    interface_index: u32,
    ttl: u32,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl From<&ChannelConfig> for SocketSettings {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            group: config.group,
            interface: config.interface,
            interface_index: config.interface_index,
            ttl: config.ttl,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

/// A joined inbound socket and what it joined, so it can leave again.
struct Membership {
    socket: Arc<UdpSocket>,
    group: IpAddr,
    interface: Option<IpAddr>,
    interface_index: u32,
}

impl Membership {
    fn leave(&self) {
        let result = match self.group {
            IpAddr::V4(group) => self
                .socket
                .leave_multicast_v4(&group, &interface_v4(self.interface)),
            IpAddr::V6(group) => self.socket.leave_multicast_v6(&group, self.interface_index),
        };
        if let Err(e) = result {
            debug!("Leaving multicast group {} failed: {e}", self.group);
        }
    }
}

struct Sockets {
    settings: SocketSettings,
    outbound: Option<Arc<UdpSocket>>,
    inbound: Option<Membership>,
    /// Set by `close`; no socket is opened afterwards.
    closed: bool,
}

impl Sockets {
    fn live_group(&self) -> Option<SocketAddr> {
        if self.closed {
            None
        } else {
            self.settings.group
        }
    }

    fn release(&mut self) {
        if let Some(membership) = self.inbound.take() {
            membership.leave();
        }
        self.outbound = None;
    }
}

/// Production [`Transport`] over UDP multicast.
pub struct MulticastTransport {
    sockets: RwLock<Sockets>,
}

impl MulticastTransport {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            sockets: RwLock::new(Sockets {
                settings: SocketSettings::from(config),
                outbound: None,
                inbound: None,
                closed: false,
            }),
        }
    }

    fn outbound(&self) -> io::Result<(Arc<UdpSocket>, SocketAddr)> {
        {
            let sockets = self.sockets.read();
            let group = sockets.live_group().ok_or_else(not_connected)?;
            if let Some(socket) = &sockets.outbound {
                return Ok((Arc::clone(socket), group));
            }
        }
        let mut sockets = self.sockets.write();
        let group = sockets.live_group().ok_or_else(not_connected)?;
        if let Some(socket) = &sockets.outbound {
            return Ok((Arc::clone(socket), group));
        }
        let socket = Arc::new(open_outbound(&sockets.settings, group)?);
        debug!(
            "Opened outbound multicast socket {:?} -> {group}",
            socket.local_addr().ok()
        );
        sockets.outbound = Some(Arc::clone(&socket));
        Ok((socket, group))
    }

    /// The joined inbound socket, or `None` while disconnected.
    fn inbound(&self) -> io::Result<Option<Arc<UdpSocket>>> {
        {
            let sockets = self.sockets.read();
            if sockets.live_group().is_none() {
                return Ok(None);
            }
            if let Some(membership) = &sockets.inbound {
                return Ok(Some(Arc::clone(&membership.socket)));
            }
        }
        let mut sockets = self.sockets.write();
        let Some(group) = sockets.live_group() else {
            return Ok(None);
        };
        if let Some(membership) = &sockets.inbound {
            return Ok(Some(Arc::clone(&membership.socket)));
        }
        let membership = open_inbound(&sockets.settings, group)?;
        info!("Joined multicast group {group}");
        let socket = Arc::clone(&membership.socket);
        sockets.inbound = Some(membership);
        Ok(Some(socket))
    }

    fn read_timeout(&self) -> Duration {
        self.sockets.read().settings.read_timeout
    }

    /// Whether `socket` is still the live inbound socket.
    fn is_current_inbound(&self, socket: &Arc<UdpSocket>) -> bool {
        self.sockets
            .read()
            .inbound
            .as_ref()
            .is_some_and(|m| Arc::ptr_eq(&m.socket, socket))
    }
}

impl Transport for MulticastTransport {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        let (socket, group) = self.outbound()?;
        let sent = socket.send_to(packet, group)?;
        if sent != packet.len() {
            warn!("Short multicast send: {sent} of {} bytes", packet.len());
        }
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some(socket) = self.inbound()? else {
            // Disconnected: idle for one read timeout so callers don't spin.
            std::thread::sleep(self.read_timeout());
            return Ok(None);
        };
        match socket.recv_from(buf) {
            Ok((len, src)) => Ok(Some((len, src))),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) if !self.is_current_inbound(&socket) => {
                trace!("Receive on released socket: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.sockets
            .read()
            .outbound
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn reconfigure(&self, config: &ChannelConfig) {
        let settings = SocketSettings::from(config);
        let mut sockets = self.sockets.write();
        if sockets.settings == settings {
            return;
        }
        sockets.release();
        sockets.settings = settings;
        debug!("Multicast transport reconfigured, sockets will reopen on next use");
    }

    fn close(&self) {
        let mut sockets = self.sockets.write();
        sockets.closed = true;
        sockets.release();
    }
}

fn interface_v4(interface: Option<IpAddr>) -> Ipv4Addr {
    match interface {
        Some(IpAddr::V4(addr)) => addr,
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

fn open_outbound(settings: &SocketSettings, group: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;
    let bind_addr = match group.ip() {
        IpAddr::V4(_) => {
            socket.set_multicast_ttl_v4(settings.ttl)?;
            socket.set_multicast_loop_v4(true)?;
            if let Some(IpAddr::V4(interface)) = settings.interface {
                socket.set_multicast_if_v4(&interface)?;
            }
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        }
        IpAddr::V6(_) => {
            socket.set_multicast_hops_v6(settings.ttl)?;
            socket.set_multicast_loop_v6(true)?;
            if settings.interface_index != 0 {
                socket.set_multicast_if_v6(settings.interface_index)?;
            }
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        }
    };
    socket.set_write_timeout(Some(settings.write_timeout))?;
    socket.bind(&SockAddr::from(bind_addr))?;
    Ok(socket.into())
}

fn open_inbound(settings: &SocketSettings, group: SocketAddr) -> io::Result<Membership> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(settings.read_timeout))?;
    let bind_addr = match group.ip() {
        IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), group.port()),
        IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), group.port()),
    };
    socket.bind(&SockAddr::from(bind_addr))?;
    match group.ip() {
        IpAddr::V4(addr) => socket.join_multicast_v4(&addr, &interface_v4(settings.interface))?,
        IpAddr::V6(addr) => socket.join_multicast_v6(&addr, settings.interface_index)?,
    }
    Ok(Membership {
        socket: Arc::new(socket.into()),
        group: group.ip(),
        interface: settings.interface,
        interface_index: settings.interface_index,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_disconnected_send_fails_not_connected() {
        let config = ChannelConfig {
            group: None,
            ..ChannelConfig::default()
        };
        let transport = MulticastTransport::new(&config);
        let err = transport.send(b"abc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(transport.local_addr().is_none());
    }

    #[test]
    fn test_disconnected_receive_idles() {
        let config = ChannelConfig {
            group: None,
            read_timeout: Duration::from_millis(20),
            ..ChannelConfig::default()
        };
        let transport = MulticastTransport::new(&config);
        let mut buf = [0u8; 64];
        assert!(transport.receive(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = ChannelConfig::default();
        config.ttl = 5;
        config.interface_index = 2;
        let settings = SocketSettings::from(&config);
        assert_eq!(settings.ttl, 5);
        assert_eq!(settings.interface_index, 2);
        assert_eq!(settings.group, config.group);
    }

    #[test]
    fn test_close_is_idempotent() {
        let transport = MulticastTransport::new(&ChannelConfig::default());
        transport.close();
        transport.close();
        assert!(transport.local_addr().is_none());
        let err = transport.send(b"late").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    #[ignore = "requires a multicast-capable network interface"]
    fn test_loopback_roundtrip() {
        let config = ChannelConfig {
            group: Some("239.255.42.98:47001".parse().unwrap()),
            read_timeout: Duration::from_millis(200),
            ..ChannelConfig::default()
        };
        let transport = MulticastTransport::new(&config);
        let mut buf = [0u8; 64];
        // Join first so the datagram is not sent before membership exists.
        let _ = transport.receive(&mut buf).unwrap();

        transport.send(b"ping").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if let Some((len, _)) = transport.receive(&mut buf).unwrap() {
                assert_eq!(&buf[..len], b"ping");
                return;
            }
        }
        panic!("datagram not looped back");
    }
}
