//! In-process transport for tests and simulations.
//!
//! A [`MemoryHub`] plays the role of the network: every datagram sent by an
//! attached [`MemoryTransport`] is delivered to all transports attached to
//! the same group, including the sender (like multicast loopback).
//! [`MemoryTransport::partition`] cuts an endpoint off without closing it.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use crate::config::ChannelConfig;
use crate::transport::{Transport, not_connected};

type Datagram = (Vec<u8>, SocketAddr);

struct Endpoint {
    group: SocketAddr,
    inbox: Sender<Datagram>,
}

/// Simulated multicast network.
pub struct MemoryHub {
    endpoints: Mutex<HashMap<SocketAddr, Endpoint>>,
    next_port: AtomicU16,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40_000),
        })
    }

    /// Create a transport with a unique loopback address on this hub.
    pub fn transport(self: &Arc<Self>, config: &ChannelConfig) -> MemoryTransport {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (inbox_tx, inbox_rx) = unbounded();
        MemoryTransport {
            hub: Arc::clone(self),
            address: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
            inbox_tx,
            inbox_rx,
            state: Mutex::new(EndpointState {
                group: config.group,
                read_timeout: config.read_timeout,
                attached: false,
                partitioned: false,
                closed: false,
            }),
        }
    }

    /// Number of attached endpoints.
    pub fn attached(&self) -> usize {
        self.endpoints.lock().len()
    }

    fn deliver(&self, from: SocketAddr, group: SocketAddr, packet: &[u8]) {
        let endpoints = self.endpoints.lock();
        for endpoint in endpoints.values().filter(|e| e.group == group) {
            let _ = endpoint.inbox.send((packet.to_vec(), from));
        }
    }
}

struct EndpointState {
    group: Option<SocketAddr>,
    read_timeout: Duration,
    attached: bool,
    partitioned: bool,
    closed: bool,
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    address: SocketAddr,
    inbox_tx: Sender<Datagram>,
    inbox_rx: Receiver<Datagram>,
    state: Mutex<EndpointState>,
}

impl MemoryTransport {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Detach from the hub and stay detached until [`heal`](Self::heal).
    pub fn partition(&self) {
        let mut state = self.state.lock();
        state.partitioned = true;
        self.detach(&mut state);
    }

    /// Allow the endpoint to reattach on next use.
    pub fn heal(&self) {
        self.state.lock().partitioned = false;
    }

    /// Attach if a group is set and the endpoint is not partitioned.
    /// Returns the group while attached.
    fn attach(&self) -> Option<SocketAddr> {
        let mut state = self.state.lock();
        let group = state.group?;
        if state.partitioned || state.closed {
            return None;
        }
        if !state.attached {
            self.hub.endpoints.lock().insert(
                self.address,
                Endpoint {
                    group,
                    inbox: self.inbox_tx.clone(),
                },
            );
            state.attached = true;
        }
        Some(group)
    }

    fn detach(&self, state: &mut EndpointState) {
        if state.attached {
            self.hub.endpoints.lock().remove(&self.address);
            state.attached = false;
        }
        // Datagrams queued before the cut are lost with the "socket".
        while self.inbox_rx.try_recv().is_ok() {}
    }
}

impl Transport for MemoryTransport {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        let (group, partitioned) = {
            let state = self.state.lock();
            let group = if state.closed { None } else { state.group };
            (group, state.partitioned)
        };
        let group = group.ok_or_else(not_connected)?;
        if partitioned {
            // The network swallows it.
            return Ok(());
        }
        self.attach();
        self.hub.deliver(self.address, group, packet);
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let timeout = self.state.lock().read_timeout;
        if self.attach().is_none() {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        match self.inbox_rx.recv_timeout(timeout) {
            Ok((data, from)) => {
                // Truncate like a real datagram socket.
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some((len, from)))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.address)
    }

    fn reconfigure(&self, config: &ChannelConfig) {
        let mut state = self.state.lock();
        state.read_timeout = config.read_timeout;
        if state.group != config.group {
            self.detach(&mut state);
            state.group = config.group;
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.detach(&mut state);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChannelConfig {
        ChannelConfig {
            read_timeout: Duration::from_millis(20),
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn test_delivery_includes_sender() {
        let hub = MemoryHub::new();
        let a = hub.transport(&config());
        let b = hub.transport(&config());
        let mut buf = [0u8; 16];
        // Attach both before sending.
        a.receive(&mut buf).unwrap();
        b.receive(&mut buf).unwrap();

        a.send(b"hello").unwrap();
        let (len, from) = b.receive(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.address());
        assert!(a.receive(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_groups_are_isolated() {
        let hub = MemoryHub::new();
        let a = hub.transport(&config());
        let other = ChannelConfig {
            group: Some("239.1.1.1:9999".parse().unwrap()),
            ..config()
        };
        let b = hub.transport(&other);
        let mut buf = [0u8; 16];
        b.receive(&mut buf).unwrap();

        a.send(b"x").unwrap();
        assert!(b.receive(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partition_and_heal() {
        let hub = MemoryHub::new();
        let a = hub.transport(&config());
        let b = hub.transport(&config());
        let mut buf = [0u8; 16];
        b.receive(&mut buf).unwrap();

        a.partition();
        a.send(b"lost").unwrap();
        assert!(b.receive(&mut buf).unwrap().is_none());

        a.heal();
        a.send(b"found").unwrap();
        let (len, _) = b.receive(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"found");
    }

    #[test]
    fn test_no_group_is_not_connected() {
        let hub = MemoryHub::new();
        let cfg = ChannelConfig {
            group: None,
            ..config()
        };
        let a = hub.transport(&cfg);
        assert_eq!(a.send(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
        let mut buf = [0u8; 4];
        assert!(a.receive(&mut buf).unwrap().is_none());
        assert_eq!(hub.attached(), 0);
    }

    #[test]
    fn test_close_detaches() {
        let hub = MemoryHub::new();
        let a = hub.transport(&config());
        let mut buf = [0u8; 4];
        a.receive(&mut buf).unwrap();
        assert_eq!(hub.attached(), 1);
        a.close();
        assert_eq!(hub.attached(), 0);
        // Closed endpoints never reattach.
        assert!(a.receive(&mut buf).unwrap().is_none());
        assert_eq!(hub.attached(), 0);
    }
}
