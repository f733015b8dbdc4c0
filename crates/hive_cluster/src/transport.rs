//! Datagram transport abstraction.
//!
//! The channel's worker threads only talk to the network through
//! [`Transport`]. [`MulticastTransport`](crate::multicast::MulticastTransport)
//! is the production implementation; [`MemoryTransport`](crate::memory::MemoryTransport)
//! delivers datagrams in-process for tests and simulations.

use std::io;
use std::net::SocketAddr;

use crate::config::ChannelConfig;

/// A group-addressed datagram socket pair.
///
/// Implementations create their sockets lazily and must tolerate
/// [`close`](Transport::close) or [`reconfigure`](Transport::reconfigure)
/// racing with in-flight `send`/`receive` calls from other threads.
pub trait Transport: Send + Sync {
    /// Send one datagram to the group.
    ///
    /// Fails with [`io::ErrorKind::NotConnected`] when no group is configured.
    fn send(&self, packet: &[u8]) -> io::Result<()>;

    /// Receive one datagram into `buf`.
    ///
    /// Blocks for at most the configured read timeout and returns `Ok(None)`
    /// when nothing arrived, when no group is configured, or when the socket
    /// was released while the call was in flight.
    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Address outbound datagrams originate from, once a socket exists.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Apply new socket settings. Open sockets are released and recreated
    /// on next use.
    fn reconfigure(&self, config: &ChannelConfig);

    /// Release both sockets.
    fn close(&self);
}

/// Whether an I/O error only means "nothing arrived yet".
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "no multicast group configured",
    )
}
