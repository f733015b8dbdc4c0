//! The public face of the cluster channel.
//!
//! [`MulticastChannel`] owns the membership table, the outbound queue, the
//! local identity and the transport, and runs three worker threads (see
//! [`worker`](crate::worker)). It is a cheap handle: clones share the same
//! channel, and handlers receive a reference to it.
//!
//! ```text
//! Uninitialized ─start─▶ Initializing ─▶ Connected ⇄ Disconnected
//!        │                                   │            │
//!        └───────────────── close ───────────┴────────────┴─▶ Closing ─▶ Closed
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::dispatch::{HandlerRegistry, MessageHandler, PresenceHandler};
use crate::error::{ClusterError, Result};
use crate::identity::LocalIdentity;
use crate::membership::{HeartbeatOutcome, MembershipStore, MembershipTable};
use crate::multicast::MulticastTransport;
use crate::node::{Message, Node, ReceivedMessage};
use crate::queue::OutboundQueue;
use crate::schedule::HeartbeatSchedule;
use crate::transport::{Transport, is_timeout};
use crate::wire;
use crate::worker;

/// Extra time granted to workers to exit after their blocking calls time out.
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Initializing,
    /// Workers running and a multicast group configured.
    Connected,
    /// Workers running but no group configured; sockets are released.
    Disconnected,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct TrafficCounters {
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
}

pub(crate) struct Shared {
    config: RwLock<ChannelConfig>,
    /// Serializes reconfiguration and socket teardown.
    reconfig: Mutex<()>,
    state: RwLock<ChannelState>,
    identity: LocalIdentity,
    schedule: Mutex<HeartbeatSchedule>,
    membership: Arc<dyn MembershipStore>,
    queue: OutboundQueue,
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    traffic: TrafficCounters,
    created_at: DateTime<Utc>,
}

/// Configures and creates a [`MulticastChannel`].
pub struct ChannelBuilder {
    config: ChannelConfig,
    transport: Option<Arc<dyn Transport>>,
    membership: Option<Arc<dyn MembershipStore>>,
    identity: Option<LocalIdentity>,
}

impl ChannelBuilder {
    /// Use a custom transport instead of UDP multicast.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom membership store.
    pub fn membership(mut self, membership: Arc<dyn MembershipStore>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Use a fixed UUID and random source for the local identity.
    pub fn identity(mut self, uuid: Uuid, rng: Box<dyn RngCore + Send>) -> Self {
        self.identity = Some(LocalIdentity::with_rng(uuid, rng));
        self
    }

    pub fn build(self) -> Result<MulticastChannel> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => {
                transport.reconfigure(&self.config);
                transport
            }
            None => Arc::new(MulticastTransport::new(&self.config)),
        };
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let shared = Shared {
            schedule: Mutex::new(HeartbeatSchedule::new(self.config.heartbeat_interval)),
            queue: OutboundQueue::new(self.config.queue_capacity),
            config: RwLock::new(self.config),
            reconfig: Mutex::new(()),
            state: RwLock::new(ChannelState::Uninitialized),
            identity: self.identity.unwrap_or_else(LocalIdentity::generate),
            membership: self
                .membership
                .unwrap_or_else(|| Arc::new(MembershipTable::new())),
            transport,
            handlers: HandlerRegistry::new(),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            workers: Mutex::new(Vec::new()),
            traffic: TrafficCounters::default(),
            created_at: Utc::now(),
        };
        Ok(MulticastChannel {
            shared: Arc::new(shared),
        })
    }
}

/// A peer-to-peer channel over UDP multicast.
///
/// Create with [`MulticastChannel::new`] or [`MulticastChannel::builder`],
/// register handlers, then call [`start`](MulticastChannel::start). Call
/// [`close`](MulticastChannel::close) to stop the workers and release the
/// sockets; dropping the last handle does not stop a started channel.
#[derive(Clone)]
pub struct MulticastChannel {
    shared: Arc<Shared>,
}

impl MulticastChannel {
    /// Create a channel on the UDP multicast transport.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ChannelConfig) -> ChannelBuilder {
        ChannelBuilder {
            config,
            transport: None,
            membership: None,
            identity: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ChannelState {
        *self.shared.state.read()
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> ChannelConfig {
        self.shared.config.read().clone()
    }

    /// This process's UUID.
    pub fn uuid(&self) -> Uuid {
        self.shared.identity.uuid()
    }

    /// This process's current node id, `0` while unassigned.
    pub fn local_id(&self) -> i16 {
        self.shared.identity.current_id()
    }

    /// Snapshot of known members ordered by address.
    pub fn nodes(&self) -> Vec<Node> {
        self.shared.membership.snapshot()
    }

    pub fn node(&self, id: i16) -> Option<Node> {
        self.shared.membership.get(id)
    }

    /// This process as a [`Node`], with channel-wide traffic counters.
    pub fn local_node(&self) -> Node {
        let traffic = &self.shared.traffic;
        let address = self
            .shared
            .transport
            .local_addr()
            .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
        Node {
            id: self.local_id(),
            uuid: self.uuid(),
            address,
            last_seen: Instant::now(),
            joined_at: self.shared.created_at,
            packets_in: traffic.packets_in.load(Ordering::Relaxed),
            bytes_in: traffic.bytes_in.load(Ordering::Relaxed),
            packets_out: traffic.packets_out.load(Ordering::Relaxed),
            bytes_out: traffic.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Messages waiting for the writer.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.shared.handlers.add_message_handler(handler);
    }

    pub fn add_presence_handler(&self, handler: Arc<dyn PresenceHandler>) {
        self.shared.handlers.add_presence_handler(handler);
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue a message for multicast, blocking while the queue is full.
    ///
    /// Delivery is best-effort: a message too large for one datagram, or one
    /// whose transmission fails, is logged and dropped by the writer.
    pub fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(ClusterError::Closed);
        }
        self.shared.queue.send(message, &self.shared.shutdown_rx)
    }

    /// Queue a message, giving up after `timeout`. Returns whether it was
    /// queued; a dropped message is not reported any other way.
    pub fn send_timeout(&self, message: Message, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        self.shared.queue.send_timeout(message, timeout)
    }

    fn is_closed(&self) -> bool {
        matches!(self.state(), ChannelState::Closing | ChannelState::Closed)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the reader, writer and pinger threads. Starting a running
    /// channel is a no-op.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            match *state {
                ChannelState::Uninitialized => *state = ChannelState::Initializing,
                ChannelState::Closing | ChannelState::Closed => return Err(ClusterError::Closed),
                _ => return Ok(()),
            }
        }

        self.shared.running.store(true, Ordering::SeqCst);
        match worker::spawn_all(self) {
            Ok(handles) => self.shared.workers.lock().extend(handles),
            Err(e) => {
                error!("Failed to start channel workers: {e}");
                self.close();
                return Err(ClusterError::Io(e));
            }
        }

        let next = self.connection_state();
        {
            let mut state = self.shared.state.write();
            // close() may have raced us from a handler.
            if *state == ChannelState::Initializing {
                *state = next;
            }
        }
        info!(
            "Cluster channel {} started ({next}, group {:?})",
            self.uuid(),
            self.shared.config.read().group
        );
        Ok(())
    }

    /// Stop the workers and release both sockets. Safe to call from any
    /// state, from any thread (including a handler), and more than once.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.write();
            match *state {
                ChannelState::Closing | ChannelState::Closed => return,
                _ => *state = ChannelState::Closing,
            }
        }
        info!("Closing cluster channel {}", self.uuid());

        self.shared.running.store(false, Ordering::SeqCst);
        // Dropping the sender wakes every select/recv on the shutdown receiver.
        self.shared.shutdown_tx.lock().take();
        {
            let _guard = self.shared.reconfig.lock();
            self.shared.transport.close();
        }

        let handles: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        let deadline = {
            let config = self.shared.config.read();
            Instant::now() + config.read_timeout + config.write_timeout + JOIN_GRACE
        };
        let current = std::thread::current().id();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.thread().id() == current {
                // close() called from one of our own handlers.
                continue;
            }
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("{name} thread panicked");
                }
            } else {
                warn!("{name} thread did not stop in time, detaching");
            }
        }

        *self.shared.state.write() = ChannelState::Closed;
        info!("Cluster channel {} closed", self.uuid());
    }

    // -----------------------------------------------------------------------
    // Reconfiguration
    // -----------------------------------------------------------------------

    /// Change the multicast group. `None` disconnects the channel: sockets
    /// are released and the workers idle until a group is set again.
    pub fn set_group(&self, group: Option<SocketAddr>) -> Result<()> {
        self.reconfigure(|config| config.group = group)?;
        // Announce ourselves on the new group with the first outbound packet.
        self.shared.schedule.lock().reset();
        let mut state = self.shared.state.write();
        if matches!(*state, ChannelState::Connected | ChannelState::Disconnected) {
            *state = if group.is_some() {
                ChannelState::Connected
            } else {
                ChannelState::Disconnected
            };
            info!("Cluster channel now {} (group {group:?})", *state);
        }
        Ok(())
    }

    /// Change the interface used to join and send to the group.
    pub fn set_interface(&self, interface: Option<IpAddr>) -> Result<()> {
        self.reconfigure(|config| config.interface = interface)
    }

    pub fn set_interface_index(&self, index: u32) -> Result<()> {
        self.reconfigure(|config| config.interface_index = index)
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        self.reconfigure(|config| config.ttl = ttl)
    }

    pub fn set_timeouts(&self, read_timeout: Duration, write_timeout: Duration) -> Result<()> {
        self.reconfigure(|config| {
            config.read_timeout = read_timeout;
            config.write_timeout = write_timeout;
        })
    }

    pub fn set_heartbeat_interval(&self, interval: Duration) -> Result<()> {
        self.reconfigure_then(
            |config| config.heartbeat_interval = interval,
            |config| {
                self.shared
                    .schedule
                    .lock()
                    .set_interval(config.heartbeat_interval)
            },
        )
    }

    pub fn set_timeout_ratio(&self, ratio: f64) -> Result<()> {
        self.reconfigure(|config| config.timeout_ratio = ratio)
    }

    /// Swap the outbound queue for one of `capacity` slots. Pending messages
    /// that do not fit are dropped.
    pub fn set_queue_capacity(&self, capacity: usize) -> Result<()> {
        self.reconfigure_then(
            |config| config.queue_capacity = capacity,
            |config| {
                self.shared.queue.set_capacity(config.queue_capacity);
            },
        )
    }

    fn reconfigure(&self, change: impl FnOnce(&mut ChannelConfig)) -> Result<()> {
        self.reconfigure_then(change, |_| {})
    }

    /// Validate and store a changed config, running `apply` under the same
    /// hold of the reconfiguration lock so dependent state cannot drift from
    /// the stored config.
    fn reconfigure_then(
        &self,
        change: impl FnOnce(&mut ChannelConfig),
        apply: impl FnOnce(&ChannelConfig),
    ) -> Result<()> {
        if self.is_closed() {
            return Err(ClusterError::Closed);
        }
        let _guard = self.shared.reconfig.lock();
        let mut updated = self.shared.config.read().clone();
        change(&mut updated);
        updated.validate()?;
        self.shared.transport.reconfigure(&updated);
        apply(&updated);
        *self.shared.config.write() = updated;
        Ok(())
    }

    fn connection_state(&self) -> ChannelState {
        if self.shared.config.read().group.is_some() {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        }
    }

    // -----------------------------------------------------------------------
    // Worker operations
    // -----------------------------------------------------------------------

    pub(crate) fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_signal(&self) -> &Receiver<()> {
        &self.shared.shutdown_rx
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.shared.config.read().heartbeat_interval
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.shared.config.read().read_timeout
    }

    pub(crate) fn next_message(&self, timeout: Duration) -> Option<Message> {
        self.shared.queue.recv(&self.shared.shutdown_rx, timeout)
    }

    /// Encode and transmit one queued message under the current id,
    /// advertising the id first if it is new or a heartbeat is due.
    pub(crate) fn transmit(&self, message: Message) {
        let Some(id) = self.ensure_identity(false) else {
            return;
        };
        match wire::encode(message.command, id, &message.payload) {
            Ok(packet) => self.send_packet(&packet, "message"),
            Err(e) => warn!("Dropping outbound command {}: {e}", message.command),
        }
    }

    /// Send a heartbeat now, allocating an id first if needed.
    pub(crate) fn heartbeat(&self) {
        self.ensure_identity(true);
    }

    /// Make sure we hold an id and advertise it when it is fresh, when a
    /// heartbeat is due, or when `force` is set. `None` if allocation failed,
    /// in which case the channel is shutting down.
    fn ensure_identity(&self, force: bool) -> Option<i16> {
        let lease = match self.shared.identity.ensure() {
            Ok(lease) => lease,
            Err(e) => {
                self.fail(e);
                return None;
            }
        };
        let now = Instant::now();
        let due = force || lease.fresh || self.shared.schedule.lock().is_due(now);
        if due {
            let packet = wire::encode_heartbeat(lease.id, &self.shared.identity.uuid());
            self.send_packet(&packet, "heartbeat");
            self.shared.schedule.lock().record(now);
        }
        Some(lease.id)
    }

    fn send_packet(&self, packet: &[u8], kind: &str) {
        match self.shared.transport.send(packet) {
            Ok(()) => {
                let traffic = &self.shared.traffic;
                traffic.packets_out.fetch_add(1, Ordering::Relaxed);
                traffic.bytes_out.fetch_add(packet.len() as u64, Ordering::Relaxed);
                trace!("Sent {kind} ({} bytes)", packet.len());
            }
            // Sockets released by close() or a reconfiguration are expected.
            Err(e) if !self.is_running() || self.state() != ChannelState::Connected => {
                debug!("Dropped {kind} while {}: {e}", self.state());
            }
            Err(e) if is_timeout(&e) => debug!("Send of {kind} timed out: {e}"),
            Err(e) => warn!("Failed to send {kind}: {e}"),
        }
    }

    /// Drop members that stopped heartbeating and notify presence handlers.
    pub(crate) fn expire_nodes(&self, now: Instant) -> usize {
        let max_age = self.shared.config.read().node_timeout();
        let removed = self.shared.membership.expire(now, max_age);
        for node in &removed {
            self.shared.handlers.dispatch_left(self, node);
        }
        removed.len()
    }

    /// Decode one datagram, update membership and dispatch.
    pub(crate) fn handle_datagram(&self, data: &[u8], source: SocketAddr, now: Instant) {
        let packet = match wire::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Dropping datagram from {source}: {e}");
                return;
            }
        };
        if packet.sender_id <= 0 {
            trace!("Dropping datagram from {source} with id {}", packet.sender_id);
            return;
        }

        if packet.is_heartbeat() {
            let Ok(uuid) = packet.heartbeat_uuid() else {
                return;
            };
            if uuid == self.shared.identity.uuid() {
                return;
            }
            self.record_inbound(data.len());
            if self.shared.identity.invalidate(packet.sender_id) {
                warn!(
                    "Node id {} claimed by {uuid} at {source}, reallocating",
                    packet.sender_id
                );
            }
            if let HeartbeatOutcome::Joined { node, previous } = self
                .shared
                .membership
                .observe_heartbeat(packet.sender_id, uuid, source, now)
            {
                self.shared
                    .handlers
                    .dispatch_enter(self, &node, previous.as_ref());
            }
            return;
        }

        let Some(from) = self
            .shared
            .membership
            .resolve(packet.sender_id, source, data.len())
        else {
            trace!(
                "Dropping command {} from unknown sender {} at {source}",
                packet.command, packet.sender_id
            );
            return;
        };
        self.record_inbound(data.len());
        let message = ReceivedMessage {
            command: packet.command,
            payload: packet.payload,
            from,
        };
        self.shared.handlers.dispatch_message(self, &message);
    }

    fn record_inbound(&self, bytes: usize) {
        let traffic = &self.shared.traffic;
        traffic.packets_in.fetch_add(1, Ordering::Relaxed);
        traffic.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Receive into `buf` through the transport.
    pub(crate) fn receive(&self, buf: &mut [u8]) -> std::io::Result<Option<(usize, SocketAddr)>> {
        self.shared.transport.receive(buf)
    }

    /// Identity allocation failed: nothing can be sent, so shut down.
    fn fail(&self, err: ClusterError) {
        error!("Cluster channel {} cannot continue: {err}", self.uuid());
        let channel = self.clone();
        // close() joins the workers, so it cannot run on the caller's thread
        // if that thread is the writer or pinger being joined.
        let spawned = std::thread::Builder::new()
            .name("hive-cluster-close".into())
            .spawn(move || channel.close());
        if let Err(e) = spawned {
            error!("Failed to spawn close thread: {e}");
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.shutdown_tx.lock().take();
        }
    }
}

impl fmt::Debug for MulticastChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastChannel")
            .field("uuid", &self.uuid())
            .field("id", &self.local_id())
            .field("state", &self.state())
            .field("nodes", &self.shared.membership.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
