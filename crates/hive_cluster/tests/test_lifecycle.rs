use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::RngCore;
use uuid::Uuid;

use hive_cluster::wire;
use hive_cluster::{
    ChannelConfig, ChannelState, ClusterError, MemoryHub, Message, MulticastChannel, Transport,
    command_handler,
};

fn config_with_capacity(queue_capacity: usize) -> ChannelConfig {
    ChannelConfig {
        read_timeout: Duration::from_millis(20),
        write_timeout: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(50),
        queue_capacity,
        ..ChannelConfig::default()
    }
}

fn channel_on(hub: &Arc<MemoryHub>, config: ChannelConfig) -> MulticastChannel {
    MulticastChannel::builder(config.clone())
        .transport(Arc::new(hub.transport(&config)))
        .build()
        .unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Only ever draws zero, so no node id can be allocated.
struct ZeroRng;

impl RngCore for ZeroRng {
    fn next_u32(&mut self) -> u32 {
        0
    }

    fn next_u64(&mut self) -> u64 {
        0
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(0);
    }
}

#[test]
fn identity_exhaustion_closes_channel() {
    let hub = MemoryHub::new();
    let config = config_with_capacity(16);
    let channel = MulticastChannel::builder(config.clone())
        .transport(Arc::new(hub.transport(&config)))
        .identity(Uuid::new_v4(), Box::new(ZeroRng))
        .build()
        .unwrap();
    channel.start().unwrap();
    // Wake the writer too, so both id-allocating workers hit the failure.
    assert!(channel.send_timeout(Message::new(1, "never sent"), Duration::from_millis(50)));

    // The writer and pinger cannot join themselves, so a clean Closed state
    // means the shutdown ran on a separate thread.
    assert!(wait_for(|| channel.state() == ChannelState::Closed));
    assert_eq!(channel.local_id(), 0);
    assert_eq!(channel.local_node().packets_out, 0);
    assert!(matches!(
        channel.send(Message::new(1, "late")),
        Err(ClusterError::Closed)
    ));
    assert!(matches!(channel.start(), Err(ClusterError::Closed)));
    assert_eq!(hub.attached(), 0);
}

#[test]
fn state_transitions_through_lifecycle() {
    let hub = MemoryHub::new();
    let channel = channel_on(&hub, config_with_capacity(16));
    assert_eq!(channel.state(), ChannelState::Uninitialized);

    channel.start().unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    channel.set_group(None).unwrap();
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(wait_for(|| hub.attached() == 0));

    channel
        .set_group(Some("239.255.42.99:4446".parse().unwrap()))
        .unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(hub.attached(), 0);
}

#[test]
fn start_without_group_is_disconnected() {
    let hub = MemoryHub::new();
    let config = ChannelConfig {
        group: None,
        ..config_with_capacity(16)
    };
    let channel = channel_on(&hub, config);
    channel.start().unwrap();
    assert_eq!(channel.state(), ChannelState::Disconnected);

    thread::sleep(Duration::from_millis(150));
    assert_eq!(channel.local_id(), 0, "no heartbeats without a group");
    channel.close();
}

#[test]
fn send_blocks_when_full_until_closed() {
    let hub = MemoryHub::new();
    // Not started, so nothing drains the queue.
    let channel = channel_on(&hub, config_with_capacity(2));
    channel.send(Message::new(1, "a")).unwrap();
    channel.send(Message::new(1, "b")).unwrap();

    let started = Instant::now();
    assert!(!channel.send_timeout(Message::new(1, "c"), Duration::from_millis(50)));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(40));
    assert!(waited < Duration::from_secs(1));
    assert_eq!(channel.pending(), 2);

    let blocked = {
        let channel = channel.clone();
        thread::spawn(move || channel.send(Message::new(1, "d")))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!blocked.is_finished());

    channel.close();
    let result = blocked.join().unwrap();
    assert!(matches!(result, Err(ClusterError::Closed)));
}

#[test]
fn started_channel_drains_backlog() {
    let hub = MemoryHub::new();
    let channel = channel_on(&hub, config_with_capacity(4));
    for i in 0..4u8 {
        channel.send(Message::new(1, vec![i])).unwrap();
    }
    channel.start().unwrap();
    assert!(wait_for(|| channel.pending() == 0));
    assert!(channel.local_node().packets_out >= 5);
    channel.close();
}

#[test]
fn close_from_inside_a_handler() {
    let hub = MemoryHub::new();
    let channel = channel_on(&hub, config_with_capacity(16));
    channel.add_message_handler(command_handler(9, |ch, _| ch.close()));
    channel.start().unwrap();
    assert!(wait_for(|| channel.local_id() > 0));

    let raw = hub.transport(&config_with_capacity(16));
    raw.send(&wire::encode_heartbeat(77, &Uuid::new_v4())).unwrap();
    raw.send(&wire::encode(9, 77, b"stop").unwrap()).unwrap();

    assert!(wait_for(|| channel.state() == ChannelState::Closed));
    assert!(matches!(channel.start(), Err(ClusterError::Closed)));
}

#[test]
fn queue_capacity_change_keeps_what_fits() {
    let hub = MemoryHub::new();
    let channel = channel_on(&hub, config_with_capacity(8));
    for i in 0..5u8 {
        channel.send(Message::new(1, vec![i])).unwrap();
    }
    channel.set_queue_capacity(3).unwrap();
    assert_eq!(channel.pending(), 3);
    assert_eq!(channel.config().queue_capacity, 3);
    assert!(channel.set_queue_capacity(0).is_err());
    channel.close();
}

#[test]
fn local_node_reports_identity_and_traffic() {
    let hub = MemoryHub::new();
    let channel = channel_on(&hub, config_with_capacity(16));
    channel.start().unwrap();
    assert!(wait_for(|| channel.local_id() > 0));

    let local = channel.local_node();
    assert_eq!(local.id, channel.local_id());
    assert_eq!(local.uuid, channel.uuid());
    assert!(local.address.ip().is_loopback());
    assert!(local.packets_out >= 1);
    assert!(channel.nodes().is_empty());
    channel.close();
}
