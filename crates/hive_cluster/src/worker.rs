//! Worker threads behind a started [`MulticastChannel`].
//!
//! - **writer** drains the outbound queue, encoding each message under the
//!   current node id and heartbeating first when the id is new or a
//!   heartbeat is due.
//! - **reader** receives datagrams and hands them to the channel for
//!   membership bookkeeping and dispatch.
//! - **pinger** evicts silent members and forces a heartbeat once per
//!   interval.
//!
//! Every loop checks the running flag and waits on the channel's shutdown
//! signal rather than sleeping, so `close()` wakes them immediately.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::channel::{ChannelState, MulticastChannel};
use crate::wire::MAX_PACKET_SIZE;

/// How long the writer waits on an empty queue before rechecking state.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pause after a receive error so a broken socket does not spin the reader.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) const WRITER_THREAD: &str = "hive-cluster-writer";
pub(crate) const READER_THREAD: &str = "hive-cluster-reader";
pub(crate) const PINGER_THREAD: &str = "hive-cluster-pinger";

/// Spawn the writer, reader and pinger threads.
pub(crate) fn spawn_all(channel: &MulticastChannel) -> io::Result<Vec<JoinHandle<()>>> {
    let workers: [(&str, fn(MulticastChannel)); 3] = [
        (WRITER_THREAD, run_writer),
        (READER_THREAD, run_reader),
        (PINGER_THREAD, run_pinger),
    ];
    let mut handles = Vec::with_capacity(workers.len());
    for (name, body) in workers {
        let channel = channel.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(channel))?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Wait on the shutdown signal. Returns `false` once the channel is closing.
fn pause(channel: &MulticastChannel, timeout: Duration) -> bool {
    match channel.shutdown_signal().recv_timeout(timeout) {
        Err(RecvTimeoutError::Timeout) => channel.is_running(),
        Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
    }
}

fn run_writer(channel: MulticastChannel) {
    debug!("Writer started");
    while channel.is_running() {
        if channel.state() != ChannelState::Connected {
            // Keep messages queued until a group is configured.
            if !pause(&channel, QUEUE_POLL_INTERVAL) {
                break;
            }
            continue;
        }
        if let Some(message) = channel.next_message(QUEUE_POLL_INTERVAL) {
            channel.transmit(message);
        }
    }
    debug!("Writer stopped");
}

fn run_reader(channel: MulticastChannel) {
    debug!("Reader started");
    // One spare byte so oversized datagrams are seen as too long.
    let mut buf = [0u8; MAX_PACKET_SIZE + 1];
    while channel.is_running() {
        match channel.receive(&mut buf) {
            Ok(Some((len, source))) => {
                channel.handle_datagram(&buf[..len], source, Instant::now());
            }
            Ok(None) => {}
            Err(e) => {
                if !channel.is_running() {
                    break;
                }
                warn!("Multicast receive failed: {e}");
                if !pause(&channel, ERROR_BACKOFF) {
                    break;
                }
            }
        }
    }
    debug!("Reader stopped");
}

fn run_pinger(channel: MulticastChannel) {
    debug!("Pinger started");
    while pause(&channel, channel.heartbeat_interval()) {
        let evicted = channel.expire_nodes(Instant::now());
        if evicted > 0 {
            debug!("Evicted {evicted} silent node(s)");
        }
        if channel.state() == ChannelState::Connected {
            channel.heartbeat();
        }
    }
    debug!("Pinger stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
