//! Small interactive cluster member.
//!
//! Usage: `hive-cluster [config.json]`
//!
//! Every stdin line is multicast as command 1. `/nodes` lists the known
//! members and `/quit` (or EOF) leaves the cluster.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use hive_cluster::logging::{DEFAULT_FILTER, init_logging};
use hive_cluster::{ChannelConfig, Message, MulticastChannel, command_handler, presence_handler};

const CHAT_COMMAND: u8 = 1;

fn main() -> Result<()> {
    init_logging(DEFAULT_FILTER)?;

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ChannelConfig::load_or_default(&path),
        None => ChannelConfig::default(),
    };

    let channel = MulticastChannel::new(config).context("invalid channel configuration")?;
    channel.add_presence_handler(presence_handler(
        |_, node, previous| match previous {
            Some(old) => info!("Node {} taken over by {} at {}", old.id, node.uuid, node.address),
            None => info!("Node {} joined from {} ({})", node.id, node.address, node.uuid),
        },
        |_, node| info!("Node {} left ({})", node.id, node.address),
    ));
    channel.add_message_handler(command_handler(CHAT_COMMAND, |_, msg| {
        println!("[{}] {}", msg.from.id, String::from_utf8_lossy(&msg.payload));
    }));

    channel.start().context("failed to start channel")?;
    info!("Joined as {}; type a line to send it", channel.uuid());

    for line in std::io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/nodes" => {
                let local = channel.local_node();
                println!("* {} {} (self)", local.id, local.address);
                for node in channel.nodes() {
                    println!("  {} {} {}", node.id, node.address, node.uuid);
                }
            }
            text => channel
                .send(Message::new(CHAT_COMMAND, text.as_bytes()))
                .context("channel closed")?,
        }
    }

    channel.close();
    Ok(())
}
