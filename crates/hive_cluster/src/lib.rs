//! Peer-to-peer cluster channel over UDP multicast.
//!
//! Members discover each other through heartbeats, pick their own ephemeral
//! 16-bit node ids without a coordinator, age out peers that go silent, and
//! exchange small best-effort messages tagged with a one-byte command.
//!
//! ```no_run
//! use hive_cluster::{ChannelConfig, Message, MulticastChannel, command_handler};
//!
//! # fn main() -> hive_cluster::Result<()> {
//! let channel = MulticastChannel::new(ChannelConfig::default())?;
//! channel.add_message_handler(command_handler(1, |_, msg| {
//!     println!("{} says {:?}", msg.from.id, msg.payload);
//! }));
//! channel.start()?;
//! channel.send(Message::new(1, "hello"))?;
//! channel.close();
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod logging;
pub mod membership;
pub mod memory;
pub mod multicast;
pub mod node;
pub mod queue;
pub mod schedule;
pub mod transport;
pub mod wire;
mod worker;

pub use channel::{ChannelBuilder, ChannelState, MulticastChannel};
pub use config::ChannelConfig;
pub use dispatch::{MessageHandler, PresenceHandler, command_handler, presence_handler};
pub use error::{ClusterError, Result};
pub use identity::LocalIdentity;
pub use membership::{HeartbeatOutcome, MembershipStore, MembershipTable};
pub use memory::{MemoryHub, MemoryTransport};
pub use multicast::MulticastTransport;
pub use node::{Message, Node, ReceivedMessage};
pub use transport::Transport;
