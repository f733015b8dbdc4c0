//! Handler dispatch: delivers received messages and membership changes to
//! registered collaborators.
//!
//! Handlers run on the channel's reader and pinger threads. They are called
//! in registration order, outside any channel lock, so a handler may call
//! back into the channel (send, query nodes, register more handlers). A
//! panicking handler is logged and skipped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::channel::MulticastChannel;
use crate::node::{Node, ReceivedMessage};

/// Receives application messages from cluster members.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, channel: &MulticastChannel, message: &ReceivedMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(&MulticastChannel, &ReceivedMessage) + Send + Sync,
{
    fn handle(&self, channel: &MulticastChannel, message: &ReceivedMessage) {
        self(channel, message)
    }
}

/// Observes members joining and leaving.
pub trait PresenceHandler: Send + Sync {
    /// A member appeared. `previous` is the member that held the same id
    /// before this one took it over, if any.
    fn node_enter(&self, channel: &MulticastChannel, node: &Node, previous: Option<&Node>);

    /// A member stopped heartbeating and was evicted.
    fn node_left(&self, channel: &MulticastChannel, node: &Node);
}

struct FnPresenceHandler<E, L> {
    on_enter: E,
    on_left: L,
}

impl<E, L> PresenceHandler for FnPresenceHandler<E, L>
where
    E: Fn(&MulticastChannel, &Node, Option<&Node>) + Send + Sync,
    L: Fn(&MulticastChannel, &Node) + Send + Sync,
{
    fn node_enter(&self, channel: &MulticastChannel, node: &Node, previous: Option<&Node>) {
        (self.on_enter)(channel, node, previous)
    }

    fn node_left(&self, channel: &MulticastChannel, node: &Node) {
        (self.on_left)(channel, node)
    }
}

/// Build a presence handler from two closures.
pub fn presence_handler<E, L>(on_enter: E, on_left: L) -> Arc<dyn PresenceHandler>
where
    E: Fn(&MulticastChannel, &Node, Option<&Node>) + Send + Sync + 'static,
    L: Fn(&MulticastChannel, &Node) + Send + Sync + 'static,
{
    Arc::new(FnPresenceHandler { on_enter, on_left })
}

/// Build a message handler that only sees one command.
pub fn command_handler<F>(command: u8, handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&MulticastChannel, &ReceivedMessage) + Send + Sync + 'static,
{
    Arc::new(move |channel: &MulticastChannel, message: &ReceivedMessage| {
        if message.command == command {
            handler(channel, message);
        }
    })
}

/// Registered handlers, kept in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    messages: RwLock<Vec<Arc<dyn MessageHandler>>>,
    presence: RwLock<Vec<Arc<dyn PresenceHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.messages.write();
        handlers.push(handler);
        debug!("Registered message handler #{}", handlers.len());
    }

    pub fn add_presence_handler(&self, handler: Arc<dyn PresenceHandler>) {
        let mut handlers = self.presence.write();
        handlers.push(handler);
        debug!("Registered presence handler #{}", handlers.len());
    }

    pub fn message_handler_count(&self) -> usize {
        self.messages.read().len()
    }

    pub fn presence_handler_count(&self) -> usize {
        self.presence.read().len()
    }

    pub fn dispatch_message(&self, channel: &MulticastChannel, message: &ReceivedMessage) {
        let handlers = self.messages.read().clone();
        for handler in handlers {
            guarded("message", || handler.handle(channel, message));
        }
    }

    pub fn dispatch_enter(&self, channel: &MulticastChannel, node: &Node, previous: Option<&Node>) {
        let handlers = self.presence.read().clone();
        for handler in handlers {
            guarded("presence", || handler.node_enter(channel, node, previous));
        }
    }

    pub fn dispatch_left(&self, channel: &MulticastChannel, node: &Node) {
        let handlers = self.presence.read().clone();
        for handler in handlers {
            guarded("presence", || handler.node_left(channel, node));
        }
    }
}

fn guarded(kind: &str, call: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("A {kind} handler panicked: {reason}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
