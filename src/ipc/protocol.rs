//! Transport abstraction the channel protocol runs on.

use std::sync::Arc;

use crate::error::Result;
use crate::event::Event;
use crate::ipc::messages::Message;

/// A reliable, ordered, point-to-point message pipe.
///
/// `send` is fire-and-forget and must not deliver synchronously into the
/// sender's own listeners. `on_message` fires once per inbound message, in
/// arrival order, one at a time. Messages that arrive before anyone has
/// subscribed are held and delivered to the first subscriber.
pub trait MessagePassingProtocol: Send + Sync {
    /// Queue a message for the peer.
    fn send(&self, message: Message) -> Result<()>;

    /// Inbound messages.
    fn on_message(&self) -> Event<Message>;
}

/// Shared transport handle.
pub type Protocol = Arc<dyn MessagePassingProtocol>;
