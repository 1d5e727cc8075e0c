//! Recording transport for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{IpcError, Result};
use crate::event::{Emitter, Event, lock};
use crate::ipc::messages::Message;
use crate::ipc::protocol::MessagePassingProtocol;

/// Transport that records every sent message and lets the test inject
/// inbound messages synchronously.
pub struct MockProtocol {
    sent: Mutex<Vec<Message>>,
    inbound: Emitter<Message>,
    fail_sends: AtomicBool,
}

impl MockProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: Emitter::new(),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }

    /// Drain the sent log.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *lock(&self.sent))
    }

    /// Fire `message` at every listener as if it arrived from the peer.
    pub fn deliver(&self, message: Message) {
        self.inbound.fire(message);
    }

    /// Make every following `send` fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Number of attached inbound listeners.
    pub fn listener_count(&self) -> usize {
        self.inbound.listener_count()
    }

    /// Poll the sent log until `ready` holds or two seconds pass, then
    /// return whatever was sent.
    pub async fn wait_for<F: Fn(&[Message]) -> bool>(&self, ready: F) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let sent = self.sent();
            if ready(&sent) || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl MessagePassingProtocol for MockProtocol {
    fn send(&self, message: Message) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(IpcError::Transport("mock send failure".into()));
        }
        lock(&self.sent).push(message);
        Ok(())
    }

    fn on_message(&self) -> Event<Message> {
        self.inbound.event()
    }
}
