//! Channel client: the caller side of the channel protocol.
//!
//! Provides:
//! - Request id assignment and an id-indexed handler table
//! - Buffering of calls issued before the peer's handshake
//! - Progress delivery and immediate cancellation

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::error::IpcError;
use crate::event::{Disposable, lock};
use crate::ipc::call::{CallHandle, CallSink, CancelHandle, pending_call};
use crate::ipc::messages::Message;
use crate::ipc::protocol::Protocol;

/// Anything that can issue calls against one named channel.
pub trait RemoteChannel: Send + Sync {
    /// Invoke `command` with `arg`.
    fn call(&self, command: &str, arg: Value) -> CallHandle;

    /// Invoke `command` with a serializable argument.
    fn call_with<A: Serialize>(&self, command: &str, arg: &A) -> CallHandle
    where
        Self: Sized,
    {
        match serde_json::to_value(arg) {
            Ok(arg) => self.call(command, arg),
            Err(e) => CallHandle::failed(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Uninitialized,
    Idle,
}

/// Request issued before the handshake, waiting to be flushed.
struct BufferedRequest {
    id: u64,
    message: Message,
    sink: CallSink,
}

struct ClientState {
    link: LinkState,
    last_request_id: u64,
    buffered: VecDeque<BufferedRequest>,
    handlers: HashMap<u64, CallSink>,
    disposed: bool,
}

struct ClientInner {
    protocol: Protocol,
    state: Mutex<ClientState>,
    listener: Mutex<Option<Disposable>>,
}

/// Caller side of one connection.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

impl ChannelClient {
    /// Attach a client to a transport. Calls are buffered until the peer's
    /// server announces itself.
    pub fn new(protocol: Protocol) -> Self {
        let inner = Arc::new(ClientInner {
            protocol: Arc::clone(&protocol),
            state: Mutex::new(ClientState {
                link: LinkState::Uninitialized,
                last_request_id: 0,
                buffered: VecDeque::new(),
                handlers: HashMap::new(),
                disposed: false,
            }),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let listener = protocol.on_message().listen(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(message);
            }
        });
        *lock(&inner.listener) = Some(listener);

        Self { inner }
    }

    /// Handle for calling commands on `channel_name`.
    pub fn get_channel(&self, channel_name: impl Into<String>) -> ChannelProxy {
        ChannelProxy {
            client: self.clone(),
            channel_name: channel_name.into(),
        }
    }

    /// Invoke `command` on `channel_name`.
    pub fn call(&self, channel_name: &str, command: &str, arg: Value) -> CallHandle {
        ClientInner::request(&self.inner, channel_name, command, arg)
    }

    /// Whether the peer's handshake has been observed.
    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.state).link == LinkState::Idle
    }

    /// Number of calls still waiting for a terminal response, buffered ones included.
    pub fn pending_count(&self) -> usize {
        let state = lock(&self.inner.state);
        state.handlers.len() + state.buffered.len()
    }

    /// Cancel every outstanding call and detach from the transport.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl ClientInner {
    fn request(this: &Arc<Self>, channel_name: &str, command: &str, arg: Value) -> CallHandle {
        let mut state = lock(&this.state);
        if state.disposed {
            return CallHandle::failed(IpcError::Disposed);
        }

        let id = state.last_request_id;
        state.last_request_id += 1;

        let weak = Arc::downgrade(this);
        let cancel = CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel(id);
            }
        });
        let (sink, handle) = pending_call(Some(id), cancel);
        let message = Message::request(id, channel_name, command, arg);

        match state.link {
            LinkState::Uninitialized => {
                debug!("Buffering request {} ({}.{}) until handshake", id, channel_name, command);
                state.buffered.push_back(BufferedRequest { id, message, sink });
            }
            LinkState::Idle => {
                state.handlers.insert(id, sink);
                this.send(message);
            }
        }

        handle
    }

    fn on_message(&self, message: &Message) {
        if !message.is_response() {
            return;
        }

        let mut state = lock(&self.state);
        if state.disposed {
            return;
        }

        match message {
            Message::ResponseInitialize => {
                if state.link == LinkState::Idle {
                    return;
                }
                state.link = LinkState::Idle;
                let buffered = std::mem::take(&mut state.buffered);
                debug!("Handshake received, flushing {} buffered request(s)", buffered.len());
                for request in buffered {
                    state.handlers.insert(request.id, request.sink);
                    self.send(request.message);
                }
            }
            Message::ResponseSuccess { id, data } => {
                if let Some(sink) = state.handlers.remove(id) {
                    sink.resolve(Ok(data.clone()));
                }
            }
            Message::ResponseError { id, data } => {
                if let Some(sink) = state.handlers.remove(id) {
                    sink.resolve(Err(IpcError::Remote(data.clone())));
                }
            }
            Message::ResponseErrorObj { id, data } => {
                if let Some(sink) = state.handlers.remove(id) {
                    sink.resolve(Err(IpcError::Opaque(data.clone())));
                }
            }
            Message::ResponseProgress { id, data } => {
                if let Some(sink) = state.handlers.get(id) {
                    sink.progress(data.clone());
                }
            }
            _ => {}
        }
    }

    fn cancel(&self, id: u64) {
        let mut state = lock(&self.state);

        if let Some(pos) = state.buffered.iter().position(|r| r.id == id) {
            if let Some(request) = state.buffered.remove(pos) {
                debug!("Dropping buffered request {}", id);
                request.sink.resolve(Err(IpcError::Canceled));
            }
            return;
        }

        // Removing the handler first means a late response for this id is ignored.
        if let Some(sink) = state.handlers.remove(&id) {
            self.send(Message::cancel(id));
            sink.resolve(Err(IpcError::Canceled));
        }
    }

    fn dispose(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.dispose();
        }

        let mut state = lock(&self.state);
        if state.disposed {
            return;
        }
        state.disposed = true;

        for request in state.buffered.drain(..) {
            request.sink.resolve(Err(IpcError::Canceled));
        }

        let mut ids: Vec<u64> = state.handlers.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(sink) = state.handlers.remove(&id) {
                self.send(Message::cancel(id));
                sink.resolve(Err(IpcError::Canceled));
            }
        }
    }

    fn send(&self, message: Message) {
        debug!("-> {:?} {:?}", message.kind(), message.id());
        if let Err(e) = self.protocol.send(message) {
            warn!("Failed to send request: {}", e);
        }
    }
}

/// Calls commands on one named channel through a [`ChannelClient`].
#[derive(Clone)]
pub struct ChannelProxy {
    client: ChannelClient,
    channel_name: String,
}

impl ChannelProxy {
    /// Channel name.
    pub fn name(&self) -> &str {
        &self.channel_name
    }
}

impl RemoteChannel for ChannelProxy {
    fn call(&self, command: &str, arg: Value) -> CallHandle {
        self.client.call(&self.channel_name, command, arg)
    }
}
