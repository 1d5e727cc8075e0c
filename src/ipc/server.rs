//! Channel server: the callee side of the channel protocol.
//!
//! Provides:
//! - Channel registration by name
//! - Dispatch of inbound requests to registered channels
//! - Success, error and progress responses
//! - Cancellation of in-flight calls

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, warn};
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::error::{IpcError, Result};
use crate::event::{Disposable, lock, panic_message};
use crate::ipc::messages::Message;
use crate::ipc::protocol::Protocol;

/// A named collection of remotely callable commands.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Handle `command`. Report intermediate results through `progress`.
    ///
    /// Returning `IpcError::Opaque` sends the payload back untouched; any other
    /// error is sent as a structured error.
    async fn call(&self, command: &str, arg: Value, progress: Progress) -> Result<Value>;
}

/// Channel backed by a synchronous callback
pub struct CallbackChannel<F>
where
    F: Fn(&str, Value) -> Result<Value> + Send + Sync,
{
    callback: F,
}

impl<F> CallbackChannel<F>
where
    F: Fn(&str, Value) -> Result<Value> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> Channel for CallbackChannel<F>
where
    F: Fn(&str, Value) -> Result<Value> + Send + Sync,
{
    async fn call(&self, command: &str, arg: Value, _progress: Progress) -> Result<Value> {
        (self.callback)(command, arg)
    }
}

/// Sends progress notifications for one in-flight request.
#[derive(Clone)]
pub struct Progress {
    id: u64,
    protocol: Option<Protocol>,
}

impl Progress {
    pub(crate) fn new(id: u64, protocol: Protocol) -> Self {
        Self {
            id,
            protocol: Some(protocol),
        }
    }

    /// A reporter that discards everything, for invoking channels locally.
    pub fn detached() -> Self {
        Self { id: 0, protocol: None }
    }

    /// Id of the request being served.
    pub fn request_id(&self) -> u64 {
        self.id
    }

    /// Send a progress notification to the caller.
    pub fn report(&self, data: Value) {
        if let Some(protocol) = &self.protocol {
            if let Err(e) = protocol.send(Message::progress(self.id, data)) {
                warn!("Failed to send progress for request {}: {}", self.id, e);
            }
        }
    }
}

struct ServerInner {
    protocol: Protocol,
    channels: Mutex<HashMap<String, Arc<dyn Channel>>>,
    active: Mutex<HashMap<u64, AbortHandle>>,
    listener: Mutex<Option<Disposable>>,
}

/// Callee side of one connection.
///
/// Must be created inside a tokio runtime: every request runs as its own task.
#[derive(Clone)]
pub struct ChannelServer {
    inner: Arc<ServerInner>,
}

impl ChannelServer {
    /// Attach to a transport and send the handshake.
    pub fn new(protocol: Protocol) -> Self {
        let inner = Arc::new(ServerInner {
            protocol: Arc::clone(&protocol),
            channels: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let listener = protocol.on_message().listen(move |message| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::on_message(&inner, message);
            }
        });
        *lock(&inner.listener) = Some(listener);

        inner.send(Message::ResponseInitialize);
        Self { inner }
    }

    /// Make `channel` callable as `name`. Replaces any earlier registration;
    /// calls already dispatched keep the channel they started on.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn Channel>) {
        let name = name.into();
        debug!("Registering channel '{}'", name);
        lock(&self.inner.channels).insert(name, channel);
    }

    /// Registered channel names, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.channels).keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of requests currently being served.
    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    /// Detach from the transport and abort every in-flight request.
    pub fn dispose(&self) {
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.dispose();
        }
        for (id, handle) in lock(&self.inner.active).drain() {
            debug!("Aborting request {} on dispose", id);
            handle.abort();
        }
    }
}

impl ServerInner {
    fn on_message(this: &Arc<Self>, message: &Message) {
        match message {
            Message::RequestCommon {
                id,
                channel_name,
                name,
                arg,
            } => Self::dispatch(this, *id, channel_name, name, arg.clone()),
            Message::RequestCancel { id } => this.cancel(*id),
            _ => {}
        }
    }

    fn dispatch(this: &Arc<Self>, id: u64, channel_name: &str, command: &str, arg: Value) {
        let channel = lock(&this.channels).get(channel_name).cloned();
        let Some(channel) = channel else {
            warn!("Request {} for unknown channel '{}'", id, channel_name);
            this.send(Message::failure(id, &IpcError::UnknownChannel(channel_name.to_string())));
            return;
        };

        debug!("Dispatching request {} to {}.{}", id, channel_name, command);
        let progress = Progress::new(id, Arc::clone(&this.protocol));
        let command = command.to_string();
        let weak = Arc::downgrade(this);

        // Hold the table while spawning so the record exists before the task can finish.
        let mut active = lock(&this.active);
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(channel.call(&command, arg, progress))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(IpcError::Panic(panic_message(payload.as_ref()))));
            if let Some(inner) = weak.upgrade() {
                inner.complete(id, outcome);
            }
        });
        if active.insert(id, task.abort_handle()).is_some() {
            warn!("Request id {} reused while still active", id);
        }
    }

    fn complete(&self, id: u64, outcome: Result<Value>) {
        if lock(&self.active).remove(&id).is_none() {
            debug!("Request {} finished after cancellation, dropping result", id);
            return;
        }
        let response = match outcome {
            Ok(data) => Message::success(id, data),
            Err(err) => {
                debug!("Request {} failed: {}", id, err);
                Message::failure(id, &err)
            }
        };
        self.send(response);
    }

    fn cancel(&self, id: u64) {
        if let Some(handle) = lock(&self.active).remove(&id) {
            debug!("Canceling request {}", id);
            handle.abort();
        }
    }

    fn send(&self, message: Message) {
        debug!("-> {:?} {:?}", message.kind(), message.id());
        if let Err(e) = self.protocol.send(message) {
            warn!("Failed to send response: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::ipc::messages::MessageKind;
    use crate::transport::mock::MockProtocol;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    struct TestChannel;

    #[async_trait]
    impl Channel for TestChannel {
        async fn call(&self, command: &str, arg: Value, progress: Progress) -> Result<Value> {
            match command {
                "echo" => Ok(arg),
                "fail" => Err(IpcError::Remote(
                    RemoteError::new("TypeError", "bad input").with_stack(vec!["TypeError: bad input".into(), "at echo".into()]),
                )),
                "opaque" => Err(IpcError::Opaque(arg)),
                "panic" => panic!("kaboom"),
                "progress" => {
                    progress.report(json!(1));
                    progress.report(json!(2));
                    Ok(json!("done"))
                }
                other => Err(IpcError::UnknownCommand(other.to_string())),
            }
        }
    }

    /// Never finishes; records when its future is dropped.
    struct StuckChannel {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Channel for StuckChannel {
        async fn call(&self, _command: &str, _arg: Value, _progress: Progress) -> Result<Value> {
            let _flag = DropFlag(Arc::clone(&self.dropped));
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    fn setup() -> (Arc<MockProtocol>, ChannelServer) {
        let protocol = MockProtocol::new();
        let server = ChannelServer::new(protocol.clone());
        server.register_channel("test", Arc::new(TestChannel));
        protocol.take_sent();
        (protocol, server)
    }

    #[tokio::test]
    async fn test_handshake_on_construction() {
        let protocol = MockProtocol::new();
        let _server = ChannelServer::new(protocol.clone());
        assert_eq!(protocol.sent(), vec![Message::ResponseInitialize]);
    }

    #[tokio::test]
    async fn test_success_response() {
        let (protocol, _server) = setup();
        protocol.deliver(Message::request(4, "test", "echo", json!({"x": 1})));

        let sent = protocol.wait_for(|s| !s.is_empty()).await;
        assert_eq!(sent, vec![Message::success(4, json!({"x": 1}))]);
    }

    #[tokio::test]
    async fn test_unknown_channel_gets_error_response() {
        let (protocol, _server) = setup();
        protocol.deliver(Message::request(0, "missing", "start", Value::Null));

        match protocol.sent().as_slice() {
            [Message::ResponseError { id: 0, data }] => {
                assert_eq!(data.name, "UnknownChannel");
                assert!(data.message.contains("missing"));
            }
            other => panic!("Expected one ResponseError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_structured_error_copies_fields() {
        let (protocol, _server) = setup();
        protocol.deliver(Message::request(1, "test", "fail", Value::Null));

        let sent = protocol.wait_for(|s| !s.is_empty()).await;
        match sent.as_slice() {
            [Message::ResponseError { id: 1, data }] => {
                assert_eq!(data.name, "TypeError");
                assert_eq!(data.message, "bad input");
                assert_eq!(data.stack.as_deref(), Some(&["TypeError: bad input".to_string(), "at echo".to_string()][..]));
            }
            other => panic!("Expected ResponseError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_opaque_error_response() {
        let (protocol, _server) = setup();
        protocol.deliver(Message::request(2, "test", "opaque", json!("raw")));

        let sent = protocol.wait_for(|s| !s.is_empty()).await;
        assert_eq!(sent, vec![Message::ResponseErrorObj { id: 2, data: json!("raw") }]);
    }

    #[tokio::test]
    async fn test_panic_becomes_error_response() {
        let (protocol, server) = setup();
        protocol.deliver(Message::request(3, "test", "panic", Value::Null));

        let sent = protocol.wait_for(|s| !s.is_empty()).await;
        match sent.as_slice() {
            [Message::ResponseError { id: 3, data }] => {
                assert_eq!(data.name, "Panic");
                assert!(data.message.contains("kaboom"));
            }
            other => panic!("Expected ResponseError, got {:?}", other),
        }
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_precedes_success() {
        let (protocol, _server) = setup();
        protocol.deliver(Message::request(5, "test", "progress", Value::Null));

        let sent = protocol.wait_for(|s| s.len() >= 3).await;
        assert_eq!(
            sent,
            vec![
                Message::progress(5, json!(1)),
                Message::progress(5, json!(2)),
                Message::success(5, json!("done")),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_call() {
        let (protocol, server) = setup();
        let dropped = Arc::new(AtomicBool::new(false));
        server.register_channel("stuck", Arc::new(StuckChannel { dropped: Arc::clone(&dropped) }));

        protocol.deliver(Message::request(0, "stuck", "wait", Value::Null));
        tokio::task::yield_now().await;
        assert_eq!(server.active_count(), 1);

        protocol.deliver(Message::cancel(0));
        assert_eq!(server.active_count(), 0);

        for _ in 0..50 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
        assert!(protocol.sent().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let (protocol, server) = setup();
        protocol.deliver(Message::cancel(99));
        assert_eq!(server.active_count(), 0);
        assert!(protocol.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_keeps_in_flight_channel() {
        let (protocol, server) = setup();
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);

        struct Gated(Arc<Notify>);

        #[async_trait]
        impl Channel for Gated {
            async fn call(&self, _command: &str, _arg: Value, _progress: Progress) -> Result<Value> {
                self.0.notified().await;
                Ok(json!("old"))
            }
        }

        server.register_channel("svc", Arc::new(Gated(gate)));
        protocol.deliver(Message::request(0, "svc", "get", Value::Null));
        tokio::task::yield_now().await;

        server.register_channel("svc", Arc::new(CallbackChannel::new(|_, _| Ok(json!("new")))));
        protocol.deliver(Message::request(1, "svc", "get", Value::Null));
        release.notify_one();

        let sent = protocol.wait_for(|s| s.len() >= 2).await;
        assert!(sent.contains(&Message::success(0, json!("old"))));
        assert!(sent.contains(&Message::success(1, json!("new"))));
    }

    #[tokio::test]
    async fn test_late_registration_is_visible() {
        let protocol = MockProtocol::new();
        let server = ChannelServer::new(protocol.clone());
        protocol.take_sent();

        server.register_channel("late", Arc::new(CallbackChannel::new(|cmd, _| Ok(json!(cmd)))));
        protocol.deliver(Message::request(0, "late", "hello", Value::Null));

        let sent = protocol.wait_for(|s| !s.is_empty()).await;
        assert_eq!(sent, vec![Message::success(0, json!("hello"))]);
        assert_eq!(server.channel_names(), vec!["late".to_string()]);
    }

    #[tokio::test]
    async fn test_dispose_aborts_and_detaches() {
        let (protocol, server) = setup();
        let dropped = Arc::new(AtomicBool::new(false));
        server.register_channel("stuck", Arc::new(StuckChannel { dropped: Arc::clone(&dropped) }));
        protocol.deliver(Message::request(0, "stuck", "wait", Value::Null));
        tokio::task::yield_now().await;

        server.dispose();

        assert_eq!(server.active_count(), 0);
        assert_eq!(protocol.listener_count(), 0);
        protocol.deliver(Message::request(1, "test", "echo", Value::Null));
        tokio::task::yield_now().await;
        assert!(protocol.sent().iter().all(|m| m.kind() != MessageKind::ResponseSuccess));
    }

    #[tokio::test]
    async fn test_callback_channel() {
        let channel = CallbackChannel::new(|cmd, arg| Ok(json!({"cmd": cmd, "arg": arg})));
        let result = channel.call("ping", json!(1), Progress::detached()).await.unwrap();
        assert_eq!(result, json!({"cmd": "ping", "arg": 1}));
    }
}
