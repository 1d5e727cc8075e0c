//! Multi-client server: one client/server pair per connection, plus routing of
//! outbound calls to a connection by client id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::event::{Disposable, Emitter, Event, lock};
use crate::ipc::call::{CallHandle, CallSink, CancelHandle, pending_call};
use crate::ipc::client::{ChannelClient, ChannelProxy, RemoteChannel};
use crate::ipc::messages::Message;
use crate::ipc::protocol::Protocol;
use crate::ipc::server::{Channel, ChannelServer};

/// A freshly accepted connection.
#[derive(Clone)]
pub struct ClientConnection {
    pub protocol: Protocol,
    pub on_disconnect: Event<()>,
}

/// Picks the client a call should go to.
pub trait ClientRouter: Send + Sync {
    /// Target client id for `command`, or `None` if the call cannot be routed.
    fn route(&self, command: &str, arg: &Value) -> Option<String>;
}

impl<F> ClientRouter for F
where
    F: Fn(&str, &Value) -> Option<String> + Send + Sync,
{
    fn route(&self, command: &str, arg: &Value) -> Option<String> {
        self(command, arg)
    }
}

/// Routes every call to the same client.
#[derive(Debug, Clone)]
pub struct StaticRouter {
    client_id: String,
}

impl StaticRouter {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

impl ClientRouter for StaticRouter {
    fn route(&self, _command: &str, _arg: &Value) -> Option<String> {
        Some(self.client_id.clone())
    }
}

struct Connection {
    client_id: String,
    client: ChannelClient,
    server: ChannelServer,
}

impl Connection {
    fn dispose(&self) {
        self.server.dispose();
        self.client.dispose();
    }
}

struct RouterInner {
    channels: Mutex<HashMap<String, Arc<dyn Channel>>>,
    clients: Mutex<HashMap<String, Arc<Connection>>>,
    client_added: Emitter<String>,
    subscription: Mutex<Option<Disposable>>,
}

/// Serves any number of connections.
///
/// Each connection must open with a hello message carrying its client id.
/// Globally registered channels are served on every connection.
pub struct IpcServer {
    inner: Arc<RouterInner>,
}

impl IpcServer {
    /// Start accepting connections from `on_connection`.
    pub fn new(on_connection: Event<ClientConnection>) -> Self {
        let inner = Arc::new(RouterInner {
            channels: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            client_added: Emitter::new(),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = on_connection.listen(move |connection| {
            if let Some(inner) = weak.upgrade() {
                RouterInner::on_connection(&inner, connection);
            }
        });
        *lock(&inner.subscription) = Some(subscription);

        Self { inner }
    }

    /// Serve `channel` as `name` on every current and future connection.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn Channel>) {
        let name = name.into();
        let mut channels = lock(&self.inner.channels);
        for connection in lock(&self.inner.clients).values() {
            connection.server.register_channel(name.clone(), Arc::clone(&channel));
        }
        channels.insert(name, channel);
    }

    /// Remote channel whose calls go to the client picked by `router`.
    pub fn get_channel(&self, channel_name: impl Into<String>, router: Arc<dyn ClientRouter>) -> RoutedChannel {
        RoutedChannel {
            inner: Arc::downgrade(&self.inner),
            channel_name: channel_name.into(),
            router,
        }
    }

    /// Remote channel on one connected client.
    pub fn client_channel(&self, client_id: &str, channel_name: impl Into<String>) -> Option<ChannelProxy> {
        lock(&self.inner.clients)
            .get(client_id)
            .map(|connection| connection.client.get_channel(channel_name))
    }

    /// Ids of the connected clients, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.clients).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Fires with the client id after a connection completes its hello.
    pub fn on_client_added(&self) -> Event<String> {
        self.inner.client_added.event()
    }

    /// Stop accepting connections and tear down every connected client.
    /// Calls still waiting for a client fail with [`IpcError::Disposed`].
    pub fn dispose(&self) {
        if let Some(subscription) = lock(&self.inner.subscription).take() {
            subscription.dispose();
        }
        let connections: Vec<Arc<Connection>> = lock(&self.inner.clients).drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.dispose();
        }
        self.inner.client_added.dispose();
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl RouterInner {
    fn on_connection(this: &Arc<Self>, connection: &ClientConnection) {
        let registered: Arc<Mutex<Option<Arc<Connection>>>> = Arc::new(Mutex::new(None));

        // Keeps the connection alive until it says hello or hangs up.
        let unannounced: Arc<Mutex<Option<Protocol>>> =
            Arc::new(Mutex::new(Some(Arc::clone(&connection.protocol))));

        let hello = {
            let weak = Arc::downgrade(this);
            let unannounced = Arc::clone(&unannounced);
            let registered = Arc::clone(&registered);
            connection.protocol.on_message().once().listen(move |message| {
                let Some(protocol) = lock(&unannounced).take() else {
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match message {
                    Message::Hello { client_id } => {
                        *lock(&registered) = Some(inner.add_client(client_id, protocol));
                    }
                    other => warn!("Expected hello as first message, got {:?}; ignoring connection", other.kind()),
                }
            })
        };

        let weak = Arc::downgrade(this);
        connection.on_disconnect.clone().once().listen(move |_| {
            hello.dispose();
            lock(&unannounced).take();
            let Some(connection) = lock(&registered).take() else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                inner.remove_client(&connection);
            } else {
                connection.dispose();
            }
        });
    }

    fn add_client(&self, client_id: &str, protocol: Protocol) -> Arc<Connection> {
        let client = ChannelClient::new(Arc::clone(&protocol));
        let server = ChannelServer::new(protocol);
        let connection = Arc::new(Connection {
            client_id: client_id.to_string(),
            client,
            server,
        });

        let replaced = {
            let channels = lock(&self.channels);
            for (name, channel) in channels.iter() {
                connection.server.register_channel(name.clone(), Arc::clone(channel));
            }
            lock(&self.clients).insert(client_id.to_string(), Arc::clone(&connection))
        };
        if let Some(replaced) = replaced {
            warn!("Client '{}' reconnected, dropping previous connection", client_id);
            replaced.dispose();
        }

        info!("Client '{}' connected", client_id);
        self.client_added.fire(client_id.to_string());
        connection
    }

    fn remove_client(&self, connection: &Arc<Connection>) {
        {
            let mut clients = lock(&self.clients);
            if clients
                .get(&connection.client_id)
                .is_some_and(|current| Arc::ptr_eq(current, connection))
            {
                clients.remove(&connection.client_id);
            }
        }
        info!("Client '{}' disconnected", connection.client_id);
        connection.dispose();
    }

    /// Forward to `client_id` now, or once it connects.
    fn call_client(this: &Arc<Self>, client_id: &str, channel_name: &str, command: &str, arg: Value) -> CallHandle {
        let clients = lock(&this.clients);
        if let Some(connection) = clients.get(client_id) {
            return connection.client.call(channel_name, command, arg);
        }

        debug!("Client '{}' not connected, holding {}.{}", client_id, channel_name, command);

        // Subscribe while the registry is locked so the add for this id cannot slip past.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let ready_tx = Mutex::new(Some(ready_tx));
        let wanted = client_id.to_string();
        let subscription = this
            .client_added
            .event()
            .filter(move |id| *id == wanted)
            .once()
            .listen(move |_| {
                if let Some(tx) = lock(&ready_tx).take() {
                    let _ = tx.send(());
                }
            });
        drop(clients);

        let token = CancellationToken::new();
        let slot: Arc<Mutex<Option<CallSink>>> = Arc::new(Mutex::new(None));
        let cancel = {
            let token = token.clone();
            let slot = Arc::clone(&slot);
            CancelHandle::new(move || {
                if let Some(sink) = lock(&slot).take() {
                    sink.resolve(Err(IpcError::Canceled));
                }
                token.cancel();
            })
        };
        let (sink, handle) = pending_call(None, cancel);
        *lock(&slot) = Some(sink);

        let pending = PendingCall {
            router: Arc::downgrade(this),
            client_id: client_id.to_string(),
            channel_name: channel_name.to_string(),
            command: command.to_string(),
            arg,
            slot,
            token,
        };
        tokio::spawn(pending.run(ready_rx, subscription));
        handle
    }
}

/// A routed call waiting for its client to connect.
struct PendingCall {
    router: Weak<RouterInner>,
    client_id: String,
    channel_name: String,
    command: String,
    arg: Value,
    slot: Arc<Mutex<Option<CallSink>>>,
    token: CancellationToken,
}

impl PendingCall {
    async fn run(self, ready: tokio::sync::oneshot::Receiver<()>, subscription: Disposable) {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                subscription.dispose();
                return;
            }
            added = ready => {
                if added.is_err() {
                    self.settle(Err(IpcError::Disposed));
                    return;
                }
            }
        }

        let connection = self
            .router
            .upgrade()
            .and_then(|router| lock(&router.clients).get(&self.client_id).cloned());
        let Some(connection) = connection else {
            self.settle(Err(IpcError::Disposed));
            return;
        };

        debug!("Client '{}' connected, forwarding {}.{}", self.client_id, self.channel_name, self.command);
        let remote = connection
            .client
            .call(&self.channel_name, &self.command, self.arg.clone());
        let (mut result, mut progress, remote_cancel) = remote.split();

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    remote_cancel.cancel();
                    return;
                }
                Some(data) = progress.recv() => {
                    if let Some(sink) = lock(&self.slot).as_ref() {
                        sink.progress(data);
                    }
                }
                outcome = &mut result => {
                    while let Ok(data) = progress.try_recv() {
                        if let Some(sink) = lock(&self.slot).as_ref() {
                            sink.progress(data);
                        }
                    }
                    self.settle(outcome.unwrap_or(Err(IpcError::Disposed)));
                    return;
                }
            }
        }
    }

    fn settle(&self, outcome: Result<Value>) {
        if let Some(sink) = lock(&self.slot).take() {
            sink.resolve(outcome);
        }
    }
}

/// Remote channel whose target client is chosen per call.
///
/// Calls must be issued inside a tokio runtime.
#[derive(Clone)]
pub struct RoutedChannel {
    inner: Weak<RouterInner>,
    channel_name: String,
    router: Arc<dyn ClientRouter>,
}

impl RoutedChannel {
    pub fn name(&self) -> &str {
        &self.channel_name
    }
}

impl RemoteChannel for RoutedChannel {
    fn call(&self, command: &str, arg: Value) -> CallHandle {
        let Some(client_id) = self.router.route(command, &arg).filter(|id| !id.is_empty()) else {
            return CallHandle::failed(IpcError::Routing("Client id should be provided".into()));
        };
        match self.inner.upgrade() {
            Some(inner) => RouterInner::call_client(&inner, &client_id, &self.channel_name, command, arg),
            None => CallHandle::failed(IpcError::Disposed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::CallbackChannel;
    use crate::transport::mock::MockProtocol;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        connections: Emitter<ClientConnection>,
        server: IpcServer,
    }

    struct FakeClient {
        protocol: Arc<MockProtocol>,
        disconnect: Emitter<()>,
    }

    impl Harness {
        fn new() -> Self {
            let connections = Emitter::new();
            let server = IpcServer::new(connections.event());
            Self { connections, server }
        }

        /// Connect, say hello and complete the remote handshake.
        fn connect(&self, client_id: &str) -> FakeClient {
            let client = self.accept();
            client.protocol.deliver(Message::hello(client_id));
            client.protocol.deliver(Message::ResponseInitialize);
            client
        }

        fn accept(&self) -> FakeClient {
            let protocol = MockProtocol::new();
            let disconnect = Emitter::new();
            self.connections.fire(ClientConnection {
                protocol: protocol.clone(),
                on_disconnect: disconnect.event(),
            });
            FakeClient { protocol, disconnect }
        }
    }

    fn to(client_id: &str) -> Arc<dyn ClientRouter> {
        Arc::new(StaticRouter::new(client_id))
    }

    #[tokio::test]
    async fn test_unroutable_call_fails_without_traffic() {
        let harness = Harness::new();
        let client = harness.connect("w1");
        client.protocol.take_sent();

        let nowhere: Arc<dyn ClientRouter> = Arc::new(|_: &str, _: &Value| -> Option<String> { None });
        let result = harness.server.get_channel("launch", nowhere).call("start", Value::Null).await;

        match result {
            Err(IpcError::Routing(message)) => assert_eq!(message, "Client id should be provided"),
            other => panic!("Expected routing error, got {:?}", other),
        }
        assert!(client.protocol.sent().is_empty());
    }

    #[tokio::test]
    async fn test_hello_registers_client_and_sends_handshake() {
        let harness = Harness::new();
        let client = harness.accept();
        assert!(client.protocol.sent().is_empty());

        client.protocol.deliver(Message::hello("w1"));

        assert_eq!(harness.server.client_ids(), vec!["w1".to_string()]);
        assert_eq!(client.protocol.sent(), vec![Message::ResponseInitialize]);
    }

    #[tokio::test]
    async fn test_connection_outlives_source_handle_until_hello() {
        let harness = Harness::new();
        let protocol = MockProtocol::new();
        let weak = Arc::downgrade(&protocol);
        harness.connections.fire(ClientConnection {
            protocol,
            on_disconnect: Event::none(),
        });

        let protocol = weak.upgrade().expect("connection dropped before hello");
        protocol.deliver(Message::hello("w1"));
        drop(protocol);

        assert_eq!(harness.server.client_ids(), vec!["w1".to_string()]);
        assert!(weak.upgrade().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_before_hello_releases_connection() {
        let harness = Harness::new();
        let protocol = MockProtocol::new();
        let weak = Arc::downgrade(&protocol);
        let disconnect = Emitter::new();
        harness.connections.fire(ClientConnection {
            protocol,
            on_disconnect: disconnect.event(),
        });
        assert!(weak.upgrade().is_some());

        disconnect.fire(());

        assert!(weak.upgrade().is_none());
        assert!(harness.server.client_ids().is_empty());
    }

    #[tokio::test]
    async fn test_empty_client_id_is_unroutable() {
        let harness = Harness::new();
        let client = harness.connect("");
        client.protocol.take_sent();

        let blank: Arc<dyn ClientRouter> = Arc::new(|_: &str, _: &Value| -> Option<String> { Some(String::new()) });
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            harness.server.get_channel("launch", blank).call("start", Value::Null),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(IpcError::Routing(_))));
        assert!(client.protocol.sent().is_empty());
    }

    #[tokio::test]
    async fn test_non_hello_first_message_ignores_connection() {
        let harness = Harness::new();
        let client = harness.accept();

        client.protocol.deliver(Message::ResponseInitialize);
        client.protocol.deliver(Message::hello("late"));

        assert!(harness.server.client_ids().is_empty());
        assert!(client.protocol.sent().is_empty());
    }

    #[tokio::test]
    async fn test_connected_client_receives_call_immediately() {
        let harness = Harness::new();
        let client = harness.connect("w1");
        client.protocol.take_sent();

        let handle = harness.server.get_channel("launch", to("w1")).call("start", json!({"args": []}));
        assert_eq!(
            client.protocol.take_sent(),
            vec![Message::request(0, "launch", "start", json!({"args": []}))]
        );

        client.protocol.deliver(Message::success(0, Value::Null));
        assert_eq!(handle.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_call_waits_for_client_added() {
        let harness = Harness::new();
        let other = harness.connect("w1");
        other.protocol.take_sent();

        let handle = harness
            .server
            .get_channel("launch", to("w2"))
            .call("start", json!({"args": ["--version"], "userEnv": {}}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(other.protocol.sent().is_empty());

        let w2 = harness.accept();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(w2.protocol.sent().is_empty());

        w2.protocol.deliver(Message::hello("w2"));
        w2.protocol.deliver(Message::ResponseInitialize);

        let sent = w2.protocol.wait_for(|s| s.len() >= 2).await;
        assert_eq!(
            sent,
            vec![
                Message::ResponseInitialize,
                Message::request(0, "launch", "start", json!({"args": ["--version"], "userEnv": {}})),
            ]
        );
        assert!(other.protocol.sent().is_empty());

        w2.protocol.deliver(Message::success(0, Value::Null));
        assert_eq!(handle.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_progress_is_forwarded_for_held_call() {
        let harness = Harness::new();
        let mut handle = harness.server.get_channel("svc", to("w1")).call("work", Value::Null);

        let w1 = harness.connect("w1");
        w1.protocol.wait_for(|s| s.len() >= 2).await;

        w1.protocol.deliver(Message::progress(0, json!(50)));
        w1.protocol.deliver(Message::success(0, json!("done")));

        assert_eq!(handle.next_progress().await, Some(json!(50)));
        assert_eq!(handle.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_cancel_held_call_never_reaches_wire() {
        let harness = Harness::new();
        let handle = harness.server.get_channel("svc", to("w1")).call("work", Value::Null);
        handle.cancel();
        assert!(handle.await.unwrap_err().is_canceled());

        let w1 = harness.connect("w1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(w1.protocol.sent(), vec![Message::ResponseInitialize]);
    }

    #[tokio::test]
    async fn test_cancel_after_forwarding_cancels_remote() {
        let harness = Harness::new();
        let handle = harness.server.get_channel("svc", to("w1")).call("work", Value::Null);
        let canceller = handle.canceller();

        let w1 = harness.connect("w1");
        w1.protocol.wait_for(|s| s.len() >= 2).await;

        canceller.cancel();
        assert!(handle.await.unwrap_err().is_canceled());
        let sent = w1.protocol.wait_for(|s| s.len() >= 3).await;
        assert_eq!(sent.last(), Some(&Message::cancel(0)));
    }

    #[tokio::test]
    async fn test_global_channels_served_on_every_connection() {
        let harness = Harness::new();
        harness
            .server
            .register_channel("echo", Arc::new(CallbackChannel::new(|_, arg| Ok(arg))));

        let w1 = harness.connect("w1");
        harness
            .server
            .register_channel("late", Arc::new(CallbackChannel::new(|cmd, _| Ok(json!(cmd)))));
        w1.protocol.take_sent();

        w1.protocol.deliver(Message::request(0, "echo", "any", json!(1)));
        w1.protocol.deliver(Message::request(1, "late", "hi", Value::Null));

        let sent = w1.protocol.wait_for(|s| s.len() >= 2).await;
        assert!(sent.contains(&Message::success(0, json!(1))));
        assert!(sent.contains(&Message::success(1, json!("hi"))));
    }

    #[tokio::test]
    async fn test_disconnect_removes_client() {
        let harness = Harness::new();
        let w1 = harness.connect("w1");
        let pending = harness.server.get_channel("svc", to("w1")).call("work", Value::Null);

        w1.disconnect.fire(());

        assert!(harness.server.client_ids().is_empty());
        assert!(pending.await.unwrap_err().is_canceled());
        assert_eq!(w1.protocol.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_connection() {
        let harness = Harness::new();
        let first = harness.connect("w1");
        let second = harness.connect("w1");

        first.disconnect.fire(());

        assert_eq!(harness.server.client_ids(), vec!["w1".to_string()]);
        second.protocol.take_sent();
        let _handle = harness.server.get_channel("svc", to("w1")).call("work", Value::Null);
        assert_eq!(second.protocol.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_client_added_event_and_client_channel() {
        let harness = Harness::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = harness.server.on_client_added().listen(move |id| lock(&sink).push(id.clone()));

        let w1 = harness.connect("w1");
        assert_eq!(*lock(&seen), vec!["w1".to_string()]);

        w1.protocol.take_sent();
        let proxy = harness.server.client_channel("w1", "svc").unwrap();
        let _handle = proxy.call("ping", Value::Null);
        assert_eq!(w1.protocol.sent(), vec![Message::request(0, "svc", "ping", Value::Null)]);
        assert!(harness.server.client_channel("w9", "svc").is_none());
    }

    #[tokio::test]
    async fn test_dispose_fails_held_calls() {
        let harness = Harness::new();
        let handle = harness.server.get_channel("svc", to("w1")).call("work", Value::Null);
        tokio::task::yield_now().await;

        harness.server.dispose();

        assert!(matches!(handle.await, Err(IpcError::Disposed)));
    }
}
