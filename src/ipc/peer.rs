//! Point-to-point peer: one client and one server over a single transport.

use std::sync::Arc;

use log::{info, warn};

use crate::ipc::client::{ChannelClient, ChannelProxy};
use crate::ipc::messages::Message;
use crate::ipc::protocol::Protocol;
use crate::ipc::server::{Channel, ChannelServer};

/// Both ends of the channel protocol for one connection.
///
/// On construction the peer announces `client_id` to the other side, then
/// starts serving; the other side's server handshake unblocks outbound calls.
pub struct IpcClient {
    client_id: String,
    client: ChannelClient,
    server: ChannelServer,
}

impl IpcClient {
    pub fn new(protocol: Protocol, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        info!("Connecting as client '{}'", client_id);
        if let Err(e) = protocol.send(Message::hello(client_id.clone())) {
            warn!("Failed to announce client id '{}': {}", client_id, e);
        }

        let client = ChannelClient::new(Arc::clone(&protocol));
        let server = ChannelServer::new(protocol);
        Self {
            client_id,
            client,
            server,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Remote channel on the other side.
    pub fn get_channel(&self, channel_name: impl Into<String>) -> ChannelProxy {
        self.client.get_channel(channel_name)
    }

    /// Expose a local channel to the other side.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn Channel>) {
        self.server.register_channel(name, channel);
    }

    pub fn channel_client(&self) -> &ChannelClient {
        &self.client
    }

    pub fn channel_server(&self) -> &ChannelServer {
        &self.server
    }

    /// Cancel outstanding calls, abort served requests and detach.
    pub fn dispose(&self) {
        self.server.dispose();
        self.client.dispose();
    }
}
