//! `askpass` channel: a helper process asks the host for credentials.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IpcError, Result};
use crate::ipc::client::RemoteChannel;
use crate::ipc::server::{Channel, Progress};

pub const ASKPASS_CHANNEL: &str = "askpass";

const ASKPASS: &str = "askpass";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait AskpassService: Send + Sync {
    /// Credentials for `command` talking to `host`; `id` identifies the prompt.
    async fn askpass(&self, id: &str, host: &str, command: &str) -> Result<Credentials>;
}

pub struct AskpassChannel {
    service: Arc<dyn AskpassService>,
}

impl AskpassChannel {
    pub fn new(service: Arc<dyn AskpassService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Channel for AskpassChannel {
    async fn call(&self, command: &str, arg: Value, _progress: Progress) -> Result<Value> {
        match command {
            ASKPASS => {
                let (id, host, command): (String, String, String) = serde_json::from_value(arg)?;
                let credentials = self.service.askpass(&id, &host, &command).await?;
                Ok(serde_json::to_value(credentials)?)
            }
            other => Err(IpcError::UnknownCommand(other.to_string())),
        }
    }
}

pub struct AskpassChannelClient<C: RemoteChannel> {
    channel: C,
}

impl<C: RemoteChannel> AskpassChannelClient<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl<C: RemoteChannel> AskpassService for AskpassChannelClient<C> {
    async fn askpass(&self, id: &str, host: &str, command: &str) -> Result<Credentials> {
        self.channel.call_with(ASKPASS, &[id, host, command]).typed().await
    }
}
