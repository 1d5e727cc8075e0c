//! `launch` channel: forward a second invocation's arguments to the running
//! instance, and ask it for its process id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{IpcError, Result};
use crate::ipc::client::RemoteChannel;
use crate::ipc::server::{Channel, Progress};

pub const LAUNCH_CHANNEL: &str = "launch";

const START: &str = "start";
const GET_MAIN_PROCESS_ID: &str = "get-main-process-id";

/// Argument of the `start` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartArguments {
    pub args: Vec<String>,
    #[serde(default)]
    pub user_env: HashMap<String, String>,
}

#[async_trait]
pub trait LaunchService: Send + Sync {
    /// Handle a launch with the given command line and environment.
    async fn start(&self, args: Vec<String>, user_env: HashMap<String, String>) -> Result<()>;

    async fn main_process_id(&self) -> Result<u32>;
}

/// Serves a [`LaunchService`] as the `launch` channel.
pub struct LaunchChannel {
    service: Arc<dyn LaunchService>,
}

impl LaunchChannel {
    pub fn new(service: Arc<dyn LaunchService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Channel for LaunchChannel {
    async fn call(&self, command: &str, arg: Value, _progress: Progress) -> Result<Value> {
        match command {
            START => {
                let StartArguments { args, user_env } = serde_json::from_value(arg)?;
                self.service.start(args, user_env).await?;
                Ok(Value::Null)
            }
            GET_MAIN_PROCESS_ID => Ok(json!(self.service.main_process_id().await?)),
            other => Err(IpcError::UnknownCommand(other.to_string())),
        }
    }
}

/// Typed caller for a remote `launch` channel.
pub struct LaunchChannelClient<C: RemoteChannel> {
    channel: C,
}

impl<C: RemoteChannel> LaunchChannelClient<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl<C: RemoteChannel> LaunchService for LaunchChannelClient<C> {
    async fn start(&self, args: Vec<String>, user_env: HashMap<String, String>) -> Result<()> {
        let arg = StartArguments { args, user_env };
        self.channel.call_with(START, &arg).await?;
        Ok(())
    }

    async fn main_process_id(&self) -> Result<u32> {
        self.channel.call(GET_MAIN_PROCESS_ID, Value::Null).typed().await
    }
}
