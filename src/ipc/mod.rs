//! Channel protocol: typed request/response messages over any ordered
//! message transport.
//!
//! This module provides:
//! - Message types and the transport trait
//! - The channel client (caller side) and channel server (callee side)
//! - A point-to-point peer and a multi-client server with routing

pub mod call;
pub mod client;
pub mod messages;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod server;

pub use call::{CallHandle, CancelHandle};
pub use client::{ChannelClient, ChannelProxy, RemoteChannel};
pub use messages::{Message, MessageKind};
pub use peer::IpcClient;
pub use protocol::{MessagePassingProtocol, Protocol};
pub use router::{ClientConnection, ClientRouter, IpcServer, RoutedChannel, StaticRouter};
pub use server::{CallbackChannel, Channel, ChannelServer, Progress};
