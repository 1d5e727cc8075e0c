//! chanipc - channel-based inter-process communication
//!
//! Named channels of remotely callable commands over any ordered message
//! transport: request ids, handshake buffering, progress, cancellation and
//! routing of calls across many connected clients.

pub mod channels;
pub mod error;
pub mod event;
pub mod ipc;
pub mod transport;

pub use error::{IpcError, RemoteError, Result};
pub use event::{Disposable, Emitter, EmitterOptions, Event};
