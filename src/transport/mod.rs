//! Transports the channel protocol can run on.
//!
//! - `memory`: in-process pairs and a connection hub
//! - `unix`: Unix domain sockets with newline-delimited JSON frames
//! - `mock`: a recording transport for tests

pub mod codec;
pub mod memory;
pub mod mock;
pub mod unix;

pub use codec::NdJsonCodec;
pub use memory::{MemoryHub, MemoryProtocol, memory_pair};
pub use mock::MockProtocol;
pub use unix::{SocketListener, SocketOptions, UnixProtocol};
