// Concrete transports for captp-core sessions: an in-process pair for
// tests and a framed codec over any async byte stream.

pub mod framed;
pub mod memory;

pub use framed::{FramedRx, FramedTransport, FramedTx};
pub use memory::{memory_pipe, MemoryRx, MemoryTransport, MemoryTx};

pub use captp_core::transport::{RpcTransport, TransportError, TransportRx, TransportTx};
