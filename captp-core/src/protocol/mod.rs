// Connection-level CapTP: the four-table state machine and everything it
// bookkeeps. Leaves first; `session` wires the stack to a transport.

pub mod cap;
pub mod engine;
pub mod message;
pub mod promise;
pub mod session;
pub mod table;
