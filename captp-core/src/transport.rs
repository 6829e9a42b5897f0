// The byte-level transport is a collaborator; the session only consumes
// these two halves. Concrete transports live in captp-transport.

use crate::protocol::message::Message;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Outbound half: reliable, ordered delivery of frames.
#[async_trait]
pub trait TransportTx: Send + 'static {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half: the next frame from the peer, or `None` at end of stream.
#[async_trait]
pub trait TransportRx: Send + 'static {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;
}

/// A transport that can be torn into its two independently-owned halves.
pub trait RpcTransport {
    type Tx: TransportTx;
    type Rx: TransportRx;

    fn split(self) -> (Self::Tx, Self::Rx);
}
