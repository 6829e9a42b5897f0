// An in-process transport pair: two sessions wired back to back through
// bounded channels. The workhorse of the end-to-end tests.

use async_trait::async_trait;
use captp_core::transport::{RpcTransport, TransportError, TransportRx, TransportTx};
use captp_core::Message;
use tokio::sync::mpsc;

/// Two connected transports. Frames sent on one side arrive on the other,
/// reliably and in order; `capacity` bounds the in-flight window.
pub fn memory_pipe(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemoryTransport {
            tx: MemoryTx { tx: Some(a_tx) },
            rx: MemoryRx { rx: a_rx },
        },
        MemoryTransport {
            tx: MemoryTx { tx: Some(b_tx) },
            rx: MemoryRx { rx: b_rx },
        },
    )
}

#[derive(Debug)]
pub struct MemoryTransport {
    tx: MemoryTx,
    rx: MemoryRx,
}

impl RpcTransport for MemoryTransport {
    type Tx = MemoryTx;
    type Rx = MemoryRx;

    fn split(self) -> (MemoryTx, MemoryRx) {
        (self.tx, self.rx)
    }
}

#[derive(Debug)]
pub struct MemoryTx {
    tx: Option<mpsc::Sender<Message>>,
}

#[async_trait]
impl TransportTx for MemoryTx {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryRx {
    rx: mpsc::Receiver<Message>,
}

#[async_trait]
impl TransportRx for MemoryRx {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.rx.recv().await)
    }
}
