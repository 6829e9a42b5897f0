// Frames over any reliable ordered byte stream.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use captp_core::codec::{encode_frame, try_decode_frame, FrameFormat};
use captp_core::transport::{RpcTransport, TransportError, TransportRx, TransportTx};
use captp_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

/// A duplex byte stream carrying delimited frames.
pub struct FramedTransport<S> {
    stream: S,
    format: FrameFormat,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S, format: FrameFormat) -> Self {
        FramedTransport { stream, format }
    }
}

impl<S> RpcTransport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Tx = FramedTx<WriteHalf<S>>;
    type Rx = FramedRx<ReadHalf<S>>;

    fn split(self) -> (Self::Tx, Self::Rx) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FramedTx {
                writer: write,
                format: self.format,
            },
            FramedRx {
                reader: read,
                buffer: BytesMut::with_capacity(4096),
                format: self.format,
            },
        )
    }
}

pub struct FramedTx<W> {
    writer: W,
    format: FrameFormat,
}

#[async_trait]
impl<W> TransportTx for FramedTx<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let frame =
            encode_frame(&msg, self.format).map_err(|e| TransportError::Codec(e.message))?;
        trace!(len = frame.len(), "frame out");
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

pub struct FramedRx<R> {
    reader: R,
    buffer: BytesMut,
    format: FrameFormat,
}

#[async_trait]
impl<R> TransportRx for FramedRx<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some((msg, consumed)) = try_decode_frame(&self.buffer, self.format)
                .map_err(|e| TransportError::Codec(e.message))?
            {
                self.buffer.advance(consumed);
                trace!(len = consumed, "frame in");
                return Ok(Some(msg));
            }
            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Codec(
                    "stream ended mid-frame".to_string(),
                ));
            }
        }
    }
}
