use crate::error::RpcError;
use crate::protocol::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// How frames are delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FrameFormat {
    LengthPrefixed,
    #[default]
    NewlineDelimited,
}

pub fn encode_message(msg: &Message) -> Result<Bytes, RpcError> {
    let json = serde_json::to_vec(msg)?;
    Ok(Bytes::from(json))
}

pub fn decode_message(data: &[u8]) -> Result<Message, RpcError> {
    let msg = serde_json::from_slice(data)?;
    Ok(msg)
}

pub fn encode_frame(msg: &Message, format: FrameFormat) -> Result<Bytes, RpcError> {
    let json = serde_json::to_vec(msg)?;

    match format {
        FrameFormat::LengthPrefixed => {
            let len = json.len() as u32;
            let mut buf = BytesMut::with_capacity(4 + json.len());
            buf.put_u32(len);
            buf.put_slice(&json);
            Ok(buf.freeze())
        }
        FrameFormat::NewlineDelimited => {
            let mut buf = BytesMut::with_capacity(json.len() + 1);
            buf.put_slice(&json);
            buf.put_u8(b'\n');
            Ok(buf.freeze())
        }
    }
}

/// Try to decode one frame from the front of `data`. `Ok(None)` means the
/// buffer does not yet hold a complete frame; a malformed frame is an error.
pub fn try_decode_frame(
    data: &[u8],
    format: FrameFormat,
) -> Result<Option<(Message, usize)>, RpcError> {
    match format {
        FrameFormat::LengthPrefixed => {
            if data.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            let total_len = 4 + len;
            if data.len() < total_len {
                return Ok(None);
            }
            let msg = decode_message(&data[4..total_len])?;
            Ok(Some((msg, total_len)))
        }
        FrameFormat::NewlineDelimited => {
            let newline_pos = match data.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => return Ok(None),
            };
            let msg = decode_message(&data[..newline_pos])?;
            Ok(Some((msg, newline_pos + 1)))
        }
    }
}

/// Drain as many complete frames as the buffer holds, consuming them.
pub fn drain_frames(
    buffer: &mut BytesMut,
    format: FrameFormat,
) -> Result<Vec<Message>, RpcError> {
    let mut frames = Vec::new();
    while let Some((msg, consumed)) = try_decode_frame(buffer, format)? {
        buffer.advance(consumed);
        frames.push(msg);
    }
    Ok(frames)
}
