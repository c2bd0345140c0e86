//! Framing of [`Message`]s onto channel frames.
//!
//! # Broker mode
//!
//! ```text
//! control messages: text frame, JSON
//! chunks:           binary frame
//!   [4 bytes BE: header_len][header_len bytes: JSON ChunkHeader][rest: raw payload]
//! ```
//!
//! # Manual mode
//!
//! Every message is a JSON text frame. Chunk payloads travel as base64 data
//! URLs inside the JSON and are decoded before reaching the transfer layer.

use peerdrop_protocol::{ChunkHeader, ChunkMessage, Message};

use crate::DataChannelError;

/// Which underlying link a channel runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// Broker-assisted link; binary payloads are carried natively.
    Broker,
    /// Manually signaled link; text-only framing.
    Manual,
}

/// A unit handed to or received from the underlying transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Size in bytes, as counted by flow control.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encodes a message for the given channel mode.
pub fn encode(mode: ChannelMode, msg: &Message) -> Result<Frame, DataChannelError> {
    match (mode, msg) {
        (ChannelMode::Broker, Message::Chunk(chunk)) => {
            let (header, payload) = chunk.clone().into_parts();
            Ok(Frame::Binary(encode_binary_chunk(&header, &payload)?))
        }
        _ => Ok(Frame::Text(serde_json::to_string(msg)?)),
    }
}

/// Decodes a frame received on a channel of the given mode.
pub fn decode(mode: ChannelMode, frame: Frame) -> Result<Message, DataChannelError> {
    match frame {
        Frame::Text(text) => Ok(serde_json::from_str(&text)?),
        Frame::Binary(data) => match mode {
            ChannelMode::Broker => parse_binary_chunk(&data).map(Message::Chunk),
            ChannelMode::Manual => Err(DataChannelError::Protocol(
                "binary frame on a text-only channel".into(),
            )),
        },
    }
}

/// Encodes a binary chunk frame.
pub fn encode_binary_chunk(
    header: &ChunkHeader,
    payload: &[u8],
) -> Result<Vec<u8>, DataChannelError> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header_json.len())
        .map_err(|_| DataChannelError::Protocol("chunk header too large".into()))?;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parses a binary chunk frame.
pub fn parse_binary_chunk(data: &[u8]) -> Result<ChunkMessage, DataChannelError> {
    if data.len() < 4 {
        return Err(DataChannelError::Protocol(
            "binary frame too short (need at least 4 bytes)".into(),
        ));
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() - 4 < header_len {
        return Err(DataChannelError::Protocol(format!(
            "header truncated: expected {header_len} bytes, got {}",
            data.len() - 4
        )));
    }

    let header: ChunkHeader = serde_json::from_slice(&data[4..4 + header_len])?;
    if header.msg_type != ChunkHeader::TYPE {
        return Err(DataChannelError::Protocol(format!(
            "unexpected binary frame type: {}",
            header.msg_type
        )));
    }

    Ok(ChunkMessage::from_parts(header, data[4 + header_len..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_protocol::TransferAccepted;

    fn chunk() -> Message {
        Message::Chunk(ChunkMessage {
            transfer_id: "t1".into(),
            name: "photo.png".into(),
            index: 2,
            total: 3,
            data: vec![0, 159, 146, 150, 255],
        })
    }

    #[test]
    fn broker_chunk_is_binary() {
        let frame = encode(ChannelMode::Broker, &chunk()).unwrap();
        let Frame::Binary(bytes) = &frame else {
            panic!("expected binary frame");
        };
        // Payload sits raw at the tail.
        assert!(bytes.ends_with(&[0, 159, 146, 150, 255]));
        assert_eq!(decode(ChannelMode::Broker, frame).unwrap(), chunk());
    }

    #[test]
    fn manual_chunk_is_text_with_data_url() {
        let frame = encode(ChannelMode::Manual, &chunk()).unwrap();
        let Frame::Text(text) = &frame else {
            panic!("expected text frame");
        };
        assert!(text.contains("data:application/octet-stream;base64,"));
        assert_eq!(decode(ChannelMode::Manual, frame).unwrap(), chunk());
    }

    #[test]
    fn control_messages_are_text_in_both_modes() {
        let msg = Message::TransferAccepted(TransferAccepted {
            transfer_id: "t1".into(),
            resume_index: 0,
        });
        for mode in [ChannelMode::Broker, ChannelMode::Manual] {
            let frame = encode(mode, &msg).unwrap();
            assert!(matches!(frame, Frame::Text(_)));
            assert_eq!(decode(mode, frame).unwrap(), msg);
        }
    }

    #[test]
    fn manual_rejects_binary_frames() {
        let frame = encode(ChannelMode::Broker, &chunk()).unwrap();
        assert!(matches!(
            decode(ChannelMode::Manual, frame),
            Err(DataChannelError::Protocol(_))
        ));
    }

    #[test]
    fn short_binary_frame_rejected() {
        assert!(parse_binary_chunk(&[0, 0]).is_err());
    }

    #[test]
    fn truncated_header_rejected() {
        let mut data = 100u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"{}");
        assert!(matches!(
            parse_binary_chunk(&data),
            Err(DataChannelError::Protocol(_))
        ));
    }

    #[test]
    fn foreign_binary_type_rejected() {
        let header = ChunkHeader {
            msg_type: "artwork".into(),
            transfer_id: "t1".into(),
            name: "x".into(),
            index: 0,
            total: 1,
        };
        let data = encode_binary_chunk(&header, b"x").unwrap();
        assert!(parse_binary_chunk(&data).is_err());
    }

    #[test]
    fn empty_payload_chunk() {
        let header = ChunkHeader {
            msg_type: ChunkHeader::TYPE.into(),
            transfer_id: "t1".into(),
            name: "x".into(),
            index: 0,
            total: 1,
        };
        let data = encode_binary_chunk(&header, &[]).unwrap();
        assert!(parse_binary_chunk(&data).unwrap().data.is_empty());
    }
}
