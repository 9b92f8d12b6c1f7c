use crate::core::{Block, Transaction};
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Upper bound on one frame. A full sync reply of `max_blocks_per_sync` blocks
/// with 100 claims each stays well below this.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Gossip messages. On the wire each one is a JSON object tagged with `type`.
///
/// `new_block` and `new_tx` carry the sender's listening port so the receiver
/// can skip the sender when it passes them on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        version: String,
        height: u64,
        port: u16,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    GetBlocks {
        start: u64,
    },
    Blocks {
        blocks: Vec<Block>,
    },
    NewBlock {
        block: Block,
        port: u16,
    },
    NewTx {
        transaction: Transaction,
        port: u16,
    },
    GetPeers,
    Peers {
        peers: Vec<String>,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::GetBlocks { .. } => "get_blocks",
            Message::Blocks { .. } => "blocks",
            Message::NewBlock { .. } => "new_block",
            Message::NewTx { .. } => "new_tx",
            Message::GetPeers => "get_peers",
            Message::Peers { .. } => "peers",
        }
    }
}

/// 4-byte big-endian length followed by the JSON body
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(BlockchainError::Network(format!(
            "Frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&encode_frame(message)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Ok(None) means the other side closed the connection cleanly
/// between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BlockchainError::Network(format!(
            "Peer announced a {len} byte frame, limit is {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Message::GetPeers).unwrap();
        write_frame(&mut buf, &Message::GetBlocks { start: 3 }).unwrap();
        assert_eq!(&buf[..4], &(br#"{"type":"get_peers"}"#.len() as u32).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Message::GetPeers));
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            Some(Message::GetBlocks { start: 3 })
        );
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_wire_shape_is_tagged_json() {
        let hello = Message::Hello {
            version: "1.0.0".to_string(),
            height: 7,
            port: 8333,
        };
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["height"], 7);
        assert_eq!(hello.kind(), "hello");

        let parsed: Message = serde_json::from_str(r#"{"type":"pong","timestamp":5}"#).unwrap();
        assert_eq!(parsed, Message::Pong { timestamp: 5 });
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BlockchainError::Network(_)));
    }

    #[test]
    fn test_truncated_body_is_error() {
        let mut buf = 100u32.to_be_bytes().to_vec();
        buf.extend_from_slice(br#"{"type":"#);
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_unknown_type_is_error() {
        let body = br#"{"type":"launch_missiles"}"#;
        let mut buf = (body.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(body);
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }
}
