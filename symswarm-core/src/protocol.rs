//! Peer wire messages: a closed set of kinds keyed by message id.

use crate::wire::{self, Frame, FrameEncodeError};

pub const MSG_CHOKE: u8 = 0;
pub const MSG_UNCHOKE: u8 = 1;
pub const MSG_INTERESTED: u8 = 2;
pub const MSG_NOT_INTERESTED: u8 = 3;
pub const MSG_HAVE: u8 = 4;
pub const MSG_BITFIELD: u8 = 5;
pub const MSG_REQUEST: u8 = 6;
/// Id 7 carries symbols: `block_id (u32) || symbol_id (u32) || data`.
pub const MSG_SYMBOL: u8 = 7;

/// All wire message types. Integers are big-endian, fixed width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// A block has been completed by the sender.
    Have { block_id: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    /// One symbol of one block.
    Symbol {
        block_id: u32,
        symbol_id: u32,
        data: Vec<u8>,
    },
    /// Any id outside the known set. Kept so callers can log and skip it.
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Serialize into a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        match self {
            Message::KeepAlive => Ok(wire::encode_keep_alive()),
            Message::Choke => wire::encode_frame(MSG_CHOKE, &[]),
            Message::Unchoke => wire::encode_frame(MSG_UNCHOKE, &[]),
            Message::Interested => wire::encode_frame(MSG_INTERESTED, &[]),
            Message::NotInterested => wire::encode_frame(MSG_NOT_INTERESTED, &[]),
            Message::Have { block_id } => wire::encode_frame(MSG_HAVE, &block_id.to_be_bytes()),
            Message::Bitfield(bits) => wire::encode_frame(MSG_BITFIELD, bits),
            Message::Request {
                index,
                begin,
                length,
            } => {
                let mut p = Vec::with_capacity(12);
                p.extend_from_slice(&index.to_be_bytes());
                p.extend_from_slice(&begin.to_be_bytes());
                p.extend_from_slice(&length.to_be_bytes());
                wire::encode_frame(MSG_REQUEST, &p)
            }
            Message::Symbol {
                block_id,
                symbol_id,
                data,
            } => {
                let mut p = Vec::with_capacity(8 + data.len());
                p.extend_from_slice(&block_id.to_be_bytes());
                p.extend_from_slice(&symbol_id.to_be_bytes());
                p.extend_from_slice(data);
                wire::encode_frame(MSG_SYMBOL, &p)
            }
            Message::Unknown { id, payload } => wire::encode_frame(*id, payload),
        }
    }

    /// Interpret a decoded frame.
    pub fn from_frame(frame: Frame) -> Result<Message, MessageError> {
        let Some(id) = frame.id else {
            return Ok(Message::KeepAlive);
        };
        let p = frame.payload;
        let msg = match id {
            MSG_CHOKE => Message::Choke,
            MSG_UNCHOKE => Message::Unchoke,
            MSG_INTERESTED => Message::Interested,
            MSG_NOT_INTERESTED => Message::NotInterested,
            MSG_HAVE => Message::Have {
                block_id: read_u32(&p, 0, id)?,
            },
            MSG_BITFIELD => Message::Bitfield(p),
            MSG_REQUEST => Message::Request {
                index: read_u32(&p, 0, id)?,
                begin: read_u32(&p, 4, id)?,
                length: read_u32(&p, 8, id)?,
            },
            MSG_SYMBOL => {
                let block_id = read_u32(&p, 0, id)?;
                let symbol_id = read_u32(&p, 4, id)?;
                Message::Symbol {
                    block_id,
                    symbol_id,
                    data: p[8..].to_vec(),
                }
            }
            _ => Message::Unknown { id, payload: p },
        };
        Ok(msg)
    }
}

fn read_u32(p: &[u8], at: usize, id: u8) -> Result<u32, MessageError> {
    p.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(MessageError::Malformed { id, len: p.len() })
}

/// Payload shorter than the fixed fields of its message kind.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("malformed payload for message id {id} ({len} bytes)")]
    Malformed { id: u8, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_frame;

    fn roundtrip(msg: Message) -> Message {
        let bytes = msg.encode().unwrap();
        let (frame, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        Message::from_frame(frame).unwrap()
    }

    #[test]
    fn symbol_payload_layout() {
        let bytes = Message::Symbol {
            block_id: 2,
            symbol_id: 3,
            data: b"xy".to_vec(),
        }
        .encode()
        .unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 11, 7, 0, 0, 0, 2, 0, 0, 0, 3, b'x', b'y']);
    }

    #[test]
    fn known_messages_roundtrip() {
        let all = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { block_id: 42 },
            Message::Bitfield(vec![0b1010_0000]),
            Message::Request {
                index: 1,
                begin: 16_384,
                length: 16_384,
            },
            Message::Symbol {
                block_id: 3,
                symbol_id: 99,
                data: vec![7u8; 16_000],
            },
        ];
        for msg in all {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn unknown_id_is_preserved() {
        let msg = roundtrip(Message::Unknown {
            id: 20,
            payload: b"ext".to_vec(),
        });
        assert_eq!(
            msg,
            Message::Unknown {
                id: 20,
                payload: b"ext".to_vec()
            }
        );
    }

    #[test]
    fn oversize_symbol_refused() {
        let msg = Message::Symbol {
            block_id: 0,
            symbol_id: 0,
            data: vec![0u8; wire::MAX_FRAME_LEN as usize],
        };
        assert!(matches!(msg.encode(), Err(FrameEncodeError::TooLarge(_))));
    }

    #[test]
    fn short_have_is_malformed() {
        let frame = Frame {
            id: Some(MSG_HAVE),
            payload: vec![0, 1],
        };
        assert_eq!(
            Message::from_frame(frame),
            Err(MessageError::Malformed { id: 4, len: 2 })
        );
    }

    #[test]
    fn symbol_with_empty_data() {
        let frame = Frame {
            id: Some(MSG_SYMBOL),
            payload: vec![0, 0, 0, 1, 0, 0, 0, 2],
        };
        assert_eq!(
            Message::from_frame(frame).unwrap(),
            Message::Symbol {
                block_id: 1,
                symbol_id: 2,
                data: vec![]
            }
        );
    }
}
