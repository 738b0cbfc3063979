//! Framing: handshake codec plus 4-byte big-endian length prefix + message id + payload.

use crate::identity::{InfoHash, PeerId, ID_LEN};

/// Protocol name carried in the handshake.
pub const PROTOCOL_NAME: &[u8] = b"BitTorrent protocol";
pub const RESERVED_LEN: usize = 8;
/// Fixed handshake size: name length byte, name, reserved, info hash, peer id.
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_NAME.len() + RESERVED_LEN + ID_LEN + ID_LEN;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Decoded handshake fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

/// Encode a handshake: `len(name) || name || 8 zero bytes || info_hash || peer_id`.
pub fn encode_handshake(info_hash: &InfoHash, peer_id: &PeerId) -> Vec<u8> {
    let mut out = Vec::with_capacity(HANDSHAKE_LEN);
    out.push(PROTOCOL_NAME.len() as u8);
    out.extend_from_slice(PROTOCOL_NAME);
    out.extend_from_slice(&[0u8; RESERVED_LEN]);
    out.extend_from_slice(info_hash.as_bytes());
    out.extend_from_slice(peer_id.as_bytes());
    out
}

/// Decode a handshake. Peer id is the last 20 bytes; info hash the 20 bytes before it.
pub fn decode_handshake(bytes: &[u8]) -> Result<Handshake, HandshakeError> {
    if bytes.len() < HANDSHAKE_LEN {
        return Err(HandshakeError::Length(bytes.len()));
    }
    let name_len = bytes[0] as usize;
    if name_len != PROTOCOL_NAME.len() || &bytes[1..1 + name_len] != PROTOCOL_NAME {
        return Err(HandshakeError::ProtocolName);
    }
    let end = bytes.len();
    let mut peer_id = [0u8; ID_LEN];
    peer_id.copy_from_slice(&bytes[end - ID_LEN..]);
    let mut info_hash = [0u8; ID_LEN];
    info_hash.copy_from_slice(&bytes[end - 2 * ID_LEN..end - ID_LEN]);
    Ok(Handshake {
        info_hash: InfoHash(info_hash),
        peer_id: PeerId(peer_id),
    })
}

/// Malformed handshake.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake too short: {0} bytes")]
    Length(usize),
    #[error("protocol name mismatch")]
    ProtocolName,
}

/// One frame off the wire. `id` is `None` for a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn keep_alive() -> Self {
        Frame {
            id: None,
            payload: Vec::new(),
        }
    }
}

/// Encode a message frame: `u32 BE (1 + len(payload)) || id || payload`.
/// The frame length may not exceed `MAX_FRAME_LEN`, the bound the decoder enforces.
pub fn encode_frame(id: u8, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if payload.len() >= MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let len = 1 + payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + 1 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(id);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("payload too large for one frame: {0} bytes")]
    TooLarge(usize),
}

/// Keep-alive: a zero length prefix and nothing else.
pub fn encode_keep_alive() -> Vec<u8> {
    0u32.to_be_bytes().to_vec()
}

/// Parse a length prefix, rejecting oversize frames before anything is allocated.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len as usize)
}

/// Split a frame body (the `length` bytes after the prefix) into id and payload.
pub fn split_body(mut body: Vec<u8>) -> Frame {
    if body.is_empty() {
        return Frame::keep_alive();
    }
    let payload = body.split_off(1);
    Frame {
        id: Some(body[0]),
        payload,
    }
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let body = bytes[LEN_SIZE..LEN_SIZE + len].to_vec();
    Ok((split_body(body), LEN_SIZE + len))
}

/// Error decoding a frame from a buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
}
