//! Torrent descriptor: bencoded `{announce, info: {name, piece length, length, pieces}}`.

use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

use crate::identity::InfoHash;
use crate::integrity::{self, DIGEST_LEN};

/// What the transfer engine needs from a descriptor. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    pub announce: String,
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub length: u64,
    /// SHA-1 of each `piece_length` slice of the file.
    pub pieces: Vec<[u8; DIGEST_LEN]>,
}

#[derive(Deserialize)]
struct Envelope {
    announce: String,
    info: Value,
}

#[derive(Debug, Deserialize, Serialize)]
struct InfoDict {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    length: u64,
    pieces: ByteBuf,
}

#[derive(Serialize)]
struct Metainfo<'a> {
    announce: &'a str,
    info: InfoDict,
}

impl ContentDescriptor {
    /// Parse a descriptor file. The info hash covers the `info` dictionary re-encoded in
    /// canonical (sorted key) form, which is byte-identical for well-formed descriptors.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let env: Envelope = serde_bencode::from_bytes(bytes)?;
        let info_bytes = serde_bencode::to_bytes(&env.info)?;
        let info: InfoDict = serde_bencode::from_bytes(&info_bytes)?;
        if info.pieces.len() % DIGEST_LEN != 0 {
            return Err(DescriptorError::Pieces(info.pieces.len()));
        }
        let pieces = info
            .pieces
            .chunks_exact(DIGEST_LEN)
            .map(|c| {
                let mut d = [0u8; DIGEST_LEN];
                d.copy_from_slice(c);
                d
            })
            .collect();
        Ok(Self {
            announce: env.announce,
            info_hash: InfoHash(integrity::sha1(&info_bytes)),
            name: info.name,
            piece_length: info.piece_length,
            length: info.length,
            pieces,
        })
    }
}

/// Build a descriptor for `data`, hashing it in `piece_length` pieces.
pub fn build_metainfo(
    name: &str,
    data: &[u8],
    piece_length: u32,
    announce: &str,
) -> Result<Vec<u8>, DescriptorError> {
    if piece_length == 0 {
        return Err(DescriptorError::PieceLength);
    }
    let pieces: Vec<u8> = integrity::piece_hashes(data, piece_length).concat();
    let meta = Metainfo {
        announce,
        info: InfoDict {
            name: name.to_string(),
            piece_length,
            length: data.len() as u64,
            pieces: ByteBuf::from(pieces),
        },
    };
    Ok(serde_bencode::to_bytes(&meta)?)
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("pieces field is {0} bytes, not a multiple of 20")]
    Pieces(usize),
    #[error("piece length must be non-zero")]
    PieceLength,
}
