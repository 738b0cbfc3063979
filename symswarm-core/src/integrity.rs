//! Integrity: SHA-1 digests for info hashes and per-piece checks of a reassembled file.

use sha1::{Digest, Sha1};

pub const DIGEST_LEN: usize = 20;

/// SHA-1 of a byte slice.
pub fn sha1(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest of every `piece_length` slice of `data`, in order.
pub fn piece_hashes(data: &[u8], piece_length: u32) -> Vec<[u8; DIGEST_LEN]> {
    if piece_length == 0 {
        return Vec::new();
    }
    data.chunks(piece_length as usize).map(sha1).collect()
}

/// Check a whole file against the descriptor's piece digests.
pub fn verify_pieces(
    data: &[u8],
    piece_length: u32,
    expected: &[[u8; DIGEST_LEN]],
) -> Result<(), IntegrityError> {
    let actual = piece_hashes(data, piece_length);
    if actual.len() != expected.len() {
        return Err(IntegrityError::PieceCount {
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    match actual.iter().zip(expected).position(|(a, e)| a != e) {
        Some(index) => Err(IntegrityError::Mismatch { index }),
        None => Ok(()),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("expected {expected} pieces, file has {actual}")]
    PieceCount { expected: usize, actual: usize },
    #[error("piece {index} digest mismatch")]
    Mismatch { index: usize },
}
