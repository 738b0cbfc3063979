//! Identity: 20-byte peer id and 20-byte content identifier (info hash).

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a peer id and of an info hash on the wire.
pub const ID_LEN: usize = 20;

/// Client prefix placed at the front of every generated peer id.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-SW0100-";

/// Peer id carried in the handshake. Always exactly 20 bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId(pub [u8; ID_LEN]);

impl PeerId {
    /// Generate a peer id: fixed client prefix followed by random alphanumerics.
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        let mut rng = rand::thread_rng();
        for b in &mut id[PEER_ID_PREFIX.len()..] {
            *b = rng.sample(Alphanumeric);
        }
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// SHA-1 digest of the descriptor's bencoded `info` dictionary. Identifies a swarm.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; ID_LEN]);

impl InfoHash {
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
