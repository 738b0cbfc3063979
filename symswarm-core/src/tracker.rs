//! Tracker announce contract: compact peer lists and the swarm directory.

use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::identity::InfoHash;

/// Seconds between announces advertised by the directory.
pub const DEFAULT_INTERVAL: u32 = 120;
const COMPACT_ENTRY_LEN: usize = 6;

/// Decoded announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Deserialize, Serialize)]
struct RawResponse {
    #[serde(
        rename = "failure reason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    failure: Option<String>,
    #[serde(default)]
    interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peers: Option<ByteBuf>,
}

/// Parse a bencoded `{interval, peers}` response with compact IPv4 peers, or a
/// `{failure reason}` rejection.
pub fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let raw: RawResponse = serde_bencode::from_bytes(bytes)?;
    if let Some(reason) = raw.failure {
        return Err(TrackerError::Failure(reason));
    }
    let peers = raw.peers.ok_or(TrackerError::MissingPeers)?;
    Ok(AnnounceResponse {
        interval: raw.interval,
        peers: parse_compact_peers(&peers)?,
    })
}

pub fn encode_announce_response(resp: &AnnounceResponse) -> Result<Vec<u8>, TrackerError> {
    let raw = RawResponse {
        failure: None,
        interval: resp.interval,
        peers: Some(ByteBuf::from(encode_compact_peers(&resp.peers))),
    };
    Ok(serde_bencode::to_bytes(&raw)?)
}

#[derive(Serialize)]
struct RawFailure<'a> {
    #[serde(rename = "failure reason")]
    reason: &'a str,
}

/// `{failure reason: reason}`, the body of a refused announce.
pub fn encode_failure(reason: &str) -> Result<Vec<u8>, TrackerError> {
    Ok(serde_bencode::to_bytes(&RawFailure { reason })?)
}

/// 6-byte entries: IPv4 address then big-endian port.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    if bytes.len() % COMPACT_ENTRY_LEN != 0 {
        return Err(TrackerError::CompactPeers(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(COMPACT_ENTRY_LEN)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

pub fn encode_compact_peers(peers: &[SocketAddrV4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * COMPACT_ENTRY_LEN);
    for p in peers {
        out.extend_from_slice(&p.ip().octets());
        out.extend_from_slice(&p.port().to_be_bytes());
    }
    out
}

/// Registry of participants per content identifier.
#[derive(Debug, Default)]
pub struct SwarmDirectory {
    swarms: HashMap<InfoHash, BTreeSet<SocketAddrV4>>,
}

impl SwarmDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer` in the swarm and return every member, the caller included.
    pub fn announce(&mut self, info_hash: InfoHash, peer: SocketAddrV4) -> AnnounceResponse {
        let swarm = self.swarms.entry(info_hash).or_default();
        swarm.insert(peer);
        AnnounceResponse {
            interval: DEFAULT_INTERVAL,
            peers: swarm.iter().copied().collect(),
        }
    }

    pub fn swarm_size(&self, info_hash: &InfoHash) -> usize {
        self.swarms.get(info_hash).map_or(0, BTreeSet::len)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("compact peer list is {0} bytes, not a multiple of 6")]
    CompactPeers(usize),
    #[error("response has no peers")]
    MissingPeers,
    #[error("tracker refused announce: {0}")]
    Failure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_response() {
        let raw = b"d8:intervali120e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x00\x50e";
        let resp = parse_announce_response(raw).unwrap();
        assert_eq!(resp.interval, 120);
        assert_eq!(
            resp.peers,
            vec![
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
            ]
        );
    }

    #[test]
    fn empty_peer_list() {
        let resp = parse_announce_response(b"d8:intervali60e5:peers0:e").unwrap();
        assert!(resp.peers.is_empty());
    }

    #[test]
    fn missing_peers_fails() {
        assert!(matches!(
            parse_announce_response(b"d8:intervali60ee"),
            Err(TrackerError::MissingPeers)
        ));
    }

    #[test]
    fn malformed_bencode_fails() {
        assert!(matches!(
            parse_announce_response(b"d8:interval"),
            Err(TrackerError::Bencode(_))
        ));
    }

    #[test]
    fn failure_reason_surfaces() {
        let body = encode_failure("unknown swarm").unwrap();
        assert_eq!(body, b"d14:failure reason13:unknown swarme".to_vec());
        assert!(matches!(
            parse_announce_response(&body),
            Err(TrackerError::Failure(r)) if r == "unknown swarm"
        ));
    }

    #[test]
    fn ragged_peers_fail() {
        assert!(matches!(
            parse_announce_response(b"d8:intervali60e5:peers5:abcdee"),
            Err(TrackerError::CompactPeers(5))
        ));
    }

    #[test]
    fn directory_accumulates_swarm() {
        let mut dir = SwarmDirectory::new();
        let ih = InfoHash([1; 20]);
        let a = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000);
        let b = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7001);
        assert_eq!(dir.announce(ih, a).peers, vec![a]);
        let resp = dir.announce(ih, b);
        assert_eq!(resp.peers, vec![a, b]);
        assert_eq!(dir.announce(ih, a).peers.len(), 2);
        assert_eq!(dir.swarm_size(&ih), 2);
        assert_eq!(dir.swarm_size(&InfoHash([2; 20])), 0);

        let decoded = parse_announce_response(&encode_announce_response(&resp).unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }
}
