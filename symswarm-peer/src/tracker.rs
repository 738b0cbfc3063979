//! HTTP announce: register with the tracker and fetch the swarm's peer list.

use std::net::{SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use symswarm_core::tracker::{parse_announce_response, AnnounceResponse};
use symswarm_core::{InfoHash, PeerId};

/// Everything but the RFC 3986 unreserved set is escaped.
const QUERY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Announce endpoint for a tracker base URL (`/announce` appended unless already present).
pub fn announce_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/announce") {
        base.to_string()
    } else {
        format!("{base}/announce")
    }
}

/// Build announce URL with query parameters. Raw id bytes are percent-encoded.
pub fn build_announce_url(base: &str, info_hash: &InfoHash, peer_id: &PeerId, port: u16) -> String {
    let mut url = announce_endpoint(base);
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str("info_hash=");
    url.push_str(&percent_encode(info_hash.as_bytes(), QUERY_SET).to_string());
    url.push_str("&peer_id=");
    url.push_str(&percent_encode(peer_id.as_bytes(), QUERY_SET).to_string());
    url.push_str(&format!("&port={port}"));
    url
}

/// Perform HTTP GET announce.
pub async fn announce(
    base: &str,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
) -> Result<AnnounceResponse> {
    let url = build_announce_url(base, info_hash, peer_id, port);
    tracing::debug!(%url, "announcing");
    let resp = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .context("tracker request failed")?;
    let status = resp.status();
    let body = resp.bytes().await.context("reading tracker response")?;
    // Refusals carry a bencoded failure reason whatever the status.
    parse_announce_response(&body)
        .with_context(|| format!("decoding tracker response (HTTP {status})"))
}

/// Peers to dial: every entry except the ones advertising our own listening port.
pub fn remote_peers(resp: &AnnounceResponse, listen_port: u16) -> Vec<SocketAddr> {
    resp.peers
        .iter()
        .filter(|p| p.port() != listen_port)
        .map(|p: &SocketAddrV4| SocketAddr::V4(*p))
        .collect()
}
