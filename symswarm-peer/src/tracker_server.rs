//! HTTP announce endpoint backed by an in-memory [`SwarmDirectory`].
//!
//! One request per connection: `GET /announce?info_hash=..&peer_id=..&port=..`. The
//! caller is registered under its socket IP and the announced port, and gets back every
//! member of the swarm as a compact peer list.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use symswarm_core::identity::ID_LEN;
use symswarm_core::tracker::{encode_announce_response, encode_failure, SwarmDirectory};
use symswarm_core::InfoHash;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The announce parameters the directory needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceQuery {
    pub info_hash: InfoHash,
    pub port: u16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("info_hash must be 20 bytes, got {0}")]
    InfoHashLength(usize),
    #[error("invalid port")]
    Port,
}

/// Parse an announce query string. Values are percent-decoded to raw bytes.
pub fn parse_announce_query(query: &str) -> Result<AnnounceQuery, QueryError> {
    let mut info_hash = None;
    let mut port = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "info_hash" => info_hash = Some(percent_decode_str(value).collect::<Vec<u8>>()),
            "port" => match value.parse::<u16>() {
                Ok(p) if p != 0 => port = Some(p),
                _ => return Err(QueryError::Port),
            },
            _ => {}
        }
    }
    let raw = info_hash.ok_or(QueryError::Missing("info_hash"))?;
    let bytes: [u8; ID_LEN] = raw
        .as_slice()
        .try_into()
        .map_err(|_| QueryError::InfoHashLength(raw.len()))?;
    Ok(AnnounceQuery {
        info_hash: InfoHash(bytes),
        port: port.ok_or(QueryError::Missing("port"))?,
    })
}

/// Status code and bencoded body for one request head.
fn respond(head: &[u8], remote: SocketAddr, directory: &Mutex<SwarmDirectory>) -> (u16, Vec<u8>) {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(status) if status.is_complete() => {}
        _ => return failure(400, "malformed request"),
    }
    if req.method != Some("GET") {
        return failure(405, "announce is GET only");
    }
    let path = req.path.unwrap_or("");
    let (route, query) = path.split_once('?').unwrap_or((path, ""));
    if !route.trim_end_matches('/').ends_with("/announce") {
        return failure(404, "not found");
    }
    let q = match parse_announce_query(query) {
        Ok(q) => q,
        Err(e) => return failure(400, &e.to_string()),
    };
    let Some(ip) = peer_ipv4(remote.ip()) else {
        return failure(400, "only IPv4 peers are supported");
    };

    let peer = SocketAddrV4::new(ip, q.port);
    let resp = directory.lock().announce(q.info_hash, peer);
    info!(info_hash = %q.info_hash, %peer, swarm = resp.peers.len(), "announce");
    match encode_announce_response(&resp) {
        Ok(body) => (200, body),
        Err(e) => failure(500, &e.to_string()),
    }
}

fn peer_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn failure(status: u16, reason: &str) -> (u16, Vec<u8>) {
    debug!(status, reason, "announce refused");
    (status, encode_failure(reason).unwrap_or_default())
}

fn http_response(status: u16, body: &[u8]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn head_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

async fn read_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !head_complete(&buf) && buf.len() < MAX_REQUEST_HEAD {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    directory: Arc<Mutex<SwarmDirectory>>,
) -> io::Result<()> {
    let head = tokio::time::timeout(READ_TIMEOUT, read_head(&mut stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request head"))??;
    let (status, body) = respond(&head, remote, &directory);
    stream.write_all(&http_response(status, &body)).await?;
    stream.shutdown().await
}

/// Serve announces until `stop` flips.
pub async fn serve(
    listener: TcpListener,
    directory: Arc<Mutex<SwarmDirectory>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok((stream, addr)) => {
                    let directory = directory.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, directory).await {
                            debug!(%addr, error = %e, "tracker connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = stop.changed() => break,
        }
    }
    debug!("tracker stopped");
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use symswarm_core::tracker::{parse_announce_response, TrackerError};
    use symswarm_core::PeerId;

    use super::*;
    use crate::tracker::{announce, build_announce_url};

    fn directory() -> Mutex<SwarmDirectory> {
        Mutex::new(SwarmDirectory::new())
    }

    fn get(path: &str) -> Vec<u8> {
        format!("GET {path} HTTP/1.1\r\nHost: tracker\r\n\r\n").into_bytes()
    }

    fn query_of(url: &str) -> &str {
        url.split_once('?').map(|(_, q)| q).unwrap_or("")
    }

    fn remote(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn query_from_client_url_parses() {
        let mut ih = [0u8; 20];
        ih[0] = 0xff;
        ih[5] = b'&';
        ih[6] = b'=';
        let url = build_announce_url("http://t:1", &InfoHash(ih), &PeerId::generate(), 6881);
        let q = parse_announce_query(query_of(&url)).unwrap();
        assert_eq!(q.info_hash, InfoHash(ih));
        assert_eq!(q.port, 6881);
    }

    #[test]
    fn bad_queries_rejected() {
        assert_eq!(
            parse_announce_query("port=1"),
            Err(QueryError::Missing("info_hash"))
        );
        assert_eq!(
            parse_announce_query("info_hash=abc&port=1"),
            Err(QueryError::InfoHashLength(3))
        );
        let ih = "%01".repeat(20);
        assert_eq!(
            parse_announce_query(&format!("info_hash={ih}")),
            Err(QueryError::Missing("port"))
        );
        assert_eq!(
            parse_announce_query(&format!("info_hash={ih}&port=70000")),
            Err(QueryError::Port)
        );
        assert_eq!(
            parse_announce_query(&format!("info_hash={ih}&port=0")),
            Err(QueryError::Port)
        );
    }

    #[test]
    fn announces_accumulate_per_swarm() {
        let dir = directory();
        let ih = InfoHash([3; 20]);
        let first = build_announce_url("http://t", &ih, &PeerId::generate(), 7000);
        let (status, _) = respond(&get(&first[8..]), remote(50_000), &dir);
        assert_eq!(status, 200);

        let second = build_announce_url("http://t", &ih, &PeerId::generate(), 7001);
        let (status, body) = respond(&get(&second[8..]), remote(50_001), &dir);
        assert_eq!(status, 200);
        let resp = parse_announce_response(&body).unwrap();
        assert_eq!(resp.interval, 120);
        assert_eq!(
            resp.peers,
            vec![
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000),
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7001),
            ]
        );

        // Another swarm sees only itself.
        let other = build_announce_url("http://t", &InfoHash([4; 20]), &PeerId::generate(), 7002);
        let (_, body) = respond(&get(&other[8..]), remote(50_002), &dir);
        assert_eq!(parse_announce_response(&body).unwrap().peers.len(), 1);
    }

    #[test]
    fn refusals_carry_failure_reason() {
        let dir = directory();
        let (status, body) = respond(&get("/scrape"), remote(1), &dir);
        assert_eq!(status, 404);
        assert!(matches!(
            parse_announce_response(&body),
            Err(TrackerError::Failure(_))
        ));

        let (status, _) = respond(b"POST /announce HTTP/1.1\r\n\r\n", remote(1), &dir);
        assert_eq!(status, 405);

        let (status, _) = respond(b"GET /announce", remote(1), &dir);
        assert_eq!(status, 400);

        let (status, body) = respond(&get("/announce?port=1"), remote(1), &dir);
        assert_eq!(status, 400);
        assert!(matches!(
            parse_announce_response(&body),
            Err(TrackerError::Failure(r)) if r == "missing info_hash"
        ));
    }

    #[test]
    fn ipv6_peers_refused_unless_mapped() {
        let dir = directory();
        let url = build_announce_url("http://t", &InfoHash([5; 20]), &PeerId::generate(), 7000);
        let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, 1));
        assert_eq!(respond(&get(&url[8..]), v6, &dir).0, 400);

        let mapped = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 9).to_ipv6_mapped(), 1));
        let (status, body) = respond(&get(&url[8..]), mapped, &dir);
        assert_eq!(status, 200);
        assert_eq!(
            parse_announce_response(&body).unwrap().peers,
            vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 7000)]
        );
    }

    #[test]
    fn response_framing() {
        let out = http_response(200, b"d5:peers0:e");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\nd5:peers0:e"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_announces_against_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(
            listener,
            Arc::new(directory()),
            stop_rx,
        ));

        let ih = InfoHash([8; 20]);
        let first = announce(&base, &ih, &PeerId::generate(), 7100).await.unwrap();
        assert_eq!(first.peers, vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7100)]);
        let second = announce(&base, &ih, &PeerId::generate(), 7101).await.unwrap();
        assert_eq!(second.peers.len(), 2);

        stop_tx.send_replace(true);
        server.await.unwrap();
    }
}
