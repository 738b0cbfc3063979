//! Peer session state machine. Host-driven: the host owns the socket, passes events in,
//! and performs the returned actions.
//!
//! `Connecting -> Handshaking -> Active -> Closed`, with any failure going straight to
//! `Closed`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::block::Encoder;
use crate::identity::{InfoHash, PeerId};
use crate::protocol::Message;
use crate::scheduler::SymbolScheduler;
use crate::store::{AssemblyStore, SymbolOutcome};
use crate::wire::{self, HandshakeError};

/// Whether this peer's writer duty transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Seed,
    Leech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Action for host to perform.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionAction {
    Send(Message),
    /// Write a completed block under its id.
    PersistBlock { block_id: u32, bytes: Vec<u8> },
    /// Write the reassembled file.
    PersistFile(Vec<u8>),
    /// Drop the connection.
    Close,
}

pub struct PeerSession {
    state: SessionState,
    role: Role,
    info_hash: InfoHash,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    scheduler: Arc<Mutex<SymbolScheduler>>,
    store: Arc<AssemblyStore>,
}

impl PeerSession {
    pub fn new(
        role: Role,
        info_hash: InfoHash,
        local_id: PeerId,
        scheduler: Arc<Mutex<SymbolScheduler>>,
        store: Arc<AssemblyStore>,
    ) -> Self {
        Self {
            state: SessionState::Connecting,
            role,
            info_hash,
            local_id,
            remote_id: None,
            scheduler,
            store,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    /// TCP established. Returns the local handshake to send.
    pub fn on_connected(&mut self) -> Vec<u8> {
        self.state = SessionState::Handshaking;
        wire::encode_handshake(&self.info_hash, &self.local_id)
    }

    /// Remote handshake received. On success the session is active and asks the host to
    /// announce interest.
    pub fn on_handshake(&mut self, bytes: &[u8]) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Handshaking {
            return Err(SessionError::UnexpectedHandshake(self.state));
        }
        let hs = match wire::decode_handshake(bytes) {
            Ok(hs) => hs,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e.into());
            }
        };
        if hs.info_hash != self.info_hash {
            self.state = SessionState::Closed;
            return Err(SessionError::InfoHashMismatch {
                expected: self.info_hash,
                actual: hs.info_hash,
            });
        }
        self.remote_id = Some(hs.peer_id);
        self.state = SessionState::Active;
        debug!(peer = %hs.peer_id, "handshake accepted");
        Ok(vec![SessionAction::Send(Message::Interested)])
    }

    /// Dispatch one inbound message.
    pub fn on_message(&mut self, msg: Message) -> Vec<SessionAction> {
        if self.state != SessionState::Active {
            return Vec::new();
        }
        match msg {
            Message::Symbol {
                block_id,
                symbol_id,
                data,
            } => self.on_symbol(block_id, symbol_id, data),
            Message::Have { block_id } => {
                trace!(block_id, "peer has block");
                Vec::new()
            }
            Message::Unknown { id, payload } => {
                debug!(id, len = payload.len(), "ignoring unknown message");
                Vec::new()
            }
            // Choking, interest, bitfields and requests carry no behaviour here.
            _ => Vec::new(),
        }
    }

    fn on_symbol(&mut self, block_id: u32, symbol_id: u32, data: Vec<u8>) -> Vec<SessionAction> {
        if self.role == Role::Seed {
            return Vec::new();
        }
        self.scheduler.lock().observe_received(block_id, symbol_id);
        match self.store.add_symbol(block_id, symbol_id, data) {
            SymbolOutcome::Pending => Vec::new(),
            SymbolOutcome::Redundant => {
                if self.store.is_complete() {
                    self.close()
                } else {
                    Vec::new()
                }
            }
            SymbolOutcome::Rejected(e) => {
                warn!(block_id, symbol_id, error = %e, "dropping symbol");
                Vec::new()
            }
            SymbolOutcome::BlockComplete(done) => {
                debug!(
                    block_id,
                    source_id = done.source_id,
                    inserted = done.inserted,
                    "block complete"
                );
                let mut actions = Vec::new();
                if done.inserted {
                    actions.push(SessionAction::PersistBlock {
                        block_id: done.block_id,
                        bytes: done.bytes,
                    });
                }
                actions.push(SessionAction::Send(Message::Have { block_id }));
                if let Some(file) = done.file {
                    actions.push(SessionAction::PersistFile(file));
                    actions.extend(self.close());
                } else if self.store.is_complete() {
                    actions.extend(self.close());
                }
                actions
            }
        }
    }

    /// Stream ended, cleanly or mid-frame.
    pub fn on_stream_end(&mut self) {
        self.state = SessionState::Closed;
    }

    fn close(&mut self) -> Vec<SessionAction> {
        self.state = SessionState::Closed;
        vec![SessionAction::Close]
    }
}

/// Order in which a seeding writer walks symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendOrder {
    /// Every block id, every symbol, in id order.
    #[default]
    Sequential,
    /// Only this sender's stripe of symbol ids, via the scheduler. The `slots` senders
    /// feeding a receiver must hold distinct slots for it to see every symbol.
    Strided,
}

/// Writer duty source: yields one `Symbol` message per step, each block id once.
pub struct SymbolFeed {
    encoder: Arc<Encoder>,
    scheduler: Arc<Mutex<SymbolScheduler>>,
    order: SendOrder,
    block_ids: std::ops::Range<u32>,
    current: Option<u32>,
    next_symbol: u32,
}

impl SymbolFeed {
    pub fn new(
        encoder: Arc<Encoder>,
        scheduler: Arc<Mutex<SymbolScheduler>>,
        order: SendOrder,
    ) -> Self {
        let mut block_ids = encoder.block_ids();
        let current = block_ids.next();
        Self {
            encoder,
            scheduler,
            order,
            block_ids,
            current,
            next_symbol: 0,
        }
    }

    fn next_symbol_id(&mut self, block_id: u32) -> Option<u32> {
        match self.order {
            SendOrder::Sequential => {
                let id = self.next_symbol;
                self.next_symbol += 1;
                Some(id)
            }
            SendOrder::Strided => self.scheduler.lock().next_outgoing(block_id),
        }
    }
}

impl Iterator for SymbolFeed {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        loop {
            let block_id = self.current?;
            let symbol = self
                .next_symbol_id(block_id)
                .and_then(|k| self.encoder.symbol(block_id, k).map(|d| (k, d.to_vec())));
            match symbol {
                Some((symbol_id, data)) => {
                    return Some(Message::Symbol {
                        block_id,
                        symbol_id,
                        data,
                    })
                }
                None => {
                    self.current = self.block_ids.next();
                    self.next_symbol = 0;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("malformed handshake: {0}")]
    MalformedHandshake(#[from] HandshakeError),
    #[error("handshake rejected: info hash {actual}, expected {expected}")]
    InfoHashMismatch {
        expected: InfoHash,
        actual: InfoHash,
    },
    #[error("handshake received in state {0:?}")]
    UnexpectedHandshake(SessionState),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CodingParams;

    fn encoder(n: usize, block: u32, symbol: u32, repair: f64) -> Arc<Encoder> {
        let data: Vec<u8> = (0..n).map(|i| (i % 199) as u8).collect();
        Arc::new(
            Encoder::new(
                data,
                CodingParams {
                    block_size: block,
                    symbol_size: symbol,
                    repair_ratio: repair,
                },
            )
            .unwrap(),
        )
    }

    fn scheduler(slots: u32, slot: u32) -> Arc<Mutex<SymbolScheduler>> {
        Arc::new(Mutex::new(SymbolScheduler::new(slots, slot).unwrap()))
    }

    fn session(role: Role, enc: &Encoder) -> PeerSession {
        PeerSession::new(
            role,
            InfoHash([9; 20]),
            PeerId::generate(),
            scheduler(8, 0),
            Arc::new(AssemblyStore::new(*enc.layout())),
        )
    }

    fn active(role: Role, enc: &Encoder) -> PeerSession {
        let mut s = session(role, enc);
        s.on_connected();
        let remote = wire::encode_handshake(&InfoHash([9; 20]), &PeerId::generate());
        s.on_handshake(&remote).unwrap();
        s
    }

    #[test]
    fn handshake_moves_to_active() {
        let enc = encoder(10, 10, 5, 0.0);
        let mut s = session(Role::Leech, &enc);
        assert_eq!(s.state(), SessionState::Connecting);
        let hs = s.on_connected();
        assert_eq!(hs.len(), wire::HANDSHAKE_LEN);
        assert_eq!(s.state(), SessionState::Handshaking);
        let remote_id = PeerId::generate();
        let actions = s
            .on_handshake(&wire::encode_handshake(&InfoHash([9; 20]), &remote_id))
            .unwrap();
        assert_eq!(actions, vec![SessionAction::Send(Message::Interested)]);
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.remote_id(), Some(remote_id));
    }

    #[test]
    fn wrong_info_hash_closes() {
        let enc = encoder(10, 10, 5, 0.0);
        let mut s = session(Role::Leech, &enc);
        s.on_connected();
        let err = s
            .on_handshake(&wire::encode_handshake(&InfoHash([1; 20]), &PeerId::generate()))
            .unwrap_err();
        assert!(matches!(err, SessionError::InfoHashMismatch { .. }));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn corrupted_handshake_closes_and_ignores_messages() {
        let enc = encoder(10, 10, 5, 0.0);
        let mut s = session(Role::Leech, &enc);
        s.on_connected();
        let mut hs = wire::encode_handshake(&InfoHash([9; 20]), &PeerId::generate());
        hs[3] = b'X';
        assert_eq!(
            s.on_handshake(&hs),
            Err(SessionError::MalformedHandshake(HandshakeError::ProtocolName))
        );
        assert_eq!(s.state(), SessionState::Closed);
        let msg = Message::Symbol {
            block_id: 0,
            symbol_id: 0,
            data: enc.symbol(0, 0).unwrap().to_vec(),
        };
        assert!(s.on_message(msg).is_empty());
    }

    #[test]
    fn handshake_before_connect_rejected() {
        let enc = encoder(10, 10, 5, 0.0);
        let mut s = session(Role::Leech, &enc);
        let hs = wire::encode_handshake(&InfoHash([9; 20]), &PeerId::generate());
        assert_eq!(
            s.on_handshake(&hs),
            Err(SessionError::UnexpectedHandshake(SessionState::Connecting))
        );
    }

    #[test]
    fn leecher_reassembles_from_feed() {
        let enc = encoder(95, 40, 10, 0.0);
        let mut leech = active(Role::Leech, &enc);
        let feed = SymbolFeed::new(enc.clone(), scheduler(8, 0), SendOrder::Sequential);
        let mut persisted = Vec::new();
        let mut haves = Vec::new();
        let mut file = None;
        for msg in feed {
            for action in leech.on_message(msg) {
                match action {
                    SessionAction::PersistBlock { block_id, .. } => persisted.push(block_id),
                    SessionAction::Send(Message::Have { block_id }) => haves.push(block_id),
                    SessionAction::PersistFile(bytes) => file = Some(bytes),
                    SessionAction::Close => {}
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
        assert_eq!(persisted, vec![0, 1, 2]);
        assert_eq!(haves, vec![0, 1, 2]);
        let expected: Vec<u8> = (0..95).map(|i| (i % 199) as u8).collect();
        assert_eq!(file, Some(expected));
        assert_eq!(leech.state(), SessionState::Closed);
    }

    #[test]
    fn observed_symbols_reach_scheduler() {
        let enc = encoder(30, 30, 10, 0.0);
        let sched = scheduler(8, 0);
        let mut s = PeerSession::new(
            Role::Leech,
            InfoHash([9; 20]),
            PeerId::generate(),
            sched.clone(),
            Arc::new(AssemblyStore::new(*enc.layout())),
        );
        s.on_connected();
        s.on_handshake(&wire::encode_handshake(&InfoHash([9; 20]), &PeerId::generate()))
            .unwrap();
        s.on_message(Message::Symbol {
            block_id: 0,
            symbol_id: 2,
            data: enc.symbol(0, 2).unwrap().to_vec(),
        });
        assert_eq!(sched.lock().highest_received(0), Some(2));
    }

    #[test]
    fn seeder_ignores_symbols() {
        let enc = encoder(10, 10, 10, 0.0);
        let mut seed = active(Role::Seed, &enc);
        let actions = seed.on_message(Message::Symbol {
            block_id: 0,
            symbol_id: 0,
            data: enc.symbol(0, 0).unwrap().to_vec(),
        });
        assert!(actions.is_empty());
        assert_eq!(seed.state(), SessionState::Active);
    }

    #[test]
    fn second_session_closes_after_file_done() {
        let enc = encoder(20, 10, 10, 1.0);
        let store = Arc::new(AssemblyStore::new(*enc.layout()));
        let mk = || {
            let mut s = PeerSession::new(
                Role::Leech,
                InfoHash([9; 20]),
                PeerId::generate(),
                scheduler(8, 0),
                store.clone(),
            );
            s.on_connected();
            s.on_handshake(&wire::encode_handshake(&InfoHash([9; 20]), &PeerId::generate()))
                .unwrap();
            s
        };
        let mut a = mk();
        let mut b = mk();
        let sym = |id: u32| Message::Symbol {
            block_id: id,
            symbol_id: 0,
            data: enc.symbol(id, 0).unwrap().to_vec(),
        };
        a.on_message(sym(0));
        let done = a.on_message(sym(1));
        assert!(done
            .iter()
            .any(|x| matches!(x, SessionAction::PersistFile(_))));
        // b receives a repair copy of an already stored block.
        assert_eq!(b.on_message(sym(3)), vec![SessionAction::Close]);
        assert_eq!(b.state(), SessionState::Closed);
    }

    #[test]
    fn keep_alive_and_unknown_are_ignored() {
        let enc = encoder(10, 10, 10, 0.0);
        let mut s = active(Role::Leech, &enc);
        assert!(s.on_message(Message::KeepAlive).is_empty());
        assert!(s
            .on_message(Message::Unknown {
                id: 99,
                payload: vec![1, 2]
            })
            .is_empty());
        assert_eq!(s.state(), SessionState::Active);
    }

    #[test]
    fn sequential_feed_covers_every_block_id() {
        let enc = encoder(25, 10, 4, 1.0);
        let feed = SymbolFeed::new(enc.clone(), scheduler(8, 0), SendOrder::Sequential);
        let sent: Vec<(u32, u32)> = feed
            .map(|m| match m {
                Message::Symbol {
                    block_id,
                    symbol_id,
                    ..
                } => (block_id, symbol_id),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // S = 3 (10, 10, 5 bytes) with 3, 3, 2 symbols; R = 3 repeats them.
        let per_block = [3u32, 3, 2, 3, 3, 2];
        let expected: Vec<(u32, u32)> = per_block
            .iter()
            .enumerate()
            .flat_map(|(b, &n)| (0..n).map(move |k| (b as u32, k)))
            .collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn strided_feeds_split_symbols() {
        let enc = encoder(40, 40, 4, 0.0);
        let ids = |slot| -> Vec<u32> {
            SymbolFeed::new(enc.clone(), scheduler(2, slot), SendOrder::Strided)
                .map(|m| match m {
                    Message::Symbol { symbol_id, .. } => symbol_id,
                    other => panic!("unexpected {other:?}"),
                })
                .collect()
        };
        assert_eq!(ids(0), vec![0, 2, 4, 6, 8]);
        assert_eq!(ids(1), vec![1, 3, 5, 7, 9]);
    }

    fn drain_into(leech: &mut PeerSession, feeds: Vec<SymbolFeed>) -> Option<Vec<u8>> {
        let mut feeds: Vec<_> = feeds.into_iter().map(|f| f.fuse()).collect();
        let mut file = None;
        loop {
            let batch: Vec<Message> = feeds.iter_mut().filter_map(|f| f.next()).collect();
            if batch.is_empty() {
                return file;
            }
            for msg in batch {
                for action in leech.on_message(msg) {
                    if let SessionAction::PersistFile(bytes) = action {
                        file = Some(bytes);
                    }
                }
            }
        }
    }

    #[test]
    fn full_set_of_strided_seeders_completes_leecher() {
        let enc = encoder(95, 40, 10, 1.0);
        let expected: Vec<u8> = (0..95).map(|i| (i % 199) as u8).collect();
        let feeds = (0..3)
            .map(|slot| SymbolFeed::new(enc.clone(), scheduler(3, slot), SendOrder::Strided))
            .collect();
        let mut leech = active(Role::Leech, &enc);
        assert_eq!(drain_into(&mut leech, feeds), Some(expected));
        assert_eq!(leech.state(), SessionState::Closed);
    }

    #[test]
    fn lone_strided_seeder_with_one_slot_completes_leecher() {
        let enc = encoder(95, 40, 10, 1.0);
        let feed = SymbolFeed::new(enc.clone(), scheduler(1, 0), SendOrder::Strided);
        let mut leech = active(Role::Leech, &enc);
        assert!(drain_into(&mut leech, vec![feed]).is_some());
    }

    #[test]
    fn partial_set_of_strided_seeders_leaves_gaps() {
        let enc = encoder(95, 40, 10, 1.0);
        let feed = SymbolFeed::new(enc.clone(), scheduler(2, 0), SendOrder::Strided);
        let mut leech = active(Role::Leech, &enc);
        assert!(drain_into(&mut leech, vec![feed]).is_none());
        assert_eq!(leech.state(), SessionState::Active);
    }

    #[test]
    fn empty_encoder_feeds_nothing() {
        let enc = encoder(0, 10, 4, 1.0);
        let mut feed = SymbolFeed::new(enc, scheduler(1, 0), SendOrder::Sequential);
        assert!(feed.next().is_none());
    }
}
