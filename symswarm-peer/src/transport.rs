//! Peer transport: TCP listener (inbound), one-shot fan-out to tracker peers (outbound),
//! handshake, then a reader duty and a writer duty per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use symswarm_core::block::LayoutError;
use symswarm_core::integrity;
use symswarm_core::scheduler::SchedulerError;
use symswarm_core::{
    AssemblyStore, BlockLayout, ContentDescriptor, Encoder, Message, PeerId, PeerSession, Role,
    SendOrder, SessionAction, SessionState, SymbolFeed, SymbolScheduler,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::framing::{self, ReadError};
use crate::storage::Storage;

/// Control messages (interest, have) queued from the reader to the writer.
const CONTROL_QUEUE: usize = 64;

/// Writer-side knobs taken from config.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub pace: Duration,
    pub order: SendOrder,
}

impl From<&Config> for SessionSettings {
    fn from(c: &Config) -> Self {
        Self {
            pace: c.send_pace(),
            order: c.send_order,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("block layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// State shared by every session of this peer process.
pub struct PeerContext {
    pub role: Role,
    pub descriptor: ContentDescriptor,
    pub peer_id: PeerId,
    pub store: Arc<AssemblyStore>,
    pub encoder: Option<Arc<Encoder>>,
    pub storage: Storage,
    pub settings: SessionSettings,
    /// This peer's stripe. Every connection starts from a clone.
    scheduler: SymbolScheduler,
    shutdown: watch::Sender<bool>,
}

impl PeerContext {
    pub fn new(
        role: Role,
        descriptor: ContentDescriptor,
        encoder: Option<Arc<Encoder>>,
        storage: Storage,
        config: &Config,
    ) -> Result<Self, SetupError> {
        let layout = BlockLayout::new(descriptor.length, config.block_size, config.symbol_size)?;
        let scheduler = SymbolScheduler::new(config.scheduler_slots, config.scheduler_slot)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            role,
            descriptor,
            peer_id: PeerId::generate(),
            store: Arc::new(AssemblyStore::new(layout)),
            encoder,
            storage,
            settings: SessionSettings::from(config),
            scheduler,
            shutdown,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every duty and the accept loop to drop their sockets.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Persist the reassembled file. Leechers stop once this is done.
    pub async fn finalize(&self, bytes: Vec<u8>) {
        let d = &self.descriptor;
        if let Err(e) = integrity::verify_pieces(&bytes, d.piece_length, &d.pieces) {
            warn!(error = %e, "reassembled file does not match descriptor pieces");
        }
        match self.storage.write_file(&d.name, &bytes).await {
            Ok(path) => info!(path = %path.display(), bytes = bytes.len(), "file-level decode complete"),
            Err(e) => warn!(error = %e, "failed to write reassembled file"),
        }
        if self.role == Role::Leech {
            self.shutdown();
        }
    }
}

/// Outcome of the initial fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanOut {
    pub attempted: usize,
    pub connected: usize,
}

/// Connect to each tracker-supplied peer once. Failures are logged and skipped.
pub async fn connect_all(peers: &[SocketAddr], ctx: &Arc<PeerContext>) -> FanOut {
    let mut out = FanOut::default();
    for &addr in peers {
        out.attempted += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!(%addr, "connected to peer");
                out.connected += 1;
                tokio::spawn(run_connection(stream, addr, ctx.clone()));
            }
            Err(e) => warn!(%addr, error = %e, "could not connect to peer"),
        }
    }
    out
}

/// Accept inbound connections until shutdown.
pub async fn accept_loop(listener: TcpListener, ctx: Arc<PeerContext>) {
    let mut stop = ctx.subscribe();
    if ctx.is_shutting_down() {
        return;
    }
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok((stream, addr)) => {
                    info!(%addr, "inbound connection");
                    tokio::spawn(run_connection(stream, addr, ctx.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = stop.changed() => break,
        }
    }
    debug!("accept loop stopped");
}

/// Drive one connection from handshake to close.
pub async fn run_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<PeerContext>) {
    let scheduler = Arc::new(Mutex::new(ctx.scheduler.clone()));
    let mut session = PeerSession::new(
        ctx.role,
        ctx.descriptor.info_hash,
        ctx.peer_id,
        scheduler.clone(),
        ctx.store.clone(),
    );
    let (mut reader, mut writer) = stream.into_split();

    let hs = session.on_connected();
    if let Err(e) = writer.write_all(&hs).await {
        warn!(%addr, error = %e, "failed to send handshake");
        return;
    }
    let remote = match framing::read_handshake(&mut reader).await {
        Ok(b) => b,
        Err(e) => {
            warn!(%addr, error = %e, "no handshake from peer");
            return;
        }
    };
    let initial = match session.on_handshake(&remote) {
        Ok(actions) => actions,
        Err(e) => {
            warn!(%addr, error = %e, "closing connection");
            return;
        }
    };
    info!(
        %addr,
        peer = %session.remote_id().map(|p| p.to_string()).unwrap_or_default(),
        slot = scheduler.lock().slot(),
        "session active"
    );

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let feed = match (ctx.role, &ctx.encoder) {
        (Role::Seed, Some(enc)) => Some(SymbolFeed::new(
            enc.clone(),
            scheduler.clone(),
            ctx.settings.order,
        )),
        _ => None,
    };
    let writer_task = tokio::spawn(writer_duty(
        writer,
        control_rx,
        feed,
        ctx.settings.pace,
        ctx.subscribe(),
    ));

    for action in initial {
        perform(action, &control_tx, &ctx).await;
    }
    reader_duty(reader, &mut session, &control_tx, &ctx).await;
    drop(control_tx);

    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%addr, error = %e, "writer stopped"),
        Err(e) => warn!(%addr, error = %e, "writer task failed"),
    }
    info!(%addr, "session closed");
}

async fn reader_duty(
    mut reader: OwnedReadHalf,
    session: &mut PeerSession,
    control: &mpsc::Sender<Message>,
    ctx: &PeerContext,
) {
    let mut stop = ctx.subscribe();
    if ctx.is_shutting_down() {
        return;
    }
    loop {
        let next = tokio::select! {
            r = framing::read_message(&mut reader) => r,
            _ = stop.changed() => break,
        };
        match next {
            Ok(msg) => {
                trace!(?msg, "received");
                for action in session.on_message(msg) {
                    perform(action, control, ctx).await;
                }
                if session.state() == SessionState::Closed {
                    break;
                }
            }
            Err(ReadError::EndOfStream) => {
                debug!("peer closed connection");
                session.on_stream_end();
                break;
            }
            Err(e) => {
                warn!(error = %e, "read failed");
                session.on_stream_end();
                break;
            }
        }
    }
}

async fn perform(action: SessionAction, control: &mpsc::Sender<Message>, ctx: &PeerContext) {
    match action {
        SessionAction::Send(msg) => {
            if let Err(e) = control.send(msg).await {
                debug!(msg = ?e.0, "writer gone, message dropped");
            }
        }
        SessionAction::PersistBlock { block_id, bytes } => {
            if let Err(e) = ctx.storage.write_block(block_id, &bytes).await {
                warn!(block_id, error = %e, "failed to write block");
            }
        }
        SessionAction::PersistFile(bytes) => ctx.finalize(bytes).await,
        SessionAction::Close => {}
    }
}

/// Control messages go out first; between them a seeding writer emits one symbol per
/// step, pausing `pace` after each.
async fn writer_duty(
    mut writer: OwnedWriteHalf,
    mut control: mpsc::Receiver<Message>,
    mut feed: Option<SymbolFeed>,
    pace: Duration,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        loop {
            match control.try_recv() {
                Ok(msg) => framing::write_message(&mut writer, &msg).await?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return writer.shutdown().await,
            }
        }
        if *stop.borrow() {
            return writer.shutdown().await;
        }
        match feed.as_mut().and_then(|f| f.next()) {
            Some(msg) => {
                framing::write_message(&mut writer, &msg).await?;
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
            }
            None => {
                if feed.take().is_some() {
                    debug!("all symbols sent");
                }
                tokio::select! {
                    msg = control.recv() => match msg {
                        Some(msg) => framing::write_message(&mut writer, &msg).await?,
                        None => return writer.shutdown().await,
                    },
                    _ = stop.changed() => return writer.shutdown().await,
                }
            }
        }
    }
}
