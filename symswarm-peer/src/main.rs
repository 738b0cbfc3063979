// Symswarm peer: announce to the tracker, then seed or leech one file over TCP.
// `symswarm tracker` runs the announce endpoint itself.

mod config;
mod framing;
mod storage;
mod tracker;
mod tracker_server;
mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use symswarm_core::descriptor::build_metainfo;
use symswarm_core::tracker::SwarmDirectory;
use symswarm_core::{ContentDescriptor, Encoder, Role};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::storage::Storage;
use crate::transport::PeerContext;

#[derive(Parser, Debug)]
#[command(author, version, about = "Symbol-striped file swarm peer")]
struct Cli {
    /// Config file (default: ~/.config/symswarm/config.toml, then /etc/symswarm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a complete local file to the swarm.
    Seed {
        /// Path to the .torrent descriptor
        torrent: PathBuf,
        /// File to serve (defaults to <dir>/<name from descriptor>)
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[command(flatten)]
        net: NetArgs,
    },
    /// Download the file described by the descriptor.
    Leech {
        torrent: PathBuf,
        #[command(flatten)]
        net: NetArgs,
    },
    /// Write a descriptor for a local file.
    Create {
        file: PathBuf,
        #[arg(short, long, default_value = "http://localhost:8000/announce")]
        announce: String,
        #[arg(short = 'l', long, default_value_t = 1 << 20)]
        piece_length: u32,
        #[arg(short, long, default_value = "out.torrent")]
        output: PathBuf,
    },
    /// Run an announce tracker.
    Tracker {
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,
    },
}

#[derive(Args, Debug)]
struct NetArgs {
    /// Download directory (block files and the reassembled file)
    #[arg(short, long, default_value = "downloads")]
    dir: PathBuf,
    /// Listen port; overrides config
    #[arg(short, long)]
    port: Option<u16>,
    /// Tracker base URL; overrides config and the descriptor's announce
    #[arg(long)]
    tracker: Option<String>,
}

impl NetArgs {
    fn apply(&self, c: &mut Config) {
        if let Some(p) = self.port {
            c.listen_port = p;
        }
        if let Some(t) = &self.tracker {
            c.tracker_url = Some(t.clone());
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Seed { torrent, file, net } => {
            net.apply(&mut cfg);
            rt.block_on(run_peer(Role::Seed, &torrent, file, &net.dir, cfg))
        }
        Command::Leech { torrent, net } => {
            net.apply(&mut cfg);
            rt.block_on(run_peer(Role::Leech, &torrent, None, &net.dir, cfg))
        }
        Command::Create {
            file,
            announce,
            piece_length,
            output,
        } => create(&file, &announce, piece_length, &output),
        Command::Tracker { port, bind } => rt.block_on(run_tracker(SocketAddr::new(bind, port))),
    }
}

async fn run_tracker(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding tracker on {addr}"))?;
    info!(addr = %listener.local_addr()?, "tracker listening");
    let (stop_tx, stop_rx) = watch::channel(false);
    let directory = Arc::new(Mutex::new(SwarmDirectory::new()));
    let server = tokio::spawn(tracker_server::serve(listener, directory, stop_rx));
    if let Err(e) = shutdown_signal().await {
        warn!(error = %e, "signal handler failed");
    }
    info!("shutting down");
    stop_tx.send_replace(true);
    server.await.context("tracker task")?;
    Ok(())
}

fn create(file: &Path, announce: &str, piece_length: u32, output: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("input path has no file name")?;
    let meta = build_metainfo(&name, &data, piece_length, announce)?;
    std::fs::write(output, &meta).with_context(|| format!("writing {}", output.display()))?;
    let d = ContentDescriptor::from_bytes(&meta)?;
    info!(output = %output.display(), info_hash = %d.info_hash, pieces = d.pieces.len(), "descriptor written");
    Ok(())
}

async fn run_peer(
    role: Role,
    torrent: &Path,
    file: Option<PathBuf>,
    dir: &Path,
    cfg: Config,
) -> Result<()> {
    let raw = std::fs::read(torrent).with_context(|| format!("reading {}", torrent.display()))?;
    let descriptor = ContentDescriptor::from_bytes(&raw).context("parsing descriptor")?;
    let storage = Storage::new(dir);
    info!(
        name = %descriptor.name,
        length = descriptor.length,
        info_hash = %descriptor.info_hash,
        ?role,
        dir = %storage.dir().display(),
        "loaded descriptor"
    );

    let encoder = match role {
        Role::Seed => {
            let path = file.unwrap_or_else(|| storage.file_path(&descriptor.name));
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            if data.len() as u64 != descriptor.length {
                bail!(
                    "{} is {} bytes, descriptor says {}",
                    path.display(),
                    data.len(),
                    descriptor.length
                );
            }
            let enc = Encoder::new(data, cfg.coding_params())?;
            info!(
                source = enc.source_count(),
                repair = enc.repair_count(),
                "encoded blocks"
            );
            Some(Arc::new(enc))
        }
        Role::Leech => None,
    };

    let tracker_url = cfg
        .tracker_url
        .clone()
        .unwrap_or_else(|| descriptor.announce.clone());
    let ctx = Arc::new(PeerContext::new(role, descriptor, encoder, storage, &cfg)?);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], cfg.listen_port)))
        .await
        .context("binding listener")?;
    let port = listener.local_addr()?.port();
    info!(port, peer_id = %ctx.peer_id, "listening");

    if role == Role::Leech && ctx.store.is_complete() {
        // Zero-length file: nothing to fetch.
        ctx.finalize(Vec::new()).await;
        return Ok(());
    }

    let accept = tokio::spawn(transport::accept_loop(listener, ctx.clone()));

    let resp = tracker::announce(&tracker_url, &ctx.descriptor.info_hash, &ctx.peer_id, port)
        .await
        .context("announce failed")?;
    let peers = tracker::remote_peers(&resp, port);
    info!(count = peers.len(), interval = resp.interval, "tracker replied");
    let fan = transport::connect_all(&peers, &ctx).await;
    info!(attempted = fan.attempted, connected = fan.connected, "initial fan-out done");

    let mut done = ctx.subscribe();
    tokio::select! {
        r = shutdown_signal() => {
            if let Err(e) = r {
                warn!(error = %e, "signal handler failed");
            }
            info!("shutting down");
            ctx.shutdown();
        }
        _ = async {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        } => info!("download finished"),
    }
    let _ = accept.await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
