//! Peer process entry point: loads the configuration, validates the on-disk
//! layout, then runs the protocol engine until the download completes and
//! keeps seeding until interrupted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use filepeer::config::Config;
use filepeer::peer::LocalPeer;
use filepeer::peer::engine::PeerEngine;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Peer id of this process, as listed in PeerInfo.cfg.
    peer_id: u32,

    /// Directory holding Common.cfg, PeerInfo.cfg and the peer_<id> directories.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
}

/// Sends this peer's audit log to `log_peer_<id>.log` next to the config
/// files. The guard must stay alive for the process lifetime.
fn init_logging(
    peer_id: u32,
    dir: &Path,
) -> std::io::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("log_peer_{peer_id}.log")))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(LevelFilter::INFO);
    let _ = tracing_subscriber::registry().with(file_layer).try_init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _guard = init_logging(args.peer_id, &args.dir)?;

    let cfg = Config::load(&args.dir)?;
    cfg.validate_filesystem(&args.dir, args.peer_id)?;
    let row = cfg
        .peer(args.peer_id)
        .cloned()
        .ok_or_else(|| format!("peer id {} not found in PeerInfo.cfg", args.peer_id))?;

    let local = LocalPeer::from_config(&cfg.common, &row);
    info!(
        "peer {} starting at {}:{}",
        local.peer_id, local.host, local.port
    );
    let engine = PeerEngine::new(local, row.has_file, &args.dir).await?;
    engine.start().await?;

    // Dial every peer listed before our own row; the rest dial in.
    for neighbor in cfg.peers_before(args.peer_id) {
        if let Err(e) = engine.connect_to_peer(neighbor).await {
            error!(
                "failed to connect to peer {} at {}:{}: {e}",
                neighbor.id, neighbor.host, neighbor.port
            );
        }
    }

    let mut complete = engine.has_complete_file().await;
    if complete {
        info!("seeding the complete file");
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !complete && engine.has_complete_file().await {
                    complete = true;
                    info!("download finished; continuing to seed");
                }
            }
        }
    }

    engine.stop().await;
    Ok(())
}
