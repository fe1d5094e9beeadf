use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating the startup configuration.
/// All of these are fatal before the engine starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{file} not found: {source}")]
    Missing {
        file: &'static str,
        source: std::io::Error,
    },

    #[error("{file}: {reason}")]
    Parse { file: &'static str, reason: String },

    #[error("Common.cfg: {0}")]
    InvalidCommon(String),

    #[error("PeerInfo.cfg: no peers listed")]
    NoPeers,

    #[error("peer {0} not found in PeerInfo.cfg")]
    UnknownPeer(u32),

    #[error("missing peer directory {0}")]
    MissingPeerDir(PathBuf),

    #[error("seed file missing: {0}")]
    MissingSeedFile(PathBuf),

    #[error("seed file size mismatch: found {found} bytes, expected {expected}")]
    SeedSizeMismatch { found: u64, expected: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
