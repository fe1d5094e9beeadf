use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod errors;
pub mod parser;

pub use errors::ConfigError;

pub const COMMON_CFG: &str = "Common.cfg";
pub const PEER_INFO_CFG: &str = "PeerInfo.cfg";

/// Per-swarm parameters from Common.cfg.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub preferred_neighbors: usize,
    pub unchoke_interval: Duration,
    pub optimistic_unchoke_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
}

impl CommonConfig {
    pub fn total_pieces(&self) -> u32 {
        self.file_size.div_ceil(self.piece_size) as u32
    }
}

/// One row of PeerInfo.cfg.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRow {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub common: CommonConfig,
    pub peers: Vec<PeerRow>,
}

/// Directory holding a peer's copy of the shared file: `peer_<id>`.
pub fn peer_dir_name(id: u32) -> String {
    format!("peer_{id}")
}

impl Config {
    /// Loads Common.cfg and PeerInfo.cfg from `root` and validates their
    /// values.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();

        let common_src = fs::read_to_string(root.join(COMMON_CFG)).map_err(|e| {
            ConfigError::Missing {
                file: COMMON_CFG,
                source: e,
            }
        })?;
        let common = Self::common_from_entries(&parser::parse_common(&common_src)?)?;

        let peers_src = fs::read_to_string(root.join(PEER_INFO_CFG)).map_err(|e| {
            ConfigError::Missing {
                file: PEER_INFO_CFG,
                source: e,
            }
        })?;
        let peers = parser::parse_peer_rows(&peers_src)?;
        if peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }

        if common.file_size % common.piece_size != 0 {
            tracing::warn!("FileSize is not a multiple of PieceSize; last piece will be partial");
        }

        Ok(Self { common, peers })
    }

    fn common_from_entries(entries: &[(&str, &str)]) -> Result<CommonConfig, ConfigError> {
        let mut preferred_neighbors = None;
        let mut unchoke_interval = None;
        let mut optimistic_unchoke_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for (key, value) in entries {
            match *key {
                "NumberOfPreferredNeighbors" => {
                    preferred_neighbors = Some(parse_positive(key, value)? as usize)
                }
                "UnchokingInterval" => {
                    unchoke_interval = Some(Duration::from_secs(parse_positive(key, value)?))
                }
                "OptimisticUnchokingInterval" => {
                    optimistic_unchoke_interval =
                        Some(Duration::from_secs(parse_positive(key, value)?))
                }
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_positive(key, value)?),
                "PieceSize" => piece_size = Some(parse_positive(key, value)?),
                _ => {} // ignore unknown keys
            }
        }

        let missing = |key: &str| ConfigError::InvalidCommon(format!("{key} missing"));
        Ok(CommonConfig {
            preferred_neighbors: preferred_neighbors
                .ok_or_else(|| missing("NumberOfPreferredNeighbors"))?,
            unchoke_interval: unchoke_interval.ok_or_else(|| missing("UnchokingInterval"))?,
            optimistic_unchoke_interval: optimistic_unchoke_interval
                .ok_or_else(|| missing("OptimisticUnchokingInterval"))?,
            file_name: file_name.ok_or_else(|| missing("FileName"))?,
            file_size: file_size.ok_or_else(|| missing("FileSize"))?,
            piece_size: piece_size.ok_or_else(|| missing("PieceSize"))?,
        })
    }

    pub fn peer(&self, id: u32) -> Option<&PeerRow> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Peers listed before `id`'s own row: the ones this peer dials at
    /// startup. Peers listed after are expected to dial in.
    pub fn peers_before(&self, id: u32) -> &[PeerRow] {
        let end = self
            .peers
            .iter()
            .position(|p| p.id == id)
            .unwrap_or(self.peers.len());
        &self.peers[..end]
    }

    /// Checks the on-disk layout for `id`: its peer directory must exist,
    /// and when the peer claims the complete file, the seed file must be
    /// present with exactly the configured size.
    pub fn validate_filesystem(&self, root: impl AsRef<Path>, id: u32) -> Result<(), ConfigError> {
        let me = self.peer(id).ok_or(ConfigError::UnknownPeer(id))?;

        let dir: PathBuf = root.as_ref().join(peer_dir_name(id));
        if !dir.is_dir() {
            return Err(ConfigError::MissingPeerDir(dir));
        }

        if me.has_file {
            let seed = dir.join(&self.common.file_name);
            if !seed.is_file() {
                return Err(ConfigError::MissingSeedFile(seed));
            }
            let found = fs::metadata(&seed)?.len();
            if found != self.common.file_size {
                return Err(ConfigError::SeedSizeMismatch {
                    found,
                    expected: self.common.file_size,
                });
            }
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ConfigError> {
    let n: u64 = value
        .parse()
        .map_err(|_| ConfigError::InvalidCommon(format!("{key} must be numeric, got {value:?}")))?;
    if n == 0 {
        return Err(ConfigError::InvalidCommon(format!("{key} must be > 0")));
    }
    Ok(n)
}
