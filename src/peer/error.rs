use thiserror::Error;

use crate::wire::WireError;

/// Errors that can occur while talking to a neighbor. Any of these tears
/// down the one connection they occurred on; none of them is fatal to the
/// process.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("handshake peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: u32, actual: u32 },

    #[error("neighbor {0} already registered")]
    DuplicateNeighbor(u32),

    #[error("piece index out of range: {0}")]
    PieceIndexOutOfRange(u32),

    #[error("piece {index} has wrong length: expected {expected} bytes, got {actual}")]
    PieceLengthMismatch {
        index: u32,
        expected: u64,
        actual: usize,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the piece store. REQUEST and PIECE handlers log these and
/// carry on; the piece involved stays eligible for a retry.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {index} has wrong length: expected {expected} bytes, got {actual}")]
    WrongPieceLength {
        index: u32,
        expected: u64,
        actual: usize,
    },
}
