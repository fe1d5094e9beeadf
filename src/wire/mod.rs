use thiserror::Error;

pub mod handshake;
pub mod message;

pub use handshake::Handshake;
pub use message::{Bitfield, Message, MessageId, PeerMessage};

/// Fixed protocol identifier opening every handshake.
pub const MAGIC: &[u8; 18] = b"P2PFILESHARINGPROJ";
pub const HANDSHAKE_LEN: usize = 32;

/// Upper bound on a single frame's declared length, to refuse absurd
/// allocations before reading the payload.
pub const MAX_MESSAGE_LEN: u32 = 1 << 26;

/// Errors produced while encoding or decoding protocol bytes.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote closed the connection at a frame boundary or mid-frame.
    #[error("connection closed")]
    Closed,

    #[error("bad handshake magic")]
    BadMagic,

    #[error("non-zero reserved byte in handshake")]
    ReservedNotZero,

    #[error("handshake too short: {0} bytes")]
    ShortHandshake(usize),

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("invalid message length: {0}")]
    InvalidLength(u32),

    #[error("bad payload for {kind:?}: {len} bytes")]
    BadPayload { kind: message::MessageId, len: usize },
}
