pub mod config;
pub mod peer;
pub mod wire;

// Re-export commonly used types for easier access
pub use config::{Config, ConfigError};
pub use peer::LocalPeer;
pub use peer::engine::PeerEngine;
pub use wire::{Handshake, Message, PeerMessage};
