use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

use crate::wire::message::{Bitfield, Message, PeerMessage};

/// State for one live connection to a remote peer. Owned exclusively by the
/// neighbor table; identity is fixed at creation, the flags and bitfield
/// change only under the table's lock.
#[derive(Debug)]
pub struct Neighbor {
    pub peer_id: u32,
    pub addr: SocketAddr,
    outbox: UnboundedSender<Message>,
    /// We are choking them: REQUESTs from this neighbor are not served.
    pub am_choking: bool,
    /// We have told this neighbor we are interested in its pieces.
    pub am_interested: bool,
    /// They are choking us: we may not request pieces from them.
    pub peer_choking: bool,
    /// They declared interest in our pieces; the choke scheduler's input.
    pub peer_interested: bool,
    pub bitfield: Bitfield,
    pub has_file: bool,
}

impl Neighbor {
    pub fn new(
        peer_id: u32,
        addr: SocketAddr,
        outbox: UnboundedSender<Message>,
        total_pieces: u32,
        has_file: bool,
    ) -> Self {
        Self {
            peer_id,
            addr,
            outbox,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::from_piece_count(total_pieces),
            has_file,
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Records a HAVE announcement from this neighbor.
    pub fn record_have(&mut self, index: u32, total_pieces: u32) {
        self.bitfield.set_piece(index);
        self.has_file = self.bitfield.all_set(total_pieces);
    }

    /// Replaces the remote bitfield with freshly announced bytes, sized to
    /// `total_pieces`, and recomputes whether the neighbor is fully seeded.
    pub fn replace_bitfield(&mut self, bytes: &[u8], total_pieces: u32) {
        self.bitfield = Bitfield::from_bytes(bytes, total_pieces);
        self.has_file = self.bitfield.all_set(total_pieces);
    }

    /// Queues a message for this neighbor's writer task. Returns false when
    /// the connection is already gone; callers treat that like any other
    /// transport failure on this one neighbor.
    pub fn send(&self, msg: impl Into<Message>) -> bool {
        self.outbox.send(msg.into()).is_ok()
    }

    /// Handle for sending to this neighbor without holding the table lock.
    pub fn sender(&self) -> UnboundedSender<Message> {
        self.outbox.clone()
    }

    pub fn send_peer_message(&self, msg: PeerMessage) -> bool {
        self.send(Message::from(msg))
    }
}
