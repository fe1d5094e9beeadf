use std::collections::{BTreeMap, HashMap, HashSet};

use crate::peer::error::PeerError;
use crate::peer::neighbor::Neighbor;
use crate::wire::message::Bitfield;

/// The aggregate shared by every dispatcher and the choke scheduler:
/// neighbor table, request ledger, local bitfield and preferred set. One
/// lock guards the whole, so selection, ledger updates and bitfield updates
/// are single critical sections.
///
/// The table is a `BTreeMap` so scheduler rounds iterate neighbors in a
/// stable order.
#[derive(Debug)]
pub struct SharedState {
    pub total_pieces: u32,
    /// Local bitfield: bit i set iff piece i is fully on disk.
    pub bitfield: Bitfield,
    pub neighbors: BTreeMap<u32, Neighbor>,
    /// Piece indices with a request outstanding.
    requested_pieces: HashSet<u32>,
    /// Which neighbor each outstanding piece was requested from. Kept in
    /// lockstep with `requested_pieces`.
    piece_owner: HashMap<u32, u32>,
    /// Neighbors granted unchoke in the current scheduling round.
    pub preferred: HashSet<u32>,
}

/// Control messages owed after a scheduling round.
#[derive(Debug, Default, PartialEq)]
pub struct ChokePlan {
    pub unchoke: Vec<u32>,
    pub choke: Vec<u32>,
}

impl SharedState {
    pub fn new(total_pieces: u32, bitfield: Bitfield) -> Self {
        Self {
            total_pieces,
            bitfield,
            neighbors: BTreeMap::new(),
            requested_pieces: HashSet::new(),
            piece_owner: HashMap::new(),
            preferred: HashSet::new(),
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    pub fn has_complete_file(&self) -> bool {
        self.bitfield.all_set(self.total_pieces)
    }

    pub fn pieces_owned(&self) -> u32 {
        self.bitfield.count_set(self.total_pieces)
    }

    pub fn is_requested(&self, index: u32) -> bool {
        self.requested_pieces.contains(&index)
    }

    pub fn register(&mut self, neighbor: Neighbor) -> Result<(), PeerError> {
        let id = neighbor.peer_id;
        if self.neighbors.contains_key(&id) {
            return Err(PeerError::DuplicateNeighbor(id));
        }
        self.neighbors.insert(id, neighbor);
        Ok(())
    }

    /// Drops a neighbor and releases every piece it was serving back to
    /// "unrequested".
    pub fn remove_neighbor(&mut self, id: u32) -> Option<Neighbor> {
        self.release_requests_of(id);
        self.preferred.remove(&id);
        self.neighbors.remove(&id)
    }

    /// Clears this neighbor's entries from the request ledger, returning the
    /// released piece indices.
    pub fn release_requests_of(&mut self, id: u32) -> Vec<u32> {
        let released: Vec<u32> = self
            .piece_owner
            .iter()
            .filter(|&(_, owner)| *owner == id)
            .map(|(&piece, _)| piece)
            .collect();
        for piece in &released {
            self.requested_pieces.remove(piece);
            self.piece_owner.remove(piece);
        }
        released
    }

    /// First piece index we lack, the neighbor has, and nobody has been
    /// asked for yet. Ascending order keeps the policy deterministic.
    pub fn next_wanted_piece(&self, neighbor_id: u32) -> Option<u32> {
        let neighbor = self.neighbors.get(&neighbor_id)?;
        (0..self.total_pieces).find(|&i| {
            !self.has_piece(i) && neighbor.has_piece(i) && !self.requested_pieces.contains(&i)
        })
    }

    /// Records an outstanding request in the ledger. Callers hold the state
    /// lock across the preceding `next_wanted_piece` call, so a piece can
    /// never be claimed twice.
    pub fn claim_piece(&mut self, index: u32, owner: u32) {
        self.requested_pieces.insert(index);
        self.piece_owner.insert(index, owner);
    }

    /// Drops a single outstanding request, leaving the piece eligible for a
    /// retry from any neighbor.
    pub fn release_piece(&mut self, index: u32) {
        self.requested_pieces.remove(&index);
        self.piece_owner.remove(&index);
    }

    pub fn owner_of(&self, index: u32) -> Option<u32> {
        self.piece_owner.get(&index).copied()
    }

    /// Marks a piece owned and clears its ledger entry in one step, so no
    /// observer can see the piece both owned and outstanding.
    pub fn complete_piece(&mut self, index: u32) {
        self.bitfield.set_piece(index);
        self.requested_pieces.remove(&index);
        self.piece_owner.remove(&index);
    }

    /// Wholesale preferred-neighbor recomputation: the first `count`
    /// interested neighbors in table order become the new set. Neighbors
    /// outside it are re-choked even if unchanged from the prior round.
    pub fn select_preferred(&mut self, count: usize) -> ChokePlan {
        let new_preferred: HashSet<u32> = self
            .neighbors
            .values()
            .filter(|n| n.peer_interested)
            .take(count)
            .map(|n| n.peer_id)
            .collect();

        let mut plan = ChokePlan::default();
        for neighbor in self.neighbors.values_mut() {
            if new_preferred.contains(&neighbor.peer_id) {
                if neighbor.am_choking {
                    neighbor.am_choking = false;
                    plan.unchoke.push(neighbor.peer_id);
                }
            } else if !neighbor.am_choking {
                neighbor.am_choking = true;
                plan.choke.push(neighbor.peer_id);
            }
        }

        self.preferred = new_preferred;
        plan
    }

    /// Force-unchokes one additional interested, non-preferred neighbor for
    /// the current round, returning its id.
    pub fn pick_optimistic(&mut self) -> Option<u32> {
        let preferred = &self.preferred;
        let neighbor = self
            .neighbors
            .values_mut()
            .find(|n| n.peer_interested && n.am_choking && !preferred.contains(&n.peer_id))?;
        neighbor.am_choking = false;
        Some(neighbor.peer_id)
    }

    pub fn preferred_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.preferred.iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}
