//! Neighbour table.
//!
//! Records are kept sorted by identity. The handoff ring walks that order
//! starting after the local node, wrapping around.

use tokio::time::Instant;

use crate::core::PeerId;
use crate::transceiver::TransId;

use super::beacon::AckStatus;

/// A peer currently considered reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    /// Peer identity.
    pub id: PeerId,
    /// Confirmed by a ping exchange.
    pub valid: bool,
    /// Already had the token during the current round.
    pub processed: bool,
    /// Last beacon sequence processed from this peer.
    pub last_trans_id: Option<u32>,
    /// Status of the last acknowledgment sent to this peer.
    pub last_ack: Option<AckStatus>,
    /// When we last sent this peer a ping request.
    pub last_ping: Option<Instant>,
}

impl Neighbour {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            valid: false,
            processed: false,
            last_trans_id: None,
            last_ack: None,
            last_ping: None,
        }
    }

    /// Whether a beacon with `seq` was already processed.
    pub fn is_duplicate(&self, seq: u32) -> bool {
        match self.last_trans_id {
            Some(last) => seq == last || TransId::seq_before(seq, last),
            None => false,
        }
    }
}

/// Neighbours sorted by identity.
#[derive(Debug, Clone, Default)]
pub struct NeighbourTable {
    entries: Vec<Neighbour>,
}

impl NeighbourTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer if unknown. Returns `true` if it was added.
    pub fn insert(&mut self, id: PeerId) -> bool {
        match self.entries.binary_search_by_key(&id, |n| n.id) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, Neighbour::new(id));
                true
            }
        }
    }

    /// Remove a peer. Returns the removed record.
    pub fn remove(&mut self, id: PeerId) -> Option<Neighbour> {
        let pos = self.entries.binary_search_by_key(&id, |n| n.id).ok()?;
        Some(self.entries.remove(pos))
    }

    /// Look up a peer.
    pub fn get(&self, id: PeerId) -> Option<&Neighbour> {
        let pos = self.entries.binary_search_by_key(&id, |n| n.id).ok()?;
        self.entries.get(pos)
    }

    /// Look up a peer mutably.
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Neighbour> {
        let pos = self.entries.binary_search_by_key(&id, |n| n.id).ok()?;
        self.entries.get_mut(pos)
    }

    /// Whether `id` is known and valid.
    pub fn is_valid(&self, id: PeerId) -> bool {
        self.get(id).is_some_and(|n| n.valid)
    }

    /// Mark a peer valid or invalid. Returns `true` if the flag changed.
    pub fn set_valid(&mut self, id: PeerId, valid: bool) -> bool {
        match self.get_mut(id) {
            Some(n) if n.valid != valid => {
                n.valid = valid;
                if !valid {
                    n.last_ack = None;
                }
                true
            }
            _ => false,
        }
    }

    /// Mark a peer as having had the token this round.
    pub fn mark_processed(&mut self, id: PeerId) {
        if let Some(n) = self.get_mut(id) {
            n.processed = true;
        }
    }

    /// Valid peers, sorted by identity.
    pub fn valid_ids(&self) -> Vec<PeerId> {
        self.entries.iter().filter(|n| n.valid).map(|n| n.id).collect()
    }

    /// Whether any peer is valid.
    pub fn has_valid(&self) -> bool {
        self.entries.iter().any(|n| n.valid)
    }

    /// Whether `local` has the lowest identity among itself and the valid peers.
    pub fn is_lowest(&self, local: PeerId) -> bool {
        self.entries.iter().filter(|n| n.valid).all(|n| local < n.id)
    }

    /// Pick the next speaker after `local` and mark it processed.
    ///
    /// Walks the valid peers in ring order starting after `local`, skipping
    /// those already processed this round; when all are processed the round
    /// restarts with every flag cleared.
    pub fn next_speaker(&mut self, local: PeerId) -> Option<PeerId> {
        let ring: Vec<PeerId> = {
            let (before, after): (Vec<&Neighbour>, Vec<&Neighbour>) = self
                .entries
                .iter()
                .filter(|n| n.valid)
                .partition(|n| n.id < local);
            after.into_iter().chain(before).map(|n| n.id).collect()
        };
        if ring.is_empty() {
            return None;
        }

        let pick = ring
            .iter()
            .copied()
            .find(|id| self.get(*id).is_some_and(|n| !n.processed));

        let pick = match pick {
            Some(id) => id,
            None => {
                for n in &mut self.entries {
                    n.processed = false;
                }
                ring[0]
            }
        };
        self.mark_processed(pick);
        Some(pick)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All records, sorted by identity.
    pub fn iter(&self) -> impl Iterator<Item = &Neighbour> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> PeerId {
        PeerId::new(raw)
    }

    fn table(ids: &[u64]) -> NeighbourTable {
        let mut t = NeighbourTable::new();
        for raw in ids {
            t.insert(id(*raw));
            t.set_valid(id(*raw), true);
        }
        t
    }

    #[test]
    fn test_sorted_insert() {
        let mut t = NeighbourTable::new();
        assert!(t.insert(id(30)));
        assert!(t.insert(id(10)));
        assert!(t.insert(id(20)));
        assert!(!t.insert(id(20)));

        let ids: Vec<u64> = t.iter().map(|n| n.id.get()).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert!(t.iter().all(|n| !n.valid));
    }

    #[test]
    fn test_remove() {
        let mut t = table(&[1, 2]);
        assert_eq!(t.remove(id(1)).map(|n| n.id), Some(id(1)));
        assert!(t.remove(id(1)).is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_ring_order_after_local() {
        let mut t = table(&[10, 30, 50]);
        let local = id(40);

        assert_eq!(t.next_speaker(local), Some(id(50)));
        assert_eq!(t.next_speaker(local), Some(id(10)));
        assert_eq!(t.next_speaker(local), Some(id(30)));
        // Full round: flags cleared, start over.
        assert_eq!(t.next_speaker(local), Some(id(50)));
    }

    #[test]
    fn test_ring_skips_invalid() {
        let mut t = table(&[10, 30, 50]);
        t.set_valid(id(50), false);
        t.set_valid(id(10), false);

        assert_eq!(t.next_speaker(id(40)), Some(id(30)));
        t.set_valid(id(30), false);
        assert_eq!(t.next_speaker(id(40)), None);
    }

    #[test]
    fn test_ring_observed_processed() {
        let mut t = table(&[2, 3]);
        t.mark_processed(id(2));
        assert_eq!(t.next_speaker(id(1)), Some(id(3)));
    }

    #[test]
    fn test_is_lowest() {
        let mut t = table(&[5, 9]);
        assert!(t.is_lowest(id(3)));
        assert!(!t.is_lowest(id(7)));

        t.set_valid(id(5), false);
        assert!(t.is_lowest(id(7)));
    }

    #[test]
    fn test_duplicate_detection() {
        let mut t = table(&[1]);
        let n = t.get_mut(id(1)).unwrap();
        assert!(!n.is_duplicate(0));

        n.last_trans_id = Some(10);
        assert!(n.is_duplicate(10));
        assert!(n.is_duplicate(9));
        assert!(!n.is_duplicate(11));
    }
}
