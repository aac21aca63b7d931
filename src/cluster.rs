use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use crate::error::ClusterError;
use crate::protocol::NodeId;

/// Known membership plus the sorted id ring built over it.
///
/// `ring` always holds `me` exactly once and is strictly increasing; the
/// successor of the largest id is the smallest. `failed` is the exclusion
/// set fed by the failure detector.
#[derive(Debug, Clone)]
pub struct ClusterView {
    me: NodeId,
    my_addr: SocketAddr,
    peers: BTreeMap<NodeId, SocketAddr>,
    ring: Vec<NodeId>,
    failed: BTreeSet<NodeId>,
}

impl ClusterView {
    pub fn new(me: NodeId, my_addr: SocketAddr) -> Self {
        Self {
            me,
            my_addr,
            peers: BTreeMap::new(),
            ring: vec![me],
            failed: BTreeSet::new(),
        }
    }

    pub fn with_peers(me: NodeId, my_addr: SocketAddr, peers: impl IntoIterator<Item = (NodeId, SocketAddr)>) -> Self {
        let mut view = Self::new(me, my_addr);
        for (id, addr) in peers {
            view.add_peer(id, addr);
        }
        view
    }

    pub fn me(&self) -> NodeId {
        self.me
    }

    pub fn my_addr(&self) -> SocketAddr {
        self.my_addr
    }

    /// Idempotent. Re-adding a known id only refreshes its address.
    pub fn add_peer(&mut self, id: NodeId, addr: SocketAddr) {
        if id == self.me {
            return;
        }
        if self.peers.insert(id, addr).is_none() {
            self.rebuild_ring();
        }
    }

    fn rebuild_ring(&mut self) {
        // BTreeMap keys are already ascending
        let mut ring: Vec<NodeId> = self.peers.keys().copied().collect();
        let pos = ring.partition_point(|&id| id < self.me);
        ring.insert(pos, self.me);
        self.ring = ring;
    }

    pub fn peers(&self) -> &BTreeMap<NodeId, SocketAddr> {
        &self.peers
    }

    pub fn ring(&self) -> &[NodeId] {
        &self.ring
    }

    pub fn address_of(&self, id: NodeId) -> Option<SocketAddr> {
        if id == self.me {
            Some(self.my_addr)
        } else {
            self.peers.get(&id).copied()
        }
    }

    /// Address of the next id in ring order, wrapping to the minimum.
    pub fn successor(&self, id: NodeId) -> Result<SocketAddr, ClusterError> {
        let pos = self
            .ring
            .binary_search(&id)
            .map_err(|_| ClusterError::UnknownNode(id))?;
        let next = self.ring[(pos + 1) % self.ring.len()];
        self.address_of(next).ok_or(ClusterError::UnknownNode(next))
    }

    /// First ring entry after `from` that is not flagged failed. Falls back
    /// to this node when everyone else is excluded.
    pub fn next_live(&self, from: NodeId) -> NodeId {
        let n = self.ring.len();
        // an id outside the ring starts the walk at its insertion point
        let start = match self.ring.binary_search(&from) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };
        (0..n)
            .map(|step| self.ring[(start + step) % n])
            .find(|&id| id != from && (id == self.me || !self.failed.contains(&id)))
            .unwrap_or(self.me)
    }

    pub fn ring_skip_down(&self, from: NodeId) -> SocketAddr {
        let next = self.next_live(from);
        self.address_of(next).unwrap_or(self.my_addr)
    }

    /// Returns true when the flag is new.
    pub fn mark_failed(&mut self, id: NodeId) -> bool {
        if id == self.me || !self.peers.contains_key(&id) {
            return false;
        }
        self.failed.insert(id)
    }

    pub fn clear_failed(&mut self, id: NodeId) -> bool {
        self.failed.remove(&id)
    }

    pub fn is_failed(&self, id: NodeId) -> bool {
        self.failed.contains(&id)
    }

    pub fn failed(&self) -> &BTreeSet<NodeId> {
        &self.failed
    }

    /// Ring members not flagged failed, ascending. Always includes `me`.
    pub fn live_ids(&self) -> Vec<NodeId> {
        self.ring
            .iter()
            .copied()
            .filter(|id| !self.failed.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn four_ring(me: NodeId) -> ClusterView {
        let peers = (1..=4).filter(|&id| id != me).map(|id| (id, addr(5000 + id as u16)));
        ClusterView::with_peers(me, addr(5000 + me as u16), peers)
    }

    #[test]
    fn ring_is_sorted_and_contains_self_once() {
        let mut view = ClusterView::new(3, addr(5003));
        view.add_peer(4, addr(5004));
        view.add_peer(1, addr(5001));
        view.add_peer(1, addr(5001));
        view.add_peer(3, addr(9999));
        assert_eq!(view.ring(), &[1, 3, 4]);
        assert_eq!(view.address_of(3), Some(addr(5003)));
    }

    #[test]
    fn successor_wraps_around() {
        let view = four_ring(1);
        assert_eq!(view.successor(1).unwrap(), addr(5002));
        assert_eq!(view.successor(4).unwrap(), addr(5001));
        assert!(matches!(view.successor(7), Err(ClusterError::UnknownNode(7))));
    }

    #[test]
    fn skip_down_passes_over_failed_nodes() {
        let mut view = four_ring(3);
        assert_eq!(view.ring_skip_down(3), addr(5004));
        view.mark_failed(4);
        assert_eq!(view.ring_skip_down(3), addr(5001));
        view.mark_failed(1);
        assert_eq!(view.ring_skip_down(3), addr(5002));
    }

    #[test]
    fn skip_down_degenerates_to_self() {
        let mut view = four_ring(2);
        for id in [1, 3, 4] {
            assert!(view.mark_failed(id));
        }
        assert_eq!(view.ring_skip_down(2), addr(5002));
        assert_eq!(ClusterView::new(9, addr(5009)).ring_skip_down(9), addr(5009));
    }

    #[test]
    fn self_is_never_flagged() {
        let mut view = four_ring(2);
        assert!(!view.mark_failed(2));
        assert!(!view.mark_failed(42));
        assert!(view.mark_failed(3));
        assert!(!view.mark_failed(3));
        assert_eq!(view.live_ids(), vec![1, 2, 4]);
        assert!(view.clear_failed(3));
        assert_eq!(view.live_ids(), vec![1, 2, 3, 4]);
    }
}
