//! Ring leader election (Chang–Roberts).
//!
//! An ELECTION message carries the largest id seen so far around the
//! sorted ring. A node forwards larger ids, replaces smaller ones with its
//! own the first time it participates, and drops smaller ones afterwards.
//! The node that receives its own id back is the maximum live id and
//! announces itself; the announcement makes one circuit and stops at its
//! originator.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::ClusterView;
use crate::protocol::{Message, NodeId, NodeRole, Outbound};

#[derive(Debug, Clone, Default)]
pub struct ElectionState {
    pub participant: bool,
    pub in_progress: bool,
    /// When this node first took part in the current round.
    pub started_at: Option<Instant>,
    /// Leader id whose announcement was already relayed this round.
    forwarded_announce: Option<NodeId>,
}

impl ElectionState {
    fn enter(&mut self, now: Instant) {
        if !self.participant {
            self.forwarded_announce = None;
        }
        self.participant = true;
        self.in_progress = true;
        self.started_at.get_or_insert(now);
    }

    fn finish(&mut self) {
        self.participant = false;
        self.in_progress = false;
        self.started_at = None;
    }
}

/// What accepting a LEADER_ANNOUNCE requires of the rest of the node.
#[derive(Debug, Default)]
pub struct AnnounceOutcome {
    pub outbound: Vec<Outbound>,
    /// Set when this node just became a follower of the given leader and
    /// should report its hosted rooms there.
    pub follow: Option<SocketAddr>,
}

/// Cluster membership, election bookkeeping and liveness timestamps. These
/// change together, so they live behind a single lock.
#[derive(Debug)]
pub struct Coordinator {
    pub(crate) view: ClusterView,
    pub(crate) election: ElectionState,
    pub(crate) role: NodeRole,
    pub(crate) leader: Option<(NodeId, SocketAddr)>,
    pub(crate) last_heartbeat_from_leader: Instant,
    /// Last heartbeat per follower, maintained while leader.
    pub(crate) peer_seen: HashMap<NodeId, Instant>,
}

impl Coordinator {
    pub fn new(view: ClusterView, now: Instant) -> Self {
        Self {
            view,
            election: ElectionState::default(),
            role: NodeRole::Follower,
            leader: None,
            last_heartbeat_from_leader: now,
            peer_seen: HashMap::new(),
        }
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ClusterView {
        &mut self.view
    }

    pub fn election(&self) -> &ElectionState {
        &self.election
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn leader(&self) -> Option<(NodeId, SocketAddr)> {
        self.leader
    }

    pub fn leader_addr(&self) -> Option<SocketAddr> {
        self.leader.map(|(_, addr)| addr)
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    fn neighbor(&self) -> SocketAddr {
        self.view.ring_skip_down(self.view.me())
    }

    /// No-op while already participating, so overlapping triggers cannot
    /// flood the ring.
    pub fn start_election(&mut self, now: Instant) -> Vec<Outbound> {
        let me = self.view.me();
        if self.election.participant {
            debug!("[{}] election already in flight", me);
            return Vec::new();
        }
        self.election.enter(now);
        self.role = NodeRole::Candidate;

        let neighbor = self.neighbor();
        info!("[{}] starting election, sending to {}", me, neighbor);
        vec![Outbound::new(neighbor, Message::Election { mid: me })]
    }

    /// Drop a round that never completed so a fresh one can start.
    pub fn abandon_election(&mut self) {
        if self.election.in_progress {
            info!("[{}] abandoning stalled election", self.view.me());
        }
        self.election.finish();
        if self.role == NodeRole::Candidate {
            self.role = NodeRole::Follower;
        }
    }

    pub fn handle_election(&mut self, mid: NodeId, now: Instant) -> Vec<Outbound> {
        let me = self.view.me();
        let neighbor = self.neighbor();

        if mid > me {
            self.election.enter(now);
            self.role = NodeRole::Candidate;
            debug!("[{}] forwarding ELECTION({}) to {}", me, mid, neighbor);
            return vec![Outbound::new(neighbor, Message::Election { mid })];
        }

        if mid == me {
            return self.become_leader(now);
        }

        if self.election.participant {
            debug!("[{}] discarding stale ELECTION({})", me, mid);
            return Vec::new();
        }
        self.election.enter(now);
        self.role = NodeRole::Candidate;
        debug!("[{}] replacing ELECTION({}) with own id", me, mid);
        vec![Outbound::new(neighbor, Message::Election { mid: me })]
    }

    fn become_leader(&mut self, now: Instant) -> Vec<Outbound> {
        let me = self.view.me();
        let address = self.view.my_addr();
        info!("[{}] won election; announcing leadership", me);

        self.role = NodeRole::Leader;
        self.leader = Some((me, address));
        self.election.finish();
        self.election.forwarded_announce = Some(me);
        self.last_heartbeat_from_leader = now;
        // every follower gets a full timeout before being suspected
        self.peer_seen = self.view.peers().keys().map(|&id| (id, now)).collect();

        let neighbor = self.neighbor();
        vec![Outbound::new(neighbor, Message::LeaderAnnounce { mid: me, address })]
    }

    pub fn handle_leader_announce(&mut self, mid: NodeId, address: SocketAddr, now: Instant) -> AnnounceOutcome {
        let me = self.view.me();

        if mid == me {
            // our announcement completed its circuit
            if self.role != NodeRole::Leader {
                self.role = NodeRole::Leader;
                self.leader = Some((me, address));
                self.election.finish();
            }
            debug!("[{}] leadership announcement returned home", me);
            return AnnounceOutcome::default();
        }

        let repeat = !self.election.participant
            && self.election.forwarded_announce == Some(mid)
            && self.leader == Some((mid, address));
        self.last_heartbeat_from_leader = now;
        if repeat {
            debug!("[{}] announcement for {} already relayed", me, mid);
            return AnnounceOutcome::default();
        }

        self.view.add_peer(mid, address);
        self.view.clear_failed(mid);
        self.leader = Some((mid, address));
        self.role = NodeRole::Follower;
        self.election.finish();
        self.election.forwarded_announce = Some(mid);
        self.peer_seen.clear();
        info!("[{}] following leader {} at {}", me, mid, address);

        let mut outbound = Vec::new();
        let neighbor = self.neighbor();
        if neighbor != self.view.my_addr() {
            outbound.push(Outbound::new(neighbor, Message::LeaderAnnounce { mid, address }));
        }
        AnnounceOutcome { outbound, follow: Some(address) }
    }

    /// Accept `id` as leader without an announcement (heartbeat discovery).
    pub(crate) fn adopt_leader(&mut self, id: NodeId, address: SocketAddr, now: Instant) {
        self.view.add_peer(id, address);
        self.view.clear_failed(id);
        self.leader = Some((id, address));
        self.role = NodeRole::Follower;
        self.election.finish();
        self.last_heartbeat_from_leader = now;
        info!("[{}] discovered leader {} at {}", self.view.me(), id, address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn addr(id: NodeId) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5000 + id as u16))
    }

    fn id_of(a: SocketAddr) -> NodeId {
        (a.port() - 5000) as NodeId
    }

    fn ring(ids: &[NodeId], failed: &[NodeId], now: Instant) -> HashMap<NodeId, Coordinator> {
        ids.iter()
            .map(|&me| {
                let peers = ids.iter().filter(|&&p| p != me).map(|&p| (p, addr(p)));
                let mut view = ClusterView::with_peers(me, addr(me), peers);
                for &f in failed {
                    view.mark_failed(f);
                }
                (me, Coordinator::new(view, now))
            })
            .collect()
    }

    /// Delivers messages until the ring goes quiet, dropping anything sent
    /// to `dead`. Returns (election hops, announce hops).
    fn run(
        nodes: &mut HashMap<NodeId, Coordinator>,
        dead: &[NodeId],
        seed: Vec<Outbound>,
        now: Instant,
    ) -> (usize, usize) {
        let mut queue: VecDeque<Outbound> = seed.into();
        let (mut elections, mut announces) = (0, 0);
        while let Some(out) = queue.pop_front() {
            let to = id_of(out.to);
            if dead.contains(&to) {
                continue;
            }
            let node = nodes.get_mut(&to).unwrap();
            match out.message {
                Message::Election { mid } => {
                    elections += 1;
                    queue.extend(node.handle_election(mid, now));
                }
                Message::LeaderAnnounce { mid, address } => {
                    announces += 1;
                    queue.extend(node.handle_leader_announce(mid, address, now).outbound);
                }
                other => panic!("unexpected {other:?}"),
            }
            assert!(elections + announces < 1000, "ring did not terminate");
        }
        (elections, announces)
    }

    fn assert_single_leader(nodes: &HashMap<NodeId, Coordinator>, live: &[NodeId], expected: NodeId) {
        for &id in live {
            let node = &nodes[&id];
            let want = if id == expected { NodeRole::Leader } else { NodeRole::Follower };
            assert_eq!(node.role(), want, "node {id}");
            assert_eq!(node.leader_addr(), Some(addr(expected)), "node {id}");
            assert!(!node.election().participant, "node {id}");
        }
    }

    #[test]
    fn elects_maximum_from_any_starting_node() {
        let ids = [3, 7, 1, 9, 4];
        let now = Instant::now();
        for start in ids {
            let mut nodes = ring(&ids, &[], now);
            let seed = nodes.get_mut(&start).unwrap().start_election(now);
            let (elections, announces) = run(&mut nodes, &[], seed, now);
            assert_single_leader(&nodes, &ids, 9);
            assert!(elections <= 2 * ids.len(), "start {start}: {elections} hops");
            assert_eq!(announces, ids.len());
        }
    }

    #[test]
    fn concurrent_starts_still_converge() {
        let ids = [1, 2, 3, 4, 5];
        let now = Instant::now();
        let mut nodes = ring(&ids, &[], now);
        let mut seed = Vec::new();
        for id in ids {
            seed.extend(nodes.get_mut(&id).unwrap().start_election(now));
        }
        run(&mut nodes, &[], seed, now);
        assert_single_leader(&nodes, &ids, 5);
    }

    #[test]
    fn skips_unreachable_maximum() {
        let ids = [1, 2, 3, 4];
        let now = Instant::now();
        let mut nodes = ring(&ids, &[4], now);
        let seed = nodes.get_mut(&1).unwrap().start_election(now);
        run(&mut nodes, &[4], seed, now);
        assert_single_leader(&nodes, &[1, 2, 3], 3);
    }

    #[test]
    fn single_node_elects_itself_in_one_hop() {
        let now = Instant::now();
        let mut nodes = ring(&[6], &[], now);
        let seed = nodes.get_mut(&6).unwrap().start_election(now);
        assert_eq!(seed[0].to, addr(6));
        let (elections, announces) = run(&mut nodes, &[], seed, now);
        assert_eq!((elections, announces), (1, 1));
        assert_single_leader(&nodes, &[6], 6);
    }

    #[test]
    fn start_is_idempotent_while_participating() {
        let now = Instant::now();
        let mut nodes = ring(&[1, 2], &[], now);
        let node = nodes.get_mut(&1).unwrap();
        assert_eq!(node.start_election(now).len(), 1);
        assert!(node.start_election(now).is_empty());
        assert_eq!(node.role(), NodeRole::Candidate);
        node.abandon_election();
        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.start_election(now).len(), 1);
    }

    #[test]
    fn smaller_id_is_replaced_once_then_discarded() {
        let now = Instant::now();
        let mut nodes = ring(&[1, 5, 8], &[], now);
        let node = nodes.get_mut(&5).unwrap();
        let out = node.handle_election(1, now);
        assert_eq!(out, vec![Outbound::new(addr(8), Message::Election { mid: 5 })]);
        assert!(node.handle_election(1, now).is_empty());
        let out = node.handle_election(8, now);
        assert_eq!(out, vec![Outbound::new(addr(8), Message::Election { mid: 8 })]);
    }

    #[test]
    fn follower_requests_state_sync_and_relays_once() {
        let now = Instant::now();
        let mut nodes = ring(&[1, 2, 3], &[], now);
        let node = nodes.get_mut(&2).unwrap();
        let first = node.handle_leader_announce(3, addr(3), now);
        assert_eq!(first.follow, Some(addr(3)));
        assert_eq!(first.outbound.len(), 1);
        let again = node.handle_leader_announce(3, addr(3), now);
        assert!(again.follow.is_none());
        assert!(again.outbound.is_empty());
    }

    #[test]
    fn announce_clears_failed_flag_of_new_leader() {
        let now = Instant::now();
        let mut nodes = ring(&[1, 2, 3], &[3], now);
        let node = nodes.get_mut(&1).unwrap();
        node.handle_leader_announce(3, addr(3), now);
        assert!(!node.view().is_failed(3));
        assert_eq!(node.leader(), Some((3, addr(3))));
    }
}
