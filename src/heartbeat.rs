//! Failure detection.
//!
//! Leaders ping every peer and followers ping their leader each interval.
//! The monitor runs on a shorter period: on a follower it watches the
//! leader's heartbeat age and asks for an election, on the leader it flags
//! followers that went quiet so they drop out of the ring and out of room
//! placement.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::election::Coordinator;
use crate::protocol::{Message, NodeId, NodeRole, Outbound};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Followers flagged failed on this tick (leader only).
    pub newly_failed: Vec<NodeId>,
    pub start_election: bool,
}

impl Coordinator {
    pub fn heartbeat_targets(&self) -> Vec<Outbound> {
        let me = self.view.me();
        let beat = Message::Heartbeat { from: me };
        match self.role {
            NodeRole::Leader => self
                .view
                .peers()
                .values()
                .map(|&addr| Outbound::new(addr, beat.clone()))
                .collect(),
            NodeRole::Follower => match self.leader {
                Some((id, addr)) if id != me => vec![Outbound::new(addr, beat)],
                _ => Vec::new(),
            },
            NodeRole::Candidate => Vec::new(),
        }
    }

    /// Returns the leader address when this heartbeat made us discover a
    /// leader we did not know about.
    pub fn record_heartbeat(&mut self, from: NodeId, src: SocketAddr, now: Instant) -> Option<SocketAddr> {
        let me = self.view.me();
        self.peer_seen.insert(from, now);

        if self.leader.map(|(id, _)| id) == Some(from) {
            self.last_heartbeat_from_leader = now;
            return None;
        }

        if self.role == NodeRole::Leader {
            if self.view.address_of(from).is_none() {
                self.view.add_peer(from, src);
            }
            return None;
        }

        if self.leader.is_none() && !self.election.participant {
            self.adopt_leader(from, src, now);
            return Some(src);
        }

        debug!("[{}] ignoring heartbeat from non-leader {}", me, from);
        None
    }

    pub fn monitor_tick(&mut self, now: Instant, timeout: Duration) -> MonitorReport {
        let me = self.view.me();
        let mut report = MonitorReport::default();

        if self.role == NodeRole::Leader {
            let quiet: Vec<NodeId> = self
                .view
                .peers()
                .keys()
                .copied()
                .filter(|id| !self.view.is_failed(*id))
                .filter(|id| match self.peer_seen.get(id) {
                    Some(seen) => now.saturating_duration_since(*seen) > timeout,
                    None => false,
                })
                .collect();
            for id in quiet {
                if self.view.mark_failed(id) {
                    warn!("[{}] follower {} silent for over {:?}; excluding from ring", me, id, timeout);
                    report.newly_failed.push(id);
                }
            }
            return report;
        }

        if now.saturating_duration_since(self.last_heartbeat_from_leader) <= timeout {
            return report;
        }

        if let Some((id, _)) = self.leader {
            if id != me && self.view.mark_failed(id) {
                warn!("[{}] leader {} timed out", me, id);
            }
        }

        if self.election.in_progress {
            let stalled = self
                .election
                .started_at
                .map_or(true, |t| now.saturating_duration_since(t) > timeout);
            if !stalled {
                return report;
            }
            self.abandon_election();
        } else {
            info!("[{}] no heartbeat for over {:?}; leader presumed dead", me, timeout);
        }
        self.leader = None;
        report.start_election = true;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterView;

    const TIMEOUT: Duration = Duration::from_secs(6);

    fn addr(id: NodeId) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5000 + id as u16))
    }

    fn node(me: NodeId, ids: &[NodeId], now: Instant) -> Coordinator {
        let peers = ids.iter().filter(|&&p| p != me).map(|&p| (p, addr(p)));
        Coordinator::new(ClusterView::with_peers(me, addr(me), peers), now)
    }

    fn secs(t0: Instant, s: u64) -> Instant {
        t0 + Duration::from_secs(s)
    }

    #[test]
    fn leader_pings_everyone_follower_pings_leader() {
        let t0 = Instant::now();
        let mut leader = node(3, &[1, 2, 3], t0);
        leader.handle_election(3, t0);
        let targets: Vec<SocketAddr> = leader.heartbeat_targets().into_iter().map(|o| o.to).collect();
        assert_eq!(targets, vec![addr(1), addr(2)]);

        let mut follower = node(1, &[1, 2, 3], t0);
        assert!(follower.heartbeat_targets().is_empty());
        follower.handle_leader_announce(3, addr(3), t0);
        let out = follower.heartbeat_targets();
        assert_eq!(out, vec![Outbound::new(addr(3), Message::Heartbeat { from: 1 })]);
    }

    #[test]
    fn timeout_triggers_once_per_window() {
        let t0 = Instant::now();
        let mut n = node(1, &[1, 2, 3], t0);
        n.handle_leader_announce(3, addr(3), t0);

        assert!(!n.monitor_tick(secs(t0, 5), TIMEOUT).start_election);
        assert!(!n.monitor_tick(secs(t0, 6), TIMEOUT).start_election);

        let report = n.monitor_tick(secs(t0, 7), TIMEOUT);
        assert!(report.start_election);
        assert!(n.view().is_failed(3));
        assert!(n.leader().is_none());
        n.start_election(secs(t0, 7));

        let fired = (8..=13).filter(|&s| n.monitor_tick(secs(t0, s), TIMEOUT).start_election).count();
        assert_eq!(fired, 0);

        // the round never finished: retry after one more window
        assert!(n.monitor_tick(secs(t0, 14), TIMEOUT).start_election);
        assert!(!n.election().participant);
        assert_eq!(n.start_election(secs(t0, 14)).len(), 1);
    }

    #[test]
    fn heartbeat_from_leader_resets_the_countdown() {
        let t0 = Instant::now();
        let mut n = node(2, &[1, 2, 3], t0);
        n.handle_leader_announce(3, addr(3), t0);
        assert_eq!(n.record_heartbeat(3, addr(3), secs(t0, 5)), None);
        assert!(!n.monitor_tick(secs(t0, 10), TIMEOUT).start_election);
        assert!(n.monitor_tick(secs(t0, 12), TIMEOUT).start_election);
    }

    #[test]
    fn leaderless_node_adopts_heartbeat_sender() {
        let t0 = Instant::now();
        let mut n = node(1, &[1], t0);
        assert_eq!(n.record_heartbeat(4, addr(4), t0), Some(addr(4)));
        assert_eq!(n.role(), NodeRole::Follower);
        assert_eq!(n.leader(), Some((4, addr(4))));
        assert_eq!(n.view().ring(), &[1, 4]);
    }

    #[test]
    fn leader_excludes_silent_followers() {
        let t0 = Instant::now();
        let mut leader = node(3, &[1, 2, 3], t0);
        leader.handle_election(3, t0);

        leader.record_heartbeat(1, addr(1), secs(t0, 4));
        let report = leader.monitor_tick(secs(t0, 8), TIMEOUT);
        assert_eq!(report.newly_failed, vec![2]);
        assert!(!report.start_election);
        assert_eq!(leader.view().live_ids(), vec![1, 3]);

        // flagged once only; a later heartbeat does not unflag
        assert!(leader.monitor_tick(secs(t0, 9), TIMEOUT).newly_failed.is_empty());
        leader.record_heartbeat(2, addr(2), secs(t0, 9));
        assert!(leader.view().is_failed(2));
    }
}
