use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cluster::ClusterView;
use crate::config::{NodeConfig, Timing};
use crate::delivery::{AckOutcome, DeliveryTracker, PendingDelivery};
use crate::election::Coordinator;
use crate::heartbeat::MonitorReport;
use crate::protocol::{self, ClientId, Envelope, Message, MessageId, NodeId, NodeRole, Outbound};
use crate::rooms::RoomDirectory;
use crate::transport::{Inbound, Transport};

/// One relay process.
///
/// State is split into three lock groups (membership/election, room
/// directory, pending deliveries). When more than one is needed they are
/// taken in that order. Handlers collect outbound messages and send them
/// after the locks are released.
pub struct RelayNode {
    id: NodeId,
    addr: SocketAddr,
    timing: Timing,
    transport: Arc<dyn Transport>,
    ring: Mutex<Coordinator>,
    directory: Mutex<RoomDirectory>,
    deliveries: Mutex<DeliveryTracker>,
}

impl RelayNode {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let addr = transport.local_addr();
        let view = ClusterView::with_peers(config.id, addr, config.peers);
        Arc::new(Self {
            id: config.id,
            addr,
            timing: config.timing,
            transport,
            ring: Mutex::new(Coordinator::new(view, Instant::now())),
            directory: Mutex::new(RoomDirectory::new(config.id)),
            deliveries: Mutex::new(DeliveryTracker::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Spawn the dispatch loop and the periodic loops. They run for the
    /// life of the process.
    pub fn start(self: &Arc<Self>, inbound: Inbound) -> Vec<JoinHandle<()>> {
        info!("[{}] relay node starting on {}", self.id, self.addr);
        let mut handles = Vec::new();

        let me = self.clone();
        handles.push(tokio::spawn(async move { me.dispatch_loop(inbound).await }));

        let me = self.clone();
        handles.push(tokio::spawn(async move { me.heartbeat_loop().await }));

        let me = self.clone();
        handles.push(tokio::spawn(async move { me.monitor_loop().await }));

        let me = self.clone();
        handles.push(tokio::spawn(async move { me.resend_loop().await }));

        let me = self.clone();
        handles.push(tokio::spawn(async move { me.announce_loop().await }));

        handles
    }

    fn send_all(&self, out: impl IntoIterator<Item = Outbound>) {
        for o in out {
            self.transport.send(o.to, o.message);
        }
    }

    // ── loops ────────────────────────────────────────────────────────────

    async fn dispatch_loop(&self, mut inbound: Inbound) {
        while let Some(env) = inbound.recv().await {
            self.handle_message(env).await;
        }
        info!("[{}] inbound channel closed; dispatcher stopping", self.id);
    }

    async fn heartbeat_loop(&self) {
        loop {
            sleep(self.timing.heartbeat_interval).await;
            let out = self.ring.lock().await.heartbeat_targets();
            self.send_all(out);
        }
    }

    async fn monitor_loop(&self) {
        loop {
            sleep(self.timing.monitor_interval).await;
            self.monitor_tick(Instant::now()).await;
        }
    }

    async fn resend_loop(&self) {
        loop {
            sleep(self.timing.sweep_interval).await;
            self.sweep(Instant::now()).await;
        }
    }

    /// Tell configured peers we exist until some leader is known. Bounded,
    /// with doubling backoff capped at the heartbeat timeout.
    async fn announce_loop(&self) {
        let mut backoff = self.timing.announce_backoff;
        for attempt in 1..=self.timing.announce_retries {
            let peers: Vec<SocketAddr> = {
                let ring = self.ring.lock().await;
                if ring.leader().is_some() {
                    break;
                }
                ring.view().peers().values().copied().collect()
            };
            if peers.is_empty() {
                break;
            }
            debug!("[{}] SERVER_UP round {} to {} peer(s)", self.id, attempt, peers.len());
            self.send_all(
                peers
                    .into_iter()
                    .map(|p| Outbound::new(p, Message::ServerUp { server_id: self.id })),
            );
            // small jitter so restarted nodes don't announce in lockstep
            let jitter = Duration::from_millis(rand::random::<u64>() % 50);
            sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(self.timing.heartbeat_timeout);
        }
    }

    /// One failure-detector pass. Starts an election when the leader has
    /// gone quiet.
    pub async fn monitor_tick(&self, now: Instant) -> MonitorReport {
        let (report, out) = {
            let mut ring = self.ring.lock().await;
            let report = ring.monitor_tick(now, self.timing.heartbeat_timeout);
            let out = if report.start_election { ring.start_election(now) } else { Vec::new() };
            (report, out)
        };
        self.send_all(out);
        report
    }

    /// One resend pass. Returns how many RESEND_REQUESTs went out.
    pub async fn sweep(&self, now: Instant) -> usize {
        let due = self.deliveries.lock().await.sweep(now, self.timing.ack_timeout);
        if due.is_empty() {
            return 0;
        }
        let out: Vec<Outbound> = {
            let dir = self.directory.lock().await;
            due.into_iter()
                .filter_map(|(message_id, sender)| match dir.session_addr(&sender) {
                    Some(addr) => {
                        info!("[{}] requesting resend of {} from {}", self.id, message_id, sender);
                        Some(Outbound::new(addr, Message::ResendRequest { message_id }))
                    }
                    None => {
                        warn!("[{}] no address for sender {} of {}", self.id, sender, message_id);
                        None
                    }
                })
                .collect()
        };
        let n = out.len();
        self.send_all(out);
        n
    }

    pub async fn start_election(&self) {
        let out = self.ring.lock().await.start_election(Instant::now());
        self.send_all(out);
    }

    // ── dispatch ─────────────────────────────────────────────────────────

    pub async fn handle_message(&self, env: Envelope) {
        let Envelope { from: src, message } = env;
        match message {
            Message::ClientJoin { client_id } => self.on_client_join(client_id, src).await,
            Message::ListChatrooms => {
                let rooms = self.directory.lock().await.room_names();
                self.transport.send(src, protocol::chatrooms_list(rooms));
            }
            Message::CreateChatroom { room, client_id, reply_to } => {
                self.on_room_request(room, client_id, reply_to, src, true).await
            }
            Message::JoinChatroom { room, client_id, reply_to } => {
                self.on_room_request(room, client_id, reply_to, src, false).await
            }
            Message::RoomAssignmentUpdate { room, server_id } => {
                self.directory.lock().await.apply_assignment(&room, server_id);
            }
            Message::ChatMsg { message_id, from, room, body } => {
                self.on_chat(message_id, from, room, body, src).await
            }
            Message::Ack { message_id, from } => self.on_ack(message_id, from, src).await,
            Message::Heartbeat { from } => self.on_heartbeat(from, src).await,
            Message::Election { mid } => self.on_election(mid).await,
            Message::LeaderAnnounce { mid, address } => self.on_leader_announce(mid, address).await,
            Message::StateSync { rooms, sid } => self.on_state_sync(rooms, sid, src).await,
            Message::ServerUp { server_id } => self.on_server_up(server_id, src).await,
            Message::DirectorySync { chatrooms, server_load } => {
                self.directory.lock().await.apply_directory_sync(chatrooms, server_load);
                debug!("[{}] directory replica synced from {}", self.id, src);
            }
            other @ (Message::ChatroomsList { .. }
            | Message::RoomAssignment { .. }
            | Message::Delivered { .. }
            | Message::ResendRequest { .. }) => {
                debug!("[{}] ignoring client-bound {} from {}", self.id, other.kind(), src);
            }
        }
    }

    // ── clients and rooms ────────────────────────────────────────────────

    async fn on_client_join(&self, client_id: ClientId, src: SocketAddr) {
        let rooms = {
            let mut dir = self.directory.lock().await;
            dir.touch_session(&client_id, src);
            dir.room_names()
        };
        info!("[{}] client {} connected from {}", self.id, client_id, src);
        self.transport.send(src, protocol::chatrooms_list(rooms));
    }

    /// CREATE_CHATROOM and JOIN_CHATROOM. The owner attaches the client;
    /// the leader places unknown rooms (joining a missing room creates it);
    /// a follower answers from its replica when it knows the owner and
    /// otherwise relays to the leader once.
    async fn on_room_request(
        &self,
        room: String,
        client_id: ClientId,
        reply_to: Option<SocketAddr>,
        src: SocketAddr,
        create: bool,
    ) {
        let client_addr = reply_to.unwrap_or(src);
        let mut out = Vec::new();
        {
            let ring = self.ring.lock().await;
            let mut dir = self.directory.lock().await;
            dir.touch_session(&client_id, client_addr);

            if dir.join(&room, &client_id) {
                out.push(Outbound::new(client_addr, Message::RoomAssignment { room, server_addr: self.addr }));
            } else if ring.is_leader() {
                let placement = dir.create_or_get(&room, &ring.view().live_ids());
                if placement.created {
                    for &peer in ring.view().peers().values() {
                        out.push(Outbound::new(
                            peer,
                            Message::RoomAssignmentUpdate { room: room.clone(), server_id: placement.owner },
                        ));
                    }
                } else if placement.owner != self.id {
                    // a request for a known room reaching the leader means the
                    // owner may have missed its update; repeat it to the owner
                    if let Some(owner_addr) = ring.view().address_of(placement.owner) {
                        out.push(Outbound::new(
                            owner_addr,
                            Message::RoomAssignmentUpdate { room: room.clone(), server_id: placement.owner },
                        ));
                    }
                }
                if placement.owner == self.id {
                    dir.join(&room, &client_id);
                }
                match ring.view().address_of(placement.owner) {
                    Some(server_addr) => {
                        out.push(Outbound::new(client_addr, Message::RoomAssignment { room, server_addr }))
                    }
                    None => warn!("[{}] owner {} of '{}' has no known address", self.id, placement.owner, room),
                }
            } else if reply_to.is_some() {
                warn!("[{}] relayed request for '{}' reached a non-leader; dropping", self.id, room);
            } else if let Some(server_addr) = dir
                .owner_of(&room)
                .filter(|&owner| owner != self.id)
                .and_then(|owner| ring.view().address_of(owner))
            {
                debug!("[{}] '{}' lives on {}; answering from replica", self.id, room, server_addr);
                out.push(Outbound::new(client_addr, Message::RoomAssignment { room, server_addr }));
            } else if let Some(leader) = ring.leader_addr() {
                let reply_to = Some(client_addr);
                let relayed = if create {
                    Message::CreateChatroom { room, client_id, reply_to }
                } else {
                    Message::JoinChatroom { room, client_id, reply_to }
                };
                debug!("[{}] relaying {} to leader {}", self.id, relayed.kind(), leader);
                out.push(Outbound::new(leader, relayed));
            } else {
                warn!("[{}] no leader known; dropping request for '{}'", self.id, room);
            }
        }
        self.send_all(out);
    }

    async fn on_chat(&self, message_id: MessageId, from: ClientId, room: String, body: String, src: SocketAddr) {
        let members = {
            let mut dir = self.directory.lock().await;
            dir.touch_session(&from, src);
            // writing to a hosted room implies membership
            if dir.join(&room, &from) {
                dir.members(&room).cloned()
            } else {
                None
            }
        };
        let Some(members) = members else {
            self.redirect_chat(room, from, src).await;
            return;
        };

        debug!("[{}] [{}] {}: {}", self.id, room, from, body);
        let payload = Message::ChatMsg { message_id: message_id.clone(), from: from.clone(), room: room.clone(), body };
        let fan = self.deliveries.lock().await.on_chat_message(
            &message_id,
            &from,
            &room,
            payload.clone(),
            &members,
            Instant::now(),
        );

        let mut out = Vec::new();
        {
            let dir = self.directory.lock().await;
            for member in &fan.recipients {
                match dir.session_addr(member) {
                    Some(addr) => out.push(Outbound::new(addr, payload.clone())),
                    None => warn!("[{}] member {} of '{}' has no session", self.id, member, room),
                }
            }
        }
        if fan.delivered {
            out.push(Outbound::new(src, Message::Delivered { message_id }));
        }
        self.send_all(out);
    }

    /// A chat for a room hosted elsewhere: point the client at the owner,
    /// or treat it as a join when no owner is known yet.
    async fn redirect_chat(&self, room: String, client_id: ClientId, src: SocketAddr) {
        let owner_addr = {
            let ring = self.ring.lock().await;
            let dir = self.directory.lock().await;
            dir.owner_of(&room).and_then(|owner| ring.view().address_of(owner))
        };
        match owner_addr {
            Some(server_addr) => {
                debug!("[{}] redirecting {} to owner of '{}' at {}", self.id, client_id, room, server_addr);
                self.transport.send(src, Message::RoomAssignment { room, server_addr });
            }
            None => self.on_room_request(room, client_id, None, src, false).await,
        }
    }

    async fn on_ack(&self, message_id: MessageId, client: ClientId, src: SocketAddr) {
        let outcome = {
            self.directory.lock().await.touch_session(&client, src);
            self.deliveries.lock().await.on_ack(&message_id, &client)
        };
        match outcome {
            AckOutcome::Complete { sender } => {
                let addr = self.directory.lock().await.session_addr(&sender);
                match addr {
                    Some(addr) => self.transport.send(addr, Message::Delivered { message_id }),
                    None => warn!("[{}] delivered {} but sender {} has no session", self.id, message_id, sender),
                }
            }
            AckOutcome::Waiting(left) => debug!("[{}] {} acked by {}; {} left", self.id, message_id, client, left),
            AckOutcome::Unknown => debug!("[{}] ack for unknown message {}", self.id, message_id),
        }
    }

    // ── cluster coordination ─────────────────────────────────────────────

    fn state_sync(&self, dir: &RoomDirectory, leader: SocketAddr) -> Vec<Outbound> {
        protocol::state_sync(self.id, dir.hosted_rooms())
            .into_iter()
            .map(|m| Outbound::new(leader, m))
            .collect()
    }

    async fn on_heartbeat(&self, from: NodeId, src: SocketAddr) {
        let adopted = self.ring.lock().await.record_heartbeat(from, src, Instant::now());
        if let Some(leader) = adopted {
            let sync = self.state_sync(&*self.directory.lock().await, leader);
            self.send_all(sync);
        }
    }

    async fn on_election(&self, mid: NodeId) {
        let (out, elected, known) = {
            let mut ring = self.ring.lock().await;
            let was_leader = ring.is_leader();
            let out = ring.handle_election(mid, Instant::now());
            (out, !was_leader && ring.is_leader(), ring.view().ring().to_vec())
        };
        if elected {
            self.directory.lock().await.rebuild_load(&known);
        }
        self.send_all(out);
    }

    async fn on_leader_announce(&self, mid: NodeId, address: SocketAddr) {
        let outcome = self.ring.lock().await.handle_leader_announce(mid, address, Instant::now());
        let mut out = outcome.outbound;
        if let Some(leader) = outcome.follow {
            out.extend(self.state_sync(&*self.directory.lock().await, leader));
        }
        self.send_all(out);
    }

    /// Leader rebuilds ownership and load from a follower's hosted rooms.
    async fn on_state_sync(&self, rooms: Vec<String>, sid: NodeId, src: SocketAddr) {
        let mut out = Vec::new();
        {
            let mut ring = self.ring.lock().await;
            if !ring.is_leader() {
                debug!("[{}] STATE_SYNC from {} but not leader", self.id, sid);
                return;
            }
            ring.view_mut().add_peer(sid, src);
            let mut dir = self.directory.lock().await;
            let changed = dir.absorb_state_sync(sid, &rooms);
            dir.rebuild_load(ring.view().ring());
            for room in changed {
                for (&peer, &addr) in ring.view().peers() {
                    if peer != sid {
                        out.push(Outbound::new(addr, Message::RoomAssignmentUpdate { room: room.clone(), server_id: sid }));
                    }
                }
            }
            info!("[{}] state sync from {}: {} hosted room(s)", self.id, sid, rooms.len());
        }
        self.send_all(out);
    }

    /// A node announcing itself is an explicit rejoin: it is (re)added to
    /// the ring and any failed flag is lifted.
    async fn on_server_up(&self, server_id: NodeId, src: SocketAddr) {
        let mut out = Vec::new();
        {
            let mut ring = self.ring.lock().await;
            ring.view_mut().add_peer(server_id, src);
            if ring.view_mut().clear_failed(server_id) {
                info!("[{}] node {} rejoined", self.id, server_id);
            }
            if ring.is_leader() {
                ring.peer_seen.insert(server_id, Instant::now());
                let mut dir = self.directory.lock().await;
                dir.rebuild_load(ring.view().ring());
                out.extend(
                    protocol::directory_sync(dir.chatrooms(), dir.server_load())
                        .into_iter()
                        .map(|m| Outbound::new(src, m)),
                );
                out.push(Outbound::new(src, Message::Heartbeat { from: self.id }));
            }
        }
        info!("[{}] node {} is up at {}", self.id, server_id, src);
        self.send_all(out);
    }

    // ── inspection ───────────────────────────────────────────────────────

    pub async fn role(&self) -> NodeRole {
        self.ring.lock().await.role()
    }

    pub async fn leader(&self) -> Option<(NodeId, SocketAddr)> {
        self.ring.lock().await.leader()
    }

    pub async fn failed_peers(&self) -> Vec<NodeId> {
        self.ring.lock().await.view().failed().iter().copied().collect()
    }

    pub async fn ring_ids(&self) -> Vec<NodeId> {
        self.ring.lock().await.view().ring().to_vec()
    }

    pub async fn room_owner(&self, room: &str) -> Option<NodeId> {
        self.directory.lock().await.owner_of(room)
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.directory.lock().await.room_names()
    }

    pub async fn server_load(&self) -> BTreeMap<NodeId, u32> {
        self.directory.lock().await.server_load().clone()
    }

    pub async fn members(&self, room: &str) -> Vec<ClientId> {
        self.directory
            .lock()
            .await
            .members(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn pending(&self, message_id: &str) -> Option<PendingDelivery> {
        self.deliveries.lock().await.get(message_id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.deliveries.lock().await.len()
    }
}
