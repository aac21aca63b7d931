//! Room directory.
//!
//! Every node keeps a replica of room -> owner so it can answer lookups
//! locally, but only the leader assigns owners. Placement picks the live
//! node hosting the fewest rooms, smallest id first on ties. Load only
//! grows; rooms are never deleted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use tracing::{debug, info};

use crate::protocol::{ClientId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub name: String,
    pub owner: NodeId,
    pub members: BTreeSet<ClientId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub owner: NodeId,
    pub created: bool,
}

#[derive(Debug)]
pub struct RoomDirectory {
    me: NodeId,
    chatrooms: BTreeMap<String, NodeId>,
    server_load: BTreeMap<NodeId, u32>,
    /// Rooms this node owns, with their members.
    hosted: BTreeMap<String, RoomRecord>,
    sessions: HashMap<ClientId, SocketAddr>,
}

impl RoomDirectory {
    pub fn new(me: NodeId) -> Self {
        Self {
            me,
            chatrooms: BTreeMap::new(),
            server_load: BTreeMap::from([(me, 0)]),
            hosted: BTreeMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn room_names(&self) -> Vec<String> {
        self.chatrooms.keys().cloned().collect()
    }

    pub fn owner_of(&self, room: &str) -> Option<NodeId> {
        self.chatrooms.get(room).copied()
    }

    pub fn server_load(&self) -> &BTreeMap<NodeId, u32> {
        &self.server_load
    }

    pub fn chatrooms(&self) -> &BTreeMap<String, NodeId> {
        &self.chatrooms
    }

    /// Leader only. `candidates` are the live node ids eligible to host.
    pub fn create_or_get(&mut self, room: &str, candidates: &[NodeId]) -> Placement {
        if let Some(&owner) = self.chatrooms.get(room) {
            return Placement { owner, created: false };
        }
        for &id in candidates {
            self.server_load.entry(id).or_insert(0);
        }
        let owner = candidates
            .iter()
            .copied()
            .min_by_key(|id| (self.server_load.get(id).copied().unwrap_or(0), *id))
            .unwrap_or(self.me);

        self.chatrooms.insert(room.to_string(), owner);
        *self.server_load.entry(owner).or_insert(0) += 1;
        self.host_if_mine(room, owner);
        info!("[{}] room '{}' assigned to node {}", self.me, room, owner);
        Placement { owner, created: true }
    }

    /// Replica update from the leader.
    pub fn apply_assignment(&mut self, room: &str, owner: NodeId) {
        self.chatrooms.insert(room.to_string(), owner);
        self.host_if_mine(room, owner);
        debug!("[{}] replica: '{}' owned by {}", self.me, room, owner);
    }

    fn host_if_mine(&mut self, room: &str, owner: NodeId) {
        if owner == self.me && !self.hosted.contains_key(room) {
            self.hosted.insert(
                room.to_string(),
                RoomRecord { name: room.to_string(), owner, members: BTreeSet::new() },
            );
        }
    }

    /// Recount load from the ownership table over `known` nodes.
    pub fn rebuild_load(&mut self, known: &[NodeId]) {
        let mut load: BTreeMap<NodeId, u32> = known.iter().map(|&id| (id, 0)).collect();
        for &owner in self.chatrooms.values() {
            *load.entry(owner).or_insert(0) += 1;
        }
        self.server_load = load;
    }

    /// Leader side of STATE_SYNC. Returns the rooms whose ownership the
    /// leader did not already have on record.
    pub fn absorb_state_sync(&mut self, sid: NodeId, rooms: &[String]) -> Vec<String> {
        let mut changed = Vec::new();
        for room in rooms {
            if self.chatrooms.insert(room.clone(), sid) != Some(sid) {
                changed.push(room.clone());
            }
            self.host_if_mine(room, sid);
        }
        changed
    }

    /// Newcomer side of DIRECTORY_SYNC.
    pub fn apply_directory_sync(&mut self, chatrooms: BTreeMap<String, NodeId>, server_load: BTreeMap<NodeId, u32>) {
        for (room, owner) in chatrooms {
            self.host_if_mine(&room, owner);
            self.chatrooms.insert(room, owner);
        }
        self.server_load = server_load;
    }

    pub fn hosted_rooms(&self) -> Vec<String> {
        self.hosted.keys().cloned().collect()
    }

    pub fn hosts(&self, room: &str) -> bool {
        self.hosted.contains_key(room)
    }

    /// Attach a client to a room hosted here. False if the room lives
    /// elsewhere.
    pub fn join(&mut self, room: &str, client: &str) -> bool {
        match self.hosted.get_mut(room) {
            Some(record) => {
                if record.members.insert(client.to_string()) {
                    info!("[{}] client {} joined '{}'", self.me, client, room);
                }
                true
            }
            None => false,
        }
    }

    pub fn members(&self, room: &str) -> Option<&BTreeSet<ClientId>> {
        self.hosted.get(room).map(|r| &r.members)
    }

    pub fn touch_session(&mut self, client: &str, addr: SocketAddr) {
        match self.sessions.insert(client.to_string(), addr) {
            Some(old) if old != addr => debug!("[{}] client {} moved {} -> {}", self.me, client, old, addr),
            None => debug!("[{}] new client session {} at {}", self.me, client, addr),
            _ => {}
        }
    }

    pub fn session_addr(&self, client: &str) -> Option<SocketAddr> {
        self.sessions.get(client).copied()
    }
}
