//! Wire vocabulary shared by nodes and clients.
//!
//! Every datagram is one JSON object with a `type` discriminator. It is
//! decoded exactly once at the transport boundary into [`Message`], so
//! handlers only ever see typed payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use tracing::warn;

use crate::error::CodecError;

/// Upper bound for a single encoded datagram.
pub const MAX_DATAGRAM: usize = 4096;

pub type NodeId = u32;
pub type ClientId = String;
pub type MessageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // client -> any node
    ClientJoin {
        client_id: ClientId,
    },
    ListChatrooms,
    CreateChatroom {
        room: String,
        client_id: ClientId,
        /// Set when a follower relays the request to the leader.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<SocketAddr>,
    },
    JoinChatroom {
        room: String,
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<SocketAddr>,
    },

    // node -> client
    ChatroomsList {
        rooms: Vec<String>,
    },
    RoomAssignment {
        room: String,
        server_addr: SocketAddr,
    },
    Delivered {
        message_id: MessageId,
    },
    ResendRequest {
        message_id: MessageId,
    },

    // client <-> owning node
    ChatMsg {
        message_id: MessageId,
        from: ClientId,
        room: String,
        body: String,
    },
    Ack {
        message_id: MessageId,
        from: ClientId,
    },

    // node <-> node
    RoomAssignmentUpdate {
        room: String,
        server_id: NodeId,
    },
    Heartbeat {
        from: NodeId,
    },
    Election {
        mid: NodeId,
    },
    LeaderAnnounce {
        mid: NodeId,
        address: SocketAddr,
    },
    StateSync {
        rooms: Vec<String>,
        sid: NodeId,
    },
    ServerUp {
        server_id: NodeId,
    },
    DirectorySync {
        chatrooms: BTreeMap<String, NodeId>,
        #[serde(with = "load_pairs")]
        server_load: BTreeMap<NodeId, u32>,
    },
}

/// Integer map keys do not survive serde's buffering of internally tagged
/// enums, so load travels as `[[id, rooms], ...]`.
mod load_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    use super::NodeId;

    pub fn serialize<S: Serializer>(load: &BTreeMap<NodeId, u32>, s: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(NodeId, u32)> = load.iter().map(|(&id, &n)| (id, n)).collect();
        pairs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<NodeId, u32>, D::Error> {
        let pairs = Vec::<(NodeId, u32)>::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}

impl Message {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientJoin { .. } => "CLIENT_JOIN",
            Message::ListChatrooms => "LIST_CHATROOMS",
            Message::CreateChatroom { .. } => "CREATE_CHATROOM",
            Message::JoinChatroom { .. } => "JOIN_CHATROOM",
            Message::ChatroomsList { .. } => "CHATROOMS_LIST",
            Message::RoomAssignment { .. } => "ROOM_ASSIGNMENT",
            Message::Delivered { .. } => "DELIVERED",
            Message::ResendRequest { .. } => "RESEND_REQUEST",
            Message::ChatMsg { .. } => "CHAT_MSG",
            Message::Ack { .. } => "ACK",
            Message::RoomAssignmentUpdate { .. } => "ROOM_ASSIGNMENT_UPDATE",
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::Election { .. } => "ELECTION",
            Message::LeaderAnnounce { .. } => "LEADER_ANNOUNCE",
            Message::StateSync { .. } => "STATE_SYNC",
            Message::ServerUp { .. } => "SERVER_UP",
            Message::DirectorySync { .. } => "DIRECTORY_SYNC",
        }
    }

    /// True for the shapes a client is allowed to observe.
    pub fn is_client_facing(&self) -> bool {
        matches!(
            self,
            Message::ChatroomsList { .. }
                | Message::RoomAssignment { .. }
                | Message::ChatMsg { .. }
                | Message::Delivered { .. }
                | Message::ResendRequest { .. }
        )
    }
}

/// A decoded datagram together with the address it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: SocketAddr,
    pub message: Message,
}

/// A message a component wants sent. Handlers return these so that no
/// lock is held across a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub message: Message,
}

impl Outbound {
    pub fn new(to: SocketAddr, message: Message) -> Self {
        Self { to, message }
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let buf = serde_json::to_vec(message).map_err(CodecError::Encode)?;
    if buf.len() > MAX_DATAGRAM {
        return Err(CodecError::Oversized(buf.len()));
    }
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

fn encoded_len(message: &Message) -> usize {
    serde_json::to_vec(message).map(|b| b.len()).unwrap_or(MAX_DATAGRAM)
}

fn json_str_len(s: &str) -> usize {
    serde_json::to_string(s).map(|j| j.len()).unwrap_or(s.len() + 2)
}

/// Greedy packing: each group's `base + Σ(cost + 1)` stays within one
/// datagram. An item too large on its own still gets a group.
fn pack<T>(items: impl IntoIterator<Item = T>, base: usize, cost: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut used = base;
    for item in items {
        let c = cost(&item) + 1;
        if !current.is_empty() && used + c > MAX_DATAGRAM {
            groups.push(std::mem::take(&mut current));
            used = base;
        }
        used += c;
        current.push(item);
    }
    if !current.is_empty() || groups.is_empty() {
        groups.push(current);
    }
    groups
}

/// CHATROOMS_LIST truncated to what fits in one datagram.
pub fn chatrooms_list(rooms: Vec<String>) -> Message {
    let total = rooms.len();
    let base = encoded_len(&Message::ChatroomsList { rooms: Vec::new() });
    let rooms = pack(rooms, base, |r| json_str_len(r)).swap_remove(0);
    if rooms.len() < total {
        warn!("room list truncated to {} of {} names", rooms.len(), total);
    }
    Message::ChatroomsList { rooms }
}

/// A directory snapshot as one or more DIRECTORY_SYNC datagrams. Every
/// part carries the full load table; receivers merge the room maps.
pub fn directory_sync(chatrooms: &BTreeMap<String, NodeId>, server_load: &BTreeMap<NodeId, u32>) -> Vec<Message> {
    let base = encoded_len(&Message::DirectorySync { chatrooms: BTreeMap::new(), server_load: server_load.clone() });
    pack(chatrooms.iter(), base, |(room, owner)| json_str_len(room) + 1 + owner.to_string().len())
        .into_iter()
        .map(|part| Message::DirectorySync {
            chatrooms: part.into_iter().map(|(room, &owner)| (room.clone(), owner)).collect(),
            server_load: server_load.clone(),
        })
        .collect()
}

/// Hosted rooms as one or more STATE_SYNC datagrams.
pub fn state_sync(sid: NodeId, rooms: Vec<String>) -> Vec<Message> {
    let base = encoded_len(&Message::StateSync { rooms: Vec::new(), sid });
    pack(rooms, base, |r| json_str_len(r))
        .into_iter()
        .map(|rooms| Message::StateSync { rooms, sid })
        .collect()
}
