//! Coordination core for a cluster of chat relay nodes.
//!
//! Nodes elect a coordinator over a sorted id ring, watch it with
//! heartbeats, let it shard chat rooms across live nodes, and deliver room
//! messages with acknowledgement tracking.

pub mod cipher;
pub mod cluster;
pub mod config;
pub mod delivery;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod node;
pub mod protocol;
pub mod rooms;
pub mod transport;

pub use config::{NodeConfig, Timing};
pub use node::RelayNode;
pub use protocol::{Message, NodeId, NodeRole};
pub use transport::{LoopbackNetwork, Transport, UdpTransport};
