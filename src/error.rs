use thiserror::Error;

use crate::protocol::NodeId;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} is not part of the ring")]
    UnknownNode(NodeId),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("datagram of {0} bytes exceeds the size limit")]
    Oversized(usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bad peer entry '{0}'; expected id=ip:port")]
    BadPeer(String),
    #[error("peer list names this node's own id {0}")]
    SelfInPeers(NodeId),
    #[error("invalid timing: {0}")]
    BadTiming(String),
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Toml(#[from] toml::de::Error),
}
