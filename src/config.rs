use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::NodeId;

/// Periods and deadlines driving the background loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub monitor_interval: Duration,
    pub ack_timeout: Duration,
    pub sweep_interval: Duration,
    /// Max SERVER_UP rounds at startup.
    pub announce_retries: usize,
    pub announce_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(6),
            monitor_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            announce_retries: 8,
            announce_backoff: Duration::from_millis(150),
        }
    }
}

/// Optional overrides read from a TOML file. All values in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimingFile {
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    monitor_interval_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    announce_retries: Option<usize>,
    announce_backoff_ms: Option<u64>,
}

impl Timing {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: TimingFile = toml::from_str(content)?;
        let mut t = Timing::default();
        let ms = Duration::from_millis;
        if let Some(v) = file.heartbeat_interval_ms {
            t.heartbeat_interval = ms(v);
        }
        if let Some(v) = file.heartbeat_timeout_ms {
            t.heartbeat_timeout = ms(v);
        }
        if let Some(v) = file.monitor_interval_ms {
            t.monitor_interval = ms(v);
        }
        if let Some(v) = file.ack_timeout_ms {
            t.ack_timeout = ms(v);
        }
        if let Some(v) = file.sweep_interval_ms {
            t.sweep_interval = ms(v);
        }
        if let Some(v) = file.announce_retries {
            t.announce_retries = v;
        }
        if let Some(v) = file.announce_backoff_ms {
            t.announce_backoff = ms(v);
        }
        t.validate()?;
        Ok(t)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("monitor_interval", self.monitor_interval),
            ("ack_timeout", self.ack_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, d) in periods {
            if d.is_zero() {
                return Err(ConfigError::BadTiming(format!("{name} must be non-zero")));
            }
        }
        // one dropped heartbeat must never look like a dead leader
        if self.heartbeat_timeout <= self.heartbeat_interval * 2 {
            return Err(ConfigError::BadTiming(format!(
                "heartbeat_timeout ({:?}) must exceed twice heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub peers: BTreeMap<NodeId, SocketAddr>,
    pub timing: Timing,
}

impl NodeConfig {
    pub fn new(id: NodeId, addr: SocketAddr, peers: BTreeMap<NodeId, SocketAddr>) -> Self {
        Self { id, addr, peers, timing: Timing::default() }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}

/// Parse `2=127.0.0.1:7002,3=127.0.0.1:7003`. Empty segments are skipped.
pub fn parse_peers(list: &str, self_id: NodeId) -> Result<BTreeMap<NodeId, SocketAddr>, ConfigError> {
    let mut peers = BTreeMap::new();
    for pair in list.split(',') {
        let p = pair.trim();
        if p.is_empty() {
            continue;
        }
        let (id_s, addr) = p
            .split_once('=')
            .ok_or_else(|| ConfigError::BadPeer(p.to_string()))?;
        let id: NodeId = id_s
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadPeer(p.to_string()))?;
        let sa: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadPeer(p.to_string()))?;
        if id == self_id {
            return Err(ConfigError::SelfInPeers(id));
        }
        peers.insert(id, sa);
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_list() {
        let peers = parse_peers("2=127.0.0.1:7002, 3=127.0.0.1:7003,", 1).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[&3], "127.0.0.1:7003".parse().unwrap());
        assert!(parse_peers("", 1).unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_peers() {
        assert!(matches!(parse_peers("2-127.0.0.1:1", 1), Err(ConfigError::BadPeer(_))));
        assert!(matches!(parse_peers("x=127.0.0.1:1", 1), Err(ConfigError::BadPeer(_))));
        assert!(matches!(parse_peers("2=nowhere", 1), Err(ConfigError::BadPeer(_))));
        assert!(matches!(parse_peers("1=127.0.0.1:1", 1), Err(ConfigError::SelfInPeers(1))));
    }

    #[test]
    fn defaults_are_valid() {
        Timing::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let t = Timing::from_toml_str(
            "heartbeat_interval_ms = 500\nheartbeat_timeout_ms = 1500\nannounce_retries = 3\nannounce_backoff_ms = 40\n",
        )
        .unwrap();
        assert_eq!(t.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(t.heartbeat_timeout, Duration::from_millis(1500));
        assert_eq!(t.announce_retries, 3);
        assert_eq!(t.announce_backoff, Duration::from_millis(40));
        assert_eq!(t.ack_timeout, Timing::default().ack_timeout);
    }

    #[test]
    fn timeout_must_exceed_two_intervals() {
        let err = Timing::from_toml_str("heartbeat_interval_ms = 3000\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadTiming(_)));
        assert!(Timing::from_toml_str("sweep_interval_ms = 0\n").is_err());
        assert!(Timing::from_toml_str("bogus = 1\n").is_err());
    }
}
