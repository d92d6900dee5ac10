use serde::{Deserialize, Serialize};

use crate::core::ReplicaId;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub ring: RingConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
        }
    }
}

/// One member of the static ring membership list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaEntry {
    pub id: ReplicaId,
    pub host: String,
    /// Port bidders dial.
    pub client_port: u16,
    /// Port peers dial; by convention `client_port + 1000`.
    pub peer_port: u16,
}

impl ReplicaEntry {
    pub fn new(id: u32, host: &str, client_port: u16) -> Self {
        ReplicaEntry {
            id: ReplicaId(id),
            host: host.to_string(),
            client_port,
            peer_port: client_port + 1000,
        }
    }

    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.host, self.peer_port)
    }
}

/// Ring topology and protocol timings. Defaults are the deployed
/// protocol constants; tests shrink them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub roster: Vec<ReplicaEntry>,
    pub session_duration_ms: u64,
    pub broadcast_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub leader_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub bootstrap_grace_ms: u64,
    pub dial_timeout_ms: u64,
    pub drain_ms: u64,
    pub max_line_bytes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            roster: default_roster(),
            session_duration_ms: 90_000,
            broadcast_interval_ms: 4_000,
            heartbeat_interval_ms: 3_000,
            leader_timeout_ms: 10_000,
            monitor_interval_ms: 2_000,
            bootstrap_grace_ms: 2_000,
            dial_timeout_ms: 3_000,
            drain_ms: 2_000,
            max_line_bytes: 4_096,
        }
    }
}

impl RingConfig {
    pub fn entry(&self, id: ReplicaId) -> Option<&ReplicaEntry> {
        self.roster.iter().find(|entry| entry.id == id)
    }

    pub fn others(&self, id: ReplicaId) -> Vec<&ReplicaEntry> {
        self.roster.iter().filter(|entry| entry.id != id).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub confirm_timeout_ms: u64,
    pub reconnect_rounds: u32,
    pub reconnect_backoff_ms: u64,
    pub dial_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: 10_000,
            reconnect_rounds: 3,
            reconnect_backoff_ms: 5_000,
            dial_timeout_ms: 3_000,
        }
    }
}

fn default_roster() -> Vec<ReplicaEntry> {
    vec![
        ReplicaEntry::new(1, "localhost", 9090),
        ReplicaEntry::new(2, "localhost", 9091),
        ReplicaEntry::new(3, "localhost", 9092),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roster_is_three_localhost_replicas() {
        let ring = RingConfig::default();
        assert_eq!(ring.roster.len(), 3);
        let last = ring.entry(ReplicaId(3)).unwrap();
        assert_eq!(last.client_port, 9092);
        assert_eq!(last.peer_port, 10092);
        assert_eq!(last.client_addr(), "localhost:9092");
    }

    #[test]
    fn others_excludes_self() {
        let ring = RingConfig::default();
        let others = ring.others(ReplicaId(2));
        assert_eq!(others.len(), 2);
        assert!(others.iter().all(|entry| entry.id != ReplicaId(2)));
    }
}
