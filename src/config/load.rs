use std::path::PathBuf;

use thiserror::Error;

use super::Config;
use crate::core::ReplicaId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid roster: {reason}")]
    InvalidRoster { reason: String },
}

/// Config file path: `SUBASTA_CONFIG` override, else `./subasta.toml`.
pub fn config_path() -> PathBuf {
    std::env::var_os("SUBASTA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("subasta.toml"))
}

/// Load the config file if present, apply env overrides, validate.
pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    let mut config = if path.exists() {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Env overrides merged last, after file contents.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(value) = env_u64("SUBASTA_SESSION_DURATION_MS") {
        config.ring.session_duration_ms = value;
    }
    if let Some(value) = env_u64("SUBASTA_HEARTBEAT_INTERVAL_MS") {
        config.ring.heartbeat_interval_ms = value;
    }
    if let Some(value) = env_u64("SUBASTA_LEADER_TIMEOUT_MS") {
        config.ring.leader_timeout_ms = value;
    }
    if let Some(filter) = std::env::var_os("SUBASTA_LOG_FILTER") {
        config.logging.filter = filter.into_string().ok();
    }
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let roster = &config.ring.roster;
    if roster.is_empty() {
        return Err(ConfigError::InvalidRoster {
            reason: "roster is empty".to_string(),
        });
    }
    let mut seen = Vec::with_capacity(roster.len());
    for entry in roster {
        if entry.id == ReplicaId(0) {
            return Err(ConfigError::InvalidRoster {
                reason: "replica id 0 is reserved".to_string(),
            });
        }
        if seen.contains(&entry.id) {
            return Err(ConfigError::InvalidRoster {
                reason: format!("duplicate replica id {}", entry.id),
            });
        }
        seen.push(entry.id);
    }
    Ok(())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaEntry;

    #[test]
    fn default_config_validates() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut config = Config::default();
        config.ring.roster = vec![
            ReplicaEntry::new(1, "localhost", 9090),
            ReplicaEntry::new(1, "localhost", 9091),
        ];
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRoster { .. })
        ));
    }

    #[test]
    fn id_zero_is_rejected() {
        let mut config = Config::default();
        config.ring.roster = vec![ReplicaEntry::new(0, "localhost", 9090)];
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidRoster { .. })
        ));
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let encoded = toml::to_string(&config).unwrap();
        let decoded: Config = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.ring.roster, config.ring.roster);
        assert_eq!(decoded.ring.session_duration_ms, 90_000);
        assert_eq!(decoded.client.reconnect_rounds, 3);
    }
}
