//! Config loading: built-in roster and protocol timings, optional
//! `subasta.toml`, env overrides.

mod load;
mod schema;

pub use load::{ConfigError, apply_env_overrides, config_path, load, validate};
pub use schema::{
    ClientConfig, Config, LogFormat, LoggingConfig, ReplicaEntry, RingConfig,
};
