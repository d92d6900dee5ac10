use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::daemon::ReplicaError;

/// Crate-level convenience error: a thin wrapper over the subsystem
/// errors that can reach the binary.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
