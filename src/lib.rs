#![forbid(unsafe_code)]

pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::client::{AuctionClient, AuctionResult, BidOutcome, BidStatus, ClientEvent};
pub use crate::core::{AuctionState, HighBid, Participant, ReplicaId, RingFrame, ServerFrame};
pub use crate::daemon::{ReplicaHandle, SessionPhase, run_replica, start_replica};
