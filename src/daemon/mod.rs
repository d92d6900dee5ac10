//! Server side of the auction service.
//!
//! Provides:
//! - line-framed TCP transport
//! - ring coordinator (election, heartbeat, replication)
//! - per-bidder session handlers
//! - the session lifecycle controller
//! - replica wiring and graceful shutdown

pub mod handler;
pub mod line;
pub mod ring;
pub mod run;
pub mod session;

pub use handler::{BidderConn, SessionView, run_bidder_handler};
pub use line::{LineError, LineReader, LineWriter};
pub use ring::{LeaderView, RingCoordinator, RingError, StateSync};
pub use run::{ReplicaError, ReplicaHandle, run_replica, start_replica};
pub use session::{SessionController, SessionPhase};
