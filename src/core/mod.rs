//! Domain types shared by the server, ring, and client runtimes.

pub mod identity;
pub mod state;
pub mod time;
pub mod wire;

pub use identity::ReplicaId;
pub use state::{AuctionState, NO_BIDDER, Participant, StateError};
pub use time::now_ms;
pub use wire::{
    ClientCommand, HighBid, Reject, RingFrame, ServerFrame, WireError, fmt_amount,
    parse_client_command, parse_ring_frame, parse_server_frame,
};
