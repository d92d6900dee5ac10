//! Replicated auction state store.
//!
//! One `AuctionState` lives for the replica's process lifetime, owned by
//! the session controller and shared by reference with the ring
//! coordinator (remote merges) and the bidder handlers (local bids). All
//! mutations serialize on one internal lock; `active` and the session
//! start stamp are mirrored in atomics so hot-path checks can skip it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;

use crate::core::time::now_ms;
use crate::core::wire::{HighBid, fmt_amount};

pub const NO_BIDDER: &str = "none";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("malformed state snapshot: {reason}")]
    MalformedSnapshot { reason: String },
}

impl StateError {
    fn malformed(reason: impl Into<String>) -> Self {
        StateError::MalformedSnapshot {
            reason: reason.into(),
        }
    }
}

/// One bidder's record, keyed by its observed remote address.
#[derive(Clone, Debug, PartialEq)]
pub struct Participant {
    pub address: String,
    pub last_bid: f64,
    pub last_update_ms: u64,
}

#[derive(Debug, Default)]
struct StateInner {
    high_bid: f64,
    high_bidder: String,
    /// Insertion-ordered, at most one record per address.
    participants: Vec<Participant>,
}

impl StateInner {
    fn new() -> Self {
        StateInner {
            high_bid: 0.0,
            high_bidder: NO_BIDDER.to_string(),
            participants: Vec::new(),
        }
    }

    fn upsert_participant(&mut self, address: &str, bid: f64) {
        let now = now_ms();
        match self.participants.iter_mut().find(|p| p.address == address) {
            Some(p) => {
                p.last_bid = bid;
                p.last_update_ms = now;
            }
            None => self.participants.push(Participant {
                address: address.to_string(),
                last_bid: bid,
                last_update_ms: now,
            }),
        }
    }
}

/// Thread-safe auction state for one session.
pub struct AuctionState {
    inner: Mutex<StateInner>,
    active: AtomicBool,
    started_at_ms: AtomicU64,
}

impl AuctionState {
    pub fn new() -> Self {
        AuctionState {
            inner: Mutex::new(StateInner::new()),
            active: AtomicBool::new(false),
            started_at_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().expect("auction state lock poisoned")
    }

    /// Commit a locally submitted bid. Returns true when the bid is the
    /// new strict high; an equal bid never displaces the incumbent.
    pub fn register(&self, bid: f64, address: &str) -> bool {
        let mut inner = self.lock();
        inner.upsert_participant(address, bid);
        if bid > inner.high_bid {
            inner.high_bid = bid;
            inner.high_bidder = address.to_string();
            true
        } else {
            false
        }
    }

    /// Apply a replicated high-bid update. Monotone in the high bid and
    /// idempotent under reapplication of the same `(bid, address)`.
    pub fn merge_remote(&self, bid: f64, address: &str) {
        let mut inner = self.lock();
        if bid > inner.high_bid {
            inner.high_bid = bid;
            inner.high_bidder = address.to_string();
        }
        inner.upsert_participant(address, bid);
    }

    /// Reset every field to its initial value for the next session.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = StateInner::new();
        self.active.store(false, Ordering::Release);
        self.started_at_ms.store(0, Ordering::Release);
    }

    /// Mark the session running. Returns the start stamp.
    pub fn start(&self) -> u64 {
        let now = now_ms();
        self.started_at_ms.store(now, Ordering::Release);
        self.active.store(true, Ordering::Release);
        now
    }

    pub fn finish(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms.load(Ordering::Acquire)
    }

    pub fn high_bid(&self) -> f64 {
        self.lock().high_bid
    }

    /// The current high bid, `OFERTA_MAX:none:0.0` shaped before the
    /// first commit.
    pub fn snapshot_high(&self) -> HighBid {
        let inner = self.lock();
        HighBid {
            addr: inner.high_bidder.clone(),
            amount: inner.high_bid,
        }
    }

    /// The record holding the current high bid, if any bid committed.
    pub fn winner(&self) -> Option<Participant> {
        let inner = self.lock();
        inner
            .participants
            .iter()
            .find(|p| p.address == inner.high_bidder)
            .cloned()
    }

    pub fn participant_count(&self) -> usize {
        self.lock().participants.len()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.lock().participants.clone()
    }

    /// Complete snapshot: `high|bidder|started|active|addr:bid,addr:bid,`.
    pub fn serialize(&self) -> String {
        let inner = self.lock();
        let mut out = format!(
            "{}|{}|{}|{}|",
            fmt_amount(inner.high_bid),
            inner.high_bidder,
            self.started_at_ms.load(Ordering::Acquire),
            self.active.load(Ordering::Acquire),
        );
        for p in &inner.participants {
            out.push_str(&p.address);
            out.push(':');
            out.push_str(&fmt_amount(p.last_bid));
            out.push(',');
        }
        out
    }

    /// Replace this state with a serialized snapshot. Participant
    /// timestamps are re-stamped on apply; they are not part of the
    /// snapshot.
    pub fn deserialize(&self, data: &str) -> Result<(), StateError> {
        let parts: Vec<&str> = data.split('|').collect();
        if parts.len() < 4 {
            return Err(StateError::malformed("expected at least 4 fields"));
        }
        let high_bid: f64 = parts[0]
            .parse()
            .map_err(|_| StateError::malformed("bad high bid"))?;
        let high_bidder = parts[1].to_string();
        let started_at: u64 = parts[2]
            .parse()
            .map_err(|_| StateError::malformed("bad start stamp"))?;
        let active: bool = parts[3]
            .parse()
            .map_err(|_| StateError::malformed("bad active flag"))?;

        let mut participants = Vec::new();
        if let Some(list) = parts.get(4)
            && !list.is_empty()
        {
            let now = now_ms();
            for item in list.split(',').filter(|item| !item.is_empty()) {
                let Some((address, bid)) = item.split_once(':') else {
                    return Err(StateError::malformed("bad participant entry"));
                };
                let bid: f64 = bid
                    .parse()
                    .map_err(|_| StateError::malformed("bad participant bid"))?;
                participants.push(Participant {
                    address: address.to_string(),
                    last_bid: bid,
                    last_update_ms: now,
                });
            }
        }

        let mut inner = self.lock();
        inner.high_bid = high_bid;
        inner.high_bidder = high_bidder;
        inner.participants = participants;
        self.started_at_ms.store(started_at, Ordering::Release);
        self.active.store(active, Ordering::Release);
        Ok(())
    }
}

impl Default for AuctionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_bid_is_always_the_high() {
        let state = AuctionState::new();
        assert!(state.register(0.01, "10.0.0.1"));
        assert_eq!(state.snapshot_high().addr, "10.0.0.1");
    }

    #[test]
    fn equal_bid_never_displaces_the_incumbent() {
        let state = AuctionState::new();
        assert!(state.register(100.0, "a"));
        assert!(!state.register(100.0, "b"));
        let high = state.snapshot_high();
        assert_eq!(high.addr, "a");
        assert_eq!(high.amount, 100.0);
        // The late bidder is still recorded as a participant.
        assert_eq!(state.participant_count(), 2);
    }

    #[test]
    fn register_returns_true_only_for_strict_increase() {
        let state = AuctionState::new();
        assert!(state.register(50.0, "a"));
        assert!(!state.register(40.0, "b"));
        assert!(!state.register(50.0, "b"));
        assert!(state.register(50.5, "b"));
        assert_eq!(state.snapshot_high().addr, "b");
    }

    #[test]
    fn last_bid_tracks_the_most_recent_commit() {
        let state = AuctionState::new();
        state.register(50.0, "a");
        state.register(75.0, "a");
        let winner = state.winner().unwrap();
        assert_eq!(winner.address, "a");
        assert_eq!(winner.last_bid, 75.0);
    }

    #[test]
    fn merge_remote_is_idempotent_and_monotone() {
        let state = AuctionState::new();
        state.merge_remote(200.0, "x");
        state.merge_remote(200.0, "x");
        assert_eq!(state.participant_count(), 1);
        assert_eq!(state.high_bid(), 200.0);

        // A stale lower update never lowers the high bid.
        state.merge_remote(150.0, "y");
        let high = state.snapshot_high();
        assert_eq!(high.amount, 200.0);
        assert_eq!(high.addr, "x");
        assert_eq!(state.participant_count(), 2);
    }

    #[test]
    fn empty_state_snapshot_is_none_zero() {
        let state = AuctionState::new();
        assert_eq!(state.snapshot_high().to_string(), "OFERTA_MAX:none:0.0");
        assert!(state.winner().is_none());
    }

    #[test]
    fn start_and_reset_drive_the_atomics() {
        let state = AuctionState::new();
        assert!(!state.is_active());
        let stamp = state.start();
        assert!(state.is_active());
        assert_eq!(state.started_at_ms(), stamp);
        assert!(stamp > 0);
        state.finish();
        assert!(!state.is_active());
        state.reset();
        assert_eq!(state.started_at_ms(), 0);
        assert_eq!(state.snapshot_high().to_string(), "OFERTA_MAX:none:0.0");
    }

    #[test]
    fn snapshot_round_trips_observable_state() {
        let state = AuctionState::new();
        state.start();
        state.register(50.0, "10.1.1.1");
        state.register(75.5, "10.1.1.2");

        let encoded = state.serialize();
        let restored = AuctionState::new();
        restored.deserialize(&encoded).unwrap();

        assert_eq!(restored.high_bid(), state.high_bid());
        assert_eq!(restored.snapshot_high(), state.snapshot_high());
        assert_eq!(restored.is_active(), state.is_active());
        assert_eq!(restored.started_at_ms(), state.started_at_ms());
        let expect: Vec<(String, f64)> = state
            .participants()
            .into_iter()
            .map(|p| (p.address, p.last_bid))
            .collect();
        let got: Vec<(String, f64)> = restored
            .participants()
            .into_iter()
            .map(|p| (p.address, p.last_bid))
            .collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn empty_snapshot_round_trips() {
        let state = AuctionState::new();
        assert_eq!(state.serialize(), "0.0|none|0|false|");
        let restored = AuctionState::new();
        restored.deserialize(&state.serialize()).unwrap();
        assert_eq!(restored.snapshot_high().to_string(), "OFERTA_MAX:none:0.0");
    }

    #[test]
    fn deserialize_rejects_garbage() {
        let state = AuctionState::new();
        assert!(state.deserialize("not a snapshot").is_err());
        assert!(state.deserialize("x|none|0|false|").is_err());
        assert!(state.deserialize("1.0|a|0|false|broken").is_err());
    }
}
