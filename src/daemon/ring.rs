//! Ring coordinator: peer connections, leader election, heartbeat, and
//! high-bid replication.
//!
//! The election is the simplified highest-live-id rule, not classical
//! Chang-Roberts: every replica computes `max({self} ∪ peers)` over its
//! own peer map, so identical live sets converge on the same leader with
//! no message exchange. The protocol is correct only while the peer map
//! reflects the true live set; peers are removed on write error and on
//! reader EOF, and are not re-dialed within a session.

use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::config::RingConfig;
use crate::core::{AuctionState, ReplicaId, RingFrame, now_ms, parse_ring_frame};
use crate::daemon::line::{LineReader, LineWriter};

#[derive(Debug, Error)]
pub enum RingError {
    #[error("replica {0} is not in the roster")]
    UnknownReplica(ReplicaId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only leadership view consumed by the session controller.
pub trait LeaderView: Send + Sync {
    fn is_leader(&self) -> bool;
    fn leader_id(&self) -> Option<ReplicaId>;
}

/// Replication hook invoked when a handler commits a new high bid.
pub trait StateSync: Send + Sync {
    fn replicate(&self, amount: f64, addr: &str);
}

/// Highest-id election rule over the live set.
fn elect(my_id: ReplicaId, peers: &[ReplicaId]) -> ReplicaId {
    peers.iter().copied().chain([my_id]).max().unwrap_or(my_id)
}

pub struct RingCoordinator {
    my_id: ReplicaId,
    config: RingConfig,
    state: Arc<AuctionState>,
    peers: Mutex<BTreeMap<ReplicaId, LineWriter<TcpStream>>>,
    /// Raw id of the current leader; 0 while unknown.
    leader: AtomicU32,
    i_am_leader: AtomicBool,
    election_in_progress: AtomicBool,
    last_heartbeat_ms: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl RingCoordinator {
    pub fn new(
        my_id: ReplicaId,
        config: RingConfig,
        state: Arc<AuctionState>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, RingError> {
        if config.entry(my_id).is_none() {
            return Err(RingError::UnknownReplica(my_id));
        }
        Ok(RingCoordinator {
            my_id,
            config,
            state,
            peers: Mutex::new(BTreeMap::new()),
            leader: AtomicU32::new(0),
            i_am_leader: AtomicBool::new(false),
            election_in_progress: AtomicBool::new(false),
            last_heartbeat_ms: AtomicU64::new(now_ms()),
            shutdown: shutdown.clone(),
        })
    }

    /// Spawn the coordinator threads: peer accept loop, bootstrap
    /// (grace, dial-out, initial election), heartbeat emitter, and the
    /// leader-liveness monitor.
    pub fn start(this: &Arc<Self>, listener: TcpListener) -> Result<Vec<JoinHandle<()>>, RingError> {
        listener.set_nonblocking(true)?;

        let mut joins = Vec::new();

        let coordinator = Arc::clone(this);
        joins.push(
            thread::Builder::new()
                .name(format!("ring-accept-{}", this.my_id))
                .spawn(move || coordinator.run_accept_loop(listener))?,
        );

        let coordinator = Arc::clone(this);
        joins.push(
            thread::Builder::new()
                .name(format!("ring-bootstrap-{}", this.my_id))
                .spawn(move || coordinator.run_bootstrap())?,
        );

        let coordinator = Arc::clone(this);
        joins.push(
            thread::Builder::new()
                .name(format!("ring-heartbeat-{}", this.my_id))
                .spawn(move || coordinator.run_heartbeat_loop())?,
        );

        let coordinator = Arc::clone(this);
        joins.push(
            thread::Builder::new()
                .name(format!("ring-monitor-{}", this.my_id))
                .spawn(move || coordinator.run_monitor_loop())?,
        );

        Ok(joins)
    }

    fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let this = Arc::clone(&self);
                    thread::spawn(move || this.run_peer_reader(stream, None));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(25));
                }
                Err(err) => {
                    tracing::warn!(id = %self.my_id, "ring accept error: {err}");
                    thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }

    /// Wait out the startup grace so peers can bind, dial every other
    /// roster entry, then run the initial election.
    fn run_bootstrap(self: Arc<Self>) {
        thread::sleep(Duration::from_millis(self.config.bootstrap_grace_ms));
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }

        for entry in self.config.others(self.my_id) {
            match self.dial_peer(&entry.peer_addr()) {
                Ok(stream) => {
                    let writer = match stream.try_clone() {
                        Ok(clone) => LineWriter::new(clone),
                        Err(err) => {
                            tracing::warn!(peer = %entry.id, "peer socket clone failed: {err}");
                            continue;
                        }
                    };
                    self.peers
                        .lock()
                        .expect("peer map lock poisoned")
                        .insert(entry.id, writer);
                    tracing::info!(id = %self.my_id, peer = %entry.id, "connected to peer");

                    let this = Arc::clone(&self);
                    let peer_id = entry.id;
                    thread::spawn(move || this.run_peer_reader(stream, Some(peer_id)));
                }
                Err(err) => {
                    tracing::info!(id = %self.my_id, peer = %entry.id, "peer unavailable: {err}");
                }
            }
        }

        let connected = self.peers.lock().expect("peer map lock poisoned").len();
        tracing::info!(id = %self.my_id, connected, "ring bootstrap complete");
        self.run_election();
    }

    fn dial_peer(&self, addr: &str) -> std::io::Result<TcpStream> {
        let timeout = Duration::from_millis(self.config.dial_timeout_ms);
        let resolved = addr.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved")
        })?;
        let stream = TcpStream::connect_timeout(&resolved, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(self.config.monitor_interval_ms)))?;
        Ok(stream)
    }

    /// Drain frames from one peer connection. Runs for both inbound
    /// (accepted) connections and outbound (dialed) ones; on the dialed
    /// leg `peer_id` is known and EOF doubles as failure detection.
    fn run_peer_reader(self: Arc<Self>, stream: TcpStream, peer_id: Option<ReplicaId>) {
        let _ = stream.set_read_timeout(Some(Duration::from_millis(
            self.config.monitor_interval_ms,
        )));
        let mut reader = LineReader::new(stream, self.config.max_line_bytes);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            match reader.read_line() {
                Ok(Some(line)) => {
                    // Any peer frame counts as liveness.
                    self.touch_heartbeat();
                    match parse_ring_frame(&line) {
                        Ok(frame) => self.handle_frame(frame),
                        Err(err) => {
                            tracing::warn!(id = %self.my_id, "dropping ring frame: {err}")
                        }
                    }
                }
                Ok(None) => break,
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    tracing::debug!(id = %self.my_id, "peer read error: {err}");
                    break;
                }
            }
        }
        if let Some(peer_id) = peer_id {
            self.on_peer_lost(peer_id);
        }
    }

    fn handle_frame(&self, frame: RingFrame) {
        match frame {
            RingFrame::Coordinator { id } => {
                self.leader.store(id.get(), Ordering::Release);
                self.i_am_leader.store(self.my_id == id, Ordering::Release);
                tracing::info!(id = %self.my_id, leader = %id, "new coordinator announced");
            }
            RingFrame::Heartbeat { .. } => {}
            RingFrame::SyncState { amount, addr, .. } => {
                self.state.merge_remote(amount, &addr);
                tracing::debug!(id = %self.my_id, amount, addr = %addr, "replicated high bid applied");
            }
            RingFrame::ElectionRequest => self.run_election(),
        }
    }

    fn on_peer_lost(&self, peer_id: ReplicaId) {
        let removed = self
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .remove(&peer_id)
            .is_some();
        if !removed || self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        tracing::warn!(id = %self.my_id, peer = %peer_id, "peer connection lost");
        if self.leader_id() == Some(peer_id) {
            self.broadcast(&RingFrame::ElectionRequest);
            self.run_election();
        }
    }

    /// Compute the leader over the live set. Guarded against overlapping
    /// runs on the same replica; extra triggers while one is underway are
    /// dropped.
    pub fn run_election(&self) {
        if self.election_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }
        self.i_am_leader.store(false, Ordering::Release);

        let live: Vec<ReplicaId> = self
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .keys()
            .copied()
            .collect();
        let new_leader = elect(self.my_id, &live);

        self.leader.store(new_leader.get(), Ordering::Release);
        let is_me = new_leader == self.my_id;
        self.i_am_leader.store(is_me, Ordering::Release);
        self.touch_heartbeat();
        self.election_in_progress.store(false, Ordering::Release);

        tracing::info!(
            id = %self.my_id,
            leader = %new_leader,
            live = live.len() + 1,
            "election finished"
        );
        if is_me {
            self.broadcast(&RingFrame::Coordinator { id: self.my_id });
        }
    }

    fn run_heartbeat_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        loop {
            thread::sleep(interval);
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if self.is_leader() {
                self.broadcast(&RingFrame::Heartbeat {
                    id: self.my_id,
                    at_ms: now_ms(),
                });
            }
        }
    }

    fn run_monitor_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.monitor_interval_ms);
        loop {
            thread::sleep(interval);
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if self.is_leader() || self.leader_id().is_none() {
                continue;
            }
            let silence = now_ms().saturating_sub(self.last_heartbeat_ms.load(Ordering::Acquire));
            if silence > self.config.leader_timeout_ms {
                tracing::warn!(
                    id = %self.my_id,
                    silence_ms = silence,
                    "leader heartbeat missing, starting election"
                );
                self.broadcast(&RingFrame::ElectionRequest);
                self.run_election();
            }
        }
    }

    /// Send a frame to every connected peer. Fire-and-forget: a failed
    /// write drops the peer, nothing is retried.
    fn broadcast(&self, frame: &RingFrame) {
        let line = frame.to_string();
        let ids: Vec<ReplicaId> = self
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.send_to(id, &line);
        }
    }

    fn send_to(&self, peer_id: ReplicaId, line: &str) {
        let mut peers = self.peers.lock().expect("peer map lock poisoned");
        let Some(writer) = peers.get_mut(&peer_id) else {
            return;
        };
        if let Err(err) = writer.write_line(line) {
            tracing::warn!(id = %self.my_id, peer = %peer_id, "peer write failed, dropping: {err}");
            peers.remove(&peer_id);
        }
    }

    fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Release);
    }
}

impl LeaderView for RingCoordinator {
    fn is_leader(&self) -> bool {
        self.i_am_leader.load(Ordering::Acquire)
    }

    fn leader_id(&self) -> Option<ReplicaId> {
        match self.leader.load(Ordering::Acquire) {
            0 => None,
            id => Some(ReplicaId(id)),
        }
    }
}

impl StateSync for RingCoordinator {
    fn replicate(&self, amount: f64, addr: &str) {
        if !self.is_leader() {
            return;
        }
        self.broadcast(&RingFrame::SyncState {
            amount,
            addr: addr.to_string(),
            at_ms: now_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_picks_the_highest_live_id() {
        assert_eq!(elect(ReplicaId(1), &[]), ReplicaId(1));
        assert_eq!(elect(ReplicaId(1), &[ReplicaId(2), ReplicaId(3)]), ReplicaId(3));
        assert_eq!(elect(ReplicaId(3), &[ReplicaId(1), ReplicaId(2)]), ReplicaId(3));
        assert_eq!(elect(ReplicaId(2), &[ReplicaId(1)]), ReplicaId(2));
    }

    #[test]
    fn election_is_deterministic_across_replicas() {
        // Every replica sees the same live set {1, 2, 3}; all must agree.
        for my in [ReplicaId(1), ReplicaId(2), ReplicaId(3)] {
            let peers: Vec<ReplicaId> = [ReplicaId(1), ReplicaId(2), ReplicaId(3)]
                .into_iter()
                .filter(|id| *id != my)
                .collect();
            assert_eq!(elect(my, &peers), ReplicaId(3));
        }
    }
}
