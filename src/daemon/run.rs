//! Replica wiring and lifecycle.
//!
//! `start_replica` binds both listeners, spawns the ring coordinator and
//! the session controller, and returns a handle that owns the shutdown
//! flag. The binary runs `run_replica`, which parks on the signal flag.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::config::Config;
use crate::core::{AuctionState, ReplicaId};
use crate::daemon::ring::{LeaderView, RingCoordinator, RingError, StateSync};
use crate::daemon::session::{SessionController, SessionPhase};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replica {0} is not in the roster")]
    UnknownReplica(ReplicaId),
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Ring(#[from] RingError),
}

/// A running replica. Dropping the handle leaves the replica running;
/// call `shutdown` to stop it and join its threads.
pub struct ReplicaHandle {
    id: ReplicaId,
    state: Arc<AuctionState>,
    ring: Arc<RingCoordinator>,
    controller: Arc<SessionController>,
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl ReplicaHandle {
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> &Arc<AuctionState> {
        &self.state
    }

    pub fn is_leader(&self) -> bool {
        self.ring.is_leader()
    }

    pub fn leader_id(&self) -> Option<ReplicaId> {
        self.ring.leader_id()
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.controller.phase()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop every thread and wait for them.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.controller.disconnect_all();
        for join in self.joins {
            let _ = join.join();
        }
        tracing::info!(id = %self.id, "replica stopped");
    }
}

/// Bring one replica up: bidder listener, ring coordinator, session
/// controller. Bind failures are fatal.
pub fn start_replica(config: &Config, id: ReplicaId) -> Result<ReplicaHandle, ReplicaError> {
    let entry = config
        .ring
        .entry(id)
        .ok_or(ReplicaError::UnknownReplica(id))?
        .clone();

    let client_listener = TcpListener::bind(entry.client_addr()).map_err(|source| {
        ReplicaError::Bind {
            role: "bidder",
            addr: entry.client_addr(),
            source,
        }
    })?;
    let peer_listener =
        TcpListener::bind(entry.peer_addr()).map_err(|source| ReplicaError::Bind {
            role: "ring",
            addr: entry.peer_addr(),
            source,
        })?;
    let client_addr = client_listener.local_addr().map_err(|source| ReplicaError::Bind {
        role: "bidder",
        addr: entry.client_addr(),
        source,
    })?;
    let peer_addr = peer_listener.local_addr().map_err(|source| ReplicaError::Bind {
        role: "ring",
        addr: entry.peer_addr(),
        source,
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let state = Arc::new(AuctionState::new());

    let ring = Arc::new(RingCoordinator::new(
        id,
        config.ring.clone(),
        Arc::clone(&state),
        Arc::clone(&shutdown),
    )?);
    let mut joins = RingCoordinator::start(&ring, peer_listener)?;

    let controller = SessionController::new(
        id,
        config.ring.clone(),
        Arc::clone(&state),
        Arc::clone(&ring) as Arc<dyn LeaderView>,
        Arc::clone(&ring) as Arc<dyn StateSync>,
        Arc::clone(&shutdown),
    );
    {
        let controller = Arc::clone(&controller);
        joins.push(
            thread::Builder::new()
                .name(format!("session-{id}"))
                .spawn(move || controller.run(client_listener))
                .map_err(RingError::from)?,
        );
    }

    tracing::info!(
        %id,
        bidders = %client_addr,
        ring = %peer_addr,
        "auction replica active"
    );

    Ok(ReplicaHandle {
        id,
        state,
        ring,
        controller,
        shutdown,
        joins,
        client_addr,
        peer_addr,
    })
}

/// Run a replica in the foreground until SIGINT/SIGTERM.
pub fn run_replica(config: &Config, id: ReplicaId) -> Result<(), ReplicaError> {
    let handle = start_replica(config, id)?;

    let shutdown = handle.shutdown_flag();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    tracing::info!(%id, "shutdown signal received");
    handle.shutdown();
    Ok(())
}
