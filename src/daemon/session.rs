//! Auction session lifecycle.
//!
//! One controller per replica drives Preparation -> Running -> Completed
//! rounds forever. Only the leader starts a session; a follower that
//! knows a live leader redirects fresh bidders there instead of parking
//! them. Timers are plain threads gated on a generation counter, so a
//! stray late firing after a reset is a no-op.

use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::RingConfig;
use crate::core::{AuctionState, Reject, ReplicaId, ServerFrame, now_ms};
use crate::daemon::handler::{BidderConn, SessionView, run_bidder_handler};
use crate::daemon::line::LineWriter;
use crate::daemon::ring::{LeaderView, StateSync};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Preparation,
    Running,
    Completed,
}

impl SessionPhase {
    fn as_u8(self) -> u8 {
        match self {
            SessionPhase::Preparation => 0,
            SessionPhase::Running => 1,
            SessionPhase::Completed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionPhase::Running,
            2 => SessionPhase::Completed,
            _ => SessionPhase::Preparation,
        }
    }
}

pub struct SessionController {
    my_id: ReplicaId,
    config: RingConfig,
    state: Arc<AuctionState>,
    leader: Arc<dyn LeaderView>,
    sync: Arc<dyn StateSync>,
    handlers: Mutex<Vec<Arc<BidderConn>>>,
    phase: AtomicU8,
    started_at_ms: AtomicU64,
    /// Bumped on every session start and reset; timer threads compare it
    /// before acting.
    generation: AtomicU64,
    session_counter: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl SessionController {
    pub fn new(
        my_id: ReplicaId,
        config: RingConfig,
        state: Arc<AuctionState>,
        leader: Arc<dyn LeaderView>,
        sync: Arc<dyn StateSync>,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(SessionController {
            my_id,
            config,
            state,
            leader,
            sync,
            handlers: Mutex::new(Vec::new()),
            phase: AtomicU8::new(SessionPhase::Preparation.as_u8()),
            started_at_ms: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            session_counter: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    pub fn session_counter(&self) -> u64 {
        self.session_counter.load(Ordering::Acquire)
    }

    /// Bidder accept loop; runs until shutdown, one session per pass.
    pub fn run(self: Arc<Self>, listener: TcpListener) {
        if let Err(err) = listener.set_nonblocking(true) {
            tracing::error!(id = %self.my_id, "bidder listener setup failed: {err}");
            return;
        }

        while !self.shutdown.load(Ordering::Relaxed) {
            let session = self.session_counter.fetch_add(1, Ordering::AcqRel) + 1;
            self.set_phase(SessionPhase::Preparation);
            tracing::info!(id = %self.my_id, session, "session preparation, accepting bidders");

            while self.phase() != SessionPhase::Completed {
                if self.shutdown.load(Ordering::Relaxed) {
                    self.disconnect_all();
                    return;
                }
                match listener.accept() {
                    Ok((stream, _)) => Self::handle_accept(&self, stream),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        tracing::warn!(id = %self.my_id, "bidder accept error: {err}");
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }

            // Drain the tail: connections arriving after the deadline get
            // a single rejection frame before the next session opens.
            self.drain_late_connections(&listener);
            self.reset();
        }
        self.disconnect_all();
    }

    fn handle_accept(this: &Arc<Self>, stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(err) => {
                tracing::warn!(id = %this.my_id, "dropping bidder connection: {err}");
                return;
            }
        };
        tracing::info!(id = %this.my_id, bidder = %peer, "bidder connected");

        if !this.leader.is_leader()
            && let Some(leader_id) = this.leader.leader_id()
            && leader_id != this.my_id
            && let Some(entry) = this.config.entry(leader_id)
        {
            this.redirect(stream, &entry.host, entry.client_port);
            return;
        }

        if this.phase() == SessionPhase::Preparation
            && this.handlers.lock().expect("handler list lock poisoned").is_empty()
            && this.leader.is_leader()
        {
            Self::start_session(this);
        }

        if this.phase() == SessionPhase::Running {
            let elapsed = now_ms().saturating_sub(this.started_at_ms.load(Ordering::Acquire));
            if elapsed >= this.config.session_duration_ms {
                tracing::info!(id = %this.my_id, bidder = %peer, "rejecting late bidder");
                reject_and_close(stream, Reject::AuctionFinished);
                return;
            }
        }

        let conn = match BidderConn::new(stream) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(id = %this.my_id, "bidder connection setup failed: {err}");
                return;
            }
        };
        let reader = match conn.reader(this.config.max_line_bytes) {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(id = %this.my_id, "bidder connection setup failed: {err}");
                return;
            }
        };

        let total = {
            let mut handlers = this.handlers.lock().expect("handler list lock poisoned");
            handlers.push(Arc::clone(&conn));
            handlers.len()
        };

        {
            let conn = Arc::clone(&conn);
            let state = Arc::clone(&this.state);
            let sync = Arc::clone(&this.sync);
            let session: Arc<dyn SessionView> = Arc::clone(this) as Arc<dyn SessionView>;
            thread::spawn(move || run_bidder_handler(conn, reader, state, sync, session));
        }

        if this.phase() == SessionPhase::Running {
            conn.notify_start(this.secs_left());
        }
        tracing::info!(id = %this.my_id, total, "bidders connected");
    }

    fn redirect(&self, stream: TcpStream, host: &str, port: u16) {
        tracing::info!(id = %self.my_id, host, port, "redirecting bidder to leader");
        let mut writer = LineWriter::new(stream);
        let frame = ServerFrame::Redirect {
            host: host.to_string(),
            port,
        };
        let _ = writer.write_line(&frame.to_string());
    }

    /// Enter Running: record the start stamp, arm the end timer and the
    /// periodic broadcast. Leader-gated.
    fn start_session(this: &Arc<Self>) {
        if !this.leader.is_leader() {
            tracing::info!(id = %this.my_id, "not the leader, session stays in preparation");
            return;
        }

        this.set_phase(SessionPhase::Running);
        let started = this.state.start();
        this.started_at_ms.store(started, Ordering::Release);
        let generation = this.generation.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::info!(
            id = %this.my_id,
            session = this.session_counter(),
            duration_s = this.config.session_duration_ms / 1000,
            "auction session started"
        );

        let controller = Arc::clone(this);
        let duration = Duration::from_millis(this.config.session_duration_ms);
        thread::spawn(move || {
            thread::sleep(duration);
            if controller.generation.load(Ordering::Acquire) == generation
                && controller.phase() == SessionPhase::Running
            {
                controller.end_session();
            }
        });

        let controller = Arc::clone(this);
        let interval = Duration::from_millis(this.config.broadcast_interval_ms);
        thread::spawn(move || {
            loop {
                thread::sleep(interval);
                if controller.generation.load(Ordering::Acquire) != generation
                    || controller.phase() != SessionPhase::Running
                {
                    break;
                }
                controller.broadcast_update();
            }
        });
    }

    /// Close the session: determine the winner from the store, notify
    /// every handler once, then disconnect them all.
    fn end_session(&self) {
        self.set_phase(SessionPhase::Completed);
        self.state.finish();
        tracing::info!(
            id = %self.my_id,
            session = self.session_counter(),
            "auction session finished"
        );

        let participants = self.state.participants();
        if participants.is_empty() {
            tracing::info!(id = %self.my_id, "session closed with no participants");
        }
        for p in &participants {
            tracing::info!(id = %self.my_id, addr = %p.address, bid = p.last_bid, "final bid");
        }

        let handlers = self.handler_snapshot();
        match self.state.winner() {
            Some(winner) if winner.last_bid > 0.0 => {
                tracing::info!(
                    id = %self.my_id,
                    winner = %winner.address,
                    bid = winner.last_bid,
                    "auction winner"
                );
                let frame = ServerFrame::Result {
                    addr: winner.address.clone(),
                    amount: winner.last_bid,
                };
                for handler in &handlers {
                    handler.notify_result(&frame);
                }
            }
            _ => tracing::info!(id = %self.my_id, "no winner to announce"),
        }

        for handler in &handlers {
            handler.disconnect();
        }
    }

    fn broadcast_update(&self) {
        let handlers = self.handler_snapshot();
        if handlers.is_empty() {
            return;
        }
        let frame = ServerFrame::Sync {
            high: self.state.snapshot_high(),
            secs_left: self.secs_left(),
        };
        tracing::debug!(
            id = %self.my_id,
            high = %frame,
            bidders = handlers.len(),
            "periodic update"
        );
        for handler in &handlers {
            handler.notify_update(&frame);
        }
    }

    fn drain_late_connections(&self, listener: &TcpListener) {
        let deadline = Instant::now() + Duration::from_millis(self.config.drain_ms);
        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::info!(id = %self.my_id, bidder = %peer, "rejecting late bidder");
                    reject_and_close(stream, Reject::AuctionFinished);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    /// Back to initial: cancel timers via the generation bump, wipe the
    /// store, forget the handler list.
    fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.reset();
        self.handlers
            .lock()
            .expect("handler list lock poisoned")
            .clear();
        self.started_at_ms.store(0, Ordering::Release);
        tracing::info!(id = %self.my_id, "ready for next session");
    }

    fn handler_snapshot(&self) -> Vec<Arc<BidderConn>> {
        self.handlers
            .lock()
            .expect("handler list lock poisoned")
            .clone()
    }

    pub fn disconnect_all(&self) {
        for handler in self.handler_snapshot() {
            handler.disconnect();
        }
    }
}

impl SessionView for SessionController {
    fn is_running(&self) -> bool {
        self.phase() == SessionPhase::Running
    }

    fn secs_left(&self) -> u64 {
        if self.phase() != SessionPhase::Running {
            return 0;
        }
        let elapsed = now_ms().saturating_sub(self.started_at_ms.load(Ordering::Acquire));
        self.config.session_duration_ms.saturating_sub(elapsed) / 1000
    }
}

fn reject_and_close(stream: TcpStream, reason: Reject) {
    let mut writer = LineWriter::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let _ = writer.write_line(&ServerFrame::reject(reason).to_string());
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_encoding_round_trips() {
        for phase in [
            SessionPhase::Preparation,
            SessionPhase::Running,
            SessionPhase::Completed,
        ] {
            assert_eq!(SessionPhase::from_u8(phase.as_u8()), phase);
        }
    }
}
