//! Failover-aware bidder runtime.
//!
//! Owns the connection to one replica, a receiver thread dispatching
//! server frames, and the synchronous bid rendezvous. When the server
//! dies mid-auction the client redials the next candidate and re-sends
//! its last bid, so the new leader observes the bidder's intent; the
//! server treats the repeat idempotently and the client tolerates
//! silence after the reissue.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use crate::config::{ClientConfig, Config};
use crate::core::{HighBid, ServerFrame, fmt_amount, parse_server_frame};
use crate::daemon::line::{LineReader, LineWriter};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unable to reach any auction server")]
    AllServersUnreachable,
    #[error("no confirmation from the server after retry")]
    ConfirmTimeout,
    #[error("no auction result within {0:?}")]
    NoResult(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A server candidate the client may dial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Final auction outcome as announced by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct AuctionResult {
    pub winner_addr: String,
    pub winning_bid: f64,
}

impl AuctionResult {
    /// Did this client's last bid win?
    pub fn won(&self, own_last_bid: f64) -> bool {
        self.winning_bid == own_last_bid
    }
}

/// Typed reply to one submitted bid.
#[derive(Clone, Debug, PartialEq)]
pub enum BidOutcome {
    Confirmed(BidStatus),
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct BidStatus {
    pub high: HighBid,
    pub secs_left: u64,
    pub leading: bool,
}

/// Push notifications surfaced to the UI layer.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Started { duration_secs: u64 },
    Update { high: HighBid, secs_left: u64 },
    Finished { result: AuctionResult },
    Disconnected,
}

/// What the receiver hands to a thread parked in the bid rendezvous.
#[derive(Clone, Debug)]
enum Signal {
    Reply(ServerFrame),
    Redirect { host: String, port: u16 },
    Lost,
}

struct Rendezvous {
    slot: Mutex<Option<Signal>>,
    cv: Condvar,
}

impl Rendezvous {
    fn new() -> Self {
        Rendezvous {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn clear(&self) {
        *self.slot.lock().expect("rendezvous lock poisoned") = None;
    }

    fn put(&self, signal: Signal) {
        let mut slot = self.slot.lock().expect("rendezvous lock poisoned");
        *slot = Some(signal);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<Signal> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().expect("rendezvous lock poisoned");
        loop {
            if let Some(signal) = slot.take() {
                return Some(signal);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(slot, deadline - now)
                .expect("rendezvous lock poisoned");
            slot = guard;
        }
    }
}

struct ClientShared {
    rendezvous: Rendezvous,
    result: Mutex<Option<AuctionResult>>,
    pending_redirect: Mutex<Option<Endpoint>>,
    active: AtomicBool,
    lost: AtomicBool,
    events: Sender<ClientEvent>,
}

/// Bidder-side connection with transparent failover.
pub struct AuctionClient {
    candidates: Vec<Endpoint>,
    current: usize,
    timing: ClientConfig,
    max_line_bytes: usize,
    stream: TcpStream,
    writer: LineWriter<TcpStream>,
    receiver: Option<JoinHandle<()>>,
    shared: Arc<ClientShared>,
    events_rx: Receiver<ClientEvent>,
    last_bid: Option<f64>,
}

impl AuctionClient {
    /// Connect using the configured roster, starting at `start_index`.
    pub fn connect(config: &Config, start_index: usize) -> Result<Self, ClientError> {
        let candidates = config
            .ring
            .roster
            .iter()
            .map(|entry| Endpoint::new(entry.host.clone(), entry.client_port))
            .collect();
        Self::connect_to(
            candidates,
            start_index,
            config.client.clone(),
            config.ring.max_line_bytes,
        )
    }

    /// Connect to an explicit candidate list. Candidates are tried from
    /// `start_index`, wrapping once; the first successful dial wins.
    pub fn connect_to(
        candidates: Vec<Endpoint>,
        start_index: usize,
        timing: ClientConfig,
        max_line_bytes: usize,
    ) -> Result<Self, ClientError> {
        let (events_tx, events_rx) = unbounded();
        let shared = Arc::new(ClientShared {
            rendezvous: Rendezvous::new(),
            result: Mutex::new(None),
            pending_redirect: Mutex::new(None),
            active: AtomicBool::new(true),
            lost: AtomicBool::new(false),
            events: events_tx,
        });

        let count = candidates.len().max(1);
        for offset in 0..count {
            let index = (start_index + offset) % count;
            let Some(endpoint) = candidates.get(index) else {
                continue;
            };
            match dial(endpoint, &timing) {
                Ok(stream) => {
                    tracing::info!(server = %endpoint.addr(), "connected to auction server");
                    let writer = LineWriter::new(stream.try_clone()?);
                    let receiver =
                        spawn_receiver(stream.try_clone()?, Arc::clone(&shared), max_line_bytes)?;
                    return Ok(AuctionClient {
                        candidates,
                        current: index,
                        timing,
                        max_line_bytes,
                        stream,
                        writer,
                        receiver: Some(receiver),
                        shared,
                        events_rx,
                        last_bid: None,
                    });
                }
                Err(err) => {
                    tracing::info!(server = %endpoint.addr(), "server unavailable: {err}");
                }
            }
        }
        Err(ClientError::AllServersUnreachable)
    }

    /// Push notifications (`INICIO`, periodic `SYNC`, final result).
    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events_rx
    }

    /// The auction is live until a `RESULTADO` frame arrives.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn last_bid(&self) -> Option<f64> {
        self.last_bid
    }

    /// Submit one bid and wait for the server's reply.
    ///
    /// On a silent 10 s window the client reconnects once, re-sends the
    /// bid, and waits one more window before giving up.
    pub fn bid(&mut self, amount: f64) -> Result<BidOutcome, ClientError> {
        // Heal first: a pending redirect or loss reissues the *previous*
        // bid, then this one goes out normally.
        self.heal_connection()?;
        self.last_bid = Some(amount);

        self.shared.rendezvous.clear();
        if self.send_amount(amount).is_err() {
            // Dead socket discovered on write: fail over, reissue, wait.
            self.failover()?;
            return self.wait_reply_or_give_up();
        }

        let timeout = Duration::from_millis(self.timing.confirm_timeout_ms);
        match self.shared.rendezvous.wait(timeout) {
            Some(Signal::Reply(frame)) => outcome_from_frame(frame),
            Some(Signal::Redirect { host, port }) => {
                self.follow_redirect(Endpoint::new(host, port), amount)
            }
            Some(Signal::Lost) | None => {
                self.failover()?;
                self.wait_reply_or_give_up()
            }
        }
    }

    /// Tell the server we are leaving the auction.
    pub fn quit(&mut self) -> Result<(), ClientError> {
        self.writer.write_line("SALIR")?;
        Ok(())
    }

    /// Block until the final result arrives, reconnecting if the server
    /// dies while we wait.
    pub fn await_result(&mut self, timeout: Duration) -> Result<AuctionResult, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self
                .shared
                .result
                .lock()
                .expect("result lock poisoned")
                .clone()
            {
                return Ok(result);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::NoResult(timeout));
            }
            self.heal_connection()?;
            thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn close(mut self) {
        self.shared.active.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
    }

    /// Apply any pending redirect or reconnect after a detected loss.
    fn heal_connection(&mut self) -> Result<(), ClientError> {
        let redirect = self
            .shared
            .pending_redirect
            .lock()
            .expect("redirect lock poisoned")
            .take();
        if let Some(target) = redirect {
            self.shared.lost.store(false, Ordering::Release);
            match self.install_connection(&target) {
                Ok(()) => self.reissue_last_bid(),
                Err(err) => {
                    // Stale redirect: the named leader is already gone.
                    tracing::info!(server = %target.addr(), "redirect target unreachable: {err}");
                    self.failover()?;
                }
            }
            return Ok(());
        }
        if self.shared.lost.swap(false, Ordering::AcqRel) {
            self.failover()?;
        }
        Ok(())
    }

    /// Redial the next candidates, wrapping, up to `reconnect_rounds`
    /// passes with a backoff between them. On success the last bid is
    /// re-sent so the new server observes this bidder's intent.
    fn failover(&mut self) -> Result<(), ClientError> {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
        // The dying receiver may have left a Lost signal behind; the
        // rendezvous must start clean for the reissued bid.
        self.shared.rendezvous.clear();
        self.shared.lost.store(false, Ordering::Release);

        let count = self.candidates.len();
        for round in 0..self.timing.reconnect_rounds {
            if round > 0 {
                thread::sleep(Duration::from_millis(self.timing.reconnect_backoff_ms));
            }
            for step in 1..=count {
                let index = (self.current + step) % count;
                let endpoint = self.candidates[index].clone();
                match self.install_connection(&endpoint) {
                    Ok(()) => {
                        self.current = index;
                        tracing::info!(server = %endpoint.addr(), "failed over to server");
                        self.reissue_last_bid();
                        return Ok(());
                    }
                    Err(err) => {
                        tracing::info!(server = %endpoint.addr(), "failover attempt failed: {err}");
                    }
                }
            }
        }
        Err(ClientError::AllServersUnreachable)
    }

    fn follow_redirect(
        &mut self,
        target: Endpoint,
        amount: f64,
    ) -> Result<BidOutcome, ClientError> {
        tracing::info!(server = %target.addr(), "redirected to leader");
        self.shared
            .pending_redirect
            .lock()
            .expect("redirect lock poisoned")
            .take();
        match self.install_connection(&target) {
            Ok(()) => {
                self.shared.rendezvous.clear();
                if self.send_amount(amount).is_err() {
                    self.failover()?;
                }
            }
            Err(err) => {
                tracing::info!(server = %target.addr(), "redirect target unreachable: {err}");
                self.failover()?;
            }
        }
        self.wait_reply_or_give_up()
    }

    fn wait_reply_or_give_up(&mut self) -> Result<BidOutcome, ClientError> {
        let timeout = Duration::from_millis(self.timing.confirm_timeout_ms);
        match self.shared.rendezvous.wait(timeout) {
            Some(Signal::Reply(frame)) => outcome_from_frame(frame),
            Some(Signal::Redirect { host, port }) => {
                let Some(amount) = self.last_bid else {
                    return Err(ClientError::ConfirmTimeout);
                };
                self.follow_redirect(Endpoint::new(host, port), amount)
            }
            _ => Err(ClientError::ConfirmTimeout),
        }
    }

    fn install_connection(&mut self, endpoint: &Endpoint) -> Result<(), ClientError> {
        let stream = dial(endpoint, &self.timing)?;
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
        self.writer = LineWriter::new(stream.try_clone()?);
        self.receiver = Some(spawn_receiver(
            stream.try_clone()?,
            Arc::clone(&self.shared),
            self.max_line_bytes,
        )?);
        self.stream = stream;
        if let Some(index) = self.candidates.iter().position(|c| c == endpoint) {
            self.current = index;
        }
        Ok(())
    }

    /// Re-send the last bid after a reconnect, without a rendezvous: a
    /// repeat of an already-seen bid may be answered with silence.
    fn reissue_last_bid(&mut self) {
        if let Some(amount) = self.last_bid {
            tracing::info!(amount, "re-sending last bid after reconnect");
            let _ = self.send_amount(amount);
        }
    }

    fn send_amount(&mut self, amount: f64) -> std::io::Result<()> {
        self.writer.write_line(&fmt_amount(amount))
    }
}

fn dial(endpoint: &Endpoint, timing: &ClientConfig) -> std::io::Result<TcpStream> {
    let timeout = Duration::from_millis(timing.dial_timeout_ms);
    let resolved = endpoint.addr().to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved")
    })?;
    let stream = TcpStream::connect_timeout(&resolved, timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn spawn_receiver(
    stream: TcpStream,
    shared: Arc<ClientShared>,
    max_line_bytes: usize,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("auction-receiver".to_string())
        .spawn(move || run_receiver(stream, shared, max_line_bytes))
}

/// Receiver loop: dispatch frames by prefix until the stream closes or
/// the final result lands.
fn run_receiver(stream: TcpStream, shared: Arc<ClientShared>, max_line_bytes: usize) {
    let mut reader = LineReader::new(stream, max_line_bytes);
    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                on_connection_lost(&shared);
                return;
            }
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                tracing::debug!("receiver read error: {err}");
                on_connection_lost(&shared);
                return;
            }
        };

        let frame = match parse_server_frame(&line) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("ignoring server frame: {err}");
                continue;
            }
        };

        match frame {
            ServerFrame::Start { duration_secs } => {
                let _ = shared.events.send(ClientEvent::Started { duration_secs });
            }
            ServerFrame::Sync { high, secs_left } => {
                let _ = shared.events.send(ClientEvent::Update { high, secs_left });
            }
            ServerFrame::Conf { .. } | ServerFrame::Error { .. } => {
                shared.rendezvous.put(Signal::Reply(frame));
            }
            ServerFrame::Result { addr, amount } => {
                let result = AuctionResult {
                    winner_addr: addr,
                    winning_bid: amount,
                };
                *shared.result.lock().expect("result lock poisoned") = Some(result.clone());
                shared.active.store(false, Ordering::Release);
                let _ = shared.events.send(ClientEvent::Finished { result });
                return;
            }
            ServerFrame::Redirect { host, port } => {
                *shared
                    .pending_redirect
                    .lock()
                    .expect("redirect lock poisoned") = Some(Endpoint::new(host.clone(), port));
                shared.rendezvous.put(Signal::Redirect { host, port });
                return;
            }
        }
    }
}

fn on_connection_lost(shared: &ClientShared) {
    if !shared.active.load(Ordering::Acquire) {
        return;
    }
    shared.lost.store(true, Ordering::Release);
    shared.rendezvous.put(Signal::Lost);
    let _ = shared.events.send(ClientEvent::Disconnected);
}

fn outcome_from_frame(frame: ServerFrame) -> Result<BidOutcome, ClientError> {
    match frame {
        ServerFrame::Conf {
            high,
            secs_left,
            leading,
        } => Ok(BidOutcome::Confirmed(BidStatus {
            high,
            secs_left,
            leading,
        })),
        ServerFrame::Error { message } => Ok(BidOutcome::Rejected(message)),
        other => {
            tracing::warn!(?other, "unexpected frame in bid rendezvous");
            Err(ClientError::ConfirmTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_delivers_and_times_out() {
        let rendezvous = Rendezvous::new();
        rendezvous.put(Signal::Lost);
        assert!(matches!(
            rendezvous.wait(Duration::from_millis(10)),
            Some(Signal::Lost)
        ));
        // Slot is consumed; the next wait times out.
        assert!(rendezvous.wait(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn result_comparison_uses_own_last_bid() {
        let result = AuctionResult {
            winner_addr: "127.0.0.1".to_string(),
            winning_bid: 75.0,
        };
        assert!(result.won(75.0));
        assert!(!result.won(50.0));
    }

    #[test]
    fn outcome_maps_conf_and_err() {
        let conf = ServerFrame::Conf {
            high: HighBid {
                addr: "1.2.3.4".to_string(),
                amount: 9.0,
            },
            secs_left: 3,
            leading: false,
        };
        assert!(matches!(
            outcome_from_frame(conf),
            Ok(BidOutcome::Confirmed(BidStatus { leading: false, .. }))
        ));
        let err = ServerFrame::Error {
            message: "Oferta debe ser positiva".to_string(),
        };
        assert_eq!(
            outcome_from_frame(err).unwrap(),
            BidOutcome::Rejected("Oferta debe ser positiva".to_string())
        );
    }

    #[test]
    fn connect_fails_when_no_candidate_answers() {
        // Reserved port on localhost that nothing listens on.
        let candidates = vec![Endpoint::new("127.0.0.1", 1)];
        let timing = ClientConfig {
            dial_timeout_ms: 200,
            ..ClientConfig::default()
        };
        match AuctionClient::connect_to(candidates, 0, timing, 4096) {
            Err(ClientError::AllServersUnreachable) => {}
            Err(other) => panic!("expected AllServersUnreachable, got {other:?}"),
            Ok(_) => panic!("expected AllServersUnreachable, got a connection"),
        }
    }
}
