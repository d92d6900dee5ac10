//! Per-bidder connection handling.
//!
//! Each accepted bidder gets a `BidderConn` (the shared handle the
//! session controller pushes notifications through) and a reader thread
//! running `run_bidder_handler`. After the read loop ends, the thread
//! parks until the final result has been delivered exactly once, then
//! closes the socket.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::core::{AuctionState, ClientCommand, Reject, ServerFrame, parse_client_command};
use crate::daemon::line::{LineReader, LineWriter};
use crate::daemon::ring::StateSync;

/// Read-only session view the handler consults per frame.
pub trait SessionView: Send + Sync {
    fn is_running(&self) -> bool;
    fn secs_left(&self) -> u64;
}

/// One-shot latch the handler blocks on after its read loop.
struct ResultLatch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl ResultLatch {
    fn new() -> Self {
        ResultLatch {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut done = self.done.lock().expect("result latch lock poisoned");
        *done = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().expect("result latch lock poisoned");
        while !*done {
            done = self.cv.wait(done).expect("result latch lock poisoned");
        }
    }
}

/// Shared handle for one bidder connection.
pub struct BidderConn {
    addr: String,
    stream: TcpStream,
    writer: Mutex<LineWriter<TcpStream>>,
    notified: AtomicBool,
    latch: ResultLatch,
    last_bid: Mutex<f64>,
}

impl BidderConn {
    pub fn new(stream: TcpStream) -> std::io::Result<Arc<Self>> {
        let addr = stream.peer_addr()?.ip().to_string();
        stream.set_nodelay(true)?;
        let writer = LineWriter::new(stream.try_clone()?);
        Ok(Arc::new(BidderConn {
            addr,
            stream,
            writer: Mutex::new(writer),
            notified: AtomicBool::new(false),
            latch: ResultLatch::new(),
            last_bid: Mutex::new(0.0),
        }))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn reader(&self, max_line_bytes: usize) -> std::io::Result<LineReader<TcpStream>> {
        Ok(LineReader::new(self.stream.try_clone()?, max_line_bytes))
    }

    /// The bidder's most recent accepted bid, kept for end-of-session
    /// reporting; the store stays authoritative.
    pub fn last_bid(&self) -> f64 {
        *self.last_bid.lock().expect("last bid lock poisoned")
    }

    fn record_bid(&self, amount: f64) {
        *self.last_bid.lock().expect("last bid lock poisoned") = amount;
    }

    fn send(&self, frame: &ServerFrame) -> std::io::Result<()> {
        let mut writer = self.writer.lock().expect("bidder writer lock poisoned");
        writer.write_line(&frame.to_string())
    }

    pub fn notify_start(&self, secs_left: u64) {
        let frame = ServerFrame::Start {
            duration_secs: secs_left,
        };
        if let Err(err) = self.send(&frame) {
            tracing::debug!(addr = %self.addr, "start notification failed: {err}");
        }
    }

    pub fn notify_update(&self, frame: &ServerFrame) {
        if let Err(err) = self.send(frame) {
            tracing::debug!(addr = %self.addr, "update notification failed: {err}");
        }
    }

    /// Deliver the final result. At most one `RESULTADO` ever reaches
    /// the bidder; repeated calls only open the latch.
    pub fn notify_result(&self, frame: &ServerFrame) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.send(frame) {
                tracing::debug!(addr = %self.addr, "result notification failed: {err}");
            }
        }
        self.latch.open();
    }

    /// Release the handler thread (without a result, if none was sent)
    /// and shut the socket down.
    pub fn disconnect(&self) {
        self.latch.open();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn await_result(&self) {
        self.latch.wait();
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Read loop for one bidder. Consumes frames while the session runs,
/// commits bids to the store, replicates new highs through `sync`, and
/// answers with `CONF`/`ERR` frames.
pub fn run_bidder_handler(
    conn: Arc<BidderConn>,
    mut reader: LineReader<TcpStream>,
    state: Arc<AuctionState>,
    sync: Arc<dyn StateSync>,
    session: Arc<dyn SessionView>,
) {
    while session.is_running() {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!(addr = %conn.addr(), "bidder disconnected");
                break;
            }
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                tracing::warn!(addr = %conn.addr(), "bidder read error: {err}");
                break;
            }
        };

        let reply = match parse_client_command(&line) {
            Ok(ClientCommand::Quit) => {
                tracing::info!(addr = %conn.addr(), "bidder left the auction");
                break;
            }
            Ok(ClientCommand::Bid(amount)) if amount <= 0.0 => {
                ServerFrame::reject(Reject::NonPositiveBid)
            }
            Ok(ClientCommand::Bid(amount)) => {
                conn.record_bid(amount);
                let is_high = state.register(amount, conn.addr());
                if is_high {
                    tracing::info!(addr = %conn.addr(), amount, "new high bid");
                    sync.replicate(amount, conn.addr());
                }
                ServerFrame::Conf {
                    high: state.snapshot_high(),
                    secs_left: session.secs_left(),
                    leading: is_high,
                }
            }
            Err(reject) => {
                tracing::debug!(addr = %conn.addr(), line = %line, "rejected bidder frame");
                ServerFrame::reject(reject)
            }
        };

        if conn.send(&reply).is_err() {
            break;
        }
    }

    conn.await_result();
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    struct RunningSession;

    impl SessionView for RunningSession {
        fn is_running(&self) -> bool {
            true
        }
        fn secs_left(&self) -> u64 {
            42
        }
    }

    #[derive(Default)]
    struct RecordingSync {
        calls: StdMutex<Vec<(f64, String)>>,
    }

    impl StateSync for RecordingSync {
        fn replicate(&self, amount: f64, addr: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((amount, addr.to_string()));
        }
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn result_is_delivered_at_most_once() {
        let (client, server) = socket_pair();
        let conn = BidderConn::new(server).unwrap();

        let frame = ServerFrame::Result {
            addr: "127.0.0.1".to_string(),
            amount: 75.0,
        };
        conn.notify_result(&frame);
        conn.notify_result(&frame);
        conn.disconnect();

        let mut lines = Vec::new();
        for line in BufReader::new(client).lines() {
            lines.push(line.unwrap());
        }
        assert_eq!(lines, vec!["RESULTADO:127.0.0.1:OFERTA:75.0"]);
    }

    #[test]
    fn handler_validates_then_confirms() {
        let (mut client, server) = socket_pair();
        let conn = BidderConn::new(server).unwrap();
        let reader = conn.reader(4096).unwrap();
        let state = Arc::new(AuctionState::new());
        let sync = Arc::new(RecordingSync::default());

        let handler = {
            let conn = Arc::clone(&conn);
            let state = Arc::clone(&state);
            let sync: Arc<dyn StateSync> = Arc::clone(&sync) as Arc<dyn StateSync>;
            thread::spawn(move || {
                run_bidder_handler(conn, reader, state, sync, Arc::new(RunningSession));
            })
        };

        client.write_all(b"abc\n-5\n42\n").unwrap();
        let mut replies = BufReader::new(client.try_clone().unwrap()).lines();
        assert_eq!(
            replies.next().unwrap().unwrap(),
            "ERR:Formato de oferta incorrecto"
        );
        assert_eq!(
            replies.next().unwrap().unwrap(),
            "ERR:Oferta debe ser positiva"
        );
        let conf = replies.next().unwrap().unwrap();
        assert!(conf.starts_with("CONF:OFERTA_MAX:127.0.0.1:42.0:TIEMPO:"), "{conf}");
        assert!(conf.ends_with(":ESTADO:LIDER"), "{conf}");

        assert_eq!(conn.last_bid(), 42.0);
        assert_eq!(sync.calls.lock().unwrap().as_slice(), &[(42.0, conn.addr().to_string())]);

        client.write_all(b"SALIR\n").unwrap();
        // The read loop has exited; the thread now waits on the latch.
        thread::sleep(Duration::from_millis(50));
        assert!(!handler.is_finished());
        conn.disconnect();
        handler.join().unwrap();
    }

    #[test]
    fn equal_bid_confirms_as_following() {
        let (mut client, server) = socket_pair();
        let conn = BidderConn::new(server).unwrap();
        let reader = conn.reader(4096).unwrap();
        let state = Arc::new(AuctionState::new());
        // Another bidder already holds the high at 100.
        state.register(100.0, "10.9.9.9");
        let sync = Arc::new(RecordingSync::default());

        let handler = {
            let conn = Arc::clone(&conn);
            let state = Arc::clone(&state);
            let sync: Arc<dyn StateSync> = Arc::clone(&sync) as Arc<dyn StateSync>;
            thread::spawn(move || {
                run_bidder_handler(conn, reader, state, sync, Arc::new(RunningSession));
            })
        };

        client.write_all(b"100\n").unwrap();
        let mut replies = BufReader::new(client.try_clone().unwrap()).lines();
        let conf = replies.next().unwrap().unwrap();
        assert!(conf.starts_with("CONF:OFERTA_MAX:10.9.9.9:100.0:"), "{conf}");
        assert!(conf.ends_with(":ESTADO:SIGUIENDO"), "{conf}");
        // An equal bid is not replicated: it is not a new high.
        assert!(sync.calls.lock().unwrap().is_empty());

        conn.disconnect();
        drop(client);
        handler.join().unwrap();
    }
}
