//! Shared fixtures: shrunken timings, ephemeral-port rosters, and a raw
//! line-oriented bidder for driving servers without the client runtime.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use subasta::config::{Config, ReplicaEntry};
use subasta::core::ReplicaId;

/// Grab a free loopback port. The listener is dropped immediately; the
/// tiny reuse window is acceptable for tests.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// A config with `n` loopback replicas on ephemeral ports and timings
/// shrunk far enough that a whole session fits in a test.
pub fn test_config(n: u32) -> Config {
    let mut config = Config::default();
    config.ring.roster = (1..=n)
        .map(|id| ReplicaEntry {
            id: ReplicaId(id),
            host: "127.0.0.1".to_string(),
            client_port: free_port(),
            peer_port: free_port(),
        })
        .collect();
    config.ring.session_duration_ms = 3_000;
    config.ring.broadcast_interval_ms = 500;
    config.ring.heartbeat_interval_ms = 300;
    config.ring.leader_timeout_ms = 1_500;
    config.ring.monitor_interval_ms = 200;
    config.ring.bootstrap_grace_ms = 300;
    config.ring.dial_timeout_ms = 1_000;
    config.ring.drain_ms = 1_500;
    config.client.confirm_timeout_ms = 2_000;
    config.client.reconnect_backoff_ms = 300;
    config.client.dial_timeout_ms = 500;
    config
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

/// Minimal bidder speaking raw lines, for asserting exact frames.
pub struct RawBidder {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawBidder {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect bidder");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("set read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone stream"));
        RawBidder { stream, reader }
    }

    pub fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .expect("send line");
    }

    /// Next line, or `None` at EOF / read timeout.
    pub fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end().to_string()),
            Err(_) => None,
        }
    }

    /// Skip frames until one starts with `prefix`. Periodic `SYNC`
    /// frames interleave freely with replies, so assertions filter.
    pub fn recv_matching(&mut self, prefix: &str) -> Option<String> {
        for _ in 0..64 {
            let line = self.recv()?;
            if line.starts_with(prefix) {
                return Some(line);
            }
        }
        None
    }
}
