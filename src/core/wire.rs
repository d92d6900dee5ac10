//! Wire grammar for the bidder and ring protocols.
//!
//! Every frame is one UTF-8 line. The vocabulary is inherited from the
//! deployed protocol and must stay byte-exact: `OFERTA_MAX`, `SALIR`,
//! `SYNC_ESTADO` and the Spanish error strings are part of the contract
//! with existing clients.

use std::fmt;

use thiserror::Error;

use crate::core::ReplicaId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown frame: {0:?}")]
    UnknownFrame(String),
    #[error("malformed {kind} frame: {line:?}")]
    Malformed { kind: &'static str, line: String },
}

impl WireError {
    fn malformed(kind: &'static str, line: &str) -> Self {
        WireError::Malformed {
            kind,
            line: line.to_string(),
        }
    }
}

/// Render a bid amount the way the wire expects it.
///
/// Whole amounts carry one decimal place (`75.0`, not `75`) so that
/// `OFERTA_MAX:none:0.0` and friends keep their historical shape.
pub fn fmt_amount(amount: f64) -> String {
    if amount.is_finite() && amount.fract() == 0.0 {
        format!("{amount:.1}")
    } else {
        format!("{amount}")
    }
}

fn parse_amount(field: &str, kind: &'static str, line: &str) -> Result<f64, WireError> {
    let value: f64 = field
        .parse()
        .map_err(|_| WireError::malformed(kind, line))?;
    if !value.is_finite() {
        return Err(WireError::malformed(kind, line));
    }
    Ok(value)
}

fn parse_u64(field: &str, kind: &'static str, line: &str) -> Result<u64, WireError> {
    field.parse().map_err(|_| WireError::malformed(kind, line))
}

// =============================================================================
// Bidder -> server
// =============================================================================

/// A parsed bidder frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClientCommand {
    /// A finite bid amount. Sign is validated by the handler, because a
    /// non-positive amount is rejected differently from garbage input.
    Bid(f64),
    /// `SALIR` (case-insensitive): leave the auction.
    Quit,
}

/// Why a bidder frame was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reject {
    MalformedBid,
    NonPositiveBid,
    AuctionFinished,
}

impl Reject {
    pub fn message(self) -> &'static str {
        match self {
            Reject::MalformedBid => "Formato de oferta incorrecto",
            Reject::NonPositiveBid => "Oferta debe ser positiva",
            Reject::AuctionFinished => "Subasta finalizada",
        }
    }
}

/// Parse one line from a bidder. `Err` maps to `ERR:Formato de oferta
/// incorrecto`; the positivity check stays with the caller.
pub fn parse_client_command(line: &str) -> Result<ClientCommand, Reject> {
    let trimmed = line.trim();
    if trimmed.eq_ignore_ascii_case("SALIR") {
        return Ok(ClientCommand::Quit);
    }
    match trimmed.parse::<f64>() {
        Ok(amount) if amount.is_finite() => Ok(ClientCommand::Bid(amount)),
        _ => Err(Reject::MalformedBid),
    }
}

// =============================================================================
// Server -> bidder
// =============================================================================

/// The current high bid as carried inside `CONF` and `SYNC` frames.
///
/// `addr` is `"none"` and `amount` is zero until the first bid commits.
#[derive(Clone, Debug, PartialEq)]
pub struct HighBid {
    pub addr: String,
    pub amount: f64,
}

impl fmt::Display for HighBid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OFERTA_MAX:{}:{}", self.addr, fmt_amount(self.amount))
    }
}

/// A frame the server pushes to a bidder.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    /// `INICIO:DURACION:<secs>` -- the session entered Running.
    Start { duration_secs: u64 },
    /// `CONF:OFERTA_MAX:<addr>:<amount>:TIEMPO:<secs>:ESTADO:<LIDER|SIGUIENDO>`
    Conf {
        high: HighBid,
        secs_left: u64,
        leading: bool,
    },
    /// `SYNC:OFERTA_MAX:<addr>:<amount>:TIEMPO:<secs>` -- periodic broadcast.
    Sync { high: HighBid, secs_left: u64 },
    /// `RESULTADO:<addr>:OFERTA:<amount>` -- final winner.
    Result { addr: String, amount: f64 },
    /// `ERR:<message>`
    Error { message: String },
    /// `REDIR:<host>:<port>` -- this replica is not the leader; dial there.
    Redirect { host: String, port: u16 },
}

impl ServerFrame {
    pub fn reject(reason: Reject) -> Self {
        ServerFrame::Error {
            message: reason.message().to_string(),
        }
    }
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFrame::Start { duration_secs } => {
                write!(f, "INICIO:DURACION:{duration_secs}")
            }
            ServerFrame::Conf {
                high,
                secs_left,
                leading,
            } => {
                let estado = if *leading { "LIDER" } else { "SIGUIENDO" };
                write!(f, "CONF:{high}:TIEMPO:{secs_left}:ESTADO:{estado}")
            }
            ServerFrame::Sync { high, secs_left } => {
                write!(f, "SYNC:{high}:TIEMPO:{secs_left}")
            }
            ServerFrame::Result { addr, amount } => {
                write!(f, "RESULTADO:{addr}:OFERTA:{}", fmt_amount(*amount))
            }
            ServerFrame::Error { message } => write!(f, "ERR:{message}"),
            ServerFrame::Redirect { host, port } => write!(f, "REDIR:{host}:{port}"),
        }
    }
}

/// Parse one server frame on the client side.
pub fn parse_server_frame(line: &str) -> Result<ServerFrame, WireError> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("INICIO:DURACION:") {
        let duration_secs = parse_u64(rest, "INICIO", line)?;
        return Ok(ServerFrame::Start { duration_secs });
    }
    if let Some(rest) = line.strip_prefix("CONF:") {
        // OFERTA_MAX:<addr>:<amount>:TIEMPO:<secs>:ESTADO:<estado>
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 7 || parts[0] != "OFERTA_MAX" || parts[3] != "TIEMPO" || parts[5] != "ESTADO"
        {
            return Err(WireError::malformed("CONF", line));
        }
        let leading = match parts[6] {
            "LIDER" => true,
            "SIGUIENDO" => false,
            _ => return Err(WireError::malformed("CONF", line)),
        };
        return Ok(ServerFrame::Conf {
            high: HighBid {
                addr: parts[1].to_string(),
                amount: parse_amount(parts[2], "CONF", line)?,
            },
            secs_left: parse_u64(parts[4], "CONF", line)?,
            leading,
        });
    }
    if let Some(rest) = line.strip_prefix("SYNC:") {
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 5 || parts[0] != "OFERTA_MAX" || parts[3] != "TIEMPO" {
            return Err(WireError::malformed("SYNC", line));
        }
        return Ok(ServerFrame::Sync {
            high: HighBid {
                addr: parts[1].to_string(),
                amount: parse_amount(parts[2], "SYNC", line)?,
            },
            secs_left: parse_u64(parts[4], "SYNC", line)?,
        });
    }
    if let Some(rest) = line.strip_prefix("RESULTADO:") {
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 3 || parts[1] != "OFERTA" {
            return Err(WireError::malformed("RESULTADO", line));
        }
        return Ok(ServerFrame::Result {
            addr: parts[0].to_string(),
            amount: parse_amount(parts[2], "RESULTADO", line)?,
        });
    }
    if let Some(rest) = line.strip_prefix("ERR:") {
        return Ok(ServerFrame::Error {
            message: rest.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("REDIR:") {
        let Some((host, port)) = rest.rsplit_once(':') else {
            return Err(WireError::malformed("REDIR", line));
        };
        let port: u16 = port
            .parse()
            .map_err(|_| WireError::malformed("REDIR", line))?;
        return Ok(ServerFrame::Redirect {
            host: host.to_string(),
            port,
        });
    }
    Err(WireError::UnknownFrame(line.to_string()))
}

// =============================================================================
// Replica <-> replica (ring port)
// =============================================================================

/// A frame on the inter-replica ring port.
#[derive(Clone, Debug, PartialEq)]
pub enum RingFrame {
    /// `COORDINADOR:<id>` -- the sender announces itself as leader.
    Coordinator { id: ReplicaId },
    /// `HEARTBEAT:<id>:<millis>` -- leader liveness ping.
    Heartbeat { id: ReplicaId, at_ms: u64 },
    /// `SYNC_ESTADO:<amount>:<addr>:<millis>` -- replicate a new high bid.
    SyncState {
        amount: f64,
        addr: String,
        at_ms: u64,
    },
    /// `ELECCION_REQUEST` -- force receivers to run an election.
    ElectionRequest,
}

impl fmt::Display for RingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingFrame::Coordinator { id } => write!(f, "COORDINADOR:{id}"),
            RingFrame::Heartbeat { id, at_ms } => write!(f, "HEARTBEAT:{id}:{at_ms}"),
            RingFrame::SyncState { amount, addr, at_ms } => {
                write!(f, "SYNC_ESTADO:{}:{addr}:{at_ms}", fmt_amount(*amount))
            }
            RingFrame::ElectionRequest => write!(f, "ELECCION_REQUEST"),
        }
    }
}

/// Parse one ring frame.
///
/// `SYNC_ESTADO` is parsed from both ends (`amount` first, `millis`
/// last) so the address in the middle stays opaque even if it ever
/// carries a colon.
pub fn parse_ring_frame(line: &str) -> Result<RingFrame, WireError> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("COORDINADOR:") {
        let id = rest
            .parse::<ReplicaId>()
            .map_err(|_| WireError::malformed("COORDINADOR", line))?;
        return Ok(RingFrame::Coordinator { id });
    }
    if let Some(rest) = line.strip_prefix("HEARTBEAT:") {
        let Some((id, at_ms)) = rest.split_once(':') else {
            return Err(WireError::malformed("HEARTBEAT", line));
        };
        let id = id
            .parse::<ReplicaId>()
            .map_err(|_| WireError::malformed("HEARTBEAT", line))?;
        return Ok(RingFrame::Heartbeat {
            id,
            at_ms: parse_u64(at_ms, "HEARTBEAT", line)?,
        });
    }
    if let Some(rest) = line.strip_prefix("SYNC_ESTADO:") {
        let Some((amount, tail)) = rest.split_once(':') else {
            return Err(WireError::malformed("SYNC_ESTADO", line));
        };
        let Some((addr, at_ms)) = tail.rsplit_once(':') else {
            return Err(WireError::malformed("SYNC_ESTADO", line));
        };
        if addr.is_empty() {
            return Err(WireError::malformed("SYNC_ESTADO", line));
        }
        return Ok(RingFrame::SyncState {
            amount: parse_amount(amount, "SYNC_ESTADO", line)?,
            addr: addr.to_string(),
            at_ms: parse_u64(at_ms, "SYNC_ESTADO", line)?,
        });
    }
    if line == "ELECCION_REQUEST" {
        return Ok(RingFrame::ElectionRequest);
    }
    Err(WireError::UnknownFrame(line.to_string()))
}
