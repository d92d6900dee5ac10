//! CLI surface: run a replica or join as a bidder.

use std::ffi::OsString;
use std::io::BufRead;
use std::thread;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::client::{AuctionClient, BidOutcome, ClientEvent};
use crate::config::Config;
use crate::core::ReplicaId;
use crate::{Result, daemon};

#[derive(Parser, Debug)]
#[command(
    name = "subasta",
    version,
    about = "Replicated live-auction service",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one auction replica.
    Server {
        /// Replica id from the ring roster.
        id: ReplicaId,
    },
    /// Join the auction as a bidder.
    Client {
        /// Roster index of the server to try first.
        #[arg(long, default_value_t = 0)]
        server_index: usize,
    },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Server { id } => daemon::run_replica(&config, id)?,
        Commands::Client { server_index } => run_bidder(&config, server_index)?,
    }
    Ok(())
}

/// Minimal line-oriented bidder loop: one bid per stdin line, `x` or
/// `SALIR` to leave.
fn run_bidder(config: &Config, server_index: usize) -> Result<()> {
    let mut client = AuctionClient::connect(config, server_index)?;

    let events = client.events().clone();
    thread::spawn(move || {
        for event in events.iter() {
            match event {
                ClientEvent::Started { duration_secs } => {
                    println!("auction started, {duration_secs}s");
                }
                ClientEvent::Update { high, secs_left } => {
                    println!("{high} ({secs_left}s left)");
                }
                ClientEvent::Finished { result } => {
                    println!(
                        "winner: {} at {}",
                        result.winner_addr, result.winning_bid
                    );
                }
                ClientEvent::Disconnected => println!("server lost, reconnecting..."),
            }
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("x") || input.eq_ignore_ascii_case("SALIR") {
            let _ = client.quit();
            break;
        }
        let Ok(amount) = input.parse::<f64>() else {
            println!("enter a positive amount, or 'x' to leave");
            continue;
        };
        match client.bid(amount)? {
            BidOutcome::Confirmed(status) => {
                let role = if status.leading { "leading" } else { "following" };
                println!("{} ({}s left) - {role}", status.high, status.secs_left);
            }
            BidOutcome::Rejected(message) => println!("rejected: {message}"),
        }
        if !client.is_active() {
            break;
        }
    }

    if client.is_active() {
        let result = client.await_result(Duration::from_secs(
            config.ring.session_duration_ms / 1000 + 30,
        ))?;
        let own = client.last_bid().unwrap_or(0.0);
        if result.won(own) {
            println!("you won at {}", result.winning_bid);
        } else {
            println!("{} won at {}", result.winner_addr, result.winning_bid);
        }
    }
    client.close();
    Ok(())
}
