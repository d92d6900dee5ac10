//! Multi-replica behavior: election, replication, redirect, failover.

mod common;

use std::time::Duration;

use common::{RawBidder, test_config, wait_until};
use subasta::client::{AuctionClient, BidOutcome, Endpoint};
use subasta::core::ReplicaId;
use subasta::daemon::start_replica;

#[test]
fn ensemble_elects_the_highest_id() {
    let config = test_config(3);
    let h1 = start_replica(&config, ReplicaId(1)).expect("start replica 1");
    let h2 = start_replica(&config, ReplicaId(2)).expect("start replica 2");
    let h3 = start_replica(&config, ReplicaId(3)).expect("start replica 3");

    assert!(
        wait_until(Duration::from_secs(5), || {
            h1.leader_id() == Some(ReplicaId(3))
                && h2.leader_id() == Some(ReplicaId(3))
                && h3.is_leader()
        }),
        "all replicas must converge on replica 3"
    );
    assert!(!h1.is_leader());
    assert!(!h2.is_leader());

    h1.shutdown();
    h2.shutdown();
    h3.shutdown();
}

#[test]
fn high_bid_replicates_to_followers() {
    let config = test_config(3);
    let h1 = start_replica(&config, ReplicaId(1)).expect("start replica 1");
    let h2 = start_replica(&config, ReplicaId(2)).expect("start replica 2");
    let h3 = start_replica(&config, ReplicaId(3)).expect("start replica 3");
    assert!(wait_until(Duration::from_secs(5), || {
        h1.leader_id() == Some(ReplicaId(3))
            && h2.leader_id() == Some(ReplicaId(3))
            && h3.is_leader()
    }));

    let mut bidder = RawBidder::connect(h3.client_addr());
    bidder.recv_matching("INICIO:").expect("INICIO frame");
    bidder.send("200");
    let conf = bidder.recv_matching("CONF:").expect("confirmation");
    assert!(conf.ends_with(":ESTADO:LIDER"), "{conf}");

    assert!(
        wait_until(Duration::from_secs(2), || {
            h1.state().high_bid() == 200.0 && h2.state().high_bid() == 200.0
        }),
        "followers must observe the replicated high bid"
    );
    assert_eq!(h1.state().snapshot_high().addr, "127.0.0.1");
    assert_eq!(h2.state().snapshot_high().addr, "127.0.0.1");

    h1.shutdown();
    h2.shutdown();
    h3.shutdown();
}

#[test]
fn follower_redirects_bidders_to_the_leader() {
    let config = test_config(3);
    let h1 = start_replica(&config, ReplicaId(1)).expect("start replica 1");
    let h2 = start_replica(&config, ReplicaId(2)).expect("start replica 2");
    let h3 = start_replica(&config, ReplicaId(3)).expect("start replica 3");
    assert!(wait_until(Duration::from_secs(5), || {
        h1.leader_id() == Some(ReplicaId(3)) && h3.is_leader()
    }));

    let leader_port = config.ring.entry(ReplicaId(3)).unwrap().client_port;
    let mut bidder = RawBidder::connect(h1.client_addr());
    assert_eq!(
        bidder.recv().as_deref(),
        Some(format!("REDIR:127.0.0.1:{leader_port}").as_str())
    );
    assert_eq!(bidder.recv(), None);

    h1.shutdown();
    h2.shutdown();
    h3.shutdown();
}

#[test]
fn client_fails_over_when_the_leader_dies() {
    let config = test_config(3);
    let h1 = start_replica(&config, ReplicaId(1)).expect("start replica 1");
    let h2 = start_replica(&config, ReplicaId(2)).expect("start replica 2");
    let h3 = start_replica(&config, ReplicaId(3)).expect("start replica 3");
    assert!(wait_until(Duration::from_secs(5), || {
        h1.leader_id() == Some(ReplicaId(3))
            && h2.leader_id() == Some(ReplicaId(3))
            && h3.is_leader()
    }));

    let candidates: Vec<Endpoint> = config
        .ring
        .roster
        .iter()
        .map(|entry| Endpoint::new(entry.host.clone(), entry.client_port))
        .collect();
    // Start at the roster index of the current leader.
    let mut client = AuctionClient::connect_to(
        candidates,
        2,
        config.client.clone(),
        config.ring.max_line_bytes,
    )
    .expect("connect to leader");

    match client.bid(300.0).expect("bid accepted") {
        BidOutcome::Confirmed(status) => assert!(status.leading),
        other => panic!("expected confirmation, got {other:?}"),
    }

    // The committed bid must reach the followers before the leader dies,
    // or it is legitimately lost (documented best-effort window).
    assert!(wait_until(Duration::from_secs(2), || {
        h1.state().high_bid() == 300.0 && h2.state().high_bid() == 300.0
    }));

    h3.shutdown();

    assert!(
        wait_until(Duration::from_secs(5), || h2.is_leader()),
        "replica 2 must take over"
    );

    // The client reconnects (following redirects as needed), re-sends its
    // bid, and still receives the correct final result.
    let result = client
        .await_result(Duration::from_secs(15))
        .expect("result after failover");
    assert_eq!(result.winner_addr, "127.0.0.1");
    assert_eq!(result.winning_bid, 300.0);
    assert!(result.won(300.0));

    client.close();
    h1.shutdown();
    h2.shutdown();
}
