//! End-to-end synchronization scenarios against in-memory chains and peers.
//!
//! Every test runs under a paused clock, so timeout-heavy scenarios (60 s
//! TTLs, 3 s continuation polls) finish instantly while preserving ordering.

use std::{sync::Arc, time::Duration};

use osprey::{
    cfg::SyncConfig,
    crypto::Hash,
    db::{Kv, MemoryKv},
    error::SyncError,
    message::SyncMode,
    test_util::{
        build_test_state, grow_test_state, harness, RemoteChain, TestPeer, TestPeerOptions,
    },
};
use tokio::time::sleep;

fn plain_remote(blocks: usize) -> Arc<RemoteChain> {
    let remote = RemoteChain::new(Arc::new(MemoryKv::new()));
    remote.grow(blocks, Hash::compute(&[b"state"]), b"main");
    remote
}

#[tokio::test(start_paused = true)]
async fn full_sync_imports_remote_chain() {
    let h = harness(SyncConfig::default());
    let remote = plain_remote(500);
    let peer = TestPeer::new(&h.dl, &remote);
    peer.register().unwrap();

    let (head, td) = remote.head();
    h.dl
        .synchronise(peer.id, head, td, SyncMode::Full)
        .await
        .unwrap();

    let (_, block, _) = h.chain.heads();
    assert_eq!(block, 500);
    assert_eq!(
        h.chain.canonical_hash(500),
        Some(remote.block(500).unwrap().hash())
    );

    let progress = h.dl.progress();
    assert_eq!(progress.current_block, 500);
    assert_eq!(progress.highest_block, 500);
    assert_eq!(progress.pulled_states, 0);
    assert!(h.dropped.is_empty());
}

#[tokio::test(start_paused = true)]
async fn light_sync_imports_headers_only() {
    let h = harness(SyncConfig::default());
    let remote = plain_remote(150);
    let peer = TestPeer::new(&h.dl, &remote);
    peer.register().unwrap();

    let (head, td) = remote.head();
    h.dl
        .synchronise(peer.id, head, td, SyncMode::Light)
        .await
        .unwrap();

    let (header, block, _) = h.chain.heads();
    assert_eq!(header, 150);
    assert_eq!(block, 0);
}

#[tokio::test(start_paused = true)]
async fn monotone_import_across_cycles() {
    let h = harness(SyncConfig::default());
    let remote = plain_remote(120);
    let peer = TestPeer::new(&h.dl, &remote);
    peer.register().unwrap();

    let (head, td) = remote.head();
    h.dl
        .synchronise(peer.id, head, td, SyncMode::Full)
        .await
        .unwrap();
    let first = h.chain.heads().1;
    assert_eq!(first, 120);

    remote.grow(80, Hash::compute(&[b"state"]), b"main");
    let (head, td) = remote.head();
    h.dl
        .synchronise(peer.id, head, td, SyncMode::Full)
        .await
        .unwrap();
    let second = h.chain.heads().1;
    assert_eq!(second, 200);
    assert!(second >= first);
}

#[tokio::test(start_paused = true)]
async fn concurrent_synchronise_returns_busy() {
    let h = harness(SyncConfig::default());
    let remote = plain_remote(100);
    let peer = TestPeer::new(&h.dl, &remote);
    peer.register().unwrap();

    let (head, td) = remote.head();
    let first = h.dl.synchronise(peer.id, head, td, SyncMode::Full);
    let second = h.dl.synchronise(peer.id, head, td, SyncMode::Full);
    let (a, b) = tokio::join!(first, second);

    let outcomes = (a.clone(), b.clone());
    assert!(
        matches!(
            outcomes,
            (Ok(()), Err(SyncError::Busy)) | (Err(SyncError::Busy), Ok(()))
        ),
        "expected exactly one busy rejection, got {a:?} / {b:?}"
    );
    assert_eq!(h.chain.heads().1, 100);
}

#[tokio::test(start_paused = true)]
async fn stalling_peer_times_out_and_next_cycle_succeeds() {
    let h = harness(SyncConfig::default());
    let remote = plain_remote(200);
    // Answers the height probe, then goes silent.
    let stalling = TestPeer::with_options(
        &h.dl,
        &remote,
        TestPeerOptions {
            silent_after_headers: Some(1),
            ..Default::default()
        },
    );
    stalling.register().unwrap();

    let (head, td) = remote.head();
    let result = h.dl.synchronise(stalling.id, head, td, SyncMode::Full).await;
    assert_eq!(result, Err(SyncError::Timeout));
    assert!(h.dropped.contains(stalling.id));
    assert_eq!(h.chain.heads().1, 0);

    let healthy = TestPeer::new(&h.dl, &remote);
    healthy.register().unwrap();
    h.dl
        .synchronise(healthy.id, head, td, SyncMode::Full)
        .await
        .unwrap();
    assert_eq!(h.chain.heads().1, 200);
}

#[tokio::test(start_paused = true)]
async fn invalid_body_aborts_cycle_and_drops_peer() {
    let h = harness(SyncConfig::default());
    let remote = plain_remote(90);
    let peer = TestPeer::with_options(
        &h.dl,
        &remote,
        TestPeerOptions {
            corrupt_bodies: true,
            ..Default::default()
        },
    );
    peer.register().unwrap();

    let (head, td) = remote.head();
    let result = h.dl.synchronise(peer.id, head, td, SyncMode::Full).await;
    assert_eq!(result, Err(SyncError::InvalidBody));
    assert!(h.dropped.contains(peer.id));
    // Nothing beyond the trivially-empty prefix was committed; the first
    // transaction-bearing block is number 3.
    assert!(h.chain.heads().1 < 3);
}

#[tokio::test(start_paused = true)]
async fn fork_within_allowance_reorgs_to_heavier_chain() {
    let h = harness(SyncConfig::default());
    let state_root = Hash::compute(&[b"state"]);
    let base = RemoteChain::new(Arc::new(MemoryKv::new()));
    base.grow(180, state_root, b"shared");
    let chain_b = base.fork();
    base.grow(20, state_root, b"side-a"); // local chain A, head 200
    chain_b.grow(70, state_root, b"side-b"); // remote chain B, head 250

    h.chain.preload(&base);
    assert_eq!(h.chain.heads(), (200, 200, 200));

    let peer = TestPeer::new(&h.dl, &chain_b);
    peer.register().unwrap();
    let (head, td) = chain_b.head();
    h.dl
        .synchronise(peer.id, head, td, SyncMode::Full)
        .await
        .unwrap();

    // The heavier B chain is canonical; A's tail was replaced.
    assert_eq!(h.chain.heads().1, 250);
    assert_eq!(
        h.chain.canonical_hash(250),
        Some(chain_b.block(250).unwrap().hash())
    );
    assert_eq!(
        h.chain.canonical_hash(170),
        Some(chain_b.block(170).unwrap().hash())
    );
    assert_eq!(
        h.chain.canonical_hash(190),
        Some(chain_b.block(190).unwrap().hash())
    );
    assert_ne!(
        h.chain.canonical_hash(190),
        Some(base.block(190).unwrap().hash())
    );
}

#[tokio::test(start_paused = true)]
async fn fast_sync_downloads_state_and_commits_pivot() {
    let h = harness(SyncConfig::default());
    let (root, server_state) = build_test_state(400, b"state-a");
    let remote = RemoteChain::new(server_state);
    remote.grow(300, root, b"main");

    let peer = TestPeer::new(&h.dl, &remote);
    peer.register().unwrap();
    let (head, td) = remote.head();
    h.dl
        .synchronise(peer.id, head, td, SyncMode::Fast)
        .await
        .unwrap();

    let (header, block, fast) = h.chain.heads();
    assert_eq!(header, 300);
    assert_eq!(fast, 300);
    assert_eq!(block, 300);
    // The pivot state landed in the local store.
    assert!(h.state_db.get(root.as_bytes()).unwrap().is_some());
    let progress = h.dl.progress();
    assert!(progress.pulled_states > 0);
    assert_eq!(progress.known_states, progress.pulled_states);
}

#[tokio::test(start_paused = true)]
async fn fast_sync_follows_moving_pivot() {
    let h = harness(SyncConfig::default());
    let server_state = Arc::new(MemoryKv::new());
    let root_a = grow_test_state(&server_state, 3000, b"state-a", None);
    let root_b = grow_test_state(&server_state, 60, b"state-b", Some(root_a));
    let remote = RemoteChain::new(server_state);
    remote.grow(1000, root_a, b"main");

    // State answers are slow, so the chain races ahead of the download and
    // the pivot goes stale mid-cycle.
    let peer = TestPeer::with_options(
        &h.dl,
        &remote,
        TestPeerOptions {
            state_delay: Duration::from_millis(400),
            ..Default::default()
        },
    );
    peer.register().unwrap();

    // Once 700 blocks are in, the remote head jumps to 1200 with new state.
    {
        let chain = h.chain.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            loop {
                if chain.heads().2 >= 700 {
                    remote.grow(200, root_b, b"main");
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        });
    }

    let (head, td) = remote.head();
    h.dl
        .synchronise(peer.id, head, td, SyncMode::Fast)
        .await
        .unwrap();

    let (_, block, fast) = h.chain.heads();
    assert_eq!(fast, 1200);
    assert_eq!(block, 1200);
    // The moved pivot's state root was downloaded and committed.
    assert!(h.state_db.get(root_b.as_bytes()).unwrap().is_some());
    let progress = h.dl.progress();
    assert!(progress.pulled_states > 0);
    assert_eq!(progress.known_states, progress.pulled_states);
}

#[tokio::test(start_paused = true)]
async fn failed_header_insert_rolls_back_speculative_headers() {
    let h = harness(SyncConfig::default());
    let (root, server_state) = build_test_state(50, b"state-roll");
    let remote = RemoteChain::new(server_state);
    remote.grow(300, root, b"main");
    h.chain.set_fail_header_at(Some(250));

    let peer = TestPeer::new(&h.dl, &remote);
    peer.register().unwrap();
    let (head, td) = remote.head();
    let result = h.dl.synchronise(peer.id, head, td, SyncMode::Fast).await;
    assert_eq!(result, Err(SyncError::InvalidChain));

    // With the default configuration every header that was unknown before
    // the cycle joins the rollback list, so the failure unwinds everything.
    assert_eq!(h.chain.heads().0, 0);
}

#[tokio::test(start_paused = true)]
async fn rollback_limited_to_failed_batch_when_configured() {
    let cfg = SyncConfig {
        rollback_unknown_headers: false,
        ..Default::default()
    };
    let h = harness(cfg);
    let (root, server_state) = build_test_state(50, b"state-roll");
    let remote = RemoteChain::new(server_state);
    remote.grow(300, root, b"main");
    h.chain.set_fail_header_at(Some(250));

    let peer = TestPeer::new(&h.dl, &remote);
    peer.register().unwrap();
    let (head, td) = remote.head();
    let result = h.dl.synchronise(peer.id, head, td, SyncMode::Fast).await;
    assert_eq!(result, Err(SyncError::InvalidChain));

    // Only the failing batch is unwound; earlier batches stay in place.
    let header_head = h.chain.heads().0;
    assert!(header_head > 0, "headers before the failing batch survive");
    assert!(header_head < 250);
}
