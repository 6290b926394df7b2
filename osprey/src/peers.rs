//! Active sync peers and their quality-of-service accounting.
//!
//! Every completed delivery updates an exponentially smoothed per-kind
//! throughput and an RTT sample on the peer. The downloader turns those into
//! per-request capacities, so fast peers get big batches and slow peers get
//! small ones without starving.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use itertools::Itertools;
use libp2p::PeerId;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    constants::{
        MAX_BODY_FETCH, MAX_HEADER_FETCH, MAX_RECEIPT_FETCH, MAX_STATE_FETCH, QOS_TUNING_PEERS,
        RTT_MAX_ESTIMATE, RTT_MIN_ESTIMATE,
    },
    crypto::Hash,
    error::{SyncError, SyncResult},
};

/// Impact a single measurement has on a peer's smoothed metrics.
const MEASUREMENT_IMPACT: f64 = 0.1;

/// Upper bound on the remembered set of hashes a peer is known to lack.
const MAX_LACKING_HASHES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Headers,
    Bodies,
    Receipts,
    State,
}

impl FetchKind {
    fn index(self) -> usize {
        match self {
            FetchKind::Headers => 0,
            FetchKind::Bodies => 1,
            FetchKind::Receipts => 2,
            FetchKind::State => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FetchKind::Headers => "headers",
            FetchKind::Bodies => "bodies",
            FetchKind::Receipts => "receipts",
            FetchKind::State => "state",
        }
    }

    fn max_items(self) -> usize {
        match self {
            FetchKind::Headers => MAX_HEADER_FETCH,
            FetchKind::Bodies => MAX_BODY_FETCH,
            FetchKind::Receipts => MAX_RECEIPT_FETCH,
            FetchKind::State => MAX_STATE_FETCH,
        }
    }
}

/// Network actions a sync peer must support. Requests are fire-and-forget:
/// responses come back through the downloader's `deliver_*` inbox.
pub trait PeerClient: Send + Sync {
    /// The peer's advertised head hash and total difficulty.
    fn head(&self) -> (Hash, u128);

    fn request_headers_by_hash(
        &self,
        origin: Hash,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> anyhow::Result<()>;

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> anyhow::Result<()>;

    fn request_bodies(&self, hashes: Vec<Hash>) -> anyhow::Result<()>;

    fn request_receipts(&self, hashes: Vec<Hash>) -> anyhow::Result<()>;

    fn request_node_data(&self, hashes: Vec<Hash>) -> anyhow::Result<()>;
}

struct Meters {
    throughput: [f64; 4],
    started: [Instant; 4],
    rtt: Duration,
}

pub struct Peer {
    pub id: PeerId,
    pub version: u32,
    pub client: Arc<dyn PeerClient>,
    /// One availability flag per fetch kind.
    idle: [AtomicBool; 4],
    meters: Mutex<Meters>,
    /// Hashes this peer previously failed to serve; don't re-ask.
    lacking: Mutex<HashSet<Hash>>,
}

impl Peer {
    pub fn new(id: PeerId, version: u32, client: Arc<dyn PeerClient>) -> Self {
        Peer {
            id,
            version,
            client,
            idle: std::array::from_fn(|_| AtomicBool::new(true)),
            meters: Mutex::new(Meters {
                throughput: [0.0; 4],
                started: std::array::from_fn(|_| Instant::now()),
                rtt: RTT_MAX_ESTIMATE,
            }),
            lacking: Mutex::new(HashSet::new()),
        }
    }

    /// Claims the peer for a fetch of `kind`. Returns false if a fetch of
    /// that kind is already running.
    pub fn start_fetch(&self, kind: FetchKind) -> bool {
        if self.idle[kind.index()]
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.meters.lock().unwrap().started[kind.index()] = Instant::now();
        true
    }

    pub fn is_idle(&self, kind: FetchKind) -> bool {
        self.idle[kind.index()].load(Ordering::SeqCst)
    }

    /// Returns the peer to the idle pool, folding the delivery into its
    /// throughput and RTT estimates. A zero delivery resets the throughput
    /// so the next reservation starts from the minimum.
    pub fn set_idle(&self, kind: FetchKind, delivered: usize) {
        {
            let mut meters = self.meters.lock().unwrap();
            if delivered == 0 {
                meters.throughput[kind.index()] = 0.0;
            } else {
                let elapsed = meters.started[kind.index()]
                    .elapsed()
                    .max(Duration::from_millis(1));
                let measured = delivered as f64 / elapsed.as_secs_f64();
                let throughput = (1.0 - MEASUREMENT_IMPACT) * meters.throughput[kind.index()]
                    + MEASUREMENT_IMPACT * measured;
                meters.throughput[kind.index()] = throughput;
                meters.rtt = Duration::from_secs_f64(
                    (1.0 - MEASUREMENT_IMPACT) * meters.rtt.as_secs_f64()
                        + MEASUREMENT_IMPACT * elapsed.as_secs_f64(),
                );
                trace!(peer = %self.id, kind = kind.label(), throughput = throughput,
                    "peer throughput updated");
            }
        }
        self.idle[kind.index()].store(true, Ordering::SeqCst);
    }

    /// Estimated number of items this peer can deliver within `target_rtt`.
    pub fn capacity(&self, kind: FetchKind, target_rtt: Duration) -> usize {
        let throughput = self.meters.lock().unwrap().throughput[kind.index()];
        let cap = 1.0 + (throughput * target_rtt.as_secs_f64()).max(1.0);
        cap.min(kind.max_items() as f64) as usize
    }

    pub fn throughput(&self, kind: FetchKind) -> f64 {
        self.meters.lock().unwrap().throughput[kind.index()]
    }

    pub fn rtt(&self) -> Duration {
        self.meters.lock().unwrap().rtt
    }

    /// Clears per-cycle state: idle flags, measured throughput and the
    /// lacking set. Run at the start of every sync cycle.
    pub fn reset(&self) {
        for flag in &self.idle {
            flag.store(true, Ordering::SeqCst);
        }
        self.meters.lock().unwrap().throughput = [0.0; 4];
        self.lacking.lock().unwrap().clear();
    }

    /// Force-releases the idle flag for `kind` without touching the meters.
    /// Used when an owning fetcher went away with requests still in flight.
    pub(crate) fn make_idle(&self, kind: FetchKind) {
        self.idle[kind.index()].store(true, Ordering::SeqCst);
    }

    /// Remembers that the peer cannot serve `hash`.
    pub fn mark_lacking(&self, hash: Hash) {
        let mut lacking = self.lacking.lock().unwrap();
        while lacking.len() >= MAX_LACKING_HASHES {
            let victim = *lacking.iter().next().unwrap();
            lacking.remove(&victim);
        }
        lacking.insert(hash);
    }

    pub fn lacks(&self, hash: &Hash) -> bool {
        self.lacking.lock().unwrap().contains(hash)
    }

    fn seed_throughput(&self, seed: [f64; 4]) {
        self.meters.lock().unwrap().throughput = seed;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

/// The set of peers a download can proceed from.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer, seeding its throughput with the mean of the
    /// existing peers so a newcomer is neither starved nor flooded.
    pub fn register(&self, peer: Arc<Peer>) -> SyncResult<()> {
        let mut peers = self.peers.write().unwrap();
        if peers.contains_key(&peer.id) {
            return Err(SyncError::AlreadyRegistered);
        }
        if !peers.is_empty() {
            let mut seed = [0.0; 4];
            for existing in peers.values() {
                let meters = existing.meters.lock().unwrap();
                for (slot, tp) in seed.iter_mut().zip(meters.throughput) {
                    *slot += tp;
                }
            }
            seed.iter_mut().for_each(|tp| *tp /= peers.len() as f64);
            peer.seed_throughput(seed);
        }
        trace!(peer = %peer.id, "registering sync peer");
        peers.insert(peer.id, peer);
        Ok(())
    }

    pub fn unregister(&self, id: &PeerId) -> SyncResult<Arc<Peer>> {
        self.peers
            .write()
            .unwrap()
            .remove(id)
            .ok_or(SyncError::UnknownPeer)
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    /// Idle peers for `kind`, fastest first, plus the total peer count.
    pub fn idle_peers(&self, kind: FetchKind) -> (Vec<Arc<Peer>>, usize) {
        let peers = self.peers.read().unwrap();
        let total = peers.len();
        let idle = peers
            .values()
            .filter(|p| p.is_idle(kind))
            .cloned()
            .sorted_by(|a, b| {
                b.throughput(kind)
                    .partial_cmp(&a.throughput(kind))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .collect();
        (idle, total)
    }

    /// Resets every peer's per-cycle state.
    pub fn reset(&self) {
        for peer in self.peers.read().unwrap().values() {
            peer.reset();
        }
    }

    /// Median RTT of the best tuning peers, clamped to the sane window.
    pub fn median_rtt(&self) -> Duration {
        let mut rtts: Vec<Duration> = self
            .peers
            .read()
            .unwrap()
            .values()
            .map(|p| p.rtt())
            .collect();
        rtts.sort();

        let mut median = RTT_MAX_ESTIMATE;
        if rtts.len() >= QOS_TUNING_PEERS {
            median = rtts[QOS_TUNING_PEERS / 2];
        } else if !rtts.is_empty() {
            median = rtts[rtts.len() / 2];
        }
        median.clamp(RTT_MIN_ESTIMATE, RTT_MAX_ESTIMATE)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A client that drops every request on the floor.
    pub(crate) struct NullClient;

    impl PeerClient for NullClient {
        fn head(&self) -> (Hash, u128) {
            (Hash::ZERO, 0)
        }
        fn request_headers_by_hash(&self, _: Hash, _: usize, _: usize, _: bool) -> anyhow::Result<()> {
            Ok(())
        }
        fn request_headers_by_number(
            &self,
            _: u64,
            _: usize,
            _: usize,
            _: bool,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        fn request_bodies(&self, _: Vec<Hash>) -> anyhow::Result<()> {
            Ok(())
        }
        fn request_receipts(&self, _: Vec<Hash>) -> anyhow::Result<()> {
            Ok(())
        }
        fn request_node_data(&self, _: Vec<Hash>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn test_peer() -> Arc<Peer> {
        Arc::new(Peer::new(PeerId::random(), 63, Arc::new(NullClient)))
    }

    #[test]
    fn idle_flag_is_exclusive() {
        let peer = test_peer();
        assert!(peer.start_fetch(FetchKind::Bodies));
        assert!(!peer.start_fetch(FetchKind::Bodies));
        // Other kinds are unaffected.
        assert!(peer.start_fetch(FetchKind::Receipts));
        peer.set_idle(FetchKind::Bodies, 10);
        assert!(peer.start_fetch(FetchKind::Bodies));
    }

    #[test]
    fn capacity_is_clamped() {
        let peer = test_peer();
        // No throughput measured yet: minimum batch of 2 (one extra so the
        // estimator has headroom to observe growth).
        assert_eq!(peer.capacity(FetchKind::Bodies, Duration::from_secs(1)), 2);

        peer.seed_throughput([0.0, 1e9, 0.0, 0.0]);
        assert_eq!(
            peer.capacity(FetchKind::Bodies, Duration::from_secs(1)),
            MAX_BODY_FETCH
        );
    }

    #[test]
    fn duplicate_registration_rejected() {
        let set = PeerSet::new();
        let peer = test_peer();
        set.register(peer.clone()).unwrap();
        let double = Arc::new(Peer::new(peer.id, 63, Arc::new(NullClient)));
        assert_eq!(set.register(double), Err(SyncError::AlreadyRegistered));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn newcomers_inherit_mean_throughput() {
        let set = PeerSet::new();
        let a = test_peer();
        a.seed_throughput([4.0, 8.0, 0.0, 0.0]);
        set.register(a).unwrap();
        let b = test_peer();
        b.seed_throughput([2.0, 2.0, 0.0, 0.0]);
        set.register(b).unwrap();

        let c = test_peer();
        set.register(c.clone()).unwrap();
        assert_eq!(c.throughput(FetchKind::Headers), 3.0);
        assert_eq!(c.throughput(FetchKind::Bodies), 5.0);
    }

    #[test]
    fn median_rtt_is_clamped() {
        let set = PeerSet::new();
        assert_eq!(set.median_rtt(), RTT_MAX_ESTIMATE);
        set.register(test_peer()).unwrap();
        let median = set.median_rtt();
        assert!(median >= RTT_MIN_ESTIMATE && median <= RTT_MAX_ESTIMATE);
    }

    #[test]
    fn lacking_set_is_bounded() {
        let peer = test_peer();
        for i in 0..(MAX_LACKING_HASHES + 10) {
            peer.mark_lacking(Hash::compute(&[&i.to_be_bytes()]));
        }
        assert!(peer.lacking.lock().unwrap().len() <= MAX_LACKING_HASHES);
    }
}
