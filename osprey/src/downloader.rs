//! The synchronization orchestrator.
//!
//! One cycle at a time: pick a master peer, probe its head, find the common
//! ancestor, then run the staged pipeline - skeleton header fetch from the
//! master, gap fills and content fetches spread over every peer, a header
//! processor validating and scheduling, and a content processor importing in
//! block order (with pivot tracking and state download in fast mode). The
//! first failure anywhere cancels the whole cycle.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

use libp2p::PeerId;
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    cfg::SyncConfig,
    chain::{BlockChain, SyncProgress},
    constants::{
        FS_HEADER_CHECK_FREQUENCY, FS_HEADER_CONT_CHECK, FS_HEADER_FORCE_VERIFY,
        FS_HEADER_SAFETY_NET, FS_MIN_FULL_BLOCKS, MAX_FORK_ANCESTRY, MAX_HEADER_FETCH,
        MAX_HEADERS_PROCESS, MAX_QUEUED_HEADERS, MAX_SKELETON_SIZE, MIN_PROTOCOL_VERSION,
        QOS_CONFIDENCE_CAP, QOS_TUNING_IMPACT, RTT_MAX_ESTIMATE, RTT_MIN_CONFIDENCE, TTL_LIMIT,
        TTL_SCALING,
    },
    crypto::Hash,
    db::{read_fast_trie_progress, Kv},
    error::{SyncError, SyncResult},
    message::{Block, BlockBody, BlockHeader, Receipt, SyncMode},
    peers::{FetchKind, Peer, PeerClient, PeerSet},
    queue::{FetchRequest, FetchResult, Queue},
    state_sync,
};

type HeaderPack = (PeerId, Vec<BlockHeader>);
type BodyPack = (PeerId, Vec<BlockBody>);
type ReceiptPack = (PeerId, Vec<Vec<Receipt>>);
pub(crate) type StatePack = (PeerId, Vec<Vec<u8>>);

/// Callback used to disconnect a misbehaving peer.
pub type DropPeerFn = Box<dyn Fn(PeerId) + Send + Sync>;

/// Per-cycle delivery inbox; deliveries outside a cycle are `NoSyncActive`.
struct Inbox {
    header_tx: mpsc::Sender<HeaderPack>,
    body_tx: mpsc::Sender<BodyPack>,
    receipt_tx: mpsc::Sender<ReceiptPack>,
}

/// Handles shared by the pipeline tasks of one cycle.
struct CycleHandles {
    cancel: CancellationToken,
    /// Wake hints for the body/receipt fetchers: `true` = more work, `false`
    /// = header stream finished.
    body_wake_tx: mpsc::Sender<bool>,
    receipt_wake_tx: mpsc::Sender<bool>,
    header_proc_tx: mpsc::Sender<Vec<BlockHeader>>,
}

#[derive(Default)]
struct ChainStats {
    origin: u64,
    height: u64,
}

#[derive(Default)]
pub(crate) struct StateStats {
    pub processed: u64,
    pub pending: u64,
}

pub struct Downloader {
    cfg: SyncConfig,
    mode: Mutex<SyncMode>,

    pub(crate) queue: Arc<Queue>,
    pub(crate) peers: Arc<PeerSet>,
    pub(crate) chain: Arc<dyn BlockChain>,
    pub(crate) state_db: Arc<dyn Kv>,
    pub(crate) drop_peer: DropPeerFn,

    /// Target round trip time in nanoseconds.
    rtt_estimate: AtomicU64,
    /// Confidence in the estimate, in millionths.
    rtt_confidence: AtomicU64,

    sync_stats: RwLock<ChainStats>,
    pub(crate) state_stats: RwLock<StateStats>,

    synchronising: AtomicBool,
    notified: AtomicBool,
    pub(crate) committed: AtomicBool,

    inbox: RwLock<Option<Inbox>>,
    pub(crate) state_inbox: RwLock<Option<mpsc::Sender<StatePack>>>,
    cancel: RwLock<Option<(CancellationToken, PeerId)>>,
    quit: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl Downloader {
    pub fn new(
        cfg: SyncConfig,
        state_db: Arc<dyn Kv>,
        chain: Arc<dyn BlockChain>,
        drop_peer: impl Fn(PeerId) + Send + Sync + 'static,
    ) -> Arc<Downloader> {
        let processed = read_fast_trie_progress(&*state_db);
        let dl = Arc::new(Downloader {
            mode: Mutex::new(cfg.mode),
            cfg,
            queue: Arc::new(Queue::new()),
            peers: Arc::new(PeerSet::new()),
            chain,
            state_db,
            drop_peer: Box::new(drop_peer),
            rtt_estimate: AtomicU64::new(RTT_MAX_ESTIMATE.as_nanos() as u64),
            rtt_confidence: AtomicU64::new(1_000_000),
            sync_stats: RwLock::new(ChainStats::default()),
            state_stats: RwLock::new(StateStats {
                processed,
                pending: 0,
            }),
            synchronising: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            inbox: RwLock::new(None),
            state_inbox: RwLock::new(None),
            cancel: RwLock::new(None),
            quit: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        tokio::spawn(qos_tuner(Arc::downgrade(&dl)));
        dl
    }

    /// Injects a new peer as a block source. Versions below the supported
    /// protocol floor are rejected.
    pub fn register_peer(
        &self,
        id: PeerId,
        version: u32,
        client: Arc<dyn PeerClient>,
    ) -> SyncResult<()> {
        if version < MIN_PROTOCOL_VERSION {
            return Err(SyncError::TooOld);
        }
        trace!(peer = %id, "registering sync peer");
        self.peers.register(Arc::new(Peer::new(id, version, client)))?;
        self.qos_reduce_confidence();
        Ok(())
    }

    /// Removes a peer, revoking its reservations. Dropping the master peer
    /// aborts the running cycle.
    pub fn unregister_peer(&self, id: PeerId) -> SyncResult<()> {
        trace!(peer = %id, "unregistering sync peer");
        self.peers.unregister(&id)?;
        self.queue.revoke(&id);
        let master = {
            let cancel = self.cancel.read().unwrap();
            cancel.as_ref().and_then(|(token, peer)| {
                (*peer == id).then(|| token.clone())
            })
        };
        if let Some(token) = master {
            token.cancel();
        }
        Ok(())
    }

    pub fn synchronising(&self) -> bool {
        self.synchronising.load(Ordering::SeqCst)
    }

    /// Current synchronisation boundaries and state download counters.
    pub fn progress(&self) -> SyncProgress {
        let current = match *self.mode.lock().unwrap() {
            SyncMode::Full => self.chain.current_block().number,
            SyncMode::Fast => self.chain.current_fast_block().number,
            SyncMode::Light => self.chain.current_header().number,
        };
        let stats = self.sync_stats.read().unwrap();
        let state = self.state_stats.read().unwrap();
        SyncProgress {
            starting_block: stats.origin,
            current_block: current,
            highest_block: stats.height,
            pulled_states: state.processed,
            known_states: state.processed + state.pending,
        }
    }

    /// Aborts the in-flight cycle, if any.
    pub fn cancel(&self) {
        if let Some((token, _)) = &*self.cancel.read().unwrap() {
            token.cancel();
        }
    }

    /// Shuts the downloader down and waits for every spawned task to exit.
    /// The downloader cannot be reused afterwards.
    pub async fn terminate(&self) {
        self.quit.cancel();
        self.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Tries to sync the local chain up with the given peer. At most one
    /// cycle runs at a time; concurrent calls return `Busy`. Failures that
    /// indict the master peer drop it before returning.
    pub async fn synchronise(
        self: &Arc<Self>,
        id: PeerId,
        head: Hash,
        td: u128,
        mode: SyncMode,
    ) -> SyncResult<()> {
        let result = self.do_synchronise(id, head, td, mode).await;
        match &result {
            Ok(()) | Err(SyncError::Busy) => {}
            Err(err) if err.drops_peer() => {
                warn!(peer = %id, %err, "synchronisation failed, dropping peer");
                (self.drop_peer)(id);
            }
            Err(err) => warn!(%err, "synchronisation failed, retrying"),
        }
        result
    }

    async fn do_synchronise(
        self: &Arc<Self>,
        id: PeerId,
        head: Hash,
        td: u128,
        mode: SyncMode,
    ) -> SyncResult<()> {
        if self
            .synchronising
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        let result = self.run_cycle(id, head, td, mode).await;
        self.synchronising.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle(
        self: &Arc<Self>,
        id: PeerId,
        head: Hash,
        td: u128,
        mode: SyncMode,
    ) -> SyncResult<()> {
        if self
            .notified
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("block synchronisation started");
        }
        self.queue.reset();
        self.peers.reset();

        let cancel = self.quit.child_token();
        *self.cancel.write().unwrap() = Some((cancel.clone(), id));

        let (header_tx, header_rx) = mpsc::channel(1);
        let (body_tx, body_rx) = mpsc::channel(1);
        let (receipt_tx, receipt_rx) = mpsc::channel(1);
        *self.inbox.write().unwrap() = Some(Inbox {
            header_tx,
            body_tx,
            receipt_tx,
        });
        *self.mode.lock().unwrap() = mode;

        let result = match self.peers.peer(&id) {
            None => Err(SyncError::UnknownPeer),
            Some(peer) if peer.version < MIN_PROTOCOL_VERSION => Err(SyncError::TooOld),
            Some(peer) => {
                self.sync_with_peer(peer, head, td, mode, cancel.clone(), header_rx, body_rx, receipt_rx)
                    .await
            }
        };

        cancel.cancel();
        *self.inbox.write().unwrap() = None;
        *self.cancel.write().unwrap() = None;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_with_peer(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        head: Hash,
        td: u128,
        mode: SyncMode,
        cancel: CancellationToken,
        mut header_rx: mpsc::Receiver<HeaderPack>,
        body_rx: mpsc::Receiver<BodyPack>,
        receipt_rx: mpsc::Receiver<ReceiptPack>,
    ) -> SyncResult<()> {
        debug!(peer = %peer.id, version = peer.version, %head, td, ?mode,
            "synchronising with the network");

        // Look up the sync boundaries: the common ancestor and the target.
        let latest = self
            .fetch_height(&peer, head, &cancel, &mut header_rx)
            .await?;
        let height = latest.number;
        let mut origin = self
            .find_ancestor(&peer, height, mode, &cancel, &mut header_rx)
            .await?;
        {
            let mut stats = self.sync_stats.write().unwrap();
            if stats.height <= origin || stats.origin > origin {
                stats.origin = origin;
            }
            stats.height = height;
        }

        // Make sure the origin sits below any fast sync pivot point.
        let mut pivot = 0u64;
        if mode == SyncMode::Fast {
            if height <= FS_MIN_FULL_BLOCKS {
                origin = 0;
            } else {
                pivot = height - FS_MIN_FULL_BLOCKS;
                if pivot <= origin {
                    origin = pivot - 1;
                }
            }
        }
        self.committed
            .store(!(mode == SyncMode::Fast && pivot != 0), Ordering::SeqCst);

        self.queue.prepare(origin + 1, mode);
        info!(peer = %peer.id, origin, height, ?mode, "starting block download");

        let (body_wake_tx, body_wake_rx) = mpsc::channel(1);
        let (receipt_wake_tx, receipt_wake_rx) = mpsc::channel(1);
        let (header_proc_tx, header_proc_rx) = mpsc::channel(1);
        let handles = Arc::new(CycleHandles {
            cancel: cancel.clone(),
            body_wake_tx,
            receipt_wake_tx,
            header_proc_tx,
        });

        let mut fetchers: JoinSet<SyncResult<()>> = JoinSet::new();
        {
            let dl = self.clone();
            let peer = peer.clone();
            let handles = handles.clone();
            fetchers.spawn(self.tracker.track_future(async move {
                dl.fetch_headers(peer, origin + 1, pivot, header_rx, handles)
                    .await
            }));
        }
        {
            let dl = self.clone();
            let cancel = cancel.clone();
            fetchers.spawn(self.tracker.track_future(async move {
                dl.fetch_bodies(origin + 1, body_rx, body_wake_rx, cancel).await
            }));
        }
        {
            let dl = self.clone();
            let cancel = cancel.clone();
            fetchers.spawn(self.tracker.track_future(async move {
                dl.fetch_receipts(origin + 1, receipt_rx, receipt_wake_rx, cancel)
                    .await
            }));
        }
        {
            let dl = self.clone();
            let handles = handles.clone();
            fetchers.spawn(self.tracker.track_future(async move {
                dl.process_headers(origin + 1, pivot, td, mode, header_proc_rx, handles)
                    .await
            }));
        }

        let mut content = match mode {
            SyncMode::Full => {
                let dl = self.clone();
                let cancel = cancel.clone();
                Some(self.tracker.spawn(async move {
                    dl.process_full_sync_content(cancel).await
                }))
            }
            SyncMode::Fast => {
                let dl = self.clone();
                let cancel = cancel.clone();
                let latest = latest.clone();
                Some(self.tracker.spawn(async move {
                    dl.process_fast_sync_content(cancel, latest).await
                }))
            }
            SyncMode::Light => None,
        };

        // First failure cancels everything else; cancellations themselves
        // are not reported as the cycle outcome.
        let mut first_err: Option<SyncError> = None;
        let mut note = |result: SyncResult<()>, cancel: &CancellationToken| {
            if let Err(err) = result {
                if first_err.is_none() && err != SyncError::Cancelled {
                    first_err = Some(err);
                }
                cancel.cancel();
            }
        };
        let mut content_done = content.is_none();
        while !fetchers.is_empty() {
            tokio::select! {
                Some(joined) = fetchers.join_next() => {
                    note(joined.unwrap_or(Err(SyncError::Cancelled)), &cancel);
                }
                joined = async { content.as_mut().unwrap().await }, if !content_done => {
                    note(joined.unwrap_or(Err(SyncError::Cancelled)), &cancel);
                    content_done = true;
                    content = None;
                }
            }
        }
        // All fetchers are done: close the queue so the content processor
        // can drain the remaining results and finish.
        self.queue.close();
        if let Some(handle) = content {
            note(handle.await.unwrap_or(Err(SyncError::Cancelled)), &cancel);
        }
        cancel.cancel();
        debug!("synchronisation terminated");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Retrieves the head header of the remote peer. Anything but a single
    /// header from that exact peer is rejected.
    async fn fetch_height(
        &self,
        peer: &Arc<Peer>,
        head: Hash,
        cancel: &CancellationToken,
        header_rx: &mut mpsc::Receiver<HeaderPack>,
    ) -> SyncResult<BlockHeader> {
        debug!(peer = %peer.id, "retrieving remote chain height");
        if peer
            .client
            .request_headers_by_hash(head, 1, 0, false)
            .is_err()
        {
            return Err(SyncError::BadPeer);
        }
        let ttl = self.request_ttl();
        let timeout = sleep(ttl);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                pack = header_rx.recv() => {
                    let Some((from, headers)) = pack else { return Err(SyncError::Cancelled) };
                    if from != peer.id {
                        debug!(peer = %from, "received headers from incorrect peer");
                        continue;
                    }
                    if headers.len() != 1 {
                        debug!(peer = %peer.id, count = headers.len(),
                            "multiple headers for single request");
                        return Err(SyncError::BadPeer);
                    }
                    let head = headers.into_iter().next().unwrap();
                    debug!(peer = %peer.id, number = head.number, hash = %head.hash(),
                        "remote head header identified");
                    return Ok(head);
                }
                _ = &mut timeout => {
                    debug!(peer = %peer.id, elapsed = ?ttl, "waiting for head header timed out");
                    return Err(SyncError::Timeout);
                }
            }
        }
    }

    /// Locates the common ancestor of the local chain and the peer's chain.
    /// A spaced span request over the top headers usually finds it; a long
    /// reorganisation falls back to binary search bounded by the fork
    /// ancestry floor.
    async fn find_ancestor(
        &self,
        peer: &Arc<Peer>,
        height: u64,
        mode: SyncMode,
        cancel: &CancellationToken,
        header_rx: &mut mpsc::Receiver<HeaderPack>,
    ) -> SyncResult<u64> {
        let ceil = match mode {
            SyncMode::Full => self.chain.current_block().number,
            SyncMode::Fast => self.chain.current_fast_block().number,
            SyncMode::Light => self.chain.current_header().number,
        };
        let floor = ceil.checked_sub(MAX_FORK_ANCESTRY);
        debug!(peer = %peer.id, local = ceil, remote = height, "looking for common ancestor");

        let known = |hash: Hash, number: u64| match mode {
            SyncMode::Full => self.chain.has_block(hash, number),
            _ => self.chain.has_header(hash, number),
        };

        // Span the top headers with 15 block gaps to short-circuit the
        // binary lookup (and reach into the future to catch lies).
        let head = ceil.min(height);
        let from = head.saturating_sub(MAX_HEADER_FETCH as u64);
        let limit = 2 * MAX_HEADER_FETCH / 16;
        let count = ((1 + (ceil - from) / 16) as usize).min(limit);
        if peer
            .client
            .request_headers_by_number(from, count, 15, false)
            .is_err()
        {
            return Err(SyncError::BadPeer);
        }

        let mut found: Option<(u64, Hash)> = None;
        let ttl = self.request_ttl();
        let timeout = sleep(ttl);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                pack = header_rx.recv() => {
                    let Some((origin, headers)) = pack else { return Err(SyncError::Cancelled) };
                    if origin != peer.id {
                        debug!(peer = %origin, "received headers from incorrect peer");
                        continue;
                    }
                    if headers.is_empty() {
                        warn!(peer = %peer.id, "empty head header set");
                        return Err(SyncError::EmptyHeaderSet);
                    }
                    for (i, header) in headers.iter().enumerate() {
                        let expected = from + i as u64 * 16;
                        if header.number != expected {
                            warn!(index = i, requested = expected, received = header.number,
                                "head headers broke chain ordering");
                            return Err(SyncError::InvalidChain);
                        }
                    }
                    for (i, header) in headers.iter().enumerate().rev() {
                        if header.number < from || header.number > ceil {
                            continue;
                        }
                        let hash = header.hash();
                        if known(hash, header.number) {
                            // If even future headers are known, the peer
                            // lied about its head outright.
                            if header.number > height && i == limit - 1 {
                                warn!(peer = %peer.id, reported = height, found = header.number,
                                    "lied about chain head");
                                return Err(SyncError::StallingPeer);
                            }
                            found = Some((header.number, hash));
                            break;
                        }
                    }
                    break;
                }
                _ = &mut timeout => {
                    debug!(peer = %peer.id, elapsed = ?ttl, "waiting for head header timed out");
                    return Err(SyncError::Timeout);
                }
            }
        }

        if let Some((number, hash)) = found {
            if number <= floor.unwrap_or(0) && floor.is_some() {
                warn!(number, %hash, allowance = floor.unwrap(), "ancestor below allowance");
                return Err(SyncError::InvalidAncestor);
            }
            debug!(number, %hash, "found common ancestor");
            return Ok(number);
        }

        // Nothing in the span was shared: binary search the interval.
        let (mut start, mut end) = (floor.unwrap_or(0), head);
        while start + 1 < end {
            let check = (start + end) / 2;
            if peer
                .client
                .request_headers_by_number(check, 1, 0, false)
                .is_err()
            {
                return Err(SyncError::BadPeer);
            }
            let ttl = self.request_ttl();
            let timeout = sleep(ttl);
            tokio::pin!(timeout);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    pack = header_rx.recv() => {
                        let Some((origin, headers)) = pack else { return Err(SyncError::Cancelled) };
                        if origin != peer.id {
                            debug!(peer = %origin, "received headers from incorrect peer");
                            continue;
                        }
                        if headers.len() != 1 {
                            debug!(peer = %peer.id, count = headers.len(),
                                "multiple headers for single request");
                            return Err(SyncError::BadPeer);
                        }
                        let header = &headers[0];
                        if !known(header.hash(), header.number) {
                            end = check;
                            break;
                        }
                        let local = self
                            .chain
                            .get_header_by_hash(header.hash())
                            .map(|h| h.number);
                        if local != Some(check) {
                            debug!(peer = %peer.id, number = header.number, request = check,
                                "received non requested header");
                            return Err(SyncError::BadPeer);
                        }
                        start = check;
                        break;
                    }
                    _ = &mut timeout => {
                        debug!(peer = %peer.id, elapsed = ?ttl, "waiting for search header timed out");
                        return Err(SyncError::Timeout);
                    }
                }
            }
        }
        if let Some(floor) = floor {
            if start <= floor {
                warn!(number = start, allowance = floor, "ancestor below allowance");
                return Err(SyncError::InvalidAncestor);
            }
        }
        debug!(number = start, "found common ancestor");
        Ok(start)
    }

    /// Master header loop: pull the skeleton (or the plain tail once the
    /// skeleton runs dry), hand gaps to the queue for concurrent filling and
    /// forward assembled batches to the header processor.
    async fn fetch_headers(
        self: Arc<Self>,
        peer: Arc<Peer>,
        from: u64,
        pivot: u64,
        mut header_rx: mpsc::Receiver<HeaderPack>,
        handles: Arc<CycleHandles>,
    ) -> SyncResult<()> {
        debug!(peer = %peer.id, origin = from, "directing header downloads");
        let mut skeleton = true;
        let mut from = from;

        'request: loop {
            let ttl = self.request_ttl();
            let issued = if skeleton {
                trace!(peer = %peer.id, count = MAX_HEADER_FETCH, from, "fetching skeleton headers");
                peer.client.request_headers_by_number(
                    from + MAX_HEADER_FETCH as u64 - 1,
                    MAX_SKELETON_SIZE,
                    MAX_HEADER_FETCH - 1,
                    false,
                )
            } else {
                trace!(peer = %peer.id, count = MAX_HEADER_FETCH, from, "fetching full headers");
                peer.client
                    .request_headers_by_number(from, MAX_HEADER_FETCH, 0, false)
            };
            if issued.is_err() {
                return Err(SyncError::BadPeer);
            }
            let timeout = sleep(ttl);
            tokio::pin!(timeout);

            loop {
                tokio::select! {
                    _ = handles.cancel.cancelled() => return Err(SyncError::Cancelled),
                    pack = header_rx.recv() => {
                        let Some((origin, headers)) = pack else { return Err(SyncError::Cancelled) };
                        if origin != peer.id {
                            debug!(peer = %origin, "received skeleton from incorrect peer");
                            continue;
                        }
                        // The skeleton ran dry: pull the remaining tail
                        // directly from the origin.
                        if headers.is_empty() && skeleton {
                            skeleton = false;
                            continue 'request;
                        }
                        if headers.is_empty() {
                            // Don't abort header fetches while the pivot is
                            // still downloading its state.
                            if !self.committed.load(Ordering::SeqCst) && pivot <= from {
                                debug!(peer = %peer.id, "no headers, waiting for pivot commit");
                                tokio::select! {
                                    _ = sleep(FS_HEADER_CONT_CHECK) => continue 'request,
                                    _ = handles.cancel.cancelled() => return Err(SyncError::Cancelled),
                                }
                            }
                            debug!(peer = %peer.id, "no more headers available");
                            tokio::select! {
                                sent = handles.header_proc_tx.send(Vec::new()) => {
                                    return sent.map_err(|_| SyncError::Cancelled);
                                }
                                _ = handles.cancel.cancelled() => return Err(SyncError::Cancelled),
                            }
                        }

                        let mut headers = headers;
                        if skeleton {
                            match self
                                .fill_header_skeleton(from, headers, &mut header_rx, &handles)
                                .await
                            {
                                Ok((filled, proced)) => {
                                    headers = filled[proced..].to_vec();
                                    from += proced as u64;
                                }
                                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                                Err(err) => {
                                    debug!(peer = %peer.id, %err, "skeleton chain invalid");
                                    return Err(SyncError::InvalidChain);
                                }
                            }
                        }
                        if !headers.is_empty() {
                            trace!(count = headers.len(), from, "scheduling new headers");
                            let count = headers.len() as u64;
                            tokio::select! {
                                sent = handles.header_proc_tx.send(headers) => {
                                    if sent.is_err() {
                                        return Err(SyncError::Cancelled);
                                    }
                                }
                                _ = handles.cancel.cancelled() => return Err(SyncError::Cancelled),
                            }
                            from += count;
                        }
                        continue 'request;
                    }
                    _ = &mut timeout => {
                        // The master timed out: drop it and wind the whole
                        // header pipeline down gracefully.
                        debug!(peer = %peer.id, elapsed = ?ttl, "header request timed out");
                        (self.drop_peer)(peer.id);
                        for wake in [&handles.body_wake_tx, &handles.receipt_wake_tx] {
                            tokio::select! {
                                _ = wake.send(false) => {}
                                _ = handles.cancel.cancelled() => {}
                            }
                        }
                        tokio::select! {
                            _ = handles.header_proc_tx.send(Vec::new()) => {}
                            _ = handles.cancel.cancelled() => {}
                        }
                        return Err(SyncError::BadPeer);
                    }
                }
            }
        }
    }

    /// Fills the gaps of a skeleton batch using every available peer. Fills
    /// are accepted only when they join the bracketing samples exactly.
    async fn fill_header_skeleton(
        self: &Arc<Self>,
        from: u64,
        skeleton: Vec<BlockHeader>,
        header_rx: &mut mpsc::Receiver<HeaderPack>,
        handles: &Arc<CycleHandles>,
    ) -> SyncResult<(Vec<BlockHeader>, usize)> {
        debug!(from, "filling up skeleton");
        let (cont_tx, mut cont_rx) = mpsc::channel(1);
        self.queue.schedule_skeleton(from, &skeleton, cont_tx);

        let queue = self.queue.clone();
        let proc_tx = handles.header_proc_tx.clone();
        let ttl_queue = self.queue.clone();
        let dl = self.clone();

        let result = self
            .fetch_parts(
                FetchKind::Headers,
                header_rx,
                &mut cont_rx,
                handles.cancel.clone(),
                move |peer: &Arc<Peer>, pack| queue.deliver_headers(peer.id, pack, &proc_tx),
                {
                    let dl = dl.clone();
                    let queue = ttl_queue.clone();
                    move || queue.expire_headers(dl.request_ttl())
                },
                {
                    let queue = ttl_queue.clone();
                    move || queue.pending_headers()
                },
                {
                    let queue = ttl_queue.clone();
                    move || queue.in_flight_headers()
                },
                || false,
                {
                    let queue = ttl_queue.clone();
                    move |peer: &Arc<Peer>, _| (queue.reserve_headers(peer), false)
                },
                |peer: &Arc<Peer>, request: &FetchRequest| {
                    peer.client
                        .request_headers_by_number(request.from, MAX_HEADER_FETCH, 0, false)
                },
            )
            .await;
        debug!(ok = result.is_ok(), "skeleton fill terminated");

        let (filled, proced) = self.queue.retrieve_headers();
        result.map(|_| (filled, proced))
    }

    async fn fetch_bodies(
        self: Arc<Self>,
        from: u64,
        mut body_rx: mpsc::Receiver<BodyPack>,
        mut wake_rx: mpsc::Receiver<bool>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        debug!(origin = from, "downloading block bodies");
        let queue = self.queue.clone();
        let dl = self.clone();
        let result = self
            .fetch_parts(
                FetchKind::Bodies,
                &mut body_rx,
                &mut wake_rx,
                cancel,
                {
                    let queue = queue.clone();
                    move |peer: &Arc<Peer>, pack| queue.deliver_bodies(peer, pack)
                },
                {
                    let dl = dl.clone();
                    let queue = queue.clone();
                    move || queue.expire_bodies(dl.request_ttl())
                },
                {
                    let queue = queue.clone();
                    move || queue.pending_blocks()
                },
                {
                    let queue = queue.clone();
                    move || queue.in_flight_blocks()
                },
                {
                    let queue = queue.clone();
                    move || queue.should_throttle_blocks()
                },
                {
                    let queue = queue.clone();
                    move |peer: &Arc<Peer>, count| queue.reserve_bodies(peer, count)
                },
                |peer: &Arc<Peer>, request: &FetchRequest| {
                    let hashes = request.headers.iter().map(|h| h.hash()).collect();
                    peer.client.request_bodies(hashes)
                },
            )
            .await;
        debug!(ok = result.is_ok(), "block body download terminated");
        result
    }

    async fn fetch_receipts(
        self: Arc<Self>,
        from: u64,
        mut receipt_rx: mpsc::Receiver<ReceiptPack>,
        mut wake_rx: mpsc::Receiver<bool>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        debug!(origin = from, "downloading transaction receipts");
        let queue = self.queue.clone();
        let dl = self.clone();
        let result = self
            .fetch_parts(
                FetchKind::Receipts,
                &mut receipt_rx,
                &mut wake_rx,
                cancel,
                {
                    let queue = queue.clone();
                    move |peer: &Arc<Peer>, pack| queue.deliver_receipts(peer, pack)
                },
                {
                    let dl = dl.clone();
                    let queue = queue.clone();
                    move || queue.expire_receipts(dl.request_ttl())
                },
                {
                    let queue = queue.clone();
                    move || queue.pending_receipts()
                },
                {
                    let queue = queue.clone();
                    move || queue.in_flight_receipts()
                },
                {
                    let queue = queue.clone();
                    move || queue.should_throttle_receipts()
                },
                {
                    let queue = queue.clone();
                    move |peer: &Arc<Peer>, count| queue.reserve_receipts(peer, count)
                },
                |peer: &Arc<Peer>, request: &FetchRequest| {
                    let hashes = request.headers.iter().map(|h| h.hash()).collect();
                    peer.client.request_receipts(hashes)
                },
            )
            .await;
        debug!(ok = result.is_ok(), "transaction receipt download terminated");
        result
    }

    /// The shared fetch loop: react to deliveries, expire overdue requests,
    /// and keep every idle peer loaded with reservations sized to its
    /// measured capacity, until the wake channel reports the pipeline done.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_parts<P>(
        &self,
        kind: FetchKind,
        delivery_rx: &mut mpsc::Receiver<(PeerId, P)>,
        wake_rx: &mut mpsc::Receiver<bool>,
        cancel: CancellationToken,
        deliver: impl Fn(&Arc<Peer>, P) -> (usize, SyncResult<()>),
        expire: impl Fn() -> HashMap<PeerId, usize>,
        pending: impl Fn() -> usize,
        in_flight: impl Fn() -> bool,
        throttle: impl Fn() -> bool,
        reserve: impl Fn(&Arc<Peer>, usize) -> (Option<FetchRequest>, bool),
        fetch: impl Fn(&Arc<Peer>, &FetchRequest) -> anyhow::Result<()>,
    ) -> SyncResult<()> {
        let mut finished = false;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                pack = delivery_rx.recv() => {
                    let Some((peer_id, payload)) = pack else { return Err(SyncError::Cancelled) };
                    // Deliveries from peers banned mid-flight are ignored.
                    if let Some(peer) = self.peers.peer(&peer_id) {
                        let (accepted, result) = deliver(&peer, payload);
                        match result {
                            Err(err) if err.aborts_cycle() => return Err(err),
                            // A stale delivery means the reservation moved
                            // on; the peer was already idled.
                            Err(SyncError::StaleDelivery) => {
                                trace!(peer = %peer_id, kind = kind.label(), "stale delivery");
                            }
                            Err(err) => {
                                trace!(peer = %peer_id, kind = kind.label(), %err,
                                    "failed to deliver retrieved data");
                                peer.set_idle(kind, accepted);
                            }
                            Ok(()) => {
                                trace!(peer = %peer_id, kind = kind.label(), count = accepted,
                                    "delivered new batch of data");
                                peer.set_idle(kind, accepted);
                            }
                        }
                    }
                }
                cont = wake_rx.recv() => {
                    if cont != Some(true) {
                        finished = true;
                    }
                }
                _ = ticker.tick() => {}
            }

            // Progress update: expire stragglers, check for completion and
            // hand out new work.
            if self.peers.is_empty() {
                return Err(SyncError::NoPeers);
            }
            for (peer_id, failed_items) in expire() {
                if let Some(peer) = self.peers.peer(&peer_id) {
                    // The request timed out, but a couple of failed items
                    // may just mean we overestimated the peer: reset it to
                    // minimal throughput instead of dropping outright.
                    if failed_items > 2 {
                        trace!(peer = %peer_id, kind = kind.label(), "data delivery timed out");
                        peer.set_idle(kind, 0);
                    } else {
                        debug!(peer = %peer_id, kind = kind.label(), "stalling delivery, dropping");
                        (self.drop_peer)(peer_id);
                    }
                }
            }
            if pending() == 0 {
                if !in_flight() && finished {
                    debug!(kind = kind.label(), "data fetching completed");
                    return Ok(());
                }
                continue;
            }

            let (idles, total) = self.peers.idle_peers(kind);
            let mut progressed = false;
            let mut throttled = false;
            let mut running = in_flight();
            for peer in &idles {
                if throttle() {
                    throttled = true;
                    break;
                }
                if pending() == 0 {
                    break;
                }
                let capacity = peer.capacity(kind, self.request_rtt());
                let (request, progress) = reserve(peer, capacity);
                if progress {
                    progressed = true;
                }
                let Some(request) = request else { continue };
                if !peer.start_fetch(kind) {
                    // The reservation raced a delivery; give it back.
                    self.queue.revoke(&peer.id);
                    continue;
                }
                trace!(peer = %peer.id, kind = kind.label(),
                    count = request.headers.len().max(1), "requesting new batch of data");
                if let Err(err) = fetch(peer, &request) {
                    debug!(peer = %peer.id, kind = kind.label(), %err, "fetch assignment failed");
                    self.queue.revoke(&peer.id);
                    peer.set_idle(kind, 0);
                    continue;
                }
                running = true;
            }
            // All peers tried, nothing assigned, nothing moving: give up.
            if !progressed && !throttled && !running && idles.len() == total && pending() > 0 {
                return Err(SyncError::PeersUnavailable);
            }
        }
    }

    /// Consumes header batches in order, validating/inserting them (light
    /// and fast modes) and scheduling content retrieval (full and fast).
    async fn process_headers(
        self: Arc<Self>,
        origin: u64,
        pivot: u64,
        td: u128,
        mode: SyncMode,
        mut proc_rx: mpsc::Receiver<Vec<BlockHeader>>,
        handles: Arc<CycleHandles>,
    ) -> SyncResult<()> {
        let mut rollback: Vec<BlockHeader> = Vec::new();
        let result = self
            .process_headers_inner(origin, pivot, td, mode, &mut proc_rx, &handles, &mut rollback)
            .await;

        if !rollback.is_empty() {
            // Undo the speculative inserts beyond the last certain block.
            let hashes: Vec<Hash> = rollback.iter().map(|h| h.hash()).collect();
            let last_header = self.chain.current_header().number;
            let (last_fast, last_block) = match mode {
                SyncMode::Light => (0, 0),
                _ => (
                    self.chain.current_fast_block().number,
                    self.chain.current_block().number,
                ),
            };
            self.chain.rollback(&hashes);
            warn!(
                count = hashes.len(),
                header = format!("{last_header}->{}", self.chain.current_header().number),
                fast = format!("{last_fast}->{}", self.chain.current_fast_block().number),
                block = format!("{last_block}->{}", self.chain.current_block().number),
                "rolled back headers"
            );
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_headers_inner(
        &self,
        origin: u64,
        pivot: u64,
        td: u128,
        mode: SyncMode,
        proc_rx: &mut mpsc::Receiver<Vec<BlockHeader>>,
        handles: &Arc<CycleHandles>,
        rollback: &mut Vec<BlockHeader>,
    ) -> SyncResult<()> {
        let mut origin = origin;
        let mut got_headers = false;
        loop {
            let headers = tokio::select! {
                _ = handles.cancel.cancelled() => return Err(SyncError::Cancelled),
                batch = proc_rx.recv() => batch.ok_or(SyncError::Cancelled)?,
            };

            if headers.is_empty() {
                // Header stream finished: notify the content fetchers.
                for wake in [&handles.body_wake_tx, &handles.receipt_wake_tx] {
                    tokio::select! {
                        _ = wake.send(false) => {}
                        _ = handles.cancel.cancelled() => {}
                    }
                }
                // A peer that promised a higher TD but delivered nothing
                // useful stalled on its promise.
                if mode != SyncMode::Light {
                    let head = self.chain.current_block();
                    let local_td = self
                        .chain
                        .get_td(head.hash(), head.number)
                        .unwrap_or_default();
                    if !got_headers && td > local_td {
                        return Err(SyncError::StallingPeer);
                    }
                }
                if mode != SyncMode::Full {
                    let head = self.chain.current_header();
                    let local_td = self
                        .chain
                        .get_td(head.hash(), head.number)
                        .unwrap_or_default();
                    if td > local_td {
                        return Err(SyncError::StallingPeer);
                    }
                }
                rollback.clear();
                return Ok(());
            }
            got_headers = true;

            let mut headers = headers;
            while !headers.is_empty() {
                if handles.cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                let limit = MAX_HEADERS_PROCESS.min(headers.len());
                let chunk: Vec<BlockHeader> = headers.drain(..limit).collect();

                if mode != SyncMode::Full {
                    // Collect the headers we did not know yet: they are the
                    // uncertain ones should this cycle turn out bad.
                    let unknown: Vec<BlockHeader> = if self.cfg.rollback_unknown_headers {
                        chunk
                            .iter()
                            .filter(|h| !self.chain.has_header(h.hash(), h.number))
                            .cloned()
                            .collect()
                    } else {
                        Vec::new()
                    };

                    // Everything adjacent to the pivot gets fully verified.
                    let frequency = if chunk.last().unwrap().number + FS_HEADER_FORCE_VERIFY > pivot
                    {
                        1
                    } else {
                        FS_HEADER_CHECK_FREQUENCY
                    };
                    let (inserted, result) = self.chain.insert_header_chain(&chunk, frequency);
                    if let Err(err) = result {
                        rollback.extend(chunk[..inserted].iter().cloned());
                        debug!(
                            number = chunk[inserted.min(chunk.len() - 1)].number,
                            %err,
                            "invalid header encountered"
                        );
                        return Err(SyncError::InvalidChain);
                    }
                    rollback.extend(unknown);
                    if rollback.len() > FS_HEADER_SAFETY_NET {
                        let excess = rollback.len() - FS_HEADER_SAFETY_NET;
                        rollback.drain(..excess);
                    }
                }

                if mode != SyncMode::Light {
                    // Backpressure: don't let the task pools grow without
                    // bound when the importer lags.
                    while self.queue.pending_blocks() >= MAX_QUEUED_HEADERS
                        || self.queue.pending_receipts() >= MAX_QUEUED_HEADERS
                    {
                        tokio::select! {
                            _ = handles.cancel.cancelled() => return Err(SyncError::Cancelled),
                            _ = sleep(Duration::from_secs(1)) => {}
                        }
                    }
                    let inserts = self.queue.schedule(chunk.clone(), origin);
                    if inserts.len() != chunk.len() {
                        debug!("stale headers");
                        return Err(SyncError::BadPeer);
                    }
                }
                origin += limit as u64;
            }

            {
                let mut stats = self.sync_stats.write().unwrap();
                if stats.height < origin {
                    stats.height = origin - 1;
                }
            }
            for wake in [&handles.body_wake_tx, &handles.receipt_wake_tx] {
                let _ = wake.try_send(true);
            }
        }
    }

    /// Full sync: import completed results in block order as they arrive.
    async fn process_full_sync_content(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        loop {
            let results = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                results = self.queue.results(true) => results,
            };
            if results.is_empty() {
                return Ok(());
            }
            self.import_block_results(results)?;
        }
    }

    fn import_block_results(&self, results: Vec<FetchResult>) -> SyncResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        if self.quit.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let (first, last) = (&results[0].header, &results[results.len() - 1].header);
        debug!(
            items = results.len(),
            firstnum = first.number,
            firsthash = %first.hash(),
            lastnum = last.number,
            lasthash = %last.hash(),
            "inserting downloaded chain"
        );
        let blocks: Vec<Block> = results
            .into_iter()
            .map(|result| Block::new(result.header, result.transactions, result.uncles))
            .collect();
        let (index, result) = self.chain.insert_chain(blocks);
        if let Err(err) = result {
            debug!(index, %err, "downloaded item processing failed");
            return Err(SyncError::InvalidChain);
        }
        Ok(())
    }

    /// Fast sync: import everything below the pivot without execution, wait
    /// for the pivot state to finish downloading, commit it as the head and
    /// fully execute the tail. The pivot moves if the chain outruns it.
    async fn process_fast_sync_content(
        self: Arc<Self>,
        cancel: CancellationToken,
        latest: BlockHeader,
    ) -> SyncResult<()> {
        // Start pulling the state of the advertised head: that covers most
        // of the pivot's state already.
        let mut state_sync = state_sync::spawn(self.clone(), latest.state_root, &cancel);
        state_sync.close_queue_on_failure(&self);

        let mut pivot = latest.number.saturating_sub(FS_MIN_FULL_BLOCKS);
        let mut old_pivot: Option<FetchResult> = None;
        let mut old_tail: Vec<FetchResult> = Vec::new();

        loop {
            // Block for results unless we're babysitting a stale-able pivot.
            let results = if old_pivot.is_none() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        state_sync.cancel().await;
                        return Err(SyncError::Cancelled);
                    }
                    results = self.queue.results(true) => results,
                }
            } else {
                self.queue.results(false).await
            };
            if results.is_empty() {
                if old_pivot.is_none() {
                    state_sync.cancel().await;
                    return Ok(());
                }
                if cancel.is_cancelled() {
                    state_sync.cancel().await;
                    return Err(SyncError::Cancelled);
                }
            }

            let results = {
                let mut all = Vec::new();
                if let Some(p) = old_pivot.take() {
                    all.push(p);
                    all.append(&mut old_tail);
                }
                all.extend(results);
                all
            };

            // If the chain ran far ahead of the pivot, the old pivot state
            // is stale: move the goalpost.
            if !self.committed.load(Ordering::SeqCst) {
                if let Some(newest) = results.last() {
                    if newest.header.number > pivot + 2 * FS_MIN_FULL_BLOCKS {
                        let moved = newest.header.number - FS_MIN_FULL_BLOCKS;
                        warn!(old = pivot, new = moved, "pivot became stale, moving");
                        pivot = moved;
                    }
                }
            }

            let (pivot_result, before, after) = split_around_pivot(pivot, results);
            if let Some(err) = state_sync.error() {
                return Err(err);
            }
            self.commit_fast_sync_data(before)?;

            if let Some(pivot_result) = pivot_result {
                // A new pivot block: restart the state sync on its root.
                let restart = state_sync.root() != pivot_result.header.state_root;
                if restart {
                    state_sync.cancel().await;
                    state_sync =
                        state_sync::spawn(self.clone(), pivot_result.header.state_root, &cancel);
                    state_sync.close_queue_on_failure(&self);
                }
                tokio::select! {
                    result = state_sync.wait() => {
                        result?;
                        self.commit_pivot_block(&pivot_result)?;
                        old_pivot = None;
                    }
                    _ = sleep(Duration::from_secs(1)) => {
                        old_pivot = Some(pivot_result);
                        old_tail = after;
                        continue;
                    }
                    // The state download is a child of the cycle token, so
                    // it winds down on its own.
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
            }
            // Fast sync done for this span; the tail imports fully.
            self.import_block_results(after)?;
        }
    }

    fn commit_fast_sync_data(&self, results: Vec<FetchResult>) -> SyncResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        if self.quit.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let (first, last) = (&results[0].header, &results[results.len() - 1].header);
        debug!(
            items = results.len(),
            firstnum = first.number,
            firsthash = %first.hash(),
            lastnum = last.number,
            lasthash = %last.hash(),
            "inserting fast-sync blocks"
        );
        let mut blocks = Vec::with_capacity(results.len());
        let mut receipts = Vec::with_capacity(results.len());
        for result in results {
            receipts.push(result.receipts);
            blocks.push(Block::new(result.header, result.transactions, result.uncles));
        }
        let (index, result) = self.chain.insert_receipt_chain(blocks, receipts);
        if let Err(err) = result {
            debug!(index, %err, "downloaded item processing failed");
            return Err(SyncError::InvalidChain);
        }
        Ok(())
    }

    fn commit_pivot_block(&self, result: &FetchResult) -> SyncResult<()> {
        let block = Block::new(
            result.header.clone(),
            result.transactions.clone(),
            result.uncles.clone(),
        );
        debug!(number = block.number(), hash = %block.hash(),
            "committing fast sync pivot as new head");
        let (_, inserted) =
            self.chain
                .insert_receipt_chain(vec![block.clone()], vec![result.receipts.clone()]);
        inserted.map_err(|err| SyncError::Store(err.to_string()))?;
        self.chain
            .fast_sync_commit_head(block.hash())
            .map_err(|err| SyncError::Store(err.to_string()))?;
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Routes a batch of headers received from `peer` into the running
    /// cycle.
    pub async fn deliver_headers(&self, peer: PeerId, headers: Vec<BlockHeader>) -> SyncResult<()> {
        let tx = self
            .inbox
            .read()
            .unwrap()
            .as_ref()
            .map(|inbox| inbox.header_tx.clone());
        self.deliver(tx, (peer, headers)).await
    }

    pub async fn deliver_bodies(&self, peer: PeerId, bodies: Vec<BlockBody>) -> SyncResult<()> {
        let tx = self
            .inbox
            .read()
            .unwrap()
            .as_ref()
            .map(|inbox| inbox.body_tx.clone());
        self.deliver(tx, (peer, bodies)).await
    }

    pub async fn deliver_receipts(
        &self,
        peer: PeerId,
        receipts: Vec<Vec<Receipt>>,
    ) -> SyncResult<()> {
        let tx = self
            .inbox
            .read()
            .unwrap()
            .as_ref()
            .map(|inbox| inbox.receipt_tx.clone());
        self.deliver(tx, (peer, receipts)).await
    }

    pub async fn deliver_node_data(&self, peer: PeerId, data: Vec<Vec<u8>>) -> SyncResult<()> {
        let tx = self.state_inbox.read().unwrap().clone();
        self.deliver(tx, (peer, data)).await
    }

    async fn deliver<T>(&self, tx: Option<mpsc::Sender<T>>, item: T) -> SyncResult<()> {
        let Some(tx) = tx else {
            return Err(SyncError::NoSyncActive);
        };
        let cancel = {
            let cancel = self.cancel.read().unwrap();
            cancel.as_ref().map(|(token, _)| token.clone())
        };
        match cancel {
            Some(cancel) => tokio::select! {
                sent = tx.send(item) => sent.map_err(|_| SyncError::NoSyncActive),
                _ = cancel.cancelled() => Err(SyncError::NoSyncActive),
            },
            None => tokio::select! {
                sent = tx.send(item) => sent.map_err(|_| SyncError::NoSyncActive),
                _ = self.quit.cancelled() => Err(SyncError::NoSyncActive),
            },
        }
    }

    /// Lowers the RTT confidence when a peer joins: fewer shared samples.
    fn qos_reduce_confidence(&self) {
        let peers = self.peers.len() as u64;
        if peers == 0 {
            return;
        }
        if peers == 1 {
            self.rtt_confidence.store(1_000_000, Ordering::SeqCst);
            return;
        }
        if peers >= QOS_CONFIDENCE_CAP as u64 {
            return;
        }
        let mut conf = self.rtt_confidence.load(Ordering::SeqCst) * (peers - 1) / peers;
        if (conf as f64) / 1_000_000.0 < RTT_MIN_CONFIDENCE {
            conf = (RTT_MIN_CONFIDENCE * 1_000_000.0) as u64;
        }
        self.rtt_confidence.store(conf, Ordering::SeqCst);
        debug!(
            rtt = ?Duration::from_nanos(self.rtt_estimate.load(Ordering::SeqCst)),
            confidence = conf as f64 / 1_000_000.0,
            ttl = ?self.request_ttl(),
            "relaxed downloader QoS values"
        );
    }

    /// Target round trip for a single request. Slightly under the estimate:
    /// smaller batches make for a stabler download stream.
    pub fn request_rtt(&self) -> Duration {
        Duration::from_nanos(self.rtt_estimate.load(Ordering::SeqCst) * 9 / 10)
    }

    /// Timeout allowance for a single request, scaled up from the RTT
    /// estimate by how little we trust it.
    pub fn request_ttl(&self) -> Duration {
        let rtt = Duration::from_nanos(self.rtt_estimate.load(Ordering::SeqCst));
        let conf = self.rtt_confidence.load(Ordering::SeqCst) as f64 / 1_000_000.0;
        let ttl = Duration::from_secs_f64(rtt.as_secs_f64() / conf * TTL_SCALING as f64);
        ttl.min(TTL_LIMIT)
    }

    pub(crate) fn tune_rtt(&self) -> Duration {
        let median = self.peers.median_rtt();
        let previous = self.rtt_estimate.load(Ordering::SeqCst) as f64;
        let blended =
            (1.0 - QOS_TUNING_IMPACT) * previous + QOS_TUNING_IMPACT * median.as_nanos() as f64;
        self.rtt_estimate.store(blended as u64, Ordering::SeqCst);

        let conf = self.rtt_confidence.load(Ordering::SeqCst);
        let conf = conf + (1_000_000 - conf) / 2;
        self.rtt_confidence.store(conf, Ordering::SeqCst);

        let rtt = Duration::from_nanos(blended as u64);
        debug!(?rtt, confidence = conf as f64 / 1_000_000.0, ttl = ?self.request_ttl(),
            "recalculated downloader QoS values");
        rtt
    }
}

/// The QoS tuning loop: once per RTT, blend the peer median into the
/// estimate and let confidence recover.
async fn qos_tuner(dl: Weak<Downloader>) {
    loop {
        let Some(dl) = dl.upgrade() else { return };
        let rtt = dl.tune_rtt();
        let quit = dl.quit.clone();
        drop(dl);
        tokio::select! {
            _ = quit.cancelled() => return,
            _ = sleep(rtt) => {}
        }
    }
}

fn split_around_pivot(
    pivot: u64,
    results: Vec<FetchResult>,
) -> (Option<FetchResult>, Vec<FetchResult>, Vec<FetchResult>) {
    let mut p = None;
    let mut before = Vec::new();
    let mut after = Vec::new();
    for result in results {
        match result.header.number.cmp(&pivot) {
            std::cmp::Ordering::Less => before.push(result),
            std::cmp::Ordering::Equal => p = Some(result),
            std::cmp::Ordering::Greater => after.push(result),
        }
    }
    (p, before, after)
}
