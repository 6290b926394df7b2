//! The fetch scheduling queue.
//!
//! One shared queue carries four task pools: header-gap fills (driven by the
//! skeleton), block bodies, receipts and (indirectly) state. Tasks move
//! `Pending -> Reserved(peer) -> Delivered | Expired`; expired tasks go back
//! to pending for another peer. Completed downloads assemble into the result
//! cache, which [`Queue::results`] drains strictly in ascending, contiguous
//! block-number order - the pipeline's primary invariant.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use libp2p::PeerId;
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};
use tracing::{debug, trace};

use crate::{
    constants::{BLOCK_CACHE_ITEMS, MAX_HEADER_FETCH, MAX_RESULTS_PROCESS},
    crypto::Hash,
    error::{SyncError, SyncResult},
    message::{receipts_root, BlockBody, BlockHeader, Receipt, SyncMode, Transaction},
    peers::Peer,
};

/// Pending-mask bits of a result slot.
pub const BODY_PENDING: u8 = 1 << 0;
pub const RECEIPT_PENDING: u8 = 1 << 1;

/// A chunk of tasks reserved to one peer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub peer: PeerId,
    /// First block number of a header-gap fill (header requests only).
    pub from: u64,
    /// Headers whose content is requested (body/receipt requests only).
    pub headers: Vec<BlockHeader>,
    /// Reservation time; the request expires `ttl` after this.
    pub time: Instant,
}

/// One slot of the result cache. Complete once `pending` reaches zero.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub pending: u8,
    pub hash: Hash,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
    pub receipts: Vec<Receipt>,
}

impl FetchResult {
    fn new(hash: Hash, header: BlockHeader, mode: SyncMode) -> Self {
        let mut pending = BODY_PENDING;
        if mode == SyncMode::Fast {
            pending |= RECEIPT_PENDING;
        }
        FetchResult {
            pending,
            hash,
            header,
            transactions: Vec::new(),
            uncles: Vec::new(),
            receipts: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

/// Min-heap entry ordered by block number.
struct TaskItem {
    hash: Hash,
    header: BlockHeader,
}

impl PartialEq for TaskItem {
    fn eq(&self, other: &Self) -> bool {
        self.header.number == other.header.number
    }
}

impl Eq for TaskItem {}

impl Ord for TaskItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.header.number.cmp(&self.header.number)
    }
}

impl PartialOrd for TaskItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Bodies,
    Receipts,
}

impl ContentKind {
    fn mask(self) -> u8 {
        match self {
            ContentKind::Bodies => BODY_PENDING,
            ContentKind::Receipts => RECEIPT_PENDING,
        }
    }
}

/// One content task pool (bodies or receipts).
#[derive(Default)]
struct TaskPool {
    /// Tasks still awaiting download, by block hash.
    pool: HashMap<Hash, ()>,
    /// Pending tasks, lowest block number first.
    queue: BinaryHeap<TaskItem>,
    /// Reservations currently out with peers.
    pending: HashMap<PeerId, FetchRequest>,
    /// Hashes whose download completed (content placed in the result cache).
    done: HashSet<Hash>,
}

impl TaskPool {
    fn clear(&mut self) {
        *self = TaskPool::default();
    }
}

#[derive(Default)]
struct HeaderFill {
    /// Gap start -> bracketing skeleton sample (header and its hash).
    pool: HashMap<u64, (BlockHeader, Hash)>,
    /// Pending gap starts, lowest first.
    queue: BinaryHeap<std::cmp::Reverse<u64>>,
    /// Gaps each peer already failed to fill.
    peer_miss: HashMap<PeerId, HashSet<u64>>,
    pending: HashMap<PeerId, FetchRequest>,
    /// Fill results, indexed from `offset`.
    results: Vec<Option<BlockHeader>>,
    /// Headers already forwarded to the header processor.
    proced: usize,
    offset: u64,
    /// Signals the fill fetcher that no gaps remain (send-or-drop hint).
    cont: Option<mpsc::Sender<bool>>,
}

impl HeaderFill {
    fn clear(&mut self) {
        *self = HeaderFill::default();
    }
}

struct Inner {
    mode: SyncMode,
    closed: bool,

    headers: HeaderFill,
    /// Last scheduled header hash, to enforce chain ancestry across batches.
    header_head: Option<Hash>,

    blocks: TaskPool,
    receipts: TaskPool,

    result_cache: Vec<Option<FetchResult>>,
    result_offset: u64,
}

impl Inner {
    fn fresh() -> Self {
        Inner {
            mode: SyncMode::Full,
            closed: false,
            headers: HeaderFill::default(),
            header_head: None,
            blocks: TaskPool::default(),
            receipts: TaskPool::default(),
            result_cache: std::iter::repeat_with(|| None).take(BLOCK_CACHE_ITEMS).collect(),
            result_offset: 0,
        }
    }
}

pub struct Queue {
    inner: Mutex<Inner>,
    /// Woken whenever a result slot completes or the queue closes.
    active: Notify,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(Inner::fresh()),
            active: Notify::new(),
        }
    }

    /// Clears all internal state for a new sync cycle.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::fresh();
    }

    /// Configures the result cache for a cycle starting at `offset`.
    pub fn prepare(&self, offset: u64, mode: SyncMode) {
        let mut inner = self.inner.lock().unwrap();
        if inner.result_offset < offset {
            inner.result_offset = offset;
        }
        inner.mode = mode;
    }

    /// Marks the end of scheduling; wakes every blocked `results` call.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.active.notify_waiters();
    }

    pub fn pending_headers(&self) -> usize {
        self.inner.lock().unwrap().headers.queue.len()
    }

    pub fn pending_blocks(&self) -> usize {
        self.inner.lock().unwrap().blocks.queue.len()
    }

    pub fn pending_receipts(&self) -> usize {
        self.inner.lock().unwrap().receipts.queue.len()
    }

    pub fn in_flight_headers(&self) -> bool {
        !self.inner.lock().unwrap().headers.pending.is_empty()
    }

    pub fn in_flight_blocks(&self) -> bool {
        !self.inner.lock().unwrap().blocks.pending.is_empty()
    }

    pub fn in_flight_receipts(&self) -> bool {
        !self.inner.lock().unwrap().receipts.pending.is_empty()
    }

    pub fn should_throttle_blocks(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        result_space(&inner.result_cache, &inner.blocks, inner.result_offset) == 0
    }

    pub fn should_throttle_receipts(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        result_space(&inner.result_cache, &inner.receipts, inner.result_offset) == 0
    }

    /// Registers gap-fill tasks between the samples of a header skeleton
    /// starting at `from`. `cont` is signalled once every gap is filled.
    pub fn schedule_skeleton(&self, from: u64, skeleton: &[BlockHeader], cont: mpsc::Sender<bool>) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.headers.pool.is_empty(),
            "skeleton assembly already in progress"
        );
        inner.headers.clear();
        inner.headers.offset = from;
        inner.headers.results = std::iter::repeat_with(|| None)
            .take(skeleton.len() * MAX_HEADER_FETCH)
            .collect();
        inner.headers.cont = Some(cont);
        for (i, sample) in skeleton.iter().enumerate() {
            let start = from + (i * MAX_HEADER_FETCH) as u64;
            inner
                .headers
                .pool
                .insert(start, (sample.clone(), sample.hash()));
            inner.headers.queue.push(std::cmp::Reverse(start));
        }
        debug!(from, gaps = skeleton.len(), "scheduled skeleton fill");
    }

    /// Hands back the assembled fill results and how many headers were
    /// already forwarded for processing, ending the skeleton phase.
    pub fn retrieve_headers(&self) -> (Vec<BlockHeader>, usize) {
        let mut inner = self.inner.lock().unwrap();
        let headers = inner.headers.results.drain(..).flatten().collect();
        let proced = inner.headers.proced;
        inner.headers.clear();
        (headers, proced)
    }

    /// Reserves the lowest pending header gap for `peer`, skipping gaps the
    /// peer already failed.
    pub fn reserve_headers(&self, peer: &Peer) -> Option<FetchRequest> {
        let mut inner = self.inner.lock().unwrap();
        if inner.headers.pending.contains_key(&peer.id) {
            return None;
        }
        let mut skipped = Vec::new();
        let mut reserved = None;
        while let Some(std::cmp::Reverse(from)) = inner.headers.queue.pop() {
            let missed = inner
                .headers
                .peer_miss
                .get(&peer.id)
                .is_some_and(|misses| misses.contains(&from));
            if missed {
                skipped.push(std::cmp::Reverse(from));
            } else {
                reserved = Some(from);
                break;
            }
        }
        for item in skipped {
            inner.headers.queue.push(item);
        }
        let from = reserved?;
        let request = FetchRequest {
            peer: peer.id,
            from,
            headers: Vec::new(),
            time: Instant::now(),
        };
        inner.headers.pending.insert(peer.id, request.clone());
        Some(request)
    }

    /// Matches a header delivery against the peer's gap reservation. The
    /// batch is accepted only if it is exactly the gap: full length, starting
    /// at the reserved number, internally linked and ending in the skeleton
    /// sample. Accepted spans contiguous from the start are forwarded to
    /// `proc_tx` immediately.
    pub fn deliver_headers(
        &self,
        peer_id: PeerId,
        headers: Vec<BlockHeader>,
        proc_tx: &mpsc::Sender<Vec<BlockHeader>>,
    ) -> (usize, SyncResult<()>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(request) = inner.headers.pending.remove(&peer_id) else {
            return (0, Err(SyncError::StaleDelivery));
        };
        let from = request.from;
        let Some(target_hash) = inner.headers.pool.get(&from).map(|(_, hash)| *hash) else {
            return (0, Err(SyncError::StaleDelivery));
        };

        let mut accept = headers.len() == MAX_HEADER_FETCH;
        if accept {
            let hashes: Vec<Hash> = headers.iter().map(|h| h.hash()).collect();
            if *hashes.last().unwrap() != target_hash {
                trace!(peer = %peer_id, from, "skeleton fill mismatched target");
                accept = false;
            } else {
                for (i, header) in headers.iter().enumerate() {
                    if header.number != from + i as u64 {
                        accept = false;
                        break;
                    }
                    if i > 0 && headers[i].parent_hash != hashes[i - 1] {
                        accept = false;
                        break;
                    }
                }
            }
        }
        if !accept {
            trace!(peer = %peer_id, from, "rejected header fill batch");
            inner
                .headers
                .peer_miss
                .entry(peer_id)
                .or_default()
                .insert(from);
            inner.headers.queue.push(std::cmp::Reverse(from));
            return (0, Err(SyncError::DeliveryNotAccepted));
        }

        let accepted = headers.len();
        inner.headers.pool.remove(&from);
        let start = (from - inner.headers.offset) as usize;
        for (i, header) in headers.into_iter().enumerate() {
            inner.headers.results[start + i] = Some(header);
        }

        // Forward whatever became ready at the front of the fill.
        let mut ready = 0;
        while inner.headers.proced + ready < inner.headers.results.len()
            && inner.headers.results[inner.headers.proced + ready].is_some()
        {
            ready += 1;
        }
        if ready > 0 {
            let proced = inner.headers.proced;
            let batch: Vec<BlockHeader> = inner.headers.results[proced..proced + ready]
                .iter()
                .map(|h| h.clone().unwrap())
                .collect();
            if proc_tx.try_send(batch).is_ok() {
                inner.headers.proced += ready;
            }
        }
        if inner.headers.pool.is_empty() {
            if let Some(cont) = &inner.headers.cont {
                let _ = cont.try_send(false);
            }
        }
        (accepted, Ok(()))
    }

    pub fn expire_headers(&self, ttl: Duration) -> HashMap<PeerId, usize> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<PeerId> = inner
            .headers
            .pending
            .iter()
            .filter(|(_, req)| req.time.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        let mut failures = HashMap::new();
        for id in expired {
            let request = inner.headers.pending.remove(&id).unwrap();
            inner.headers.queue.push(std::cmp::Reverse(request.from));
            failures.insert(id, 1);
        }
        failures
    }

    /// Allocates result slots and enqueues body (and, in fast mode, receipt)
    /// tasks for `headers`. Returns the headers actually scheduled; a break
    /// in numbering or ancestry stops the scan.
    pub fn schedule(&self, headers: Vec<BlockHeader>, from: u64) -> Vec<BlockHeader> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserts = Vec::with_capacity(headers.len());
        let mut from = from;
        for header in headers {
            let hash = header.hash();
            if header.number != from {
                debug!(number = header.number, expected = from, "header broke chain ordering");
                break;
            }
            if let Some(head) = inner.header_head {
                if head != header.parent_hash {
                    debug!(number = header.number, "header broke chain ancestry");
                    break;
                }
            }
            if inner.blocks.pool.contains_key(&hash) {
                debug!(number = header.number, "header already scheduled for block fetch");
                continue;
            }
            inner.blocks.pool.insert(hash, ());
            inner.blocks.queue.push(TaskItem {
                hash,
                header: header.clone(),
            });
            if inner.mode == SyncMode::Fast && !inner.receipts.pool.contains_key(&hash) {
                inner.receipts.pool.insert(hash, ());
                inner.receipts.queue.push(TaskItem {
                    hash,
                    header: header.clone(),
                });
            }
            inner.header_head = Some(hash);
            inserts.push(header);
            from += 1;
        }
        inserts
    }

    pub fn reserve_bodies(&self, peer: &Peer, count: usize) -> (Option<FetchRequest>, bool) {
        self.reserve_content(peer, count, ContentKind::Bodies)
    }

    pub fn reserve_receipts(&self, peer: &Peer, count: usize) -> (Option<FetchRequest>, bool) {
        self.reserve_content(peer, count, ContentKind::Receipts)
    }

    fn reserve_content(
        &self,
        peer: &Peer,
        count: usize,
        kind: ContentKind,
    ) -> (Option<FetchRequest>, bool) {
        let mut completed = false;
        let reservation = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            let mode = inner.mode;
            let tasks = match kind {
                ContentKind::Bodies => &mut inner.blocks,
                ContentKind::Receipts => &mut inner.receipts,
            };
            if tasks.queue.is_empty() || tasks.pending.contains_key(&peer.id) {
                return (None, false);
            }
            let mut space = result_space(&inner.result_cache, tasks, inner.result_offset);

            let mut send = Vec::new();
            let mut skip = Vec::new();
            let mut progress = false;
            while space > 0 && send.len() < count {
                let Some(item) = tasks.queue.pop() else { break };
                let Some(index) = item.header.number.checked_sub(inner.result_offset) else {
                    // Below the cache window: the block was already imported.
                    tasks.pool.remove(&item.hash);
                    continue;
                };
                let index = index as usize;
                if index >= inner.result_cache.len() {
                    // Beyond the cache window; retry once results drain.
                    tasks.queue.push(item);
                    break;
                }
                if inner.result_cache[index].is_none() {
                    inner.result_cache[index] =
                        Some(FetchResult::new(item.hash, item.header.clone(), mode));
                }
                space -= 1;

                let noop = match kind {
                    ContentKind::Bodies => !item.header.has_body(),
                    ContentKind::Receipts => !item.header.has_receipts(),
                };
                if noop {
                    let slot = inner.result_cache[index].as_mut().unwrap();
                    slot.pending &= !kind.mask();
                    if slot.is_complete() {
                        completed = true;
                    }
                    tasks.pool.remove(&item.hash);
                    tasks.done.insert(item.hash);
                    progress = true;
                    continue;
                }
                if peer.lacks(&item.hash) {
                    skip.push(item);
                } else {
                    send.push(item.header);
                }
            }
            for item in skip {
                tasks.queue.push(item);
            }

            if send.is_empty() {
                (None, progress)
            } else {
                let request = FetchRequest {
                    peer: peer.id,
                    from: 0,
                    headers: send,
                    time: Instant::now(),
                };
                tasks.pending.insert(peer.id, request.clone());
                (Some(request), progress)
            }
        };
        if completed {
            self.active.notify_waiters();
        }
        reservation
    }

    /// Matches delivered bodies against the peer's reservation in arrival
    /// order, validating each against its header's commitments.
    pub fn deliver_bodies(&self, peer: &Peer, bodies: Vec<BlockBody>) -> (usize, SyncResult<()>) {
        self.deliver_content(peer, bodies.len(), ContentKind::Bodies, |i, header, slot| {
            let body = &bodies[i];
            if body.transactions_root() != header.transactions_root
                || body.uncles_hash() != header.uncles_hash
            {
                return Err(SyncError::InvalidBody);
            }
            slot.transactions = body.transactions.clone();
            slot.uncles = body.uncles.clone();
            Ok(())
        })
    }

    pub fn deliver_receipts(
        &self,
        peer: &Peer,
        receipts: Vec<Vec<Receipt>>,
    ) -> (usize, SyncResult<()>) {
        self.deliver_content(peer, receipts.len(), ContentKind::Receipts, |i, header, slot| {
            let list = &receipts[i];
            if receipts_root(list) != header.receipts_root {
                return Err(SyncError::InvalidReceipt);
            }
            slot.receipts = list.clone();
            Ok(())
        })
    }

    fn deliver_content(
        &self,
        peer: &Peer,
        items: usize,
        kind: ContentKind,
        mut reconstruct: impl FnMut(usize, &BlockHeader, &mut FetchResult) -> SyncResult<()>,
    ) -> (usize, SyncResult<()>) {
        let mut completed = false;
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            let tasks = match kind {
                ContentKind::Bodies => &mut inner.blocks,
                ContentKind::Receipts => &mut inner.receipts,
            };
            let Some(request) = tasks.pending.remove(&peer.id) else {
                return (0, Err(SyncError::StaleDelivery));
            };

            let mut accepted = 0;
            let mut failure = None;
            for (i, header) in request.headers.iter().enumerate() {
                if i >= items {
                    break;
                }
                let slot = match header
                    .number
                    .checked_sub(inner.result_offset)
                    .and_then(|index| inner.result_cache.get_mut(index as usize))
                {
                    Some(Some(slot)) => slot,
                    _ => {
                        failure = Some(SyncError::InvalidChain);
                        break;
                    }
                };
                if let Err(err) = reconstruct(i, header, slot) {
                    failure = Some(err);
                    break;
                }
                slot.pending &= !kind.mask();
                if slot.is_complete() {
                    completed = true;
                }
                let hash = header.hash();
                tasks.pool.remove(&hash);
                tasks.done.insert(hash);
                accepted += 1;
            }

            // Anything unfetched goes back to pending for another peer. If
            // the peer answered cleanly but left items out, it does not have
            // them; remember that so it isn't asked again.
            for header in request.headers.into_iter().skip(accepted) {
                let hash = header.hash();
                if failure.is_none() {
                    peer.mark_lacking(hash);
                }
                tasks.queue.push(TaskItem { hash, header });
            }

            match failure {
                Some(err) => (accepted, Err(err)),
                None if accepted == 0 => (0, Err(SyncError::StaleDelivery)),
                None => (accepted, Ok(())),
            }
        };
        if completed {
            self.active.notify_waiters();
        }
        outcome
    }

    pub fn expire_bodies(&self, ttl: Duration) -> HashMap<PeerId, usize> {
        self.expire_content(ttl, ContentKind::Bodies)
    }

    pub fn expire_receipts(&self, ttl: Duration) -> HashMap<PeerId, usize> {
        self.expire_content(ttl, ContentKind::Receipts)
    }

    fn expire_content(&self, ttl: Duration, kind: ContentKind) -> HashMap<PeerId, usize> {
        let mut inner = self.inner.lock().unwrap();
        let tasks = match kind {
            ContentKind::Bodies => &mut inner.blocks,
            ContentKind::Receipts => &mut inner.receipts,
        };
        let expired: Vec<PeerId> = tasks
            .pending
            .iter()
            .filter(|(_, req)| req.time.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        let mut failures = HashMap::new();
        for id in expired {
            let request = tasks.pending.remove(&id).unwrap();
            failures.insert(id, request.headers.len());
            for header in request.headers {
                let hash = header.hash();
                tasks.queue.push(TaskItem { hash, header });
            }
        }
        failures
    }

    /// Returns a dropped peer's reservations to the pending pools.
    pub fn revoke(&self, peer_id: &PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(request) = inner.headers.pending.remove(peer_id) {
            inner.headers.queue.push(std::cmp::Reverse(request.from));
        }
        for kind in [ContentKind::Bodies, ContentKind::Receipts] {
            let tasks = match kind {
                ContentKind::Bodies => &mut inner.blocks,
                ContentKind::Receipts => &mut inner.receipts,
            };
            if let Some(request) = tasks.pending.remove(peer_id) {
                for header in request.headers {
                    let hash = header.hash();
                    tasks.queue.push(TaskItem { hash, header });
                }
            }
        }
    }

    /// Pops the longest complete prefix of the result cache, in strictly
    /// ascending block-number order, at most `MAX_RESULTS_PROCESS` at a time.
    /// With `block` set, waits until results exist or the queue closes.
    pub async fn results(&self, block: bool) -> Vec<FetchResult> {
        loop {
            let notified = self.active.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                let mut nproc = 0;
                while nproc < MAX_RESULTS_PROCESS {
                    match &inner.result_cache[nproc] {
                        Some(result) if result.is_complete() => nproc += 1,
                        _ => break,
                    }
                }
                if nproc > 0 {
                    let items: Vec<FetchResult> = inner
                        .result_cache
                        .drain(..nproc)
                        .map(|slot| slot.unwrap())
                        .collect();
                    for _ in 0..nproc {
                        inner.result_cache.push(None);
                    }
                    inner.result_offset += nproc as u64;
                    // Completed downloads leave the done sets once imported.
                    for item in &items {
                        inner.blocks.done.remove(&item.hash);
                        inner.receipts.done.remove(&item.hash);
                    }
                    return items;
                }
                if !block || inner.closed {
                    return Vec::new();
                }
            }
            notified.await;
        }
    }
}

/// Free result-cache slots available to `tasks`, accounting for slots whose
/// download finished but has not been imported yet and for slots already
/// reserved. Zero means the importer is behind and fetching must throttle.
fn result_space(
    result_cache: &[Option<FetchResult>],
    tasks: &TaskPool,
    result_offset: u64,
) -> usize {
    let mut finished = 0;
    for slot in result_cache {
        match slot {
            Some(result) if tasks.done.contains(&result.hash) => finished += 1,
            Some(_) => {}
            None => break,
        }
    }
    let mut pending = 0;
    for request in tasks.pending.values() {
        for header in &request.headers {
            if header.number < result_offset + result_cache.len() as u64 {
                pending += 1;
            }
        }
    }
    result_cache.len().saturating_sub(finished + pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{EMPTY_LIST_HASH, EMPTY_ROOT_HASH},
        message::ordered_trie_root,
        peers::tests::test_peer,
    };

    fn header_chain(n: usize, txs_every: usize) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(n);
        let mut parent_hash = Hash::ZERO;
        for number in 1..=n as u64 {
            let with_txs = txs_every != 0 && number as usize % txs_every == 0;
            let transactions_root = if with_txs {
                ordered_trie_root([format!("tx-{number}").into_bytes()])
            } else {
                EMPTY_ROOT_HASH
            };
            let header = BlockHeader {
                parent_hash,
                uncles_hash: EMPTY_LIST_HASH,
                state_root: Hash::ZERO,
                transactions_root,
                receipts_root: EMPTY_ROOT_HASH,
                number,
                difficulty: 1,
                timestamp: number,
                extra: vec![],
            };
            parent_hash = header.hash();
            headers.push(header);
        }
        headers
    }

    fn body_for(header: &BlockHeader) -> BlockBody {
        if header.transactions_root == EMPTY_ROOT_HASH {
            BlockBody::default()
        } else {
            BlockBody {
                transactions: vec![Transaction(format!("tx-{}", header.number).into_bytes())],
                uncles: vec![],
            }
        }
    }

    #[tokio::test]
    async fn schedule_and_complete_in_order() {
        let queue = Queue::new();
        queue.prepare(1, SyncMode::Full);
        let headers = header_chain(8, 1); // every block has a body
        let inserts = queue.schedule(headers.clone(), 1);
        assert_eq!(inserts.len(), 8);
        assert_eq!(queue.pending_blocks(), 8);

        let peer = test_peer();
        let (request, _) = queue.reserve_bodies(&peer, 4);
        let request = request.unwrap();
        // Lowest numbers reserved first, in order.
        let numbers: Vec<u64> = request.headers.iter().map(|h| h.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(queue.in_flight_blocks());

        let bodies: Vec<BlockBody> = request.headers.iter().map(body_for).collect();
        let (accepted, result) = queue.deliver_bodies(&peer, bodies);
        assert_eq!(accepted, 4);
        result.unwrap();

        let results = queue.results(false).await;
        let numbers: Vec<u64> = results.iter().map(|r| r.header.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        // Strictly increasing and contiguous.
        for pair in numbers.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[tokio::test]
    async fn results_never_skip_incomplete_slots() {
        let queue = Queue::new();
        queue.prepare(1, SyncMode::Full);
        let headers = header_chain(6, 1);
        queue.schedule(headers.clone(), 1);

        let peer_a = test_peer();
        let peer_b = test_peer();
        let (req_a, _) = queue.reserve_bodies(&peer_a, 3);
        let (req_b, _) = queue.reserve_bodies(&peer_b, 3);
        let req_a = req_a.unwrap();
        let req_b = req_b.unwrap();

        // Only the second chunk arrives: nothing is reported.
        let bodies_b: Vec<BlockBody> = req_b.headers.iter().map(body_for).collect();
        queue.deliver_bodies(&peer_b, bodies_b).1.unwrap();
        assert!(queue.results(false).await.is_empty());

        let bodies_a: Vec<BlockBody> = req_a.headers.iter().map(body_for).collect();
        queue.deliver_bodies(&peer_a, bodies_a).1.unwrap();
        let numbers: Vec<u64> = queue
            .results(false)
            .await
            .iter()
            .map(|r| r.header.number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn empty_bodies_complete_without_network() {
        let queue = Queue::new();
        queue.prepare(1, SyncMode::Full);
        // No transactions anywhere: everything is a noop fetch.
        let headers = header_chain(5, 0);
        queue.schedule(headers, 1);

        let peer = test_peer();
        let (request, progress) = queue.reserve_bodies(&peer, 8);
        assert!(request.is_none());
        assert!(progress);
        assert_eq!(queue.results(false).await.len(), 5);
    }

    #[tokio::test]
    async fn expired_reservations_return_to_pending() {
        tokio::time::pause();
        let queue = Queue::new();
        queue.prepare(1, SyncMode::Full);
        queue.schedule(header_chain(4, 1), 1);

        let peer = test_peer();
        let (request, _) = queue.reserve_bodies(&peer, 4);
        assert_eq!(request.unwrap().headers.len(), 4);
        assert_eq!(queue.pending_blocks(), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        let failures = queue.expire_bodies(Duration::from_secs(5));
        assert_eq!(failures.get(&peer.id), Some(&4));
        assert_eq!(queue.pending_blocks(), 4);
        assert!(!queue.in_flight_blocks());

        // Another peer can pick the tasks up.
        let other = test_peer();
        let (request, _) = queue.reserve_bodies(&other, 4);
        assert_eq!(request.unwrap().headers.len(), 4);
    }

    #[tokio::test]
    async fn stale_and_invalid_deliveries() {
        let queue = Queue::new();
        queue.prepare(1, SyncMode::Full);
        queue.schedule(header_chain(2, 1), 1);

        let peer = test_peer();
        // No reservation at all.
        let (_, result) = queue.deliver_bodies(&peer, vec![]);
        assert_eq!(result, Err(SyncError::StaleDelivery));

        let (request, _) = queue.reserve_bodies(&peer, 2);
        let request = request.unwrap();
        // Tampered body: transaction list does not match the header root.
        let bad = vec![BlockBody {
            transactions: vec![Transaction(b"tampered".to_vec())],
            uncles: vec![],
        }];
        let (accepted, result) = queue.deliver_bodies(&peer, bad);
        assert_eq!(accepted, 0);
        assert_eq!(result, Err(SyncError::InvalidBody));
        // The tasks went back to pending.
        assert_eq!(queue.pending_blocks(), request.headers.len());
    }

    #[tokio::test]
    async fn skeleton_fill_accepts_only_exact_joins() {
        let queue = Queue::new();
        let headers = header_chain(MAX_HEADER_FETCH * 2, 0);
        // Skeleton samples at the end of each gap.
        let skeleton = vec![
            headers[MAX_HEADER_FETCH - 1].clone(),
            headers[2 * MAX_HEADER_FETCH - 1].clone(),
        ];
        let (cont_tx, mut cont_rx) = mpsc::channel(1);
        let (proc_tx, mut proc_rx) = mpsc::channel(4);
        queue.schedule_skeleton(1, &skeleton, cont_tx);
        assert_eq!(queue.pending_headers(), 2);

        let peer = test_peer();
        let request = queue.reserve_headers(&peer).unwrap();
        assert_eq!(request.from, 1);

        // A batch that does not end in the skeleton sample is rejected and
        // the gap is requeued for another peer.
        let mut wrong = headers[..MAX_HEADER_FETCH].to_vec();
        wrong[MAX_HEADER_FETCH - 1].timestamp += 1;
        let (accepted, result) = queue.deliver_headers(peer.id, wrong, &proc_tx);
        assert_eq!(accepted, 0);
        assert_eq!(result, Err(SyncError::DeliveryNotAccepted));
        assert_eq!(queue.pending_headers(), 2);

        // The same peer is not handed the gap it failed.
        let request = queue.reserve_headers(&peer).unwrap();
        assert_eq!(request.from, 1 + MAX_HEADER_FETCH as u64);
        let other = test_peer();
        let request = queue.reserve_headers(&other).unwrap();
        assert_eq!(request.from, 1);

        // Correct fills complete the skeleton and forward in order.
        let (accepted, result) =
            queue.deliver_headers(other.id, headers[..MAX_HEADER_FETCH].to_vec(), &proc_tx);
        assert_eq!(accepted, MAX_HEADER_FETCH);
        result.unwrap();
        let (accepted, result) =
            queue.deliver_headers(peer.id, headers[MAX_HEADER_FETCH..].to_vec(), &proc_tx);
        assert_eq!(accepted, MAX_HEADER_FETCH);
        result.unwrap();

        assert_eq!(cont_rx.recv().await, Some(false));
        let first = proc_rx.recv().await.unwrap();
        assert_eq!(first[0].number, 1);
        let (filled, proced) = queue.retrieve_headers();
        assert_eq!(filled.len(), MAX_HEADER_FETCH * 2);
        assert_eq!(proced, MAX_HEADER_FETCH * 2);
    }

    #[tokio::test]
    async fn throttles_when_importer_lags() {
        let queue = Queue::new();
        queue.prepare(1, SyncMode::Full);
        let headers = header_chain(BLOCK_CACHE_ITEMS + 10, 0);
        // Schedule more noop blocks than the result cache holds; everything
        // completes instantly and nobody imports.
        queue.schedule(headers, 1);
        let peer = test_peer();
        loop {
            let (request, progress) = queue.reserve_bodies(&peer, usize::MAX);
            assert!(request.is_none());
            if !progress {
                break;
            }
        }
        assert!(queue.should_throttle_blocks());

        // Draining the results frees the window again.
        let drained = queue.results(false).await;
        assert_eq!(drained.len(), MAX_RESULTS_PROCESS);
        assert!(!queue.should_throttle_blocks());
    }
}
