//! Fast-sync state retrieval.
//!
//! Walks the state trie reachable from the pivot root lazily: unresolved
//! node hashes are requested from idle peers in batches, verified against
//! their keccak256 hash, persisted, and their children scheduled in turn.
//! Nodes already in the store are never re-fetched, which is what makes a
//! pivot move cheap - only the delta re-downloads.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::primitives::B256;
use libp2p::PeerId;
use mp_trie::{decode_node, Node};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    constants::{EMPTY_ROOT_HASH, MAX_STATE_FETCH},
    crypto::Hash,
    db::write_fast_trie_progress,
    downloader::Downloader,
    error::{SyncError, SyncResult},
    peers::FetchKind,
};

/// Peers time out after this many failed state requests are dropped.
const MAX_STATE_FAILS: u32 = 3;

/// Handle on a running state download.
pub(crate) struct StateSync {
    root: Hash,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    error: Arc<Mutex<Option<SyncError>>>,
}

impl StateSync {
    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn error(&self) -> Option<SyncError> {
        self.error.lock().unwrap().clone()
    }

    /// Waits for the download to finish and returns its outcome.
    pub async fn wait(&mut self) -> SyncResult<()> {
        while !*self.done.borrow_and_update() {
            if self.done.changed().await.is_err() {
                break;
            }
        }
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Aborts the download and waits for the runner to acknowledge.
    pub async fn cancel(&mut self) {
        self.cancel.cancel();
        let _ = self.wait().await;
    }

    /// Closes the fetch queue if this download fails, so the content
    /// processor blocked on results wakes up and observes the failure.
    pub fn close_queue_on_failure(&self, dl: &Arc<Downloader>) {
        let mut done = self.done.clone();
        let error = self.error.clone();
        let queue = dl.queue.clone();
        dl.tracker.spawn(async move {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            let failed = error
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|err| *err != SyncError::Cancelled);
            if failed {
                queue.close();
            }
        });
    }
}

/// Starts downloading the state reachable from `root`. The download is tied
/// to `parent`: cancelling the cycle cancels it too.
pub(crate) fn spawn(dl: Arc<Downloader>, root: Hash, parent: &CancellationToken) -> StateSync {
    let cancel = parent.child_token();
    let (done_tx, done_rx) = watch::channel(false);
    let error = Arc::new(Mutex::new(None));

    let (state_tx, state_rx) = mpsc::channel(8);
    *dl.state_inbox.write().unwrap() = Some(state_tx);

    {
        let tracker = dl.tracker.clone();
        let dl = dl.clone();
        let cancel = cancel.clone();
        let error = error.clone();
        tracker.spawn(async move {
            let result = run(&dl, root, &cancel, state_rx).await;
            if let Err(err) = result {
                if err != SyncError::Cancelled {
                    warn!(%root, %err, "state sync failed");
                }
                *error.lock().unwrap() = Some(err);
            }
            *dl.state_inbox.write().unwrap() = None;
            let _ = done_tx.send(true);
        });
    }

    StateSync {
        root,
        cancel,
        done: done_rx,
        error,
    }
}

struct StateReq {
    hashes: HashSet<Hash>,
    sent_at: Instant,
}

async fn run(
    dl: &Arc<Downloader>,
    root: Hash,
    cancel: &CancellationToken,
    mut state_rx: mpsc::Receiver<(PeerId, Vec<Vec<u8>>)>,
) -> SyncResult<()> {
    debug!(%root, "state sync starting");
    if root == EMPTY_ROOT_HASH {
        return Ok(());
    }
    let db = dl.state_db.clone();
    let known = |hash: &Hash| -> SyncResult<bool> {
        db.get(hash.as_bytes())
            .map(|v| v.is_some())
            .map_err(|e| SyncError::Store(e.to_string()))
    };

    // Hashes queued for download; `scheduled` dedups across the whole run.
    let mut queue: Vec<Hash> = Vec::new();
    let mut scheduled: HashSet<Hash> = HashSet::new();
    if !known(&root)? {
        scheduled.insert(root);
        queue.push(root);
    }
    // A previous run (before a pivot move) may have gone away with requests
    // still in flight; reclaim the state lanes it left busy.
    for peer in dl.peers.all() {
        peer.make_idle(FetchKind::State);
    }

    let mut active: HashMap<PeerId, StateReq> = HashMap::new();
    let mut fails: HashMap<PeerId, u32> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !queue.is_empty() || !active.is_empty() {
        // Hand batches of unresolved hashes to every idle peer.
        let (idles, _) = dl.peers.idle_peers(FetchKind::State);
        for peer in idles {
            if queue.is_empty() {
                break;
            }
            if active.contains_key(&peer.id) || !peer.start_fetch(FetchKind::State) {
                continue;
            }
            let take = queue.len().min(MAX_STATE_FETCH);
            let batch: Vec<Hash> = queue.drain(..take).collect();
            trace!(peer = %peer.id, count = batch.len(), "requesting state nodes");
            if peer.client.request_node_data(batch.clone()).is_err() {
                queue.extend(batch);
                peer.set_idle(FetchKind::State, 0);
                continue;
            }
            active.insert(
                peer.id,
                StateReq {
                    hashes: batch.into_iter().collect(),
                    sent_at: Instant::now(),
                },
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            delivery = state_rx.recv() => {
                let Some((peer_id, data)) = delivery else { return Err(SyncError::Cancelled) };
                let Some(mut request) = active.remove(&peer_id) else {
                    // Unrequested data, probably answering a request from
                    // before a restart; discard it but free the peer.
                    trace!(peer = %peer_id, "stale state delivery");
                    if let Some(peer) = dl.peers.peer(&peer_id) {
                        peer.set_idle(FetchKind::State, 0);
                    }
                    continue;
                };

                let mut delivered = 0usize;
                let mut batch = db.batch();
                for blob in &data {
                    let hash = Hash::compute(&[blob]);
                    if !request.hashes.remove(&hash) {
                        trace!(peer = %peer_id, %hash, "unrequested state entry");
                        continue;
                    }
                    match decode_node(Some(B256::from(hash)), blob, 0) {
                        Ok(node) => {
                            batch.put(hash.as_bytes(), blob);
                            delivered += 1;
                            for child in children_of(&node) {
                                let child = Hash::from(child);
                                if scheduled.insert(child) && !known(&child)? {
                                    queue.push(child);
                                }
                            }
                        }
                        Err(err) => {
                            // Hash matched but the payload is garbage; put
                            // the task back and demote the sender.
                            debug!(peer = %peer_id, %hash, %err, "invalid state node encoding");
                            request.hashes.insert(hash);
                        }
                    }
                }
                batch.write().map_err(|e| SyncError::Store(e.to_string()))?;

                // Unfulfilled hashes go back to the pool for someone else.
                queue.extend(request.hashes.iter().copied());

                let processed = {
                    let mut stats = dl.state_stats.write().unwrap();
                    stats.processed += delivered as u64;
                    stats.pending = (queue.len()
                        + active.values().map(|r| r.hashes.len()).sum::<usize>())
                        as u64;
                    stats.processed
                };
                write_fast_trie_progress(&*db, processed)
                    .map_err(|e| SyncError::Store(e.to_string()))?;

                if let Some(peer) = dl.peers.peer(&peer_id) {
                    if delivered == 0 && !data.is_empty() {
                        // Every delivered item failed its hash check.
                        warn!(peer = %peer_id, "state data did not match requested hashes");
                        peer.set_idle(FetchKind::State, 0);
                        (dl.drop_peer)(peer_id);
                    } else if data.is_empty() {
                        // The peer has none of the data; retry elsewhere and
                        // drop it once it keeps coming up empty.
                        peer.set_idle(FetchKind::State, 0);
                        let count = fails.entry(peer_id).or_default();
                        *count += 1;
                        if *count >= MAX_STATE_FAILS {
                            debug!(peer = %peer_id, "peer has no state data, dropping");
                            (dl.drop_peer)(peer_id);
                        }
                    } else {
                        peer.set_idle(FetchKind::State, delivered);
                    }
                }
            }
            _ = ticker.tick() => {
                if dl.peers.is_empty() {
                    return Err(SyncError::NoPeers);
                }
                let ttl = dl.request_ttl();
                let expired: Vec<PeerId> = active
                    .iter()
                    .filter(|(_, req)| req.sent_at.elapsed() > ttl)
                    .map(|(id, _)| *id)
                    .collect();
                for peer_id in expired {
                    let request = active.remove(&peer_id).unwrap();
                    queue.extend(request.hashes.iter().copied());
                    let count = fails.entry(peer_id).or_default();
                    *count += 1;
                    if let Some(peer) = dl.peers.peer(&peer_id) {
                        peer.set_idle(FetchKind::State, 0);
                    }
                    if *count >= MAX_STATE_FAILS {
                        debug!(peer = %peer_id, "state sync stalling, dropping peer");
                        (dl.drop_peer)(peer_id);
                    } else {
                        trace!(peer = %peer_id, "state request timed out, rescheduling");
                    }
                }
            }
        }
    }
    debug!(%root, "state sync completed");
    Ok(())
}

/// Hash references held by a node, looking through embedded children.
fn children_of(node: &Node) -> Vec<B256> {
    fn walk(node: &Node, out: &mut Vec<B256>) {
        match node {
            Node::Hash(hash) => out.push(*hash),
            Node::Branch(branch) => {
                for child in &branch.children {
                    walk(child, out);
                }
            }
            Node::Short(short) => walk(&short.val, out),
            Node::Empty | Node::Value(_) => {}
        }
    }
    let mut out = Vec::new();
    walk(node, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_trie::{nibbles::Nibbles, node::BranchNode};

    #[test]
    fn children_looks_through_embedded_nodes() {
        let target = B256::repeat_byte(0xaa);
        let mut branch = BranchNode::new(0);
        branch.insert(3, Node::from_hash(target));
        branch.insert(
            5,
            Node::from_extension(
                Nibbles::from_hex(&[1]),
                Node::from_hash(B256::repeat_byte(0xbb)),
                0,
            ),
        );
        let node = Node::from_branch(branch);

        let children = children_of(&node);
        assert_eq!(children.len(), 2);
        assert!(children.contains(&target));
    }

    #[test]
    fn leaves_have_no_children() {
        let node = Node::from_leaf(Nibbles::from_raw(b"k", true), b"value".to_vec(), 0);
        assert!(children_of(&node).is_empty());
    }
}
