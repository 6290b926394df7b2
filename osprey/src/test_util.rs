//! In-memory chain and peer doubles for driving the sync engine end to end.
//!
//! `RemoteChain` plays the network side: a canonical chain with bodies,
//! receipts and a served state store. `TestPeer` answers the peer-client
//! requests from one (with configurable latency and misbehaviour), pushing
//! responses through the downloader's delivery inbox after a round trip
//! through the wire codec. `TestChain` is the local store being synced into.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use libp2p::PeerId;
use mp_trie::Trie;
use tokio::time::sleep;

use crate::{
    cfg::SyncConfig,
    chain::{BlockChain, LightChain},
    constants::{EMPTY_LIST_HASH, EMPTY_ROOT_HASH, MAX_STATE_FETCH},
    crypto::Hash,
    db::{Kv, MemoryKv, TrieKv},
    downloader::Downloader,
    error::SyncResult,
    message::{
        ordered_trie_root, receipts_root, Block, BlockBody, BlockHeader, HashOrNumber, Receipt,
        SyncMessage, Transaction,
    },
    peers::PeerClient,
};

pub fn genesis_block() -> Block {
    Block::new(
        BlockHeader {
            parent_hash: Hash::ZERO,
            uncles_hash: EMPTY_LIST_HASH,
            state_root: EMPTY_ROOT_HASH,
            transactions_root: EMPTY_ROOT_HASH,
            receipts_root: EMPTY_ROOT_HASH,
            number: 0,
            difficulty: 1,
            timestamp: 0,
            extra: b"genesis".to_vec(),
        },
        vec![],
        vec![],
    )
}

/// Deterministic block off `parent`. Every third block carries transactions
/// so body and receipt fetching is actually exercised on the wire.
fn make_block(parent: &BlockHeader, state_root: Hash, salt: &[u8]) -> (Block, Vec<Receipt>) {
    let number = parent.number + 1;
    let (transactions, receipts) = if number % 3 == 0 {
        let transactions: Vec<Transaction> = (0..2u8)
            .map(|i| Transaction([salt, b"-tx-", &number.to_be_bytes(), &[i]].concat()))
            .collect();
        let receipts: Vec<Receipt> = transactions
            .iter()
            .map(|tx| Receipt([b"receipt-", tx.0.as_slice()].concat()))
            .collect();
        (transactions, receipts)
    } else {
        (vec![], vec![])
    };
    let header = BlockHeader {
        parent_hash: parent.hash(),
        uncles_hash: EMPTY_LIST_HASH,
        state_root,
        transactions_root: ordered_trie_root(transactions.iter().map(|tx| tx.0.clone())),
        receipts_root: receipts_root(&receipts),
        number,
        difficulty: 1,
        timestamp: 1_600_000_000 + number,
        extra: salt.to_vec(),
    };
    (Block::new(header, transactions, vec![]), receipts)
}

/// Builds a state trie with `entries` keys into a fresh served store.
pub fn build_test_state(entries: usize, salt: &[u8]) -> (Hash, Arc<MemoryKv>) {
    let kv = Arc::new(MemoryKv::new());
    let root = grow_test_state(&kv, entries, salt, None);
    (root, kv)
}

/// Adds `entries` keys on top of `base` (or the empty trie), committing the
/// nodes into `kv` and returning the new root.
pub fn grow_test_state(
    kv: &Arc<MemoryKv>,
    entries: usize,
    salt: &[u8],
    base: Option<Hash>,
) -> Hash {
    let db = Arc::new(TrieKv::new(kv.clone() as Arc<dyn Kv>));
    let template = Trie::new(db);
    let mut trie = match base {
        Some(root) => template.at_root(root.into()),
        None => template,
    };
    for i in 0..entries as u64 {
        let key = Hash::compute(&[salt, &i.to_be_bytes()]);
        let value = [salt, b"-account-", &i.to_be_bytes(), &[0u8; 24]].concat();
        trie.insert(key.as_bytes(), &value).expect("state insert");
    }
    trie.root_hash().expect("state commit").into()
}

struct RemoteInner {
    blocks: Vec<Block>,
    receipts: Vec<Vec<Receipt>>,
    by_hash: HashMap<Hash, u64>,
}

/// The chain data a peer serves from.
pub struct RemoteChain {
    inner: Mutex<RemoteInner>,
    state: Arc<MemoryKv>,
}

impl RemoteChain {
    pub fn new(state: Arc<MemoryKv>) -> Arc<RemoteChain> {
        let genesis = genesis_block();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash(), 0);
        Arc::new(RemoteChain {
            inner: Mutex::new(RemoteInner {
                blocks: vec![genesis],
                receipts: vec![vec![]],
                by_hash,
            }),
            state,
        })
    }

    /// Appends `count` blocks carrying `state_root`.
    pub fn grow(&self, count: usize, state_root: Hash, salt: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..count {
            let parent = inner.blocks.last().unwrap().header.clone();
            let (block, receipts) = make_block(&parent, state_root, salt);
            inner.by_hash.insert(block.hash(), block.number());
            inner.blocks.push(block);
            inner.receipts.push(receipts);
        }
    }

    /// A new chain sharing every block generated so far.
    pub fn fork(&self) -> Arc<RemoteChain> {
        let inner = self.inner.lock().unwrap();
        Arc::new(RemoteChain {
            inner: Mutex::new(RemoteInner {
                blocks: inner.blocks.clone(),
                receipts: inner.receipts.clone(),
                by_hash: inner.by_hash.clone(),
            }),
            state: self.state.clone(),
        })
    }

    /// Advertised head hash and total difficulty.
    pub fn head(&self) -> (Hash, u128) {
        let inner = self.inner.lock().unwrap();
        let head = inner.blocks.last().unwrap();
        (head.hash(), inner.blocks.len() as u128)
    }

    pub fn head_number(&self) -> u64 {
        self.inner.lock().unwrap().blocks.last().unwrap().number()
    }

    pub fn block(&self, number: u64) -> Option<Block> {
        self.inner.lock().unwrap().blocks.get(number as usize).cloned()
    }

    pub fn served_state(&self) -> Arc<MemoryKv> {
        self.state.clone()
    }

    fn number_of(&self, hash: Hash) -> Option<u64> {
        self.inner.lock().unwrap().by_hash.get(&hash).copied()
    }

    fn headers_by_number(&self, origin: u64, amount: u64, skip: u64, reverse: bool) -> Vec<BlockHeader> {
        let inner = self.inner.lock().unwrap();
        let stride = skip as i128 + 1;
        let mut number = origin as i128;
        let mut headers = Vec::new();
        while (headers.len() as u64) < amount {
            if number < 0 || number as usize >= inner.blocks.len() {
                break;
            }
            headers.push(inner.blocks[number as usize].header.clone());
            number += if reverse { -stride } else { stride };
        }
        headers
    }

    fn bodies_for(&self, hashes: &[Hash]) -> Vec<BlockBody> {
        let inner = self.inner.lock().unwrap();
        hashes
            .iter()
            .filter_map(|hash| inner.by_hash.get(hash).copied())
            .map(|number| inner.blocks[number as usize].body())
            .collect()
    }

    fn receipts_for(&self, hashes: &[Hash]) -> Vec<Vec<Receipt>> {
        let inner = self.inner.lock().unwrap();
        hashes
            .iter()
            .filter_map(|hash| inner.by_hash.get(hash).copied())
            .map(|number| inner.receipts[number as usize].clone())
            .collect()
    }

    fn node_data(&self, hashes: &[Hash]) -> Vec<Vec<u8>> {
        hashes
            .iter()
            .take(MAX_STATE_FETCH)
            .filter_map(|hash| self.state.get(hash.as_bytes()).ok().flatten())
            .collect()
    }
}

struct ChainInner {
    headers: HashMap<Hash, BlockHeader>,
    blocks: HashMap<Hash, Block>,
    receipts: HashMap<Hash, Vec<Receipt>>,
    tds: HashMap<Hash, u128>,
    /// Canonical header hash per block number.
    canon: Vec<Hash>,
    header_head: Hash,
    block_head: Hash,
    fast_head: Hash,
    /// Injected header-insert failure at this block number.
    fail_header_at: Option<u64>,
}

/// The local chain store the downloader imports into.
pub struct TestChain {
    inner: Mutex<ChainInner>,
    /// When present, pivot commits verify the state root was downloaded.
    state_db: Option<Arc<MemoryKv>>,
}

impl TestChain {
    pub fn genesis_only() -> TestChain {
        Self::build(None)
    }

    pub fn with_state(state_db: Arc<MemoryKv>) -> TestChain {
        Self::build(Some(state_db))
    }

    fn build(state_db: Option<Arc<MemoryKv>>) -> TestChain {
        let genesis = genesis_block();
        let hash = genesis.hash();
        let mut headers = HashMap::new();
        headers.insert(hash, genesis.header.clone());
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);
        let mut tds = HashMap::new();
        tds.insert(hash, 1);
        TestChain {
            inner: Mutex::new(ChainInner {
                headers,
                blocks,
                receipts: HashMap::new(),
                tds,
                canon: vec![hash],
                header_head: hash,
                block_head: hash,
                fast_head: hash,
                fail_header_at: None,
            }),
            state_db,
        }
    }

    /// Seeds the local chain with the full contents of `remote`.
    pub fn preload(&self, remote: &RemoteChain) {
        let source = remote.inner.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        inner.canon.clear();
        for (block, receipts) in source.blocks.iter().zip(&source.receipts) {
            let hash = block.hash();
            inner.headers.insert(hash, block.header.clone());
            inner.blocks.insert(hash, block.clone());
            inner.receipts.insert(hash, receipts.clone());
            inner.tds.insert(hash, block.number() as u128 + 1);
            inner.canon.push(hash);
            inner.header_head = hash;
            inner.block_head = hash;
            inner.fast_head = hash;
        }
    }

    pub fn set_fail_header_at(&self, number: Option<u64>) {
        self.inner.lock().unwrap().fail_header_at = number;
    }

    /// (header head, block head, fast head) numbers.
    pub fn heads(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock().unwrap();
        (
            inner.headers[&inner.header_head].number,
            inner.headers[&inner.block_head].number,
            inner.headers[&inner.fast_head].number,
        )
    }

    pub fn canonical_hash(&self, number: u64) -> Option<Hash> {
        self.inner.lock().unwrap().canon.get(number as usize).copied()
    }
}

fn set_canon(canon: &mut Vec<Hash>, number: u64, hash: Hash) -> Result<()> {
    let index = number as usize;
    if index < canon.len() {
        canon[index] = hash;
        canon.truncate(index + 1);
    } else if index == canon.len() {
        canon.push(hash);
    } else {
        return Err(anyhow!("non-contiguous canonical insert at {number}"));
    }
    Ok(())
}

impl LightChain for TestChain {
    fn has_header(&self, hash: Hash, number: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .headers
            .get(&hash)
            .is_some_and(|h| h.number == number)
    }

    fn get_header_by_hash(&self, hash: Hash) -> Option<BlockHeader> {
        self.inner.lock().unwrap().headers.get(&hash).cloned()
    }

    fn current_header(&self) -> BlockHeader {
        let inner = self.inner.lock().unwrap();
        inner.headers[&inner.header_head].clone()
    }

    fn get_td(&self, hash: Hash, _number: u64) -> Option<u128> {
        self.inner.lock().unwrap().tds.get(&hash).copied()
    }

    fn insert_header_chain(
        &self,
        headers: &[BlockHeader],
        _verify_freq: usize,
    ) -> (usize, Result<()>) {
        let mut inner = self.inner.lock().unwrap();
        for (i, header) in headers.iter().enumerate() {
            if inner.fail_header_at == Some(header.number) {
                return (i, Err(anyhow!("injected header failure at {}", header.number)));
            }
            let Some(parent_td) = inner.tds.get(&header.parent_hash).copied() else {
                return (i, Err(anyhow!("unknown parent header")));
            };
            let hash = header.hash();
            if let Err(err) = set_canon(&mut inner.canon, header.number, hash) {
                return (i, Err(err));
            }
            inner.headers.insert(hash, header.clone());
            inner.tds.insert(hash, parent_td + header.difficulty);
            inner.header_head = hash;
        }
        (headers.len(), Ok(()))
    }

    fn rollback(&self, hashes: &[Hash]) {
        let mut inner = self.inner.lock().unwrap();
        let mut lowest = u64::MAX;
        for hash in hashes {
            if let Some(header) = inner.headers.remove(hash) {
                lowest = lowest.min(header.number);
                inner.blocks.remove(hash);
                inner.receipts.remove(hash);
                inner.tds.remove(hash);
            }
        }
        if lowest == u64::MAX {
            return;
        }
        inner.canon.truncate(lowest as usize);
        let head = *inner.canon.last().expect("genesis never rolls back");
        inner.header_head = head;
        let block_stale = inner
            .headers
            .get(&inner.block_head)
            .map_or(true, |h| h.number >= lowest);
        if block_stale {
            inner.block_head = head;
        }
        let fast_stale = inner
            .headers
            .get(&inner.fast_head)
            .map_or(true, |h| h.number >= lowest);
        if fast_stale {
            inner.fast_head = head;
        }
    }
}

impl BlockChain for TestChain {
    fn has_block(&self, hash: Hash, number: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .get(&hash)
            .is_some_and(|b| b.number() == number)
    }

    fn get_block_by_hash(&self, hash: Hash) -> Option<Block> {
        self.inner.lock().unwrap().blocks.get(&hash).cloned()
    }

    fn current_block(&self) -> BlockHeader {
        let inner = self.inner.lock().unwrap();
        inner.headers[&inner.block_head].clone()
    }

    fn current_fast_block(&self) -> BlockHeader {
        let inner = self.inner.lock().unwrap();
        inner.headers[&inner.fast_head].clone()
    }

    fn fast_sync_commit_head(&self, hash: Hash) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(header) = inner.headers.get(&hash).cloned() else {
            return Err(anyhow!("unknown fast sync head"));
        };
        if let Some(state_db) = &self.state_db {
            if header.state_root != EMPTY_ROOT_HASH
                && state_db.get(header.state_root.as_bytes())?.is_none()
            {
                return Err(anyhow!("state root {} not downloaded", header.state_root));
            }
        }
        inner.block_head = hash;
        Ok(())
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> (usize, Result<()>) {
        let mut inner = self.inner.lock().unwrap();
        for (i, block) in blocks.iter().enumerate() {
            let header = &block.header;
            let Some(parent_td) = inner.tds.get(&header.parent_hash).copied() else {
                return (i, Err(anyhow!("unknown parent block")));
            };
            if !inner.blocks.contains_key(&header.parent_hash) {
                return (i, Err(anyhow!("parent not fully imported")));
            }
            let hash = block.hash();
            if let Err(err) = set_canon(&mut inner.canon, header.number, hash) {
                return (i, Err(err));
            }
            inner.headers.insert(hash, header.clone());
            inner.blocks.insert(hash, block.clone());
            inner.tds.insert(hash, parent_td + header.difficulty);
            inner.header_head = hash;
            inner.block_head = hash;
            inner.fast_head = hash;
        }
        (blocks.len(), Ok(()))
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> (usize, Result<()>) {
        let mut inner = self.inner.lock().unwrap();
        for (i, (block, receipts)) in blocks.iter().zip(receipts).enumerate() {
            let hash = block.hash();
            if !inner.headers.contains_key(&hash) {
                return (i, Err(anyhow!("receipt import for unknown header")));
            }
            inner.blocks.insert(hash, block.clone());
            inner.receipts.insert(hash, receipts);
            inner.fast_head = hash;
        }
        (blocks.len(), Ok(()))
    }
}

/// Options for a [`TestPeer`].
pub struct TestPeerOptions {
    /// Latency on header/body/receipt responses.
    pub delay: Duration,
    /// Latency on node-data responses; larger values keep state download
    /// running while blocks race ahead.
    pub state_delay: Duration,
    /// Stop answering header requests after this many responses.
    pub silent_after_headers: Option<usize>,
    /// Serve bodies whose transactions do not match the header commitment.
    pub corrupt_bodies: bool,
}

impl Default for TestPeerOptions {
    fn default() -> Self {
        TestPeerOptions {
            delay: Duration::from_millis(1),
            state_delay: Duration::from_millis(1),
            silent_after_headers: None,
            corrupt_bodies: false,
        }
    }
}

/// A network peer answering requests from a [`RemoteChain`]. Every request
/// and response passes through the wire codec, as it would on a real link.
pub struct TestPeer {
    pub id: PeerId,
    chain: Arc<RemoteChain>,
    dl: Arc<Downloader>,
    opts: TestPeerOptions,
    served_headers: AtomicUsize,
}

impl TestPeer {
    pub fn new(dl: &Arc<Downloader>, chain: &Arc<RemoteChain>) -> Arc<TestPeer> {
        Self::with_options(dl, chain, TestPeerOptions::default())
    }

    pub fn with_options(
        dl: &Arc<Downloader>,
        chain: &Arc<RemoteChain>,
        opts: TestPeerOptions,
    ) -> Arc<TestPeer> {
        Arc::new(TestPeer {
            id: PeerId::random(),
            chain: chain.clone(),
            dl: dl.clone(),
            opts,
            served_headers: AtomicUsize::new(0),
        })
    }

    pub fn register(self: &Arc<Self>) -> SyncResult<()> {
        self.dl.register_peer(self.id, 63, self.clone())
    }

    fn respond_headers(&self, headers: Vec<BlockHeader>) {
        if let Some(limit) = self.opts.silent_after_headers {
            if self.served_headers.fetch_add(1, Ordering::SeqCst) >= limit {
                return;
            }
        }
        let dl = self.dl.clone();
        let id = self.id;
        let delay = self.opts.delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = dl.deliver_headers(id, headers).await;
        });
    }
}

/// Round-trips a message through the wire encoding, as a transport would.
fn wire(message: SyncMessage) -> SyncMessage {
    SyncMessage::decode(&message.encode()).expect("wire round trip")
}

impl PeerClient for TestPeer {
    fn head(&self) -> (Hash, u128) {
        self.chain.head()
    }

    fn request_headers_by_hash(
        &self,
        origin: Hash,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<()> {
        let request = wire(SyncMessage::GetBlockHeaders {
            origin: HashOrNumber::Hash(origin),
            amount: amount as u64,
            skip: skip as u64,
            reverse,
        });
        let SyncMessage::GetBlockHeaders { origin: HashOrNumber::Hash(origin), amount, skip, reverse } = request else {
            unreachable!()
        };
        let headers = match self.chain.number_of(origin) {
            Some(number) => self.chain.headers_by_number(number, amount, skip, reverse),
            None => vec![],
        };
        let SyncMessage::BlockHeaders(headers) = wire(SyncMessage::BlockHeaders(headers)) else {
            unreachable!()
        };
        self.respond_headers(headers);
        Ok(())
    }

    fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<()> {
        let request = wire(SyncMessage::GetBlockHeaders {
            origin: HashOrNumber::Number(origin),
            amount: amount as u64,
            skip: skip as u64,
            reverse,
        });
        let SyncMessage::GetBlockHeaders { origin: HashOrNumber::Number(origin), amount, skip, reverse } = request else {
            unreachable!()
        };
        let headers = self.chain.headers_by_number(origin, amount, skip, reverse);
        let SyncMessage::BlockHeaders(headers) = wire(SyncMessage::BlockHeaders(headers)) else {
            unreachable!()
        };
        self.respond_headers(headers);
        Ok(())
    }

    fn request_bodies(&self, hashes: Vec<Hash>) -> Result<()> {
        let SyncMessage::GetBlockBodies(hashes) = wire(SyncMessage::GetBlockBodies(hashes)) else {
            unreachable!()
        };
        let mut bodies = self.chain.bodies_for(&hashes);
        if self.opts.corrupt_bodies {
            for body in &mut bodies {
                if !body.transactions.is_empty() {
                    body.transactions = vec![Transaction(b"tampered".to_vec())];
                }
            }
        }
        let SyncMessage::BlockBodies(bodies) = wire(SyncMessage::BlockBodies(bodies)) else {
            unreachable!()
        };
        let dl = self.dl.clone();
        let id = self.id;
        let delay = self.opts.delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = dl.deliver_bodies(id, bodies).await;
        });
        Ok(())
    }

    fn request_receipts(&self, hashes: Vec<Hash>) -> Result<()> {
        let SyncMessage::GetReceipts(hashes) = wire(SyncMessage::GetReceipts(hashes)) else {
            unreachable!()
        };
        let receipts = self.chain.receipts_for(&hashes);
        let SyncMessage::Receipts(receipts) = wire(SyncMessage::Receipts(receipts)) else {
            unreachable!()
        };
        let dl = self.dl.clone();
        let id = self.id;
        let delay = self.opts.delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = dl.deliver_receipts(id, receipts).await;
        });
        Ok(())
    }

    fn request_node_data(&self, hashes: Vec<Hash>) -> Result<()> {
        let SyncMessage::GetNodeData(hashes) = wire(SyncMessage::GetNodeData(hashes)) else {
            unreachable!()
        };
        let data = self.chain.node_data(&hashes);
        let SyncMessage::NodeData(data) = wire(SyncMessage::NodeData(data)) else {
            unreachable!()
        };
        let dl = self.dl.clone();
        let id = self.id;
        let delay = self.opts.state_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = dl.deliver_node_data(id, data).await;
        });
        Ok(())
    }
}

/// Records peers the downloader asked to drop, and disconnects them.
#[derive(Default)]
pub struct DroppedPeers {
    list: Mutex<Vec<PeerId>>,
    dl: OnceLock<Weak<Downloader>>,
}

impl DroppedPeers {
    pub fn new() -> Arc<DroppedPeers> {
        Arc::new(DroppedPeers::default())
    }

    pub fn bind(&self, dl: &Arc<Downloader>) {
        let _ = self.dl.set(Arc::downgrade(dl));
    }

    pub fn record(&self, id: PeerId) {
        self.list.lock().unwrap().push(id);
        if let Some(dl) = self.dl.get().and_then(Weak::upgrade) {
            let _ = dl.unregister_peer(id);
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.list.lock().unwrap().contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().unwrap().is_empty()
    }
}

/// A downloader wired against an in-memory chain and state store.
pub struct Harness {
    pub dl: Arc<Downloader>,
    pub chain: Arc<TestChain>,
    pub state_db: Arc<MemoryKv>,
    pub dropped: Arc<DroppedPeers>,
}

pub fn harness(cfg: SyncConfig) -> Harness {
    let state_db = Arc::new(MemoryKv::new());
    let chain = Arc::new(TestChain::with_state(state_db.clone()));
    let dropped = DroppedPeers::new();
    let dl = Downloader::new(cfg, state_db.clone(), chain.clone(), {
        let dropped = dropped.clone();
        move |id| dropped.record(id)
    });
    dropped.bind(&dl);
    Harness {
        dl,
        chain,
        state_db,
        dropped,
    }
}
