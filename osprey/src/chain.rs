//! Local chain store interfaces the downloader imports into.
//!
//! The sync engine never touches block storage directly; everything goes
//! through these traits so the engine can be driven against any backend
//! (including the in-memory harness used by the tests).

use anyhow::Result;

use crate::{
    crypto::Hash,
    message::{Block, BlockHeader, Receipt},
};

/// Functions required to synchronise a header-only (light) chain.
pub trait LightChain: Send + Sync {
    fn has_header(&self, hash: Hash, number: u64) -> bool;

    fn get_header_by_hash(&self, hash: Hash) -> Option<BlockHeader>;

    /// Head header of the local chain.
    fn current_header(&self) -> BlockHeader;

    /// Total difficulty of a local block.
    fn get_td(&self, hash: Hash, number: u64) -> Option<u128>;

    /// Inserts a batch of headers, cryptographically verifying every
    /// `verify_freq`-th one (and all of them when `verify_freq` is 1).
    /// Returns how many headers were inserted before any failure.
    fn insert_header_chain(&self, headers: &[BlockHeader], verify_freq: usize)
        -> (usize, Result<()>);

    /// Removes recently inserted headers, undoing speculative inserts.
    fn rollback(&self, hashes: &[Hash]);
}

/// Functions required to sync a full or fast blockchain.
pub trait BlockChain: LightChain {
    fn has_block(&self, hash: Hash, number: u64) -> bool;

    fn get_block_by_hash(&self, hash: Hash) -> Option<Block>;

    /// Header of the head block of the fully-imported chain.
    fn current_block(&self) -> BlockHeader;

    /// Header of the head block of the fast-sync chain (data present, state
    /// not necessarily executed).
    fn current_fast_block(&self) -> BlockHeader;

    /// Promotes a fast-synced block to the chain head once its state is
    /// fully downloaded.
    fn fast_sync_commit_head(&self, hash: Hash) -> Result<()>;

    /// Executes and imports a batch of blocks. Returns how many were
    /// imported before any failure.
    fn insert_chain(&self, blocks: Vec<Block>) -> (usize, Result<()>);

    /// Imports blocks with their receipts, skipping execution. Used below
    /// the fast-sync pivot.
    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> (usize, Result<()>);
}

/// Read-only snapshot of a running (or finished) synchronisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Block number where this sync cycle started.
    pub starting_block: u64,
    /// Current head, per the active sync mode.
    pub current_block: u64,
    /// Highest block number advertised by the sync target.
    pub highest_block: u64,
    /// State trie entries downloaded so far (fast sync only).
    pub pulled_states: u64,
    /// Total state trie entries known about so far (fast sync only).
    pub known_states: u64,
}
