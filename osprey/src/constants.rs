use std::time::Duration;

use crate::crypto::Hash;

// Amount of block headers to be fetched per retrieval request.
pub const MAX_HEADER_FETCH: usize = 192;

// Number of header fetches needed for a skeleton assembly.
pub const MAX_SKELETON_SIZE: usize = 128;

// Amount of block bodies to be fetched per retrieval request.
pub const MAX_BODY_FETCH: usize = 128;

// Amount of transaction receipts to allow fetching per request.
pub const MAX_RECEIPT_FETCH: usize = 256;

// Amount of state trie nodes to allow fetching per request.
pub const MAX_STATE_FETCH: usize = 384;

// Maximum number of headers to queue for import (DOS protection).
pub const MAX_QUEUED_HEADERS: usize = 32 * 1024;

// Number of header download results to import at once into the chain.
pub const MAX_HEADERS_PROCESS: usize = 2048;

// Number of content download results to import at once into the chain.
pub const MAX_RESULTS_PROCESS: usize = 2048;

// Download result slots held in memory before throttling the fetchers.
pub const BLOCK_CACHE_ITEMS: usize = 8192;

// Blocks per epoch. Three epochs bound the permitted reorganisation depth.
pub const EPOCH_DURATION: u64 = 30_000;
pub const MAX_FORK_ANCESTRY: u64 = 3 * EPOCH_DURATION;

// Round-trip time bounds for download requests.
pub const RTT_MIN_ESTIMATE: Duration = Duration::from_secs(2);
pub const RTT_MAX_ESTIMATE: Duration = Duration::from_secs(20);

// Worst confidence factor in the estimated RTT value.
pub const RTT_MIN_CONFIDENCE: f64 = 0.1;

// Constant scaling factor for RTT -> TTL conversion, and the TTL cap.
pub const TTL_SCALING: u32 = 3;
pub const TTL_LIMIT: Duration = Duration::from_secs(60);

// Number of best peers to tune the RTT estimate on.
pub const QOS_TUNING_PEERS: usize = 5;

// Number of peers above which joins no longer reduce RTT confidence.
pub const QOS_CONFIDENCE_CAP: usize = 10;

// Impact a new tuning target has on the previous estimate.
pub const QOS_TUNING_IMPACT: f64 = 0.25;

// Verification frequency of downloaded headers during fast sync.
pub const FS_HEADER_CHECK_FREQUENCY: usize = 100;

// Number of headers to discard when a chain violation is detected.
pub const FS_HEADER_SAFETY_NET: usize = 2048;

// Headers before and after the pivot that are always fully verified.
pub const FS_HEADER_FORCE_VERIFY: u64 = 24;

// Interval for re-polling the master for header continuations while the
// pivot state is still downloading.
pub const FS_HEADER_CONT_CHECK: Duration = Duration::from_secs(3);

// Number of blocks to retrieve fully even in fast sync. The pivot sits this
// far below the remote head so the tail is always executed.
pub const FS_MIN_FULL_BLOCKS: u64 = 64;

// Minimum protocol version a sync peer must speak.
pub const MIN_PROTOCOL_VERSION: u32 = 62;

/// keccak256 of the RLP empty string: the root of an empty trie. A header
/// whose transaction or receipt root equals this has no content to fetch.
pub const EMPTY_ROOT_HASH: Hash = Hash([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

/// keccak256 of the RLP empty list: the hash of an empty uncle set.
pub const EMPTY_LIST_HASH: Hash = Hash([
    0x1d, 0xcc, 0x4d, 0xe8, 0xde, 0xc7, 0x5d, 0x7a, 0xab, 0x85, 0xb5, 0x67, 0xb6, 0xcc, 0xd4,
    0x1a, 0xd3, 0x12, 0x45, 0x1b, 0x94, 0x8a, 0x74, 0x13, 0xf0, 0xa1, 0x42, 0xfd, 0x40, 0xd4,
    0x93, 0x47,
]);

#[cfg(test)]
mod tests {
    use super::*;
    use mp_trie::rlp;

    #[test]
    fn well_known_hashes() {
        assert_eq!(Hash::compute(&[&[rlp::EMPTY_STRING_CODE]]), EMPTY_ROOT_HASH);
        assert_eq!(Hash::compute(&[&[0xc0]]), EMPTY_LIST_HASH);
    }
}
