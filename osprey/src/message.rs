//! Block data model and the sync wire messages.
//!
//! Every message is a canonical RLP list (see the trie crate's `rlp`
//! module), tagged with its protocol code byte. Transactions and receipts
//! are opaque payloads at this layer; headers commit to them through
//! index-keyed trie roots.

use std::sync::Arc;

use mp_trie::{
    rlp::{self, RlpError, RlpResult},
    MemoryDB, Trie,
};
use serde::{Deserialize, Serialize};

use crate::{
    constants::{EMPTY_LIST_HASH, EMPTY_ROOT_HASH},
    crypto::Hash,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Download and execute every block.
    #[default]
    Full,
    /// Download headers, bodies and receipts; fetch the state trie at the
    /// pivot and execute only the tail.
    Fast,
    /// Headers only.
    Light,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: Hash,
    pub uncles_hash: Hash,
    pub state_root: Hash,
    pub transactions_root: Hash,
    pub receipts_root: Hash,
    pub number: u64,
    pub difficulty: u128,
    pub timestamp: u64,
    pub extra: Vec<u8>,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        Hash::compute(&[&self.encode()])
    }

    /// Headers with the empty transaction root and uncle hash have no body
    /// on the wire.
    pub fn has_body(&self) -> bool {
        self.transactions_root != EMPTY_ROOT_HASH || self.uncles_hash != EMPTY_LIST_HASH
    }

    pub fn has_receipts(&self) -> bool {
        self.receipts_root != EMPTY_ROOT_HASH
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.rlp_append(&mut out);
        out
    }

    pub fn rlp_append(&self, out: &mut Vec<u8>) {
        rlp::append_list(out, |payload| {
            rlp::append_bytes(payload, self.parent_hash.as_bytes());
            rlp::append_bytes(payload, self.uncles_hash.as_bytes());
            rlp::append_bytes(payload, self.state_root.as_bytes());
            rlp::append_bytes(payload, self.transactions_root.as_bytes());
            rlp::append_bytes(payload, self.receipts_root.as_bytes());
            rlp::append_u64(payload, self.number);
            rlp::append_u128(payload, self.difficulty);
            rlp::append_u64(payload, self.timestamp);
            rlp::append_bytes(payload, &self.extra);
        });
    }

    pub fn decode(buf: &[u8]) -> RlpResult<BlockHeader> {
        let (header, rest) = Self::rlp_split(buf)?;
        if !rest.is_empty() {
            return Err(RlpError::TrailingBytes);
        }
        Ok(header)
    }

    fn rlp_split(buf: &[u8]) -> RlpResult<(BlockHeader, &[u8])> {
        let (payload, rest) = rlp::split_list(buf)?;
        let (parent_hash, payload) = split_hash(payload)?;
        let (uncles_hash, payload) = split_hash(payload)?;
        let (state_root, payload) = split_hash(payload)?;
        let (transactions_root, payload) = split_hash(payload)?;
        let (receipts_root, payload) = split_hash(payload)?;
        let (number, payload) = rlp::split_u64(payload)?;
        let (difficulty, payload) = rlp::split_u128(payload)?;
        let (timestamp, payload) = rlp::split_u64(payload)?;
        let (extra, payload) = rlp::split_bytes(payload)?;
        if !payload.is_empty() {
            return Err(RlpError::TrailingBytes);
        }
        Ok((
            BlockHeader {
                parent_hash,
                uncles_hash,
                state_root,
                transactions_root,
                receipts_root,
                number,
                difficulty,
                timestamp,
                extra: extra.to_vec(),
            },
            rest,
        ))
    }
}

/// An opaque, already-encoded transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction(pub Vec<u8>);

/// An opaque, already-encoded receipt payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn transactions_root(&self) -> Hash {
        ordered_trie_root(self.transactions.iter().map(|tx| tx.0.clone()))
    }

    pub fn uncles_hash(&self) -> Hash {
        uncles_hash(&self.uncles)
    }

    fn rlp_append(&self, out: &mut Vec<u8>) {
        rlp::append_list(out, |payload| {
            rlp::append_list(payload, |txs| {
                for tx in &self.transactions {
                    rlp::append_bytes(txs, &tx.0);
                }
            });
            rlp::append_list(payload, |uncles| {
                for uncle in &self.uncles {
                    uncle.rlp_append(uncles);
                }
            });
        });
    }

    fn rlp_split(buf: &[u8]) -> RlpResult<(BlockBody, &[u8])> {
        let (payload, rest) = rlp::split_list(buf)?;
        let (mut tx_payload, payload) = rlp::split_list(payload)?;
        let mut transactions = Vec::new();
        while !tx_payload.is_empty() {
            let (tx, next) = rlp::split_bytes(tx_payload)?;
            transactions.push(Transaction(tx.to_vec()));
            tx_payload = next;
        }
        let (mut uncle_payload, payload) = rlp::split_list(payload)?;
        let mut uncles = Vec::new();
        while !uncle_payload.is_empty() {
            let (uncle, next) = BlockHeader::rlp_split(uncle_payload)?;
            uncles.push(uncle);
            uncle_payload = next;
        }
        if !payload.is_empty() {
            return Err(RlpError::TrailingBytes);
        }
        Ok((BlockBody { transactions, uncles }, rest))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<BlockHeader>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>, uncles: Vec<BlockHeader>) -> Block {
        Block {
            header,
            transactions,
            uncles,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn body(&self) -> BlockBody {
        BlockBody {
            transactions: self.transactions.clone(),
            uncles: self.uncles.clone(),
        }
    }
}

/// Root of the index-keyed trie over `items`, the commitment headers carry
/// for their transaction and receipt lists.
pub fn ordered_trie_root(items: impl IntoIterator<Item = Vec<u8>>) -> Hash {
    let mut trie = Trie::new(Arc::new(MemoryDB::new(true)));
    for (index, item) in items.into_iter().enumerate() {
        let mut key = Vec::new();
        rlp::append_u64(&mut key, index as u64);
        trie.insert(&key, &item)
            .expect("in-memory trie operations cannot fail");
    }
    trie.root_hash()
        .expect("in-memory trie operations cannot fail")
        .into()
}

pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    ordered_trie_root(receipts.iter().map(|r| r.0.clone()))
}

pub fn uncles_hash(uncles: &[BlockHeader]) -> Hash {
    let mut out = Vec::new();
    rlp::append_list(&mut out, |payload| {
        for uncle in uncles {
            uncle.rlp_append(payload);
        }
    });
    Hash::compute(&[&out])
}

/// Origin selector for header requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(Hash),
    Number(u64),
}

/// The sync protocol messages, tagged with their protocol code byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    GetBlockHeaders {
        origin: HashOrNumber,
        amount: u64,
        skip: u64,
        reverse: bool,
    },
    BlockHeaders(Vec<BlockHeader>),
    GetBlockBodies(Vec<Hash>),
    BlockBodies(Vec<BlockBody>),
    GetNodeData(Vec<Hash>),
    NodeData(Vec<Vec<u8>>),
    GetReceipts(Vec<Hash>),
    Receipts(Vec<Vec<Receipt>>),
}

const GET_BLOCK_HEADERS: u8 = 0x03;
const BLOCK_HEADERS: u8 = 0x04;
const GET_BLOCK_BODIES: u8 = 0x05;
const BLOCK_BODIES: u8 = 0x06;
const GET_NODE_DATA: u8 = 0x0d;
const NODE_DATA: u8 = 0x0e;
const GET_RECEIPTS: u8 = 0x0f;
const RECEIPTS: u8 = 0x10;

impl SyncMessage {
    pub fn code(&self) -> u8 {
        match self {
            SyncMessage::GetBlockHeaders { .. } => GET_BLOCK_HEADERS,
            SyncMessage::BlockHeaders(_) => BLOCK_HEADERS,
            SyncMessage::GetBlockBodies(_) => GET_BLOCK_BODIES,
            SyncMessage::BlockBodies(_) => BLOCK_BODIES,
            SyncMessage::GetNodeData(_) => GET_NODE_DATA,
            SyncMessage::NodeData(_) => NODE_DATA,
            SyncMessage::GetReceipts(_) => GET_RECEIPTS,
            SyncMessage::Receipts(_) => RECEIPTS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.code()];
        match self {
            SyncMessage::GetBlockHeaders {
                origin,
                amount,
                skip,
                reverse,
            } => {
                rlp::append_list(&mut out, |payload| {
                    match origin {
                        HashOrNumber::Hash(hash) => rlp::append_bytes(payload, hash.as_bytes()),
                        HashOrNumber::Number(number) => rlp::append_u64(payload, *number),
                    }
                    rlp::append_u64(payload, *amount);
                    rlp::append_u64(payload, *skip);
                    rlp::append_u64(payload, *reverse as u64);
                });
            }
            SyncMessage::BlockHeaders(headers) => {
                rlp::append_list(&mut out, |payload| {
                    for header in headers {
                        header.rlp_append(payload);
                    }
                });
            }
            SyncMessage::GetBlockBodies(hashes)
            | SyncMessage::GetNodeData(hashes)
            | SyncMessage::GetReceipts(hashes) => {
                rlp::append_list(&mut out, |payload| {
                    for hash in hashes {
                        rlp::append_bytes(payload, hash.as_bytes());
                    }
                });
            }
            SyncMessage::BlockBodies(bodies) => {
                rlp::append_list(&mut out, |payload| {
                    for body in bodies {
                        body.rlp_append(payload);
                    }
                });
            }
            SyncMessage::NodeData(items) => {
                rlp::append_list(&mut out, |payload| {
                    for item in items {
                        rlp::append_bytes(payload, item);
                    }
                });
            }
            SyncMessage::Receipts(lists) => {
                rlp::append_list(&mut out, |payload| {
                    for list in lists {
                        rlp::append_list(payload, |inner| {
                            for receipt in list {
                                rlp::append_bytes(inner, &receipt.0);
                            }
                        });
                    }
                });
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> RlpResult<SyncMessage> {
        let (&code, body) = buf.split_first().ok_or(RlpError::UnexpectedEof)?;
        let (payload, rest) = rlp::split_list(body)?;
        if !rest.is_empty() {
            return Err(RlpError::TrailingBytes);
        }
        match code {
            GET_BLOCK_HEADERS => {
                let (origin_raw, payload) = rlp::split_bytes(payload)?;
                let origin = if origin_raw.len() == 32 {
                    HashOrNumber::Hash(to_hash(origin_raw)?)
                } else {
                    HashOrNumber::Number(decode_uint(origin_raw)?)
                };
                let (amount, payload) = rlp::split_u64(payload)?;
                let (skip, payload) = rlp::split_u64(payload)?;
                let (reverse, payload) = rlp::split_u64(payload)?;
                if !payload.is_empty() || reverse > 1 {
                    return Err(RlpError::UnexpectedLength);
                }
                Ok(SyncMessage::GetBlockHeaders {
                    origin,
                    amount,
                    skip,
                    reverse: reverse == 1,
                })
            }
            BLOCK_HEADERS => {
                let mut payload = payload;
                let mut headers = Vec::new();
                while !payload.is_empty() {
                    let (header, next) = BlockHeader::rlp_split(payload)?;
                    headers.push(header);
                    payload = next;
                }
                Ok(SyncMessage::BlockHeaders(headers))
            }
            GET_BLOCK_BODIES | GET_NODE_DATA | GET_RECEIPTS => {
                let mut payload = payload;
                let mut hashes = Vec::new();
                while !payload.is_empty() {
                    let (raw, next) = rlp::split_bytes(payload)?;
                    hashes.push(to_hash(raw)?);
                    payload = next;
                }
                Ok(match code {
                    GET_BLOCK_BODIES => SyncMessage::GetBlockBodies(hashes),
                    GET_NODE_DATA => SyncMessage::GetNodeData(hashes),
                    _ => SyncMessage::GetReceipts(hashes),
                })
            }
            BLOCK_BODIES => {
                let mut payload = payload;
                let mut bodies = Vec::new();
                while !payload.is_empty() {
                    let (item, next) = BlockBody::rlp_split(payload)?;
                    bodies.push(item);
                    payload = next;
                }
                Ok(SyncMessage::BlockBodies(bodies))
            }
            NODE_DATA => {
                let mut payload = payload;
                let mut items = Vec::new();
                while !payload.is_empty() {
                    let (raw, next) = rlp::split_bytes(payload)?;
                    items.push(raw.to_vec());
                    payload = next;
                }
                Ok(SyncMessage::NodeData(items))
            }
            RECEIPTS => {
                let mut payload = payload;
                let mut lists = Vec::new();
                while !payload.is_empty() {
                    let (mut inner, next) = rlp::split_list(payload)?;
                    let mut receipts = Vec::new();
                    while !inner.is_empty() {
                        let (raw, after) = rlp::split_bytes(inner)?;
                        receipts.push(Receipt(raw.to_vec()));
                        inner = after;
                    }
                    lists.push(receipts);
                    payload = next;
                }
                Ok(SyncMessage::Receipts(lists))
            }
            _ => Err(RlpError::UnexpectedLength),
        }
    }
}

fn split_hash(buf: &[u8]) -> RlpResult<(Hash, &[u8])> {
    let (raw, rest) = rlp::split_bytes(buf)?;
    Ok((to_hash(raw)?, rest))
}

fn to_hash(raw: &[u8]) -> RlpResult<Hash> {
    let bytes: [u8; 32] = raw.try_into().map_err(|_| RlpError::UnexpectedLength)?;
    Ok(Hash(bytes))
}

fn decode_uint(raw: &[u8]) -> RlpResult<u64> {
    if raw.len() > 8 {
        return Err(RlpError::UintOverflow);
    }
    if raw.first() == Some(&0) {
        return Err(RlpError::NonCanonicalInteger);
    }
    let mut v = 0u64;
    for &b in raw {
        v = (v << 8) | b as u64;
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(number: u64) -> BlockHeader {
        BlockHeader {
            parent_hash: Hash::compute(&[b"parent", &number.to_be_bytes()]),
            uncles_hash: EMPTY_LIST_HASH,
            state_root: Hash::compute(&[b"state"]),
            transactions_root: EMPTY_ROOT_HASH,
            receipts_root: EMPTY_ROOT_HASH,
            number,
            difficulty: 131_072,
            timestamp: 1_600_000_000 + number,
            extra: b"osprey".to_vec(),
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header(42);
        let encoded = header.encode();
        assert_eq!(BlockHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn header_hash_changes_with_contents() {
        let a = sample_header(1);
        let mut b = a.clone();
        b.timestamp += 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn empty_roots_mean_no_content() {
        let header = sample_header(1);
        assert!(!header.has_body());
        assert!(!header.has_receipts());

        let body = BlockBody::default();
        assert_eq!(body.transactions_root(), EMPTY_ROOT_HASH);
        assert_eq!(body.uncles_hash(), EMPTY_LIST_HASH);
    }

    #[test]
    fn body_roots_commit_to_contents() {
        let body = BlockBody {
            transactions: vec![
                Transaction(b"tx-one-payload".to_vec()),
                Transaction(b"tx-two-payload".to_vec()),
            ],
            uncles: vec![],
        };
        let root = body.transactions_root();
        assert_ne!(root, EMPTY_ROOT_HASH);

        let reordered = BlockBody {
            transactions: vec![
                Transaction(b"tx-two-payload".to_vec()),
                Transaction(b"tx-one-payload".to_vec()),
            ],
            uncles: vec![],
        };
        assert_ne!(reordered.transactions_root(), root);
    }

    #[test]
    fn message_round_trips() {
        let messages = vec![
            SyncMessage::GetBlockHeaders {
                origin: HashOrNumber::Number(1234),
                amount: 192,
                skip: 15,
                reverse: false,
            },
            SyncMessage::GetBlockHeaders {
                origin: HashOrNumber::Hash(Hash::compute(&[b"head"])),
                amount: 1,
                skip: 0,
                reverse: true,
            },
            SyncMessage::BlockHeaders(vec![sample_header(1), sample_header(2)]),
            SyncMessage::GetBlockBodies(vec![Hash::compute(&[b"a"]), Hash::compute(&[b"b"])]),
            SyncMessage::BlockBodies(vec![BlockBody {
                transactions: vec![Transaction(b"tx".to_vec())],
                uncles: vec![sample_header(9)],
            }]),
            SyncMessage::GetNodeData(vec![Hash::compute(&[b"node"])]),
            SyncMessage::NodeData(vec![b"blob-1".to_vec(), b"blob-2".to_vec()]),
            SyncMessage::GetReceipts(vec![Hash::compute(&[b"r"])]),
            SyncMessage::Receipts(vec![vec![Receipt(b"receipt".to_vec())], vec![]]),
        ];
        for message in messages {
            let encoded = message.encode();
            assert_eq!(SyncMessage::decode(&encoded).unwrap(), message, "{message:?}");
        }
    }

    #[test]
    fn message_decode_rejects_garbage() {
        assert!(SyncMessage::decode(&[]).is_err());
        assert!(SyncMessage::decode(&[0x42, 0xc0]).is_err());
        // Truncated payload.
        let mut encoded = SyncMessage::BlockHeaders(vec![sample_header(1)]).encode();
        encoded.truncate(encoded.len() - 3);
        assert!(SyncMessage::decode(&encoded).is_err());
    }
}
