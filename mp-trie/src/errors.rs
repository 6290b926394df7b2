use alloy::primitives::B256;

use crate::rlp::RlpError;

pub type TrieResult<T> = Result<T, TrieError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrieError {
    #[error("database error: {0}")]
    Db(String),
    #[error("invalid RLP: {0}")]
    Rlp(#[from] RlpError),
    /// A structurally invalid node encoding. `path` is the breadcrumb trail
    /// down to the offending child, e.g. `full[3]<-short.val`.
    #[error("invalid node encoding: {cause} (decode path: {path})")]
    InvalidEncoding { path: String, cause: String },
    /// A hash reference whose node is in neither memory nor the database.
    #[error("missing trie node {node_hash} (root {root_hash})")]
    MissingNode { node_hash: B256, root_hash: B256 },
    #[error("invalid merkle proof")]
    InvalidProof,
}
