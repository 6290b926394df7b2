pub type SyncResult<T> = Result<T, SyncError>;

/// Failure taxonomy of the synchronization engine. Which kinds drop the
/// offending peer or abort the running cycle is decided by the callers; the
/// helpers below keep that policy in one place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("busy")]
    Busy,
    #[error("peer is unknown or unhealthy")]
    UnknownPeer,
    #[error("peer is already registered")]
    AlreadyRegistered,
    #[error("peer doesn't speak a recent enough protocol version (need version >= 62)")]
    TooOld,
    #[error("action from bad peer ignored")]
    BadPeer,
    #[error("peer is stalling")]
    StallingPeer,
    #[error("no peers to keep download active")]
    NoPeers,
    #[error("timeout")]
    Timeout,
    #[error("empty header set by peer")]
    EmptyHeaderSet,
    #[error("no peers available or all tried for download")]
    PeersUnavailable,
    #[error("retrieved ancestor is invalid")]
    InvalidAncestor,
    #[error("retrieved hash chain is invalid")]
    InvalidChain,
    #[error("retrieved block is invalid")]
    InvalidBlock,
    #[error("retrieved block body is invalid")]
    InvalidBody,
    #[error("retrieved receipt is invalid")]
    InvalidReceipt,
    /// The delivery matched no live reservation; the packet is discarded.
    #[error("delivered data is stale")]
    StaleDelivery,
    /// The delivery was matched but rejected; the task goes back to pending.
    #[error("delivery not accepted")]
    DeliveryNotAccepted,
    #[error("sync cancelled")]
    Cancelled,
    #[error("no sync active")]
    NoSyncActive,
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Failures that make the serving peer unusable: the caller drops it.
    pub fn drops_peer(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout
                | SyncError::BadPeer
                | SyncError::StallingPeer
                | SyncError::EmptyHeaderSet
                | SyncError::PeersUnavailable
                | SyncError::TooOld
                | SyncError::InvalidAncestor
                | SyncError::InvalidChain
                | SyncError::InvalidBlock
                | SyncError::InvalidBody
                | SyncError::InvalidReceipt
        )
    }

    /// Validation failures that abort the running cycle outright instead of
    /// rescheduling the affected tasks.
    pub fn aborts_cycle(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidChain
                | SyncError::InvalidBlock
                | SyncError::InvalidBody
                | SyncError::InvalidReceipt
        )
    }
}
