use thiserror::Error;

/// Error kinds surfaced across the sync stack.
///
/// Most of these never reach an application caller directly — `TransportLost`
/// and `PeerUnavailable` are turned into cancellation outcomes for pending
/// object requests and commit batches instead (see [`crate::page::pending_object`]
/// and [`crate::page::commit_batch`]); this enum exists so every layer has one
/// vocabulary to report through.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("user mismatch with peer")]
    UserMismatch,

    #[error("transport lost")]
    TransportLost,

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("commit batch cannot be completed")]
    PartialBatchUnavailable,

    #[error("not found")]
    NotFound,
}
