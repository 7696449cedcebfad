use std::sync::Arc;

use crate::codec::CodecError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SliceError {
    /// The store flagged a fatal error while opening; the caller usually
    /// removes the slice directory and retries newborn initialisation.
    #[error("storage corrupted")]
    StorageCorrupted,

    /// The scanned snapshot was invalidated by a rollback; retry against a
    /// fresh snapshot.
    #[error("index rollback required")]
    IndexRollback,

    /// Cooperative scan cancellation.
    #[error("scan cancelled by client")]
    ClientCancel,

    #[error("snapshot already closed")]
    SnapshotClosed,

    #[error("slice is closed")]
    Closed,

    /// A prior worker latched a fatal store error; every subsequent
    /// mutation reports it until the slice is reset.
    #[error("fatal storage error: {0}")]
    Fatal(Arc<StoreError>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("slice init failed: {0}")]
    Init(#[from] anyhow::Error),
}
