//! `slicedb` is a per-partition secondary-index storage slice backed by a
//! pair of MVCC ordered key-value stores.
//!
//! The crate is intentionally opinionated about correctness first:
//! - The mainstore holds forward entries `key + docid` ordered by raw
//!   bytes; the backstore maps `docid` to the last indexed key.
//! - Mutations shard by source partition (vbucket) onto a pool of writer
//!   workers; per-partition arrival order is preserved, cross-partition
//!   order is not.
//! - Snapshots are taken only at quiescent points (drained mutation queue)
//!   and committed snapshots are persisted asynchronously as paired
//!   recovery points on both stores.
//! - The writer pool self-tunes against a per-instance token quota using
//!   sampled drain and mutation rates.

pub mod codec;
pub mod slice;
pub mod store;
pub mod sync;

pub use slice::config::SliceConfig;
pub use slice::error::SliceError;
pub use slice::token::WriterTokens;
pub use slice::{IndexDefn, MutationMeta, SeqVector, Slice, SliceId};
pub use store::{Store, StoreError};
