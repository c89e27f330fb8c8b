//! Offline mutation queue.
//!
//! Every state change is written to the local queue first and replayed
//! against the remote store when possible. Entries leave the queue only once
//! the remote has settled them (committed, or discarded as superseded).
//! Entries that cannot be applied are held as failed until the user retries
//! or dismisses them.

pub mod backoff;
pub mod storage;
pub mod sync;

pub use storage::QueueStore;
pub use sync::{DrainReport, SyncConfig, SyncEngine};
