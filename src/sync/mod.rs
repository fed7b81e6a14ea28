//! Offline sync for workspace entities
//!
//! # Sync Protocol
//!
//! 1. Client pulls `GET /sync/delta` with the last `next_cursor` it stored
//!    (none on first sync) and stores the new `next_cursor`
//! 2. While `has_more` is set it pulls again immediately
//! 3. Queued offline edits are pushed with `POST /sync/batch`, each carrying
//!    the `updated_at` the client last saw
//! 4. A `CONFLICT` result returns the server's record for the client to merge
//!
//! Deletions reach clients through tombstones, which are swept after the
//! retention period. A cursor older than that gets `full_resync_required`.

mod batch;
mod conflict;
mod delta;
mod tombstones;
mod types;

pub use batch::BatchProcessor;
pub use delta::{get_delta, get_status, DeltaQuery};
pub use tombstones::{purge_older_than, retention_cutoff, spawn_retention_sweep};
pub use types::{
    BatchRequest, BatchResponse, CleanupRequest, CleanupResponse, DeltaParams, SyncResponse,
    SyncStatus,
};
