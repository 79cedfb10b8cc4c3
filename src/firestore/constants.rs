use std::time::Duration;

pub(crate) const DEFAULT_DATABASE_ID: &str = "(default)";

/// Batch id reported before any batch has been read from the queue.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// Largest batch id carried by an index offset that has not seen any overlays.
pub const INITIAL_LARGEST_BATCH_ID: i32 = -1;

/// Sequence number used for limbo targets, which are never persisted.
pub const INVALID_SEQUENCE_NUMBER: i64 = -1;

/// Resume tokens older than this are rewritten even if the target saw no changes.
pub(crate) const RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Maximum number of mutation batches the write pipeline keeps in flight.
pub(crate) const MAX_PENDING_WRITES: usize = 10;

/// Consecutive watch stream failures tolerated before reporting offline.
pub(crate) const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long the online state may stay unknown before reporting offline.
pub(crate) const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle streams are closed after this long without outbound activity.
pub(crate) const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) const LRU_INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
pub(crate) const LRU_REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

pub(crate) const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub(crate) const DEFAULT_TRANSACTION_MAX_ATTEMPTS: u32 = 5;
