use std::fmt;
use std::sync::Arc;

use crate::firestore::constants::{DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS, DEFAULT_TRANSACTION_MAX_ATTEMPTS};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::{LruParams, MemoryPersistenceBackend, PersistenceBackend, QueryEngineSettings};
use crate::util::RetrySettings;

/// Configuration of a [`FirestoreClient`](crate::firestore::core::firestore_client::FirestoreClient).
#[derive(Clone)]
pub struct FirestoreSettings {
    pub lru_params: LruParams,
    pub persistence: Arc<dyn PersistenceBackend>,
    pub max_concurrent_limbo_resolutions: usize,
    pub query_engine: QueryEngineSettings,
    pub retry: RetrySettings,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            lru_params: LruParams::default(),
            persistence: Arc::new(MemoryPersistenceBackend::new()),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            query_engine: QueryEngineSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl FirestoreSettings {
    pub fn with_lru_params(mut self, lru_params: LruParams) -> Self {
        self.lru_params = lru_params;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    pub fn with_query_engine(mut self, query_engine: QueryEngineSettings) -> Self {
        self.query_engine = query_engine;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn validate(&self) -> FirestoreResult<()> {
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument("max_concurrent_limbo_resolutions must be at least 1"));
        }
        Ok(())
    }
}

impl fmt::Debug for FirestoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirestoreSettings")
            .field("lru_params", &self.lru_params)
            .field("max_concurrent_limbo_resolutions", &self.max_concurrent_limbo_resolutions)
            .field("query_engine", &self.query_engine)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Where a listener reads its results from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// The local cache, kept in sync with the backend.
    #[default]
    Default,
    /// The local cache only. No backend listen is started.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is pending-write or from-cache state.
    pub include_metadata_changes: bool,
    pub source: ListenSource,
    /// Hold back the first snapshot until the backend answers, unless offline.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_include_metadata_changes(mut self, include: bool) -> Self {
        self.include_metadata_changes = include;
        self
    }

    pub fn with_source(mut self, source: ListenSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_wait_for_sync_when_online(mut self, wait: bool) -> Self {
        self.wait_for_sync_when_online = wait;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionOptions {
    pub max_attempts: u32,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_TRANSACTION_MAX_ATTEMPTS,
        }
    }
}

impl TransactionOptions {
    pub fn new(max_attempts: u32) -> FirestoreResult<Self> {
        if max_attempts < 1 {
            return Err(invalid_argument("Max attempts must be at least 1"));
        }
        Ok(Self { max_attempts })
    }
}
