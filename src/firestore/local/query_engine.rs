use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::constants::INITIAL_LARGEST_BATCH_ID;
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::target::{IndexType, Target};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::remote_document_cache::QueryContext;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, SnapshotVersion};

pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 8.0;

/// Tuning for client-side index auto-creation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryEngineSettings {
    pub index_auto_creation_enabled: bool,
    /// Full scans reading fewer documents never trigger an index.
    pub index_auto_creation_min_collection_size: usize,
    /// Documents a full scan may read per result before an index pays off.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngineSettings {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: false,
            index_auto_creation_min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

impl QueryEngineSettings {
    pub fn with_index_auto_creation(mut self, enabled: bool) -> Self {
        self.index_auto_creation_enabled = enabled;
        self
    }

    pub fn with_min_collection_size(mut self, size: usize) -> Self {
        self.index_auto_creation_min_collection_size = size;
        self
    }

    pub fn with_relative_index_read_cost(mut self, cost: f64) -> Self {
        self.relative_index_read_cost_per_document = cost;
        self
    }
}

/// How a query was answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    Index,
    PreviousResults,
    FullScan,
}

#[derive(Debug, Clone)]
pub struct QueryEngineResult {
    /// Every matching document. Limits are applied by the view.
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    pub strategy: QueryStrategy,
    pub documents_read: usize,
    /// Target to build an index for, when the scan proved expensive.
    pub index_to_create: Option<Target>,
}

/// Picks the cheapest way to answer a query from the local cache.
#[derive(Debug, Clone, Default)]
pub struct QueryEngine {
    settings: QueryEngineSettings,
}

impl QueryEngine {
    pub fn new(settings: QueryEngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QueryEngineSettings {
        &self.settings
    }

    pub fn get_documents_matching_query(
        &self,
        view: &LocalDocumentsView<'_>,
        index_manager: &IndexManager,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> QueryEngineResult {
        if let Some(documents) = self.perform_query_using_index(view, index_manager, query) {
            return QueryEngineResult {
                documents,
                strategy: QueryStrategy::Index,
                documents_read: 0,
                index_to_create: None,
            };
        }
        if let Some(documents) =
            self.perform_query_using_remote_keys(view, query, remote_keys, last_limbo_free_snapshot_version)
        {
            return QueryEngineResult {
                documents,
                strategy: QueryStrategy::PreviousResults,
                documents_read: 0,
                index_to_create: None,
            };
        }

        let mut context = QueryContext::default();
        let documents = view.get_documents_matching_query(query, &IndexOffset::min(), &mut context);
        let index_to_create = self.index_worth_creating(query, &context, documents.len());
        log::debug!(
            "full collection scan for {} read {} documents, matched {}",
            query.canonical_id(),
            context.documents_read_count,
            documents.len()
        );
        QueryEngineResult {
            documents,
            strategy: QueryStrategy::FullScan,
            documents_read: context.documents_read_count,
            index_to_create,
        }
    }

    fn perform_query_using_index(
        &self,
        view: &LocalDocumentsView<'_>,
        index_manager: &IndexManager,
        query: &Query,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() {
            return None;
        }
        let target = query.clone().without_limit().to_target();
        if index_manager.get_index_type(&target) == IndexType::None {
            return None;
        }
        let mut keys = index_manager.get_documents_matching_target(&target)?;
        keys.extend(view.overlay_keys_for_query(query));
        let documents = view
            .get_documents(&keys)
            .into_iter()
            .filter(|(_, doc)| query.matches(doc))
            .collect();
        log::debug!("answered {} from a client-side index", query.canonical_id());
        Some(documents)
    }

    fn perform_query_using_remote_keys(
        &self,
        view: &LocalDocumentsView<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let documents = view.get_documents(remote_keys);
        let comparator = query.comparator();
        let mut previous: Vec<MutableDocument> = documents
            .into_values()
            .filter(|doc| query.matches(doc))
            .collect();
        previous.sort_by(|a, b| comparator(a, b));

        if query.has_limit()
            && Self::needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        let offset = IndexOffset::successor_of_read_time(last_limbo_free_snapshot_version, INITIAL_LARGEST_BATCH_ID);
        let mut results = view.get_documents_matching_query(query, &offset, &mut QueryContext::default());
        for doc in previous {
            results.insert(doc.key().clone(), doc);
        }
        log::debug!(
            "re-using previous results for {} since {last_limbo_free_snapshot_version}",
            query.canonical_id()
        );
        Some(results)
    }

    /// A limited query must be recomputed when documents may have entered the
    /// window: the cached count changed or the edge document is newer than the
    /// last limbo-free snapshot.
    fn needs_refill(
        query: &Query,
        sorted_previous: &[MutableDocument],
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> bool {
        if !query.has_limit() {
            return false;
        }
        if remote_keys.len() != sorted_previous.len() {
            return true;
        }
        let edge = match query.limit_type() {
            LimitType::First => sorted_previous.last(),
            LimitType::Last => sorted_previous.first(),
        };
        edge.is_some_and(|doc| doc.has_pending_writes() || doc.version() > last_limbo_free_snapshot_version)
    }

    fn index_worth_creating(&self, query: &Query, context: &QueryContext, result_size: usize) -> Option<Target> {
        if !self.settings.index_auto_creation_enabled || query.is_document_query() {
            return None;
        }
        let read = context.documents_read_count;
        if read < self.settings.index_auto_creation_min_collection_size {
            return None;
        }
        if (read as f64) <= self.settings.relative_index_read_cost_per_document * result_size as f64 {
            return None;
        }
        let target = query.to_target();
        IndexManager::index_for_target(&target)?;
        log::debug!("query {} read {read} documents for {result_size} results; creating index", query.canonical_id());
        Some(target)
    }
}
