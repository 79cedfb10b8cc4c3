use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::core::settings::TransactionOptions;
use crate::firestore::error::{
    aborted, failed_precondition, internal_error, invalid_argument, is_permanent_error, FirestoreError,
    FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation, Precondition, SnapshotVersion};
use crate::firestore::remote::datastore::DatastoreArc;
use crate::firestore::value::MapValue;
use crate::util::{AsyncQueue, ExponentialBackoff, RetrySettings, TimerId};

#[derive(Default)]
struct TransactionState {
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    last_error: Option<FirestoreError>,
    committed: bool,
}

impl TransactionState {
    fn ensure_not_committed(&self) -> FirestoreResult<()> {
        if self.committed {
            return Err(failed_precondition("Transaction has already been committed"));
        }
        Ok(())
    }

    fn record_version(&mut self, doc: &MutableDocument) -> FirestoreResult<()> {
        let version = if doc.is_found_document() {
            doc.version()
        } else if doc.is_no_document() {
            SnapshotVersion::min()
        } else {
            return Err(internal_error(format!(
                "Document in a transaction was neither found nor missing: {}",
                doc.key()
            )));
        };
        match self.read_versions.get(doc.key()) {
            Some(existing) if *existing != version => {
                Err(aborted("Document version changed between two reads."))
            }
            Some(_) => Ok(()),
            None => {
                self.read_versions.insert(doc.key().clone(), version);
                Ok(())
            }
        }
    }

    /// Precondition pinning a write to the version this transaction read.
    fn precondition(&self, key: &DocumentKey) -> Precondition {
        match self.read_versions.get(key) {
            Some(version) if !self.written_docs.contains(key) => {
                if version.is_min() {
                    Precondition::Exists(false)
                } else {
                    Precondition::UpdateTime(*version)
                }
            }
            _ => Precondition::None,
        }
    }

    fn precondition_for_update(&self, key: &DocumentKey) -> FirestoreResult<Precondition> {
        match self.read_versions.get(key) {
            Some(version) if !self.written_docs.contains(key) => {
                if version.is_min() {
                    // The document was read as missing, so the update cannot succeed.
                    return Err(invalid_argument("Can't update a document that doesn't exist."));
                }
                Ok(Precondition::UpdateTime(*version))
            }
            _ => Ok(Precondition::Exists(true)),
        }
    }

    fn write(&mut self, mutation: Mutation) -> FirestoreResult<()> {
        self.ensure_not_committed()?;
        self.written_docs.insert(mutation.key().clone());
        self.mutations.push(mutation);
        Ok(())
    }
}

/// Reads and buffered writes of one transaction attempt.
///
/// All reads must happen before the first write. Writes are sent in a single
/// commit together with a verify for every document read but not written.
#[derive(Clone)]
pub struct Transaction {
    datastore: DatastoreArc,
    state: Arc<Mutex<TransactionState>>,
}

impl Transaction {
    pub fn new(datastore: DatastoreArc) -> Self {
        Self {
            datastore,
            state: Arc::new(Mutex::new(TransactionState::default())),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads `keys` from the backend, in request order.
    pub async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        {
            let mut state = self.lock_state();
            state.ensure_not_committed()?;
            if !state.mutations.is_empty() {
                let err = invalid_argument("Firestore transactions require all reads to be executed before all writes.");
                state.last_error = Some(err.clone());
                return Err(err);
            }
        }

        let docs = self.datastore.batch_get_documents(keys).await?;
        let mut state = self.lock_state();
        for doc in &docs {
            state.record_version(doc)?;
        }
        Ok(docs)
    }

    pub async fn get(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let mut docs = self.lookup(std::slice::from_ref(key)).await?;
        docs.pop()
            .ok_or_else(|| internal_error(format!("BatchGetDocuments returned nothing for {key}")))
    }

    pub fn set(&self, key: &DocumentKey, data: MapValue) -> FirestoreResult<()> {
        let mut state = self.lock_state();
        let precondition = state.precondition(key);
        state.write(Mutation::set(key.clone(), data).with_precondition(precondition))
    }

    /// Writes the fields present in `data`, failing at commit if the document
    /// does not exist.
    pub fn update(&self, key: &DocumentKey, data: MapValue) -> FirestoreResult<()> {
        let mut state = self.lock_state();
        let precondition = match state.precondition_for_update(key) {
            Ok(precondition) => precondition,
            Err(err) => {
                state.last_error = Some(err.clone());
                state.written_docs.insert(key.clone());
                return Err(err);
            }
        };
        let mask = data.field_mask();
        state.write(Mutation::patch(key.clone(), data, mask).with_precondition(precondition))
    }

    pub fn delete(&self, key: &DocumentKey) -> FirestoreResult<()> {
        let mut state = self.lock_state();
        let precondition = state.precondition(key);
        state.write(Mutation::delete(key.clone()).with_precondition(precondition))
    }

    /// Sends the buffered writes. Fails without a round trip when an earlier
    /// operation of this transaction failed.
    pub async fn commit(&self) -> FirestoreResult<()> {
        let mutations = {
            let state = self.lock_state();
            state.ensure_not_committed()?;
            if let Some(err) = state.last_error.clone() {
                return Err(err);
            }
            let mut mutations = state.mutations.clone();
            let written: BTreeSet<&DocumentKey> = mutations.iter().map(Mutation::key).collect();
            let unwritten: Vec<DocumentKey> = state
                .read_versions
                .keys()
                .filter(|key| !written.contains(key))
                .cloned()
                .collect();
            for key in unwritten {
                let precondition = state.precondition(&key);
                mutations.push(Mutation::verify(key, precondition));
            }
            mutations
        };

        self.datastore.commit(mutations).await?;
        self.lock_state().committed = true;
        Ok(())
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock_state().mutations.clone()
    }
}

fn is_retryable_transaction_error(error: &FirestoreError) -> bool {
    matches!(
        error.code,
        FirestoreErrorCode::Aborted | FirestoreErrorCode::FailedPrecondition | FirestoreErrorCode::AlreadyExists
    ) || !is_permanent_error(error.code)
}

/// Runs an update function in fresh transactions until one commits or the
/// attempts run out. Retries are spaced by exponential backoff.
pub struct TransactionRunner {
    queue: AsyncQueue,
    datastore: DatastoreArc,
    options: TransactionOptions,
    retry: RetrySettings,
}

impl TransactionRunner {
    pub fn new(queue: AsyncQueue, datastore: DatastoreArc, options: TransactionOptions, retry: RetrySettings) -> Self {
        Self {
            queue,
            datastore,
            options,
            retry,
        }
    }

    /// Must not be awaited from inside a queue operation.
    pub async fn run<T, F, Fut>(&self, mut update: F) -> FirestoreResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        let mut backoff = ExponentialBackoff::new(self.queue.clone(), TimerId::TransactionRetry, self.retry);
        let mut attempts_remaining = self.options.max_attempts;
        loop {
            attempts_remaining = attempts_remaining.saturating_sub(1);
            backoff.backoff_and_wait().await?;

            let transaction = Transaction::new(self.datastore.clone());
            let outcome = match update(transaction.clone()).await {
                Ok(value) => transaction.commit().await.map(|()| value),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if attempts_remaining > 0 && is_retryable_transaction_error(&err) => {
                    log::debug!("transaction attempt failed, retrying: {err}");
                }
                Err(err) => {
                    log::debug!("transaction failed: {err}");
                    return Err(err);
                }
            }
        }
    }
}
