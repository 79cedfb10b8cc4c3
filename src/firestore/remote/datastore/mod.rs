use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, Mutation, MutableDocument, MutationResult};

pub mod remote;

/// Unary calls used outside the persistent streams, mainly by transactions.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Commits `mutations` atomically and returns one result per mutation.
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<Vec<MutationResult>>;

    /// Reads `keys` from the backend. The result has one document per key in
    /// request order; missing keys come back as no-documents.
    async fn batch_get_documents(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>>;

    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<MutableDocument>>;
}

pub type DatastoreArc = Arc<dyn Datastore>;

pub use remote::RemoteDatastore;
