use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::Query;
use crate::firestore::error::{
    hard_assert, internal_error, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{DocumentKey, Mutation, MutableDocument, MutationResult};
use crate::firestore::remote::connection::{ConnectionArc, CredentialsProviderArc, UnaryRpc};
use crate::firestore::remote::rpc_error::decode_error_response;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::structured_query::encode_query_target;

use super::Datastore;

/// [`Datastore`] over the unary calls of a [`Connection`](crate::firestore::remote::connection::Connection).
#[derive(Clone)]
pub struct RemoteDatastore {
    connection: ConnectionArc,
    credentials: CredentialsProviderArc,
    serializer: JsonProtoSerializer,
}

impl RemoteDatastore {
    pub fn new(
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        serializer: JsonProtoSerializer,
    ) -> Self {
        Self {
            connection,
            credentials,
            serializer,
        }
    }

    /// Failures arrive either from the transport or as an `{"error": ...}`
    /// response body.
    async fn invoke(&self, rpc: UnaryRpc, request: JsonValue) -> FirestoreResult<JsonValue> {
        let token = self.credentials.get_token().await?;
        let result = self
            .connection
            .invoke(rpc, token, request)
            .await
            .and_then(|response| match decode_error_response(&response) {
                Some(err) => Err(err),
                None => Ok(response),
            });
        if let Err(err) = &result {
            if err.code == FirestoreErrorCode::Unauthenticated {
                // The next call fetches a fresh token.
                self.credentials.invalidate_token();
            }
            log::debug!("{} failed: {err}", rpc.label());
        }
        result
    }
}

fn response_entries(response: &JsonValue) -> &[JsonValue] {
    response.as_array().map(Vec::as_slice).unwrap_or_default()
}

#[async_trait]
impl Datastore for RemoteDatastore {
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<Vec<MutationResult>> {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let request = json!({
            "database": self.serializer.database_name(),
            "writes": writes,
        });
        let response = self.invoke(UnaryRpc::Commit, request).await?;

        let commit_version = self.serializer.decode_version(response.get("commitTime"))?;
        let results = response_entries(response.get("writeResults").unwrap_or(&JsonValue::Null));
        hard_assert(results.len() == mutations.len(), || {
            format!(
                "Commit returned {} results for {} writes",
                results.len(),
                mutations.len()
            )
        })?;
        results
            .iter()
            .map(|result| self.serializer.decode_write_result(result, commit_version))
            .collect()
    }

    async fn batch_get_documents(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        let names: Vec<String> = keys.iter().map(|key| self.serializer.document_name(key)).collect();
        let request = json!({
            "database": self.serializer.database_name(),
            "documents": names,
        });
        let response = self.invoke(UnaryRpc::BatchGetDocuments, request).await?;

        let mut found = BTreeMap::new();
        for entry in response_entries(&response) {
            let read_time = self.serializer.decode_version(entry.get("readTime"))?;
            let mut doc = if let Some(document) = entry.get("found") {
                self.serializer.decode_document(document)?
            } else if let Some(name) = entry.get("missing").and_then(JsonValue::as_str) {
                let key = self.serializer.document_key_from_name(name)?;
                MutableDocument::new_no_document(key, read_time)
            } else {
                return Err(internal_error("BatchGetDocuments entry has neither found nor missing"));
            };
            doc.set_read_time(read_time);
            found.insert(doc.key().clone(), doc);
        }

        keys.iter()
            .map(|key| {
                found
                    .remove(key)
                    .ok_or_else(|| internal_error(format!("BatchGetDocuments omitted {}", key.path())))
            })
            .collect()
    }

    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<MutableDocument>> {
        let request = encode_query_target(&self.serializer, &query.to_target());
        let response = self.invoke(UnaryRpc::RunQuery, request).await?;

        let mut documents = Vec::new();
        for entry in response_entries(&response) {
            // Progress-only entries carry just a read time.
            let Some(document) = entry.get("document") else {
                continue;
            };
            let read_time = self.serializer.decode_version(entry.get("readTime"))?;
            let mut doc = self.serializer.decode_document(document)?;
            doc.set_read_time(read_time);
            documents.push(doc);
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unauthenticated;
    use crate::firestore::model::{DatabaseId, SnapshotVersion};
    use crate::firestore::remote::connection::CredentialsProvider;
    use crate::firestore::remote::stream::{loopback, LoopbackServer, ServerEvent, UnaryCall};
    use crate::firestore::value::MapValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingCredentials {
        invalidations: AtomicUsize,
    }

    #[async_trait]
    impl CredentialsProvider for CountingCredentials {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            Ok(Some("token".to_string()))
        }

        fn invalidate_token(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn datastore() -> (RemoteDatastore, LoopbackServer, Arc<CountingCredentials>, JsonProtoSerializer) {
        let (connection, server) = loopback();
        let credentials = Arc::new(CountingCredentials::default());
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        let datastore = RemoteDatastore::new(Arc::new(connection), credentials.clone(), serializer.clone());
        (datastore, server, credentials, serializer)
    }

    async fn accept_call(server: &LoopbackServer) -> UnaryCall {
        match server.accept().await {
            Some(ServerEvent::Call(call)) => call,
            _ => panic!("expected a unary call"),
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn batch_get_preserves_request_order() {
        let (datastore, server, _credentials, serializer) = datastore();
        let keys = vec![key("rooms/b"), key("rooms/a")];
        let call = tokio::spawn(async move { datastore.batch_get_documents(&keys).await });

        let request = accept_call(&server).await;
        assert_eq!(request.rpc, UnaryRpc::BatchGetDocuments);
        assert_eq!(request.auth_token.as_deref(), Some("token"));
        let found = MutableDocument::new_found_document(
            key("rooms/a"),
            SnapshotVersion::from_micros(1_000_000),
            MapValue::empty(),
        );
        request.respond(Ok(json!([
            { "found": serializer.encode_document(&found), "readTime": "1970-01-01T00:00:05Z" },
            { "missing": serializer.document_name(&key("rooms/b")), "readTime": "1970-01-01T00:00:05Z" },
        ])));

        let docs = call.await.unwrap().unwrap();
        assert_eq!(docs[0].key(), &key("rooms/b"));
        assert!(docs[0].is_no_document());
        assert_eq!(docs[0].version(), SnapshotVersion::from_micros(5_000_000));
        assert!(docs[1].is_found_document());
        assert_eq!(docs[1].read_time(), SnapshotVersion::from_micros(5_000_000));
    }

    #[tokio::test]
    async fn commit_decodes_one_result_per_write() {
        let (datastore, server, _credentials, serializer) = datastore();
        let mutations = vec![Mutation::delete(key("rooms/a"))];
        let call = tokio::spawn(async move { datastore.commit(mutations).await });

        let request = accept_call(&server).await;
        assert_eq!(request.request["writes"].as_array().unwrap().len(), 1);
        let result = MutationResult {
            version: SnapshotVersion::from_micros(7_000_000),
            transform_results: Vec::new(),
        };
        request.respond(Ok(json!({
            "commitTime": "1970-01-01T00:00:07Z",
            "writeResults": [serializer.encode_write_result(&result)],
        })));
        let results = call.await.unwrap().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].version, SnapshotVersion::from_micros(7_000_000));
    }

    #[tokio::test]
    async fn unauthenticated_invalidates_token() {
        let (datastore, server, credentials, _serializer) = datastore();
        let call = tokio::spawn(async move {
            datastore.run_query(&Query::collection("rooms").unwrap()).await
        });
        let request = accept_call(&server).await;
        assert_eq!(request.rpc, UnaryRpc::RunQuery);
        assert!(request.request.get("structuredQuery").is_some());
        request.respond(Err(unauthenticated("expired")));
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unauthenticated);
        assert_eq!(credentials.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_body_fails_the_call() {
        let (datastore, server, credentials, _serializer) = datastore();
        let call = tokio::spawn(async move { datastore.commit(vec![Mutation::delete(key("rooms/a"))]).await });
        let request = accept_call(&server).await;
        request.respond(Ok(json!({ "error": { "code": 10, "message": "Transaction contention" } })));
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Aborted);
        assert_eq!(err.message(), "Transaction contention");
        assert_eq!(credentials.invalidations.load(Ordering::SeqCst), 0);
    }
}
