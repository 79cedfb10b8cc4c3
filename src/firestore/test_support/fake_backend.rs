use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_lock::Mutex;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::error::{
    aborted, already_exists, failed_precondition, invalid_argument, not_found, permission_denied,
    FirestoreError, FirestoreResult,
};
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutableDocument, Mutation, MutationKind, MutationResult, Precondition,
    ResourcePath, SnapshotVersion, TransformOperation,
};
use crate::firestore::remote::connection::{RpcKind, UnaryRpc};
use crate::firestore::remote::rpc_error::encode_error_response;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{LoopbackServer, ServerEvent, ServerStream, UnaryCall};
use crate::firestore::remote::streams::{
    decode_listen_request, decode_write_request, encode_write_response, ListenRequest,
};
use crate::firestore::remote::structured_query::decode_query_target;
use crate::firestore::remote::watch_change::{
    encode_watch_change, DocumentWatchChange, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};
use crate::firestore::value::{FirestoreValue, MapValue};
use crate::platform::runtime::spawn_detached;

const VERSION_STEP_MICROS: i64 = 1_000_000;

/// In-process backend serving the listen and write streams and the unary
/// calls of a loopback connection.
///
/// Writes are applied atomically and fanned out to every listening target.
/// Limits are only honored when a target is first added.
#[derive(Clone)]
pub struct FakeBackend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    serializer: JsonProtoSerializer,
    state: Mutex<BackendState>,
}

struct BackendState {
    documents: BTreeMap<DocumentKey, MutableDocument>,
    version_micros: i64,
    watchers: BTreeMap<u64, Watcher>,
    next_watcher_id: u64,
    write_failures: VecDeque<FirestoreError>,
    denied_paths: Vec<ResourcePath>,
    commit_count: usize,
}

struct Watcher {
    stream: Arc<ServerStream>,
    targets: BTreeMap<i32, Target>,
}

impl FakeBackend {
    /// Starts serving `server` in the background.
    pub fn start(server: LoopbackServer, database_id: DatabaseId) -> Self {
        let inner = Arc::new(BackendInner {
            serializer: JsonProtoSerializer::new(database_id),
            state: Mutex::new(BackendState {
                documents: BTreeMap::new(),
                version_micros: VERSION_STEP_MICROS,
                watchers: BTreeMap::new(),
                next_watcher_id: 0,
                write_failures: VecDeque::new(),
                denied_paths: Vec::new(),
                commit_count: 0,
            }),
        });
        let accepting = inner.clone();
        spawn_detached(async move {
            while let Some(event) = server.accept().await {
                let inner = accepting.clone();
                match event {
                    ServerEvent::Stream(stream) => spawn_detached(async move {
                        match stream.kind() {
                            RpcKind::Listen => inner.serve_listen(stream).await,
                            RpcKind::Write => inner.serve_write(stream).await,
                        }
                    }),
                    ServerEvent::Call(call) => spawn_detached(async move { inner.serve_call(call).await }),
                }
            }
        });
        Self { inner }
    }

    /// Writes `data` to `key` as another client would.
    pub async fn set_document(&self, path: &str, data: MapValue) -> FirestoreResult<SnapshotVersion> {
        let key = DocumentKey::from_string(path)?;
        let (version, _) = self.inner.commit(vec![Mutation::set(key, data)], false).await?;
        Ok(version)
    }

    pub async fn delete_document(&self, path: &str) -> FirestoreResult<SnapshotVersion> {
        let key = DocumentKey::from_string(path)?;
        let (version, _) = self.inner.commit(vec![Mutation::delete(key)], false).await?;
        Ok(version)
    }

    /// Deletes a document without telling any listener. The backend clock
    /// still advances, so later reads report the deletion at a newer version.
    pub async fn remove_document_silently(&self, path: &str) -> FirestoreResult<()> {
        let key = DocumentKey::from_string(path)?;
        let mut state = self.inner.state.lock().await;
        state.documents.remove(&key);
        state.version_micros += VERSION_STEP_MICROS;
        Ok(())
    }

    pub async fn document(&self, path: &str) -> Option<MutableDocument> {
        let key = DocumentKey::from_string(path).ok()?;
        self.inner.state.lock().await.documents.get(&key).cloned()
    }

    /// Fails the next commit, from either the write stream or a transaction.
    pub async fn fail_next_write(&self, error: FirestoreError) {
        self.inner.state.lock().await.write_failures.push_back(error);
    }

    /// Rejects every listen target under `path` with `PermissionDenied`.
    pub async fn deny_reads_under(&self, path: &str) -> FirestoreResult<()> {
        let path = ResourcePath::from_string(path)?;
        self.inner.state.lock().await.denied_paths.push(path);
        Ok(())
    }

    /// Sends each listening target an existence filter with the backend's
    /// current count, followed by a consistent snapshot.
    pub async fn send_existence_filters(&self) {
        self.inner.send_existence_filters().await;
    }

    pub async fn commit_count(&self) -> usize {
        self.inner.state.lock().await.commit_count
    }

    /// Ids of the targets currently listened to, across all streams.
    pub async fn active_target_ids(&self) -> Vec<i32> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<i32> = state
            .watchers
            .values()
            .flat_map(|watcher| watcher.targets.keys().copied())
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl BackendState {
    fn current_version(&self) -> SnapshotVersion {
        SnapshotVersion::from_micros(self.version_micros)
    }

    fn matching(&self, target: &Target) -> Vec<MutableDocument> {
        let query = Query::from_target(target);
        let comparator = query.comparator();
        let mut docs: Vec<MutableDocument> = self
            .documents
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        docs.sort_by(|left, right| comparator(left, right));
        if let Some(limit) = target.limit {
            docs.truncate(limit as usize);
        }
        docs
    }

    fn is_denied(&self, target: &Target) -> bool {
        self.denied_paths.iter().any(|path| path.is_prefix_of(&target.path))
    }
}

fn resume_token(version: SnapshotVersion) -> Vec<u8> {
    format!("v{}", version.timestamp().to_micros()).into_bytes()
}

fn global_snapshot(version: SnapshotVersion) -> WatchChange {
    WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(version))
}

fn document_change(target_id: i32, doc: &MutableDocument) -> WatchChange {
    WatchChange::Document(DocumentWatchChange {
        updated_target_ids: vec![target_id],
        removed_target_ids: Vec::new(),
        key: doc.key().clone(),
        new_doc: Some(doc.clone()),
    })
}

fn precondition_error(mutation: &Mutation, transactional: bool) -> FirestoreError {
    match (mutation.kind(), mutation.precondition()) {
        (_, Precondition::UpdateTime(_)) if transactional => {
            aborted(format!("Transaction lost a race on {}", mutation.key()))
        }
        (_, Precondition::Exists(false)) => already_exists(format!("Document already exists: {}", mutation.key())),
        (MutationKind::Patch { .. }, _) | (_, Precondition::Exists(true)) => {
            not_found(format!("No document to update: {}", mutation.key()))
        }
        _ => failed_precondition(format!("Precondition failed for {}", mutation.key())),
    }
}

fn server_transform_results(mutation: &Mutation, doc: &MutableDocument, commit: SnapshotVersion) -> Vec<FirestoreValue> {
    mutation
        .field_transforms()
        .iter()
        .map(|transform| match transform.operation() {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(commit.timestamp()),
            operation => operation.apply_to_local_view(doc.field(transform.field()), commit.timestamp()),
        })
        .collect()
}

impl BackendInner {
    async fn send(&self, stream: &ServerStream, change: &WatchChange) {
        // A closed stream is cleaned up by its serving task.
        let _ = stream.send(encode_watch_change(&self.serializer, change)).await;
    }

    async fn serve_listen(&self, stream: ServerStream) {
        let stream = Arc::new(stream);
        let watcher_id = {
            let mut state = self.state.lock().await;
            let id = state.next_watcher_id;
            state.next_watcher_id += 1;
            state.watchers.insert(
                id,
                Watcher {
                    stream: stream.clone(),
                    targets: BTreeMap::new(),
                },
            );
            id
        };

        while let Some(message) = stream.next().await {
            match decode_listen_request(&self.serializer, &message) {
                Ok(ListenRequest::AddTarget { target_id, target, .. }) => {
                    self.add_target(watcher_id, target_id, target).await;
                }
                Ok(ListenRequest::RemoveTarget(target_id)) => {
                    let mut state = self.state.lock().await;
                    if let Some(watcher) = state.watchers.get_mut(&watcher_id) {
                        watcher.targets.remove(&target_id);
                    }
                    drop(state);
                    let removed = WatchChange::TargetChange(WatchTargetChange::new(
                        TargetChangeState::Removed,
                        vec![target_id],
                    ));
                    self.send(&stream, &removed).await;
                }
                Err(err) => {
                    stream.fail(err).await;
                    break;
                }
            }
        }
        self.state.lock().await.watchers.remove(&watcher_id);
    }

    async fn add_target(&self, watcher_id: u64, target_id: i32, target: Target) {
        let mut state = self.state.lock().await;
        let Some(stream) = state.watchers.get(&watcher_id).map(|watcher| watcher.stream.clone()) else {
            return;
        };
        if state.is_denied(&target) {
            let rejected = WatchTargetChange::new(TargetChangeState::Removed, vec![target_id])
                .with_cause(permission_denied("Missing or insufficient permissions."));
            self.send(&stream, &WatchChange::TargetChange(rejected)).await;
            return;
        }

        let version = state.current_version();
        self.send(
            &stream,
            &WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Added, vec![target_id])),
        )
        .await;
        for doc in state.matching(&target) {
            self.send(&stream, &document_change(target_id, &doc)).await;
        }
        let current = WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
            .with_resume_token(resume_token(version));
        self.send(&stream, &WatchChange::TargetChange(current)).await;
        self.send(&stream, &global_snapshot(version)).await;

        if let Some(watcher) = state.watchers.get_mut(&watcher_id) {
            watcher.targets.insert(target_id, target);
        }
    }

    async fn serve_write(&self, stream: ServerStream) {
        while let Some(message) = stream.next().await {
            let request = match decode_write_request(&self.serializer, &message) {
                Ok(request) => request,
                Err(err) => {
                    stream.fail(err).await;
                    return;
                }
            };
            if request.is_handshake() {
                let version = self.state.lock().await.current_version();
                let response = encode_write_response(&self.serializer, &resume_token(version), None, &[]);
                if stream.send(response).await.is_err() {
                    return;
                }
                continue;
            }
            match self.commit(request.writes, false).await {
                Ok((version, results)) => {
                    let response =
                        encode_write_response(&self.serializer, &resume_token(version), Some(version), &results);
                    if stream.send(response).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    log::debug!("fake backend rejected a write: {err}");
                    stream.fail(err).await;
                    return;
                }
            }
        }
    }

    async fn serve_call(&self, call: UnaryCall) {
        let response = match call.rpc {
            UnaryRpc::Commit => self.handle_commit(&call.request).await,
            UnaryRpc::BatchGetDocuments => self.handle_batch_get(&call.request).await,
            UnaryRpc::RunQuery => self.handle_run_query(&call.request).await,
        };
        // Failed calls answer with an error body, the way the REST endpoints do.
        call.respond(Ok(response.unwrap_or_else(|err| encode_error_response(&err))));
    }

    async fn handle_commit(&self, request: &JsonValue) -> FirestoreResult<JsonValue> {
        let writes = request
            .get("writes")
            .and_then(JsonValue::as_array)
            .map(|writes| {
                writes
                    .iter()
                    .map(|write| self.serializer.decode_mutation(write))
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        let (version, results) = self.commit(writes, true).await?;
        let results: Vec<JsonValue> = results
            .iter()
            .map(|result| self.serializer.encode_write_result(result))
            .collect();
        Ok(json!({
            "commitTime": self.serializer.encode_version(&version),
            "writeResults": results,
        }))
    }

    async fn handle_batch_get(&self, request: &JsonValue) -> FirestoreResult<JsonValue> {
        let names = request
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("BatchGetDocuments requires documents"))?;
        let state = self.state.lock().await;
        let read_time = self.serializer.encode_version(&state.current_version());
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let name = name
                .as_str()
                .ok_or_else(|| invalid_argument("document names must be strings"))?;
            let key = self.serializer.document_key_from_name(name)?;
            entries.push(match state.documents.get(&key) {
                Some(doc) => json!({ "found": self.serializer.encode_document(doc), "readTime": read_time }),
                None => json!({ "missing": name, "readTime": read_time }),
            });
        }
        Ok(JsonValue::Array(entries))
    }

    async fn handle_run_query(&self, request: &JsonValue) -> FirestoreResult<JsonValue> {
        let target = decode_query_target(&self.serializer, request)?;
        let state = self.state.lock().await;
        let read_time = self.serializer.encode_version(&state.current_version());
        let mut entries: Vec<JsonValue> = state
            .matching(&target)
            .iter()
            .map(|doc| json!({ "document": self.serializer.encode_document(doc), "readTime": read_time }))
            .collect();
        if entries.is_empty() {
            entries.push(json!({ "readTime": read_time }));
        }
        Ok(JsonValue::Array(entries))
    }

    /// Applies `writes` atomically and notifies every affected target.
    /// Commits through the unary RPC come from transactions, where a stale
    /// read is reported as contention.
    async fn commit(
        &self,
        writes: Vec<Mutation>,
        transactional: bool,
    ) -> FirestoreResult<(SnapshotVersion, Vec<MutationResult>)> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }

        let commit_version = SnapshotVersion::from_micros(state.version_micros + VERSION_STEP_MICROS);
        let mut staged = state.documents.clone();
        let mut results = Vec::with_capacity(writes.len());
        let mut changed = Vec::new();
        for mutation in &writes {
            let key = mutation.key().clone();
            let mut doc = staged
                .get(&key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
            if !mutation.precondition().is_valid_for(&doc) {
                return Err(precondition_error(mutation, transactional));
            }
            if matches!(mutation.kind(), MutationKind::Verify) {
                results.push(MutationResult {
                    version: commit_version,
                    transform_results: Vec::new(),
                });
                continue;
            }

            let result = MutationResult {
                version: commit_version,
                transform_results: server_transform_results(mutation, &doc, commit_version),
            };
            mutation.apply_to_remote_document(&mut doc, &result)?;
            if doc.is_found_document() {
                let data = doc.data().clone();
                staged.insert(key.clone(), MutableDocument::new_found_document(key.clone(), commit_version, data));
            } else {
                staged.remove(&key);
            }
            changed.push(key);
            results.push(result);
        }

        let previous = std::mem::replace(&mut state.documents, staged);
        state.version_micros += VERSION_STEP_MICROS;
        state.commit_count += 1;
        self.notify_watchers(&state, &previous, &changed, commit_version).await;
        Ok((commit_version, results))
    }

    async fn notify_watchers(
        &self,
        state: &BackendState,
        previous: &BTreeMap<DocumentKey, MutableDocument>,
        changed: &[DocumentKey],
        version: SnapshotVersion,
    ) {
        for watcher in state.watchers.values() {
            let mut touched_any = false;
            for (&target_id, target) in &watcher.targets {
                let query = Query::from_target(target);
                let mut touched = false;
                for key in changed {
                    let matched_before = previous.get(key).is_some_and(|doc| query.matches(doc));
                    let change = match state.documents.get(key) {
                        Some(doc) if query.matches(doc) => document_change(target_id, doc),
                        Some(_) if matched_before => WatchChange::Document(DocumentWatchChange {
                            updated_target_ids: Vec::new(),
                            removed_target_ids: vec![target_id],
                            key: key.clone(),
                            new_doc: None,
                        }),
                        None if matched_before => WatchChange::Document(DocumentWatchChange {
                            updated_target_ids: Vec::new(),
                            removed_target_ids: vec![target_id],
                            key: key.clone(),
                            new_doc: Some(MutableDocument::new_no_document(key.clone(), version)),
                        }),
                        _ => continue,
                    };
                    self.send(&watcher.stream, &change).await;
                    touched = true;
                }
                if touched {
                    let token = WatchTargetChange::new(TargetChangeState::NoChange, vec![target_id])
                        .with_resume_token(resume_token(version));
                    self.send(&watcher.stream, &WatchChange::TargetChange(token)).await;
                    touched_any = true;
                }
            }
            if touched_any {
                self.send(&watcher.stream, &global_snapshot(version)).await;
            }
        }
    }

    async fn send_existence_filters(&self) {
        let state = self.state.lock().await;
        let version = state.current_version();
        for watcher in state.watchers.values() {
            if watcher.targets.is_empty() {
                continue;
            }
            for (&target_id, target) in &watcher.targets {
                let filter = WatchChange::ExistenceFilter(ExistenceFilterChange {
                    target_id,
                    count: state.matching(target).len() as i32,
                    unchanged_names: None,
                });
                self.send(&watcher.stream, &filter).await;
            }
            self.send(&watcher.stream, &global_snapshot(version)).await;
        }
    }
}
