use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use serde_json::Value as JsonValue;

use crate::firestore::error::{unavailable, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, MutableDocument, MutationBatch, Overlay, SnapshotVersion};

pub const REMOTE_DOCUMENTS_PREFIX: &str = "remote_documents/";
pub const TARGETS_PREFIX: &str = "targets/";
pub const TARGET_DOCUMENTS_PREFIX: &str = "target_documents/";
pub const TARGET_GLOBALS_KEY: &str = "target_globals";
pub const MUTATIONS_PREFIX: &str = "mutations/";
pub const MUTATION_QUEUE_KEY: &str = "mutation_queue";
pub const DOCUMENT_OVERLAYS_PREFIX: &str = "document_overlays/";

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    Put {
        namespace: String,
        key: String,
        value: JsonValue,
    },
    Delete {
        namespace: String,
        key: String,
    },
}

/// Writes applied atomically by [`PersistenceBackend::commit`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, namespace: impl Into<String>, key: impl Into<String>, value: JsonValue) {
        self.ops.push(WriteOp::Put {
            namespace: namespace.into(),
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, namespace: impl Into<String>, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            namespace: namespace.into(),
            key: key.into(),
        });
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn namespaces(&self) -> BTreeSet<&str> {
        self.ops
            .iter()
            .map(|op| match op {
                WriteOp::Put { namespace, .. } | WriteOp::Delete { namespace, .. } => namespace.as_str(),
            })
            .collect()
    }
}

/// Durable key-value store with ordered prefix scans.
///
/// Keys live in namespaces; implementations must apply a [`WriteBatch`]
/// all-or-nothing.
pub trait PersistenceBackend: Send + Sync + 'static {
    fn read(&self, namespace: &str, key: &str) -> FirestoreResult<Option<JsonValue>>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, namespace: &str, prefix: &str) -> FirestoreResult<Vec<(String, JsonValue)>>;

    fn commit(&self, batch: WriteBatch) -> FirestoreResult<()>;
}

type Namespaces = BTreeMap<String, BTreeMap<String, JsonValue>>;

fn apply_ops(data: &mut Namespaces, ops: Vec<WriteOp>) {
    for op in ops {
        match op {
            WriteOp::Put { namespace, key, value } => {
                data.entry(namespace).or_default().insert(key, value);
            }
            WriteOp::Delete { namespace, key } => {
                if let Some(entries) = data.get_mut(&namespace) {
                    entries.remove(&key);
                }
            }
        }
    }
}

fn scan(entries: Option<&BTreeMap<String, JsonValue>>, prefix: &str) -> Vec<(String, JsonValue)> {
    let Some(entries) = entries else {
        return Vec::new();
    };
    entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Backend kept entirely in memory. Commits can be made to fail on demand to
/// exercise storage failure handling.
#[derive(Debug, Default)]
pub struct MemoryPersistenceBackend {
    data: StdMutex<Namespaces>,
    fail_commits: AtomicBool,
}

impl MemoryPersistenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn entry_count(&self, namespace: &str) -> usize {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map_or(0, BTreeMap::len)
    }
}

impl PersistenceBackend for MemoryPersistenceBackend {
    fn read(&self, namespace: &str, key: &str) -> FirestoreResult<Option<JsonValue>> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(namespace).and_then(|entries| entries.get(key)).cloned())
    }

    fn scan_prefix(&self, namespace: &str, prefix: &str) -> FirestoreResult<Vec<(String, JsonValue)>> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(scan(data.get(namespace), prefix))
    }

    fn commit(&self, batch: WriteBatch) -> FirestoreResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(unavailable("Simulated persistence failure"));
        }
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        apply_ops(&mut data, batch.ops);
        Ok(())
    }
}

/// Backend that stores each namespace as one JSON file in `directory`.
///
/// Files are rewritten through a temporary sibling and renamed into place, so a
/// crash leaves either the old or the new contents of each namespace.
#[derive(Debug)]
pub struct FilePersistenceBackend {
    directory: PathBuf,
    cache: StdMutex<Namespaces>,
}

impl FilePersistenceBackend {
    pub fn open(directory: impl Into<PathBuf>) -> FirestoreResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .map_err(|err| unavailable(format!("Failed to create {}: {err}", directory.display())))?;
        Ok(Self {
            directory,
            cache: StdMutex::new(BTreeMap::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_for(&self, namespace: &str) -> PathBuf {
        let file_name: String = namespace
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.directory.join(format!("{file_name}.json"))
    }

    fn load<'a>(&self, cache: &'a mut Namespaces, namespace: &str) -> FirestoreResult<&'a mut BTreeMap<String, JsonValue>> {
        if !cache.contains_key(namespace) {
            let path = self.file_for(namespace);
            let entries = match fs::read(&path) {
                Ok(bytes) => serde_json::from_slice::<BTreeMap<String, JsonValue>>(&bytes)
                    .map_err(|err| unavailable(format!("Corrupt persistence file {}: {err}", path.display())))?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
                Err(err) => return Err(unavailable(format!("Failed to read {}: {err}", path.display()))),
            };
            cache.insert(namespace.to_string(), entries);
        }
        Ok(cache.entry(namespace.to_string()).or_default())
    }

    fn write_namespace(&self, namespace: &str, entries: &BTreeMap<String, JsonValue>) -> FirestoreResult<()> {
        let path = self.file_for(namespace);
        let temp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(entries)
            .map_err(|err| unavailable(format!("Failed to encode namespace {namespace}: {err}")))?;
        fs::write(&temp, bytes).map_err(|err| unavailable(format!("Failed to write {}: {err}", temp.display())))?;
        fs::rename(&temp, &path).map_err(|err| unavailable(format!("Failed to replace {}: {err}", path.display())))
    }
}

impl PersistenceBackend for FilePersistenceBackend {
    fn read(&self, namespace: &str, key: &str) -> FirestoreResult<Option<JsonValue>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load(&mut cache, namespace)?.get(key).cloned())
    }

    fn scan_prefix(&self, namespace: &str, prefix: &str) -> FirestoreResult<Vec<(String, JsonValue)>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = self.load(&mut cache, namespace)?;
        Ok(scan(Some(entries), prefix))
    }

    fn commit(&self, batch: WriteBatch) -> FirestoreResult<()> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let namespaces: Vec<String> = batch.namespaces().into_iter().map(str::to_string).collect();
        let mut staged = Namespaces::new();
        for namespace in &namespaces {
            staged.insert(namespace.clone(), self.load(&mut cache, namespace)?.clone());
        }
        apply_ops(&mut staged, batch.ops);
        for (namespace, entries) in &staged {
            self.write_namespace(namespace, entries)?;
        }
        cache.extend(staged);
        Ok(())
    }
}

/// Typed record of a change made during one local store operation.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingWrite {
    RemoteDocument(MutableDocument),
    RemoveRemoteDocument(DocumentKey),
    MutationBatch(MutationBatch),
    RemoveMutationBatch(i32),
    MutationQueueMetadata {
        last_stream_token: Vec<u8>,
        highest_batch_id: i32,
    },
    Overlay(Overlay),
    RemoveOverlay(DocumentKey),
    Target(TargetData),
    RemoveTarget(i32),
    TargetDocuments {
        target_id: i32,
        keys: BTreeSet<DocumentKey>,
    },
    TargetGlobals(TargetGlobals),
}

/// Cache-wide target bookkeeping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetGlobals {
    pub highest_target_id: i32,
    pub highest_listen_sequence_number: i64,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: usize,
}

/// Changes accumulated by one local store operation, committed as a unit.
#[derive(Debug)]
pub struct PersistenceTransaction {
    label: &'static str,
    sequence_number: i64,
    writes: Vec<PendingWrite>,
}

impl PersistenceTransaction {
    pub fn new(label: &'static str, sequence_number: i64) -> Self {
        Self {
            label,
            sequence_number,
            writes: Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Listen sequence number stamped on everything touched by this operation.
    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn record(&mut self, write: PendingWrite) {
        self.writes.push(write);
    }

    pub fn writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<PendingWrite> {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;
    use std::sync::atomic::AtomicUsize;

    static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

    fn temp_dir() -> PathBuf {
        env::temp_dir().join(format!(
            "firestore-sync-persistence-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::SeqCst)
        ))
    }

    #[test]
    fn memory_backend_scans_prefixes_in_order() {
        let backend = MemoryPersistenceBackend::new();
        let mut batch = WriteBatch::new();
        batch.put("p/d", "mutations/0000000002", json!(2));
        batch.put("p/d", "mutations/0000000001", json!(1));
        batch.put("p/d", "targets/0000000002", json!("t"));
        backend.commit(batch).unwrap();

        let scanned = backend.scan_prefix("p/d", MUTATIONS_PREFIX).unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["mutations/0000000001", "mutations/0000000002"]);
        assert!(backend.scan_prefix("other", MUTATIONS_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn failed_commits_leave_data_untouched() {
        let backend = MemoryPersistenceBackend::new();
        backend.set_fail_commits(true);
        let mut batch = WriteBatch::new();
        batch.put("ns", "k", json!(true));
        let err = backend.commit(batch).unwrap_err();
        assert_eq!(err.code_str(), "firestore/unavailable");
        assert_eq!(backend.read("ns", "k").unwrap(), None);
    }

    #[test]
    fn file_backend_survives_reopen() {
        let dir = temp_dir();
        {
            let backend = FilePersistenceBackend::open(&dir).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("p/d", "remote_documents/rooms/a", json!({"v": 1}));
            batch.put("p/d/alice", "mutation_queue", json!({"token": "x"}));
            backend.commit(batch).unwrap();
            let mut batch = WriteBatch::new();
            batch.delete("p/d", "remote_documents/rooms/a");
            batch.put("p/d", "remote_documents/rooms/b", json!({"v": 2}));
            backend.commit(batch).unwrap();
        }
        let reopened = FilePersistenceBackend::open(&dir).unwrap();
        assert_eq!(reopened.read("p/d", "remote_documents/rooms/a").unwrap(), None);
        assert_eq!(
            reopened.read("p/d", "remote_documents/rooms/b").unwrap(),
            Some(json!({"v": 2}))
        );
        assert_eq!(
            reopened.read("p/d/alice", "mutation_queue").unwrap(),
            Some(json!({"token": "x"}))
        );
        let _ = fs::remove_dir_all(dir);
    }
}
