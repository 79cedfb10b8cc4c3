use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::oneshot;
use futures::FutureExt;

use crate::firestore::core::event_manager::{EventManager, QueryListener, QueryObserver};
use crate::firestore::core::query::Query;
use crate::firestore::core::settings::{FirestoreSettings, ListenOptions, ListenSource, TransactionOptions};
use crate::firestore::core::sync_engine::{SharedLocalStore, SyncEngine};
use crate::firestore::core::transaction::{Transaction, TransactionRunner};
use crate::firestore::core::user::User;
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, failed_precondition, unavailable, FirestoreResult};
use crate::firestore::local::{
    GarbageCollectionTask, LocalStore, LruGarbageCollector, LruResults, LruScheduler,
};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::{
    ConnectionArc, ConnectivityMonitor, CredentialsProviderArc, DatastoreArc, JsonProtoSerializer,
    NoopConnectivityMonitor, OnlineState, RemoteDatastore, RemoteStore,
};
use crate::util::AsyncQueue;

/// Entry point of the sync engine stack. Every component call is funnelled
/// through one [`AsyncQueue`] so callers may use the client from any task.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    database_id: DatabaseId,
    settings: FirestoreSettings,
    queue: AsyncQueue,
    local_store: SharedLocalStore,
    remote_store: RemoteStore,
    sync_engine: SyncEngine,
    event_manager: EventManager,
    datastore: DatastoreArc,
    lru_scheduler: LruScheduler,
    terminated: AtomicBool,
}

impl FirestoreClient {
    /// Opens the local store and starts the network for `user`.
    pub async fn start(
        database_id: DatabaseId,
        user: User,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        settings: FirestoreSettings,
    ) -> FirestoreResult<Self> {
        Self::start_with_connectivity(
            database_id,
            user,
            connection,
            credentials,
            settings,
            Arc::new(NoopConnectivityMonitor),
        )
        .await
    }

    pub async fn start_with_connectivity(
        database_id: DatabaseId,
        user: User,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        settings: FirestoreSettings,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> FirestoreResult<Self> {
        settings.validate()?;
        log::debug!("starting client for {database_id:?} as {user:?}");

        let queue = AsyncQueue::new();
        let local_store = LocalStore::open(
            Arc::clone(&settings.persistence),
            database_id.clone(),
            user.clone(),
            settings.query_engine,
        )?;
        let local_store: SharedLocalStore = Arc::new(Mutex::new(local_store));
        let remote_store = RemoteStore::new(
            database_id.clone(),
            queue.clone(),
            Arc::clone(&connection),
            Arc::clone(&credentials),
            settings.retry,
            connectivity,
        );
        let datastore: DatastoreArc = Arc::new(RemoteDatastore::new(
            connection,
            credentials,
            JsonProtoSerializer::new(database_id.clone()),
        ));
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            user,
            settings.max_concurrent_limbo_resolutions,
        )?;
        let event_manager = EventManager::new(sync_engine.clone())?;
        let lru_scheduler = LruScheduler::new(
            &settings.lru_params,
            queue.clone(),
            garbage_collection_task(&local_store, &settings),
        );

        let starting = remote_store.clone();
        queue.enqueue(async move { starting.start().await }).await?;
        lru_scheduler.start();

        Ok(Self {
            inner: Arc::new(ClientInner {
                database_id,
                settings,
                queue,
                local_store,
                remote_store,
                sync_engine,
                event_manager,
                datastore,
                lru_scheduler,
                terminated: AtomicBool::new(false),
            }),
        })
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.remote_store.online_state()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Subscribes `observer` to `query`. Dropping the returned registration
    /// stops the listen.
    pub fn listen<F>(&self, query: Query, options: ListenOptions, observer: F) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let observer: QueryObserver = Arc::new(observer);
        let listener = Arc::new(QueryListener::new(query, options, observer));
        let event_manager = self.inner.event_manager.clone();
        let registered = Arc::clone(&listener);
        self.inner
            .queue
            .enqueue_and_forget(async move { event_manager.listen(registered).await });
        Ok(ListenerRegistration {
            client: self.clone(),
            listener: Some(listener),
        })
    }

    /// Reads `key` from the local cache. `None` means the cache knows the
    /// document does not exist.
    pub async fn get_document_from_local_cache(&self, key: &DocumentKey) -> FirestoreResult<Option<MutableDocument>> {
        self.ensure_running()?;
        let local_store = Arc::clone(&self.inner.local_store);
        let key = key.clone();
        let document = self
            .inner
            .queue
            .enqueue(async move { Ok(lock_store(&local_store).get_document(&key)) })
            .await?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(
                "Failed to get document from cache. The document may exist on the server; \
                 read it with the default source instead.",
            ))
        }
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        self.ensure_running()?;
        let local_store = Arc::clone(&self.inner.local_store);
        let query = query.clone();
        self.inner
            .queue
            .enqueue(async move {
                let result = lock_store(&local_store).execute_query(&query, true)?;
                let mut view = View::new(query, result.remote_keys);
                let changes = view.compute_doc_changes(&result.documents, None)?;
                let change = view.apply_changes(changes, false, None)?;
                Ok(change.snapshot.unwrap_or_else(|| view.compute_initial_snapshot()))
            })
            .await
    }

    /// Waits for a backend-confirmed snapshot of `query`. Fails while offline.
    pub async fn get_documents_from_server(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let options = ListenOptions::default()
            .with_include_metadata_changes(true)
            .with_wait_for_sync_when_online(true)
            .with_source(ListenSource::Default);
        let registration = self.listen(query.clone(), options, move |result| {
            let outcome = match result {
                Ok(snapshot) if snapshot.from_cache => Err(unavailable(
                    "Failed to get documents from server because the client is offline.",
                )),
                other => other,
            };
            if let Some(sender) = sender.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = sender.send(outcome);
            }
        })?;
        let outcome = receiver
            .await
            .map_err(|_| cancelled("The listener was removed before the server answered."));
        registration.detach();
        outcome?
    }

    /// Queues `mutations` as one batch and resolves once the backend
    /// acknowledges it. While offline the batch is applied locally and the
    /// future stays pending until the network returns.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.ensure_running()?;
        let (sender, receiver) = oneshot::channel();
        let sync_engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(async move { sync_engine.write(mutations, sender).await.map(|_| ()) })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("The client was terminated before the write completed."))?
    }

    /// Runs `update` in a transaction, retrying on contention.
    pub async fn transaction<T, F, Fut>(&self, options: TransactionOptions, update: F) -> FirestoreResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        self.ensure_running()?;
        TransactionRunner::new(
            self.inner.queue.clone(),
            Arc::clone(&self.inner.datastore),
            options,
            self.inner.settings.retry,
        )
        .run(update)
        .await
    }

    /// Resolves once every write queued so far has been acknowledged or
    /// rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.ensure_running()?;
        let (sender, receiver) = oneshot::channel();
        let sync_engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(async move {
                sync_engine.register_pending_writes_callback(sender);
                Ok(())
            })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("The client was terminated while waiting for pending writes."))?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.ensure_running()?;
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.ensure_running()?;
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.disable_network().await })
            .await
    }

    /// Switches the active user. Pending writes of the previous user stay
    /// queued under that user.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        self.ensure_running()?;
        let sync_engine = self.inner.sync_engine.clone();
        self.inner
            .queue
            .enqueue(async move { sync_engine.handle_credential_change(user).await })
            .await
    }

    /// Runs one garbage collection pass now, outside the regular schedule.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        self.ensure_running()?;
        let task = garbage_collection_task(&self.inner.local_store, &self.inner.settings);
        self.inner.queue.enqueue(task()).await
    }

    /// Stops the network and refuses further calls. Idempotent.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("terminating client for {:?}", self.inner.database_id);
        self.inner.lru_scheduler.stop();
        self.inner.queue.enter_restricted_mode();
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue_even_while_restricted(async move { remote_store.shutdown().await })
            .await
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync_engine
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.inner.event_manager
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    /// Runs `read` against the local store on the queue.
    pub async fn with_local_store<T, F>(&self, read: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut LocalStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(async move { Ok(read(&mut lock_store(&local_store))) })
            .await
    }

    fn ensure_running(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }
}

fn lock_store(local_store: &SharedLocalStore) -> std::sync::MutexGuard<'_, LocalStore> {
    local_store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn garbage_collection_task(local_store: &SharedLocalStore, settings: &FirestoreSettings) -> GarbageCollectionTask {
    let local_store = Arc::clone(local_store);
    let params = settings.lru_params;
    Arc::new(move || {
        let local_store = Arc::clone(&local_store);
        async move {
            let collector = LruGarbageCollector::new(params);
            lock_store(&local_store).collect_garbage(&collector)
        }
        .boxed()
    })
}

/// Handle of an active listener. The listener is removed when the handle is
/// detached or dropped.
pub struct ListenerRegistration {
    client: FirestoreClient,
    listener: Option<Arc<QueryListener>>,
}

impl ListenerRegistration {
    pub fn detach(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(listener) = self.listener.take() {
            if self.client.is_terminated() {
                return;
            }
            let event_manager = self.client.inner.event_manager.clone();
            self.client
                .inner
                .queue
                .enqueue_and_forget(async move { event_manager.unlisten(&listener).await });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}
