use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::poll_fn;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value as JsonValue;

use crate::types::{pluralize_type, strip_ns_prefix, EntityRef};
use crate::ParqueError;

/// A hydrated relationship target.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedEntity {
    pub entity: EntityRef,
    pub predicate: String,
    pub doc: Option<JsonValue>,
}

/// The underlying per-entity relationship fetch the loader coalesces.
#[async_trait]
pub trait RelatedFetcher: Send + Sync {
    async fn get_related(
        &self,
        ns: &str,
        id: &str,
        relation: &str,
    ) -> Result<Vec<RelatedEntity>, ParqueError>;
}

#[derive(Debug, Clone)]
pub struct BatchLoaderOptions {
    /// Collection window before a batch flushes.
    pub window: Duration,
    pub max_batch_size: usize,
    pub deduplicate: bool,
}

impl Default for BatchLoaderOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(5),
            max_batch_size: 100,
            deduplicate: true,
        }
    }
}

type BatchKey = (String, String);
type SharedResult = Result<Vec<RelatedEntity>, Arc<ParqueError>>;

struct BatchState {
    ns: String,
    relation: String,
    /// Ids to fetch; taken exactly once by whoever flushes the batch.
    ids: Mutex<Option<BTreeSet<String>>>,
    results: Mutex<Option<HashMap<String, SharedResult>>>,
    full: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl BatchState {
    fn new(ns: String, relation: String) -> Self {
        Self {
            ns,
            relation,
            ids: Mutex::new(Some(BTreeSet::new())),
            results: Mutex::new(None),
            full: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock().unwrap();
        if !wakers.iter().any(|existing| existing.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn wake_all(&self) {
        let wakers: Vec<Waker> = std::mem::take(&mut *self.wakers.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
    }

    fn complete(&self, results: HashMap<String, SharedResult>) {
        *self.results.lock().unwrap() = Some(results);
        self.wake_all();
    }
}

/// Coalesces `load(type, id, relation)` calls that arrive within a small
/// window into one flush per `(type, relation)`, deduplicating ids, so a
/// page that renders N entities does not issue N identical lookups.
pub struct BatchLoader {
    fetcher: Arc<dyn RelatedFetcher>,
    options: BatchLoaderOptions,
    pending: Mutex<HashMap<BatchKey, Arc<BatchState>>>,
}

impl BatchLoader {
    pub fn new(fetcher: Arc<dyn RelatedFetcher>, options: BatchLoaderOptions) -> Self {
        Self {
            fetcher,
            options,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the related entities for one `(type, id, relation)` tuple.
    /// Callers may pass raw local ids or `ns/`-prefixed ids.
    pub async fn load(
        &self,
        type_name: &str,
        id: &str,
        relation: &str,
    ) -> Result<Vec<RelatedEntity>, ParqueError> {
        self.load_ns(&pluralize_type(type_name), id, relation).await
    }

    /// Same as `load` with the namespace already resolved.
    pub async fn load_ns(
        &self,
        ns: &str,
        id: &str,
        relation: &str,
    ) -> Result<Vec<RelatedEntity>, ParqueError> {
        let ns = ns.to_string();
        let local_id = strip_ns_prefix(id, &ns).to_string();
        let key: BatchKey = (ns.clone(), relation.to_string());

        let (batch, leader, flush_now) = {
            let mut pending = self.pending.lock().unwrap();
            let (batch, leader) = match pending.get(&key) {
                Some(batch) => (Arc::clone(batch), false),
                None => {
                    let batch = Arc::new(BatchState::new(ns.clone(), relation.to_string()));
                    pending.insert(key.clone(), Arc::clone(&batch));
                    (batch, true)
                }
            };

            let mut flush_now = false;
            {
                let mut ids = batch.ids.lock().unwrap();
                if let Some(ids) = ids.as_mut() {
                    if !self.options.deduplicate || !ids.contains(&local_id) {
                        ids.insert(local_id.clone());
                    }
                    if ids.len() >= self.options.max_batch_size {
                        flush_now = true;
                    }
                }
            }
            (batch, leader, flush_now)
        };

        if flush_now {
            batch.full.store(true, Ordering::SeqCst);
            batch.wake_all();
        }

        if leader {
            self.wait_window(&batch).await;
            self.flush_batch(&key, &batch).await;
        } else {
            self.wait_complete(&batch).await;
        }

        let results = batch.results.lock().unwrap();
        let Some(results) = results.as_ref() else {
            return Err(ParqueError::unavailable("batch completed without results"));
        };
        match results.get(&local_id) {
            Some(Ok(entities)) => Ok(entities.clone()),
            Some(Err(error)) => Err(match error.as_ref() {
                ParqueError::Cancelled(reason) => ParqueError::cancelled(reason.clone()),
                other => ParqueError::unavailable(format!("batched fetch failed: {other}")),
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Flushes every pending batch immediately.
    pub async fn flush(&self) {
        let batches: Vec<(BatchKey, Arc<BatchState>)> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .map(|(key, batch)| (key.clone(), Arc::clone(batch)))
                .collect()
        };
        for (key, batch) in batches {
            batch.full.store(true, Ordering::SeqCst);
            batch.wake_all();
            self.flush_batch(&key, &batch).await;
        }
    }

    /// Rejects every pending request with a cleared error and empties
    /// internal state.
    pub fn clear(&self) {
        let batches: Vec<Arc<BatchState>> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, batch)| batch).collect()
        };
        for batch in batches {
            let ids = batch.ids.lock().unwrap().take().unwrap_or_default();
            let error = Arc::new(ParqueError::cancelled("batch loader cleared"));
            let results: HashMap<String, SharedResult> = ids
                .into_iter()
                .map(|id| (id, Err(Arc::clone(&error))))
                .collect();
            batch.full.store(true, Ordering::SeqCst);
            batch.complete(results);
        }
    }

    /// Number of batches currently collecting.
    pub fn pending_batches(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// The leader parks until the window elapses or the batch fills.
    async fn wait_window(&self, batch: &Arc<BatchState>) {
        let mut delay = futures_timer::Delay::new(self.options.window);
        poll_fn(|cx| {
            if batch.full.load(Ordering::SeqCst) || batch.results.lock().unwrap().is_some() {
                return Poll::Ready(());
            }
            if Pin::new(&mut delay).poll(cx).is_ready() {
                return Poll::Ready(());
            }
            batch.register(cx.waker());
            if batch.full.load(Ordering::SeqCst) || batch.results.lock().unwrap().is_some() {
                return Poll::Ready(());
            }
            Poll::Pending
        })
        .await
    }

    async fn wait_complete(&self, batch: &Arc<BatchState>) {
        poll_fn(|cx| {
            if batch.results.lock().unwrap().is_some() {
                return Poll::Ready(());
            }
            batch.register(cx.waker());
            if batch.results.lock().unwrap().is_some() {
                return Poll::Ready(());
            }
            Poll::Pending
        })
        .await
    }

    /// Exactly one caller takes the id set and issues the underlying
    /// lookups; everyone else waits on the shared results. Errors are
    /// scoped to the id that failed.
    async fn flush_batch(&self, key: &BatchKey, batch: &Arc<BatchState>) {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, batch))
            {
                pending.remove(key);
            }
        }

        let Some(ids) = batch.ids.lock().unwrap().take() else {
            // Someone else already flushed (or clear() rejected) this batch.
            self.wait_complete(batch).await;
            return;
        };

        let mut fetches: FuturesUnordered<_> = ids
            .into_iter()
            .map(|id| {
                let fetcher = Arc::clone(&self.fetcher);
                let ns = batch.ns.clone();
                let relation = batch.relation.clone();
                async move {
                    let result = fetcher.get_related(&ns, &id, &relation).await;
                    (id, result.map_err(Arc::new))
                }
            })
            .collect();

        let mut results: HashMap<String, SharedResult> = HashMap::new();
        while let Some((id, result)) = fetches.next().await {
            results.insert(id, result);
        }
        batch.complete(results);
    }
}
