mod codec;
mod tail;

pub use codec::{decode_batch, encode_batch, is_compressed, GZIP_MAGIC};
pub use tail::{TailHandle, TailMode, TailReader};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::Waker;

use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::storage::StorageBackend;
use crate::ParqueError;

#[derive(Debug, Clone)]
pub struct EventLogOptions {
    /// Soft threshold: pending event count that triggers a flush.
    pub flush_batch_count: usize,
    /// Hard threshold: pending byte size that triggers a flush.
    pub flush_batch_bytes: usize,
}

impl Default for EventLogOptions {
    fn default() -> Self {
        Self {
            flush_batch_count: 64,
            flush_batch_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    pub ns: String,
    pub path: String,
    pub first_seq: u64,
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct NsState {
    loaded: bool,
    next_seq: u64,
    pending: Vec<Event>,
    pending_bytes: usize,
    segments: Vec<SegmentMeta>,
}

#[derive(Default)]
struct NsSignal {
    wakers: Mutex<Vec<Waker>>,
}

impl NsSignal {
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
}

/// Append-only compressed event log, one stream per namespace. Sequences
/// are assigned under the per-namespace lock at append time, so they are
/// strictly monotonic. Batches accumulate in memory and flush to storage
/// segments on count/byte thresholds or explicit `flush`.
pub struct EventLog {
    storage: Arc<dyn StorageBackend>,
    options: EventLogOptions,
    inner: Mutex<HashMap<String, NsState>>,
    signals: Mutex<HashMap<String, Arc<NsSignal>>>,
}

impl EventLog {
    pub fn new(storage: Arc<dyn StorageBackend>, options: EventLogOptions) -> Self {
        Self {
            storage,
            options,
            inner: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn signal(&self, ns: &str) -> Arc<NsSignalHandle> {
        let mut signals = self.signals.lock().unwrap();
        let signal = signals.entry(ns.to_string()).or_default();
        Arc::new(NsSignalHandle {
            signal: Arc::clone(signal),
        })
    }

    fn wake(&self, ns: &str) {
        let signal = {
            let signals = self.signals.lock().unwrap();
            signals.get(ns).cloned()
        };
        if let Some(signal) = signal {
            signal.wake_all();
        }
    }

    /// Rebuilds the per-namespace segment index from storage on first
    /// touch. Segment file names carry the sequence range.
    async fn ensure_loaded(&self, ns: &str) -> Result<(), ParqueError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.get(ns).is_some_and(|state| state.loaded) {
                return Ok(());
            }
        }

        let prefix = format!("wal/{ns}/");
        let paths = self.storage.list(&prefix).await?;
        let mut segments = Vec::new();
        for path in paths {
            if let Some(meta) = parse_segment_path(ns, &path) {
                segments.push(meta);
            }
        }
        segments.sort_by_key(|segment| segment.first_seq);
        let next_seq = segments
            .last()
            .map(|segment| segment.last_seq + 1)
            .unwrap_or(1);

        let mut inner = self.inner.lock().unwrap();
        let state = inner.entry(ns.to_string()).or_default();
        if !state.loaded {
            state.loaded = true;
            state.segments = segments;
            state.next_seq = next_seq.max(state.next_seq).max(1);
        }
        Ok(())
    }

    /// Appends events, assigning monotonic sequences. Returns the events
    /// with their assigned sequences. May trigger a threshold flush.
    pub async fn append(&self, ns: &str, events: Vec<Event>) -> Result<Vec<Event>, ParqueError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_loaded(ns).await?;

        let (assigned, flush_needed) = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.entry(ns.to_string()).or_default();
            if state.next_seq == 0 {
                state.next_seq = 1;
            }
            let mut assigned = Vec::with_capacity(events.len());
            for mut event in events {
                event.seq = state.next_seq;
                state.next_seq += 1;
                state.pending_bytes += serde_json::to_vec(&event).map(|b| b.len()).unwrap_or(0);
                state.pending.push(event.clone());
                assigned.push(event);
            }
            let flush_needed = state.pending.len() >= self.options.flush_batch_count
                || state.pending_bytes >= self.options.flush_batch_bytes;
            (assigned, flush_needed)
        };

        self.wake(ns);
        if flush_needed {
            self.flush(ns).await?;
        }
        Ok(assigned)
    }

    /// Writes the pending batch as one compressed segment. Returns the
    /// number of events flushed. On storage failure the batch is restored
    /// for a retry.
    pub async fn flush(&self, ns: &str) -> Result<usize, ParqueError> {
        self.ensure_loaded(ns).await?;

        let batch = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.entry(ns.to_string()).or_default();
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let first_seq = batch.first().map(|event| event.seq).unwrap_or(0);
        let last_seq = batch.last().map(|event| event.seq).unwrap_or(0);
        let path = segment_path(ns, first_seq, last_seq);
        let encoded = encode_batch(&batch)?;

        if let Err(error) = self.storage.write(&path, &encoded).await {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.entry(ns.to_string()).or_default();
            let mut restored = batch;
            restored.append(&mut state.pending);
            state.pending = restored;
            state.pending_bytes = state
                .pending
                .iter()
                .map(|event| serde_json::to_vec(event).map(|b| b.len()).unwrap_or(0))
                .sum();
            return Err(error);
        }

        let flushed = batch.len();
        let mut inner = self.inner.lock().unwrap();
        let state = inner.entry(ns.to_string()).or_default();
        state.pending_bytes = state
            .pending
            .iter()
            .map(|event| serde_json::to_vec(event).map(|b| b.len()).unwrap_or(0))
            .sum();
        state.segments.push(SegmentMeta {
            ns: ns.to_string(),
            path,
            first_seq,
            last_seq,
            created_at: Utc::now(),
        });
        state.segments.sort_by_key(|segment| segment.first_seq);
        Ok(flushed)
    }

    pub async fn flush_all(&self) -> Result<usize, ParqueError> {
        let namespaces: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.keys().cloned().collect()
        };
        let mut total = 0;
        for ns in namespaces {
            total += self.flush(&ns).await?;
        }
        Ok(total)
    }

    /// Highest assigned sequence for the namespace; 0 when empty.
    pub async fn high_water_mark(&self, ns: &str) -> Result<u64, ParqueError> {
        self.ensure_loaded(ns).await?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .get(ns)
            .map(|state| state.next_seq.saturating_sub(1))
            .unwrap_or(0))
    }

    pub(crate) fn high_water_mark_sync(&self, ns: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .get(ns)
            .map(|state| state.next_seq.saturating_sub(1))
            .unwrap_or(0)
    }

    /// Reads all events with `seq >= from_seq`, in order, spanning flushed
    /// segments and the in-memory batch.
    pub async fn read_from(&self, ns: &str, from_seq: u64) -> Result<Vec<Event>, ParqueError> {
        self.ensure_loaded(ns).await?;

        let (segments, pending) = {
            let inner = self.inner.lock().unwrap();
            let Some(state) = inner.get(ns) else {
                return Ok(Vec::new());
            };
            let segments: Vec<SegmentMeta> = state
                .segments
                .iter()
                .filter(|segment| segment.last_seq >= from_seq)
                .cloned()
                .collect();
            let pending: Vec<Event> = state
                .pending
                .iter()
                .filter(|event| event.seq >= from_seq)
                .cloned()
                .collect();
            (segments, pending)
        };

        let mut events = Vec::new();
        for segment in segments {
            let bytes = self.storage.read(&segment.path).await?;
            let batch = decode_batch(&bytes)?;
            events.extend(batch.into_iter().filter(|event| event.seq >= from_seq));
        }
        events.extend(pending);
        events.sort_by_key(|event| event.seq);
        events.dedup_by_key(|event| event.seq);
        Ok(events)
    }

    /// Current position of the log for commit metadata: the last segment
    /// id and the offset (sequence) inside the namespace stream.
    pub async fn position(&self, ns: &str) -> Result<(String, u64), ParqueError> {
        self.ensure_loaded(ns).await?;
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.get(ns) else {
            return Ok((String::new(), 0));
        };
        let segment_id = state
            .segments
            .last()
            .map(|segment| segment.path.clone())
            .unwrap_or_default();
        Ok((segment_id, state.next_seq.saturating_sub(1)))
    }

    pub fn tail(self: &Arc<Self>, ns: &str, from_seq: u64, mode: TailMode) -> TailReader {
        TailReader::new(Arc::clone(self), ns.to_string(), from_seq, mode)
    }
}

pub(crate) struct NsSignalHandle {
    signal: Arc<NsSignal>,
}

impl NsSignalHandle {
    pub(crate) fn register(&self, waker: &Waker) {
        self.signal.register(waker);
    }

    pub(crate) fn wake_all(&self) {
        self.signal.wake_all();
    }
}

fn segment_path(ns: &str, first_seq: u64, last_seq: u64) -> String {
    format!("wal/{ns}/{first_seq:020}-{last_seq:020}.bin")
}

fn parse_segment_path(ns: &str, path: &str) -> Option<SegmentMeta> {
    let name = path.rsplit('/').next()?.strip_suffix(".bin")?;
    let (first, last) = name.split_once('-')?;
    Some(SegmentMeta {
        ns: ns.to_string(),
        path: path.to_string(),
        first_seq: first.parse().ok()?,
        last_seq: last.parse().ok()?,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{EventLog, EventLogOptions};
    use crate::event::{Event, EventOp};
    use crate::storage::{MemoryBackend, StorageBackend};
    use chrono::Utc;
    use serde_json::json;

    fn draft(target: &str) -> Event {
        Event {
            id: uuid::Uuid::now_v7().to_string(),
            seq: 0,
            ts: Utc::now(),
            op: EventOp::Create,
            target: target.to_string(),
            before: None,
            after: Some(json!({"ok": true})),
            actor: "tester".to_string(),
            metadata: None,
        }
    }

    fn log_with(storage: Arc<MemoryBackend>) -> Arc<EventLog> {
        Arc::new(EventLog::new(storage, EventLogOptions::default()))
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_namespace() {
        let log = log_with(Arc::new(MemoryBackend::new()));
        let first = log.append("posts", vec![draft("posts:a"), draft("posts:b")]).await.unwrap();
        let second = log.append("posts", vec![draft("posts:c")]).await.unwrap();
        let other = log.append("users", vec![draft("users:x")]).await.unwrap();

        assert_eq!(first[0].seq, 1);
        assert_eq!(first[1].seq, 2);
        assert_eq!(second[0].seq, 3);
        assert_eq!(other[0].seq, 1);
    }

    #[tokio::test]
    async fn read_from_spans_segments_and_pending() {
        let log = log_with(Arc::new(MemoryBackend::new()));
        log.append("posts", vec![draft("posts:a"), draft("posts:b")]).await.unwrap();
        log.flush("posts").await.unwrap();
        log.append("posts", vec![draft("posts:c")]).await.unwrap();

        let events = log.read_from("posts", 1).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|event| event.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let later = log.read_from("posts", 3).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].target, "posts:c");
    }

    #[tokio::test]
    async fn count_threshold_triggers_flush() {
        let storage = Arc::new(MemoryBackend::new());
        let log = Arc::new(EventLog::new(
            storage.clone(),
            EventLogOptions {
                flush_batch_count: 2,
                flush_batch_bytes: usize::MAX,
            },
        ));
        log.append("posts", vec![draft("posts:a"), draft("posts:b")]).await.unwrap();
        let segments = storage.list("wal/posts/").await.unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[tokio::test]
    async fn index_rebuilds_from_storage_after_restart() {
        let storage = Arc::new(MemoryBackend::new());
        {
            let log = log_with(storage.clone());
            log.append("posts", vec![draft("posts:a"), draft("posts:b")]).await.unwrap();
            log.flush("posts").await.unwrap();
        }

        let log = log_with(storage);
        let appended = log.append("posts", vec![draft("posts:c")]).await.unwrap();
        assert_eq!(appended[0].seq, 3);
        assert_eq!(log.high_water_mark("posts").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn explicit_flush_of_empty_batch_returns_zero() {
        let log = log_with(Arc::new(MemoryBackend::new()));
        assert_eq!(log.flush("posts").await.unwrap(), 0);
    }
}
