mod eval_scores;
mod request_buffer;
mod worker_requests;

pub use eval_scores::{EvalScores, EvalScoresOptions, ScoreDimension, ScoreRecord, ScoreStats};
pub use request_buffer::{RequestBuffer, RequestBufferOptions};
pub use worker_requests::{
    percentile, BucketSummary, GroupBy, RequestRecord, TimeBucket, WorkerRequests,
    WorkerRequestsOptions,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::event::Event;
use crate::types::CancelToken;
use crate::wal::EventLog;
use crate::ParqueError;

/// An event-sourced materialized view. Handlers see events in WAL order
/// per namespace, at least once within a run.
#[async_trait]
pub trait MvHandler: Send + Sync {
    fn name(&self) -> &str;

    fn source_namespaces(&self) -> Vec<String>;

    async fn process(&self, events: &[Event]) -> Result<(), ParqueError>;
}

#[derive(Debug, Clone)]
pub enum RefreshMode {
    /// Live delivery on every append.
    Streaming,
    /// Periodic drain.
    Scheduled { interval: Duration },
    /// Rebuild from the start of the source streams on refresh.
    Full,
}

#[derive(Debug, Clone)]
pub struct MvOptions {
    pub mode: RefreshMode,
    pub max_staleness: Option<Duration>,
    pub indexes: Vec<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    /// Redelivery attempts for a failing batch before it is parked for
    /// the next flush.
    pub max_retries: usize,
}

impl Default for MvOptions {
    fn default() -> Self {
        Self {
            mode: RefreshMode::Streaming,
            max_staleness: None,
            indexes: Vec::new(),
            tags: Vec::new(),
            description: None,
            max_retries: 1,
        }
    }
}

struct Registered {
    handler: Arc<dyn MvHandler>,
    options: MvOptions,
    /// Last processed sequence per source namespace; never regresses.
    positions: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MvEngineStats {
    pub handlers: usize,
    pub running: bool,
    pub positions: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Drives registered handlers from the WAL. Lifecycle is explicit:
/// `register`, `start`, `flush`, `stop`, `reset`. Multiple engines may
/// coexist when their storage roots are disjoint.
pub struct MvEngine {
    wal: Arc<EventLog>,
    inner: Mutex<MvEngineInner>,
}

#[derive(Default)]
struct MvEngineInner {
    handlers: Vec<Registered>,
    running: bool,
}

impl MvEngine {
    pub fn new(wal: Arc<EventLog>) -> Self {
        Self {
            wal,
            inner: Mutex::new(MvEngineInner::default()),
        }
    }

    pub fn register(&self, handler: Arc<dyn MvHandler>, options: MvOptions) {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.push(Registered {
            handler,
            options,
            positions: HashMap::new(),
        });
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().running = true;
    }

    pub fn stop(&self) {
        self.inner.lock().unwrap().running = false;
    }

    /// Clears delivery positions. Registered handlers stay registered;
    /// their own state is handler-owned.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        for registered in &mut inner.handlers {
            registered.positions.clear();
        }
    }

    pub fn stats(&self) -> MvEngineStats {
        let inner = self.inner.lock().unwrap();
        MvEngineStats {
            handlers: inner.handlers.len(),
            running: inner.running,
            positions: inner
                .handlers
                .iter()
                .map(|registered| {
                    (
                        registered.handler.name().to_string(),
                        registered
                            .positions
                            .iter()
                            .map(|(ns, seq)| (ns.clone(), *seq))
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    /// Delivers every queued event to every interested handler before
    /// returning. Handler failures are retried per policy, then parked
    /// (the position does not advance, so nothing is dropped).
    pub async fn flush(&self) -> Result<(), ParqueError> {
        let snapshot: Vec<(usize, Arc<dyn MvHandler>, Vec<String>, HashMap<String, u64>, usize)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .handlers
                .iter()
                .enumerate()
                .map(|(index, registered)| {
                    (
                        index,
                        Arc::clone(&registered.handler),
                        registered.handler.source_namespaces(),
                        registered.positions.clone(),
                        registered.options.max_retries,
                    )
                })
                .collect()
        };

        for (index, handler, namespaces, positions, max_retries) in snapshot {
            for ns in namespaces {
                let from = positions.get(&ns).copied().unwrap_or(0) + 1;
                let events = self.wal.read_from(&ns, from).await?;
                if events.is_empty() {
                    continue;
                }

                let mut delivered = false;
                for attempt in 0..=max_retries {
                    match handler.process(&events).await {
                        Ok(()) => {
                            delivered = true;
                            break;
                        }
                        Err(error) => {
                            warn!(
                                handler = handler.name(),
                                ns = ns.as_str(),
                                attempt,
                                %error,
                                "materialized view batch failed"
                            );
                        }
                    }
                }
                if !delivered {
                    continue;
                }

                let top = events.iter().map(|event| event.seq).max().unwrap_or(0);
                let mut inner = self.inner.lock().unwrap();
                if let Some(registered) = inner.handlers.get_mut(index) {
                    let position = registered.positions.entry(ns.clone()).or_insert(0);
                    *position = (*position).max(top);
                }
            }
        }
        Ok(())
    }

    /// Rebuilds one handler from the start of its sources. The recorded
    /// position stays monotonic.
    pub async fn refresh_full(&self, handler_name: &str) -> Result<(), ParqueError> {
        let target: Option<(Arc<dyn MvHandler>, Vec<String>)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .handlers
                .iter()
                .find(|registered| registered.handler.name() == handler_name)
                .map(|registered| {
                    (
                        Arc::clone(&registered.handler),
                        registered.handler.source_namespaces(),
                    )
                })
        };
        let Some((handler, namespaces)) = target else {
            return Err(ParqueError::not_found(format!("mv handler {handler_name}")));
        };

        for ns in namespaces {
            let events = self.wal.read_from(&ns, 1).await?;
            if events.is_empty() {
                continue;
            }
            handler.process(&events).await?;
            let top = events.iter().map(|event| event.seq).max().unwrap_or(0);
            let mut inner = self.inner.lock().unwrap();
            if let Some(registered) = inner
                .handlers
                .iter_mut()
                .find(|registered| registered.handler.name() == handler_name)
            {
                let position = registered.positions.entry(ns).or_insert(0);
                *position = (*position).max(top);
            }
        }
        Ok(())
    }

    /// Periodic drain loop for scheduled handlers; run until cancelled.
    pub async fn run_scheduled(&self, interval: Duration, cancel: CancelToken) {
        while !cancel.is_cancelled() {
            if self.inner.lock().unwrap().running {
                if let Err(error) = self.flush().await {
                    warn!(%error, "scheduled materialized view drain failed");
                }
            }
            futures_timer::Delay::new(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{MvEngine, MvHandler, MvOptions};
    use crate::event::{Event, EventOp};
    use crate::storage::MemoryBackend;
    use crate::wal::{EventLog, EventLogOptions};
    use crate::ParqueError;
    use chrono::Utc;
    use serde_json::json;

    struct Recording {
        name: String,
        sources: Vec<String>,
        seen: Mutex<Vec<u64>>,
        fail_first: AtomicUsize,
    }

    impl Recording {
        fn new(name: &str, sources: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                sources: sources.iter().map(|s| s.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MvHandler for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn source_namespaces(&self) -> Vec<String> {
            self.sources.clone()
        }

        async fn process(&self, events: &[Event]) -> Result<(), ParqueError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ParqueError::unavailable("induced failure"));
            }
            self.seen.lock().unwrap().extend(events.iter().map(|e| e.seq));
            Ok(())
        }
    }

    fn draft(target: &str) -> Event {
        Event {
            id: uuid::Uuid::now_v7().to_string(),
            seq: 0,
            ts: Utc::now(),
            op: EventOp::Create,
            target: target.to_string(),
            before: None,
            after: Some(json!({})),
            actor: "tester".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn flush_delivers_events_in_wal_order() {
        let wal = Arc::new(EventLog::new(
            Arc::new(MemoryBackend::new()),
            EventLogOptions::default(),
        ));
        let engine = MvEngine::new(Arc::clone(&wal));
        let handler = Arc::new(Recording::new("posts-mv", &["posts"]));
        engine.register(handler.clone(), MvOptions::default());
        engine.start();

        wal.append("posts", vec![draft("posts:a"), draft("posts:b")]).await.unwrap();
        wal.append("users", vec![draft("users:x")]).await.unwrap();
        engine.flush().await.unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2]);

        wal.append("posts", vec![draft("posts:c")]).await.unwrap();
        engine.flush().await.unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn positions_never_regress_and_survive_refresh_full() {
        let wal = Arc::new(EventLog::new(
            Arc::new(MemoryBackend::new()),
            EventLogOptions::default(),
        ));
        let engine = MvEngine::new(Arc::clone(&wal));
        let handler = Arc::new(Recording::new("posts-mv", &["posts"]));
        engine.register(handler.clone(), MvOptions::default());

        wal.append("posts", vec![draft("posts:a")]).await.unwrap();
        engine.flush().await.unwrap();
        let before = engine.stats().positions["posts-mv"]["posts"];

        engine.refresh_full("posts-mv").await.unwrap();
        let after = engine.stats().positions["posts-mv"]["posts"];
        assert!(after >= before);
        // Full refresh redelivers from the start.
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn failing_batches_retry_then_park_without_losing_events() {
        let wal = Arc::new(EventLog::new(
            Arc::new(MemoryBackend::new()),
            EventLogOptions::default(),
        ));
        let engine = MvEngine::new(Arc::clone(&wal));
        let handler = Arc::new(Recording::new("posts-mv", &["posts"]));
        handler.fail_first.store(3, Ordering::SeqCst);
        engine.register(handler.clone(), MvOptions::default());

        wal.append("posts", vec![draft("posts:a")]).await.unwrap();
        // Two attempts (initial + one retry) both fail; the batch parks.
        engine.flush().await.unwrap();
        assert!(handler.seen.lock().unwrap().is_empty());

        // Next flush redelivers the parked batch (at-least-once).
        engine.flush().await.unwrap();
        engine.flush().await.unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), vec![1]);
    }
}
