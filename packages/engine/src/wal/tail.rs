use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;

use futures_util::future::poll_fn;

use super::EventLog;
use crate::event::Event;
use crate::ParqueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailMode {
    /// Yield events up to the current high-water mark, then stop.
    ToEnd,
    /// Block for new events after draining the backlog.
    Follow,
}

/// Closes a `TailReader` from another task.
#[derive(Clone)]
pub struct TailHandle {
    closed: Arc<AtomicBool>,
    log: Arc<EventLog>,
    ns: String,
}

impl TailHandle {
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Wake any reader parked on the namespace signal.
            self.log.signal(&self.ns).wake_all();
        }
    }
}

/// Ordered event reader over one namespace stream, starting at `from_seq`.
pub struct TailReader {
    log: Arc<EventLog>,
    ns: String,
    next_seq: u64,
    mode: TailMode,
    buffer: VecDeque<Event>,
    closed: Arc<AtomicBool>,
}

impl TailReader {
    pub(crate) fn new(log: Arc<EventLog>, ns: String, from_seq: u64, mode: TailMode) -> Self {
        Self {
            log,
            ns,
            next_seq: from_seq,
            mode,
            buffer: VecDeque::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> TailHandle {
        TailHandle {
            closed: Arc::clone(&self.closed),
            log: Arc::clone(&self.log),
            ns: self.ns.clone(),
        }
    }

    pub fn close(&self) {
        self.handle().close();
    }

    pub async fn next(&mut self) -> Result<Option<Event>, ParqueError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(event) = self.buffer.pop_front() {
                self.next_seq = event.seq + 1;
                return Ok(Some(event));
            }

            let events = self.log.read_from(&self.ns, self.next_seq).await?;
            if !events.is_empty() {
                self.buffer.extend(events);
                continue;
            }

            match self.mode {
                TailMode::ToEnd => return Ok(None),
                TailMode::Follow => self.wait_for_append().await,
            }
        }
    }

    /// Parks until the namespace high-water mark passes our cursor or the
    /// reader is closed.
    async fn wait_for_append(&self) {
        let signal = self.log.signal(&self.ns);
        let wanted = self.next_seq;
        poll_fn(|cx| {
            if self.closed.load(Ordering::SeqCst)
                || self.log.high_water_mark_sync(&self.ns) >= wanted
            {
                return Poll::Ready(());
            }
            signal.register(cx.waker());
            if self.closed.load(Ordering::SeqCst)
                || self.log.high_water_mark_sync(&self.ns) >= wanted
            {
                return Poll::Ready(());
            }
            Poll::Pending
        })
        .await
    }
}

impl Drop for TailReader {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::TailMode;
    use crate::event::{Event, EventOp};
    use crate::storage::MemoryBackend;
    use crate::wal::{EventLog, EventLogOptions};
    use chrono::Utc;
    use serde_json::json;

    fn draft(target: &str) -> Event {
        Event {
            id: uuid::Uuid::now_v7().to_string(),
            seq: 0,
            ts: Utc::now(),
            op: EventOp::Update,
            target: target.to_string(),
            before: None,
            after: Some(json!({})),
            actor: "tester".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn to_end_stops_at_high_water_mark() {
        let log = Arc::new(EventLog::new(
            Arc::new(MemoryBackend::new()),
            EventLogOptions::default(),
        ));
        log.append("posts", vec![draft("posts:a"), draft("posts:b")]).await.unwrap();

        let mut tail = log.tail("posts", 1, TailMode::ToEnd);
        assert_eq!(tail.next().await.unwrap().unwrap().seq, 1);
        assert_eq!(tail.next().await.unwrap().unwrap().seq, 2);
        assert!(tail.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn follow_wakes_on_new_appends() {
        let log = Arc::new(EventLog::new(
            Arc::new(MemoryBackend::new()),
            EventLogOptions::default(),
        ));
        log.append("posts", vec![draft("posts:a")]).await.unwrap();

        let mut tail = log.tail("posts", 1, TailMode::Follow);
        assert_eq!(tail.next().await.unwrap().unwrap().seq, 1);

        let appender = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                log.append("posts", vec![draft("posts:b")]).await.unwrap();
            })
        };

        let event = tail.next().await.unwrap().unwrap();
        assert_eq!(event.seq, 2);
        appender.await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_a_following_reader() {
        let log = Arc::new(EventLog::new(
            Arc::new(MemoryBackend::new()),
            EventLogOptions::default(),
        ));
        let mut tail = log.tail("posts", 1, TailMode::Follow);
        let handle = tail.handle();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            handle.close();
        });

        assert!(tail.next().await.unwrap().is_none());
        closer.await.unwrap();
    }
}
