use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
pub struct RequestBufferOptions {
    pub max_size: usize,
    pub flush_interval: Duration,
}

impl Default for RequestBufferOptions {
    fn default() -> Self {
        Self {
            max_size: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

type Sink = Box<dyn Fn(Vec<JsonValue>) + Send + Sync>;

struct BufferState {
    records: Vec<JsonValue>,
    last_flush: Instant,
    closed: bool,
}

/// Bounded write-through buffer for request records. Flushes to the sink
/// on the size threshold, on interval ticks, and synchronously on
/// `close()`.
pub struct RequestBuffer {
    options: RequestBufferOptions,
    sink: Sink,
    state: Mutex<BufferState>,
}

impl RequestBuffer {
    pub fn new(options: RequestBufferOptions, sink: Sink) -> Self {
        Self {
            options,
            sink,
            state: Mutex::new(BufferState {
                records: Vec::new(),
                last_flush: Instant::now(),
                closed: false,
            }),
        }
    }

    /// Buffers a record; flushes when the size threshold is reached.
    /// Records pushed after close are dropped.
    pub fn push(&self, record: JsonValue) {
        let batch = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.records.push(record);
            if state.records.len() >= self.options.max_size {
                state.last_flush = Instant::now();
                Some(std::mem::take(&mut state.records))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            (self.sink)(batch);
        }
    }

    /// Timer hook: flushes when the interval has elapsed since the last
    /// flush. Returns true when a flush happened.
    pub fn tick(&self) -> bool {
        let batch = {
            let mut state = self.state.lock().unwrap();
            if state.closed
                || state.records.is_empty()
                || state.last_flush.elapsed() < self.options.flush_interval
            {
                None
            } else {
                state.last_flush = Instant::now();
                Some(std::mem::take(&mut state.records))
            }
        };
        match batch {
            Some(batch) => {
                (self.sink)(batch);
                true
            }
            None => false,
        }
    }

    pub fn flush(&self) {
        let batch = {
            let mut state = self.state.lock().unwrap();
            state.last_flush = Instant::now();
            std::mem::take(&mut state.records)
        };
        if !batch.is_empty() {
            (self.sink)(batch);
        }
    }

    /// Flushes synchronously and rejects further pushes.
    pub fn close(&self) {
        let batch = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            std::mem::take(&mut state.records)
        };
        if !batch.is_empty() {
            (self.sink)(batch);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
