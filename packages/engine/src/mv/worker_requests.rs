use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde_json::Value as JsonValue;

use super::MvHandler;
use crate::event::Event;
use crate::ParqueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Minute,
    Hour,
    Day,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    None,
    Path,
    Colo,
    Country,
    Status,
}

#[derive(Debug, Clone)]
pub struct WorkerRequestsOptions {
    pub bucket: TimeBucket,
    pub group_by: GroupBy,
}

impl Default for WorkerRequestsOptions {
    fn default() -> Self {
        Self {
            bucket: TimeBucket::Minute,
            group_by: GroupBy::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub ts: DateTime<Utc>,
    pub path: String,
    pub colo: String,
    pub country: String,
    pub status: u16,
    pub cache_hit: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Default)]
struct BucketAgg {
    count: usize,
    status_2xx: usize,
    status_3xx: usize,
    status_4xx: usize,
    status_5xx: usize,
    cache_hits: usize,
    latencies: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketSummary {
    pub bucket: DateTime<Utc>,
    pub group: String,
    pub count: usize,
    pub status_2xx: usize,
    pub status_3xx: usize,
    pub status_4xx: usize,
    pub status_5xx: usize,
    pub cache_hit_ratio: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub error_rate: f64,
}

/// Linear-interpolation percentile. Empty input returns 0; a single
/// element returns that element for any p.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() == 1 {
        return values[0];
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return sorted[low];
    }
    let fraction = rank - low as f64;
    sorted[low] + (sorted[high] - sorted[low]) * fraction
}

/// Materialized view bucketing HTTP request records by time and optional
/// grouping, with status tallies, cache hit ratio, latency percentiles,
/// and error rates.
pub struct WorkerRequests {
    options: WorkerRequestsOptions,
    buckets: Mutex<BTreeMap<(DateTime<Utc>, String), BucketAgg>>,
}

impl WorkerRequests {
    pub fn new(options: WorkerRequestsOptions) -> Self {
        Self {
            options,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, record: &RequestRecord) {
        let bucket = truncate(record.ts, self.options.bucket);
        let group = match self.options.group_by {
            GroupBy::None => String::new(),
            GroupBy::Path => record.path.clone(),
            GroupBy::Colo => record.colo.clone(),
            GroupBy::Country => record.country.clone(),
            GroupBy::Status => record.status.to_string(),
        };

        let mut buckets = self.buckets.lock().unwrap();
        let agg = buckets.entry((bucket, group)).or_default();
        agg.count += 1;
        match record.status {
            200..=299 => agg.status_2xx += 1,
            300..=399 => agg.status_3xx += 1,
            400..=499 => agg.status_4xx += 1,
            500..=599 => agg.status_5xx += 1,
            _ => {}
        }
        if record.cache_hit {
            agg.cache_hits += 1;
        }
        agg.latencies.push(record.latency_ms);
    }

    pub fn summaries(&self) -> Vec<BucketSummary> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .iter()
            .map(|((bucket, group), agg)| BucketSummary {
                bucket: *bucket,
                group: group.clone(),
                count: agg.count,
                status_2xx: agg.status_2xx,
                status_3xx: agg.status_3xx,
                status_4xx: agg.status_4xx,
                status_5xx: agg.status_5xx,
                cache_hit_ratio: if agg.count == 0 {
                    0.0
                } else {
                    agg.cache_hits as f64 / agg.count as f64
                },
                p50: percentile(&agg.latencies, 50.0),
                p95: percentile(&agg.latencies, 95.0),
                p99: percentile(&agg.latencies, 99.0),
                error_rate: if agg.count == 0 {
                    0.0
                } else {
                    (agg.status_4xx + agg.status_5xx) as f64 / agg.count as f64
                },
            })
            .collect()
    }
}

fn truncate(ts: DateTime<Utc>, bucket: TimeBucket) -> DateTime<Utc> {
    let result = match bucket {
        TimeBucket::Minute => Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), ts.minute(), 0),
        TimeBucket::Hour => Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0),
        TimeBucket::Day => Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0),
        TimeBucket::Month => Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0),
    };
    result.single().unwrap_or(ts)
}

fn extract_record(event: &Event) -> Option<RequestRecord> {
    let doc = event.after.as_ref()?.as_object()?;
    let text = |names: &[&str]| -> String {
        names
            .iter()
            .find_map(|name| doc.get(*name).and_then(JsonValue::as_str))
            .unwrap_or_default()
            .to_string()
    };

    let status = ["status", "statusCode", "status_code"]
        .iter()
        .find_map(|name| doc.get(*name).and_then(JsonValue::as_u64))? as u16;
    let latency_ms = ["latencyMs", "latency_ms", "latency", "durationMs", "duration_ms"]
        .iter()
        .find_map(|name| doc.get(*name).and_then(JsonValue::as_f64))
        .unwrap_or(0.0);
    let cache_hit = doc
        .get("cacheHit")
        .and_then(JsonValue::as_bool)
        .or_else(|| {
            doc.get("cacheStatus")
                .and_then(JsonValue::as_str)
                .map(|status| status.eq_ignore_ascii_case("hit"))
        })
        .unwrap_or(false);
    let ts = doc
        .get("timestamp")
        .and_then(JsonValue::as_str)
        .and_then(|text| crate::filter::parse_date(text))
        .unwrap_or(event.ts);

    Some(RequestRecord {
        ts,
        path: text(&["path", "url"]),
        colo: text(&["colo"]),
        country: text(&["country"]),
        status,
        cache_hit,
        latency_ms,
    })
}

#[async_trait]
impl MvHandler for WorkerRequests {
    fn name(&self) -> &str {
        "worker_requests"
    }

    fn source_namespaces(&self) -> Vec<String> {
        vec!["worker_requests".to_string(), "requests".to_string()]
    }

    async fn process(&self, events: &[Event]) -> Result<(), ParqueError> {
        for event in events {
            if let Some(record) = extract_record(event) {
                self.record(&record);
            }
        }
        Ok(())
    }
}
