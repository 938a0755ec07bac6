use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::MvHandler;
use crate::event::Event;
use crate::ParqueError;

#[derive(Debug, Clone)]
pub struct EvalScoresOptions {
    /// Ring buffer capacity for the most recent scores.
    pub max_scores: usize,
    pub histogram_buckets: usize,
    pub trend_bucket: Duration,
}

impl Default for EvalScoresOptions {
    fn default() -> Self {
        Self {
            max_scores: 1_000,
            histogram_buckets: 10,
            trend_bucket: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub run_id: String,
    pub suite_name: String,
    pub scorer_name: String,
    pub score: f64,
    pub description: Option<String>,
    pub eval_id: Option<String>,
    pub metadata: Option<JsonValue>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub std_dev: f64,
    pub histogram: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreDimension {
    Scorer,
    Suite,
    Run,
}

#[derive(Default)]
struct EvalScoresState {
    scores: VecDeque<ScoreRecord>,
    /// Lazily computed per-dimension statistics; dropped on every insert.
    stats_cache: HashMap<(ScoreDimension, String), ScoreStats>,
}

/// Materialized view over eval score events: bounded recent-score ring,
/// per-scorer/suite/run statistics with cache invalidation on insert,
/// and time-bucketed trends.
pub struct EvalScores {
    options: EvalScoresOptions,
    state: Mutex<EvalScoresState>,
}

impl EvalScores {
    pub fn new(options: EvalScoresOptions) -> Self {
        Self {
            options,
            state: Mutex::new(EvalScoresState::default()),
        }
    }

    fn insert(&self, record: ScoreRecord) {
        let mut state = self.state.lock().unwrap();
        state.scores.push_back(record);
        while state.scores.len() > self.options.max_scores {
            state.scores.pop_front();
        }
        state.stats_cache.clear();
    }

    pub fn recent(&self, n: usize) -> Vec<ScoreRecord> {
        let state = self.state.lock().unwrap();
        state.scores.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, dimension: ScoreDimension, key: &str) -> Option<ScoreStats> {
        {
            let state = self.state.lock().unwrap();
            if let Some(cached) = state.stats_cache.get(&(dimension, key.to_string())) {
                return Some(cached.clone());
            }
        }

        let values: Vec<f64> = {
            let state = self.state.lock().unwrap();
            state
                .scores
                .iter()
                .filter(|record| dimension_key(record, dimension) == key)
                .map(|record| record.score)
                .collect()
        };
        if values.is_empty() {
            return None;
        }

        let stats = compute_stats(&values, self.options.histogram_buckets);
        let mut state = self.state.lock().unwrap();
        state
            .stats_cache
            .insert((dimension, key.to_string()), stats.clone());
        Some(stats)
    }

    /// Average score per time bucket for one scorer, oldest first.
    pub fn trend(&self, scorer_name: &str) -> Vec<(DateTime<Utc>, f64, usize)> {
        let bucket_seconds = self.options.trend_bucket.as_secs().max(1) as i64;
        let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
        {
            let state = self.state.lock().unwrap();
            for record in state
                .scores
                .iter()
                .filter(|record| record.scorer_name == scorer_name)
            {
                let slot = record.ts.timestamp().div_euclid(bucket_seconds) * bucket_seconds;
                let entry = buckets.entry(slot).or_insert((0.0, 0));
                entry.0 += record.score;
                entry.1 += 1;
            }
        }
        buckets
            .into_iter()
            .filter_map(|(slot, (sum, count))| {
                DateTime::<Utc>::from_timestamp(slot, 0)
                    .map(|ts| (ts, sum / count as f64, count))
            })
            .collect()
    }
}

fn dimension_key(record: &ScoreRecord, dimension: ScoreDimension) -> &str {
    match dimension {
        ScoreDimension::Scorer => &record.scorer_name,
        ScoreDimension::Suite => &record.suite_name,
        ScoreDimension::Run => &record.run_id,
    }
}

fn compute_stats(values: &[f64], histogram_buckets: usize) -> ScoreStats {
    let count = values.len();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let average = values.iter().sum::<f64>() / count as f64;
    let variance =
        values.iter().map(|v| (v - average).powi(2)).sum::<f64>() / count as f64;
    let std_dev = variance.sqrt();

    let buckets = histogram_buckets.max(1);
    let mut histogram = vec![0usize; buckets];
    let span = max - min;
    for value in values {
        let index = if span == 0.0 {
            0
        } else {
            (((value - min) / span) * buckets as f64).floor() as usize
        };
        histogram[index.min(buckets - 1)] += 1;
    }

    ScoreStats {
        count,
        min,
        max,
        average,
        std_dev,
        histogram,
    }
}

/// Field-name mappings for score events coming from different producers.
fn extract_record(event: &Event) -> Option<ScoreRecord> {
    let doc = event.after.as_ref()?.as_object()?;

    let text = |names: &[&str]| -> Option<String> {
        names
            .iter()
            .find_map(|name| doc.get(*name).and_then(JsonValue::as_str))
            .map(str::to_string)
    };

    let score = ["score", "value"]
        .iter()
        .find_map(|name| doc.get(*name).and_then(JsonValue::as_f64))?;
    let suite_name = text(&["suiteName", "suite_name", "suite"])?;
    let scorer_name = text(&["scorerName", "scorer_name", "scorer", "name"])?;
    if suite_name.is_empty() || scorer_name.is_empty() {
        return None;
    }

    Some(ScoreRecord {
        run_id: text(&["runId", "run_id", "run"]).unwrap_or_default(),
        suite_name,
        scorer_name,
        score,
        description: text(&["description"]),
        eval_id: text(&["evalId", "eval_id"]),
        metadata: doc.get("metadata").cloned(),
        ts: event.ts,
    })
}

#[async_trait]
impl MvHandler for EvalScores {
    fn name(&self) -> &str {
        "eval_scores"
    }

    fn source_namespaces(&self) -> Vec<String> {
        vec!["evalite_scores".to_string(), "scores".to_string()]
    }

    async fn process(&self, events: &[Event]) -> Result<(), ParqueError> {
        for event in events {
            if let Some(record) = extract_record(event) {
                self.insert(record);
            }
        }
        Ok(())
    }
}
