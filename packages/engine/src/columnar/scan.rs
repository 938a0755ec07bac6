use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use futures_util::stream::{FuturesOrdered, StreamExt};
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;

use super::format::RowGroupMeta;
use super::reader::ColumnarReader;
use crate::filter::{compare_ordered, get_path, matches_filter};
use crate::types::CancelToken;
use crate::ParqueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub filter: Option<JsonValue>,
    pub sort: Option<Vec<SortKey>>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub columns: Option<Vec<String>>,
    /// Row groups read in parallel; emission order stays by group index.
    pub concurrency: usize,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub row_groups_total: usize,
    pub row_groups_read: usize,
    pub rows_scanned: u64,
    pub rows_yielded: u64,
    pub terminated_early: bool,
}

/// Streaming row-group scan. Rows come out in row-group order, then
/// physical row order; with `sort`, in sort order after a full pass.
pub struct Scan {
    reader: Arc<ColumnarReader>,
    options: ScanOptions,
    projection: Option<Vec<String>>,
    stats: ScanStats,
    // Unsorted streaming state.
    next_group: usize,
    skip_remaining: usize,
    in_flight: FuturesOrdered<BoxFuture<'static, (usize, Result<Vec<JsonValue>, ParqueError>)>>,
    pending: VecDeque<JsonValue>,
    // Sorted state.
    sorted_output: Option<VecDeque<JsonValue>>,
    done: bool,
}

pub fn scan(reader: Arc<ColumnarReader>, options: ScanOptions) -> Scan {
    let stats = ScanStats {
        row_groups_total: reader.footer().row_groups.len(),
        ..ScanStats::default()
    };
    let projection = load_projection(&options, reader.as_ref());
    let skip_remaining = options.skip;
    Scan {
        reader,
        options,
        projection,
        stats,
        next_group: 0,
        skip_remaining,
        in_flight: FuturesOrdered::new(),
        pending: VecDeque::new(),
        sorted_output: None,
        done: false,
    }
}

impl Scan {
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub async fn next(&mut self) -> Result<Option<JsonValue>, ParqueError> {
        if self.options.cancel.is_cancelled() {
            self.release();
            return Err(ParqueError::cancelled("scan cancelled"));
        }
        if self.done {
            return Ok(None);
        }
        if self.options.sort.is_some() {
            return self.next_sorted().await;
        }
        self.next_streaming().await
    }

    pub async fn collect(mut self) -> Result<(Vec<JsonValue>, ScanStats), ParqueError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok((rows, self.stats()))
    }

    /// Releases buffered rows and cancels in-flight row-group loads.
    fn release(&mut self) {
        self.in_flight = FuturesOrdered::new();
        self.pending.clear();
        self.done = true;
    }

    async fn next_streaming(&mut self) -> Result<Option<JsonValue>, ParqueError> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                self.stats.rows_yielded += 1;
                if self
                    .options
                    .limit
                    .is_some_and(|limit| self.stats.rows_yielded >= limit as u64)
                {
                    let exhausted = self.next_group >= self.stats.row_groups_total
                        && self.in_flight.is_empty()
                        && self.pending.is_empty();
                    self.stats.terminated_early = !exhausted;
                    self.release();
                }
                return Ok(Some(self.project(row)));
            }

            self.schedule_groups();

            match self.in_flight.next().await {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some((_, rows)) => {
                    let rows = rows?;
                    self.stats.row_groups_read += 1;
                    self.absorb_rows(rows);
                }
            }
        }
    }

    /// Queues row-group loads up to the concurrency cap, consuming
    /// whole-group skips and statistics-based exclusions without a read.
    fn schedule_groups(&mut self) {
        let concurrency = self.options.concurrency.max(1);
        while self.in_flight.len() < concurrency && self.next_group < self.stats.row_groups_total {
            let index = self.next_group;
            self.next_group += 1;
            let group = &self.reader.footer().row_groups[index];

            if let Some(filter) = &self.options.filter {
                if !group_can_match(group, filter) {
                    continue;
                }
            } else if self.options.sort.is_none() && self.skip_remaining >= group.row_count as usize {
                // No filter: the whole group falls inside the skip window,
                // so it never needs to be read.
                self.skip_remaining -= group.row_count as usize;
                continue;
            }

            let reader = Arc::clone(&self.reader);
            let projection = self.projection.clone();
            self.in_flight.push_back(Box::pin(async move {
                let rows = reader
                    .read_row_group(index, projection.as_deref())
                    .await;
                (index, rows)
            }));
        }
    }

    fn absorb_rows(&mut self, rows: Vec<JsonValue>) {
        for row in rows {
            self.stats.rows_scanned += 1;
            let matches = self
                .options
                .filter
                .as_ref()
                .map(|filter| matches_filter(&row, filter))
                .unwrap_or(true);
            if !matches {
                continue;
            }
            if self.skip_remaining > 0 {
                self.skip_remaining -= 1;
                continue;
            }
            self.pending.push_back(row);
        }
    }

    async fn next_sorted(&mut self) -> Result<Option<JsonValue>, ParqueError> {
        if self.sorted_output.is_none() {
            let output = self.run_sorted_pass().await?;
            self.sorted_output = Some(output);
        }
        let Some(output) = self.sorted_output.as_mut() else {
            return Ok(None);
        };
        match output.pop_front() {
            Some(row) => {
                self.stats.rows_yielded += 1;
                Ok(Some(self.project(row)))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Sort disallows early termination: every surviving row group is read
    /// and matching rows feed a bounded top-K heap.
    async fn run_sorted_pass(&mut self) -> Result<VecDeque<JsonValue>, ParqueError> {
        let keys = self.options.sort.clone().unwrap_or_default();
        let top_k = self.options.limit.map(|limit| self.options.skip + limit);
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        let mut all: Vec<HeapEntry> = Vec::new();
        let mut sequence = 0u64;

        loop {
            if self.options.cancel.is_cancelled() {
                self.release();
                return Err(ParqueError::cancelled("scan cancelled"));
            }
            self.schedule_groups();
            let Some((_, rows)) = self.in_flight.next().await else {
                break;
            };
            let rows = rows?;
            self.stats.row_groups_read += 1;
            for row in rows {
                self.stats.rows_scanned += 1;
                let matches = self
                    .options
                    .filter
                    .as_ref()
                    .map(|filter| matches_filter(&row, filter))
                    .unwrap_or(true);
                if !matches {
                    continue;
                }
                let entry = HeapEntry::new(row, &keys, sequence);
                sequence += 1;
                match top_k {
                    Some(k) => {
                        heap.push(entry);
                        if heap.len() > k {
                            heap.pop();
                        }
                    }
                    None => all.push(entry),
                }
            }
        }

        let mut ordered: Vec<HeapEntry> = match top_k {
            Some(_) => heap.into_sorted_vec(),
            None => {
                all.sort();
                all
            }
        };
        let tail: Vec<HeapEntry> = ordered.split_off(ordered.len().min(self.options.skip));
        Ok(tail.into_iter().map(|entry| entry.row).collect())
    }

    /// Strips rows down to the requested projection. Loads may include
    /// extra columns needed by the filter or the sort keys.
    fn project(&self, row: JsonValue) -> JsonValue {
        let Some(columns) = &self.options.columns else {
            return row;
        };
        let mut out = JsonValue::Object(serde_json::Map::new());
        for column in columns {
            if let Some(value) = get_path(&row, column) {
                crate::filter::set_path(&mut out, column, value.clone());
            }
        }
        out
    }
}

/// Columns to load: the requested projection plus any fields the filter
/// and sort keys touch. `None` loads everything.
fn load_projection(options: &ScanOptions, reader: &ColumnarReader) -> Option<Vec<String>> {
    let columns = options.columns.as_ref()?;
    let mut wanted: Vec<String> = columns.clone();
    if let Some(filter) = options.filter.as_ref().and_then(JsonValue::as_object) {
        for key in filter.keys().filter(|key| !key.starts_with('$')) {
            push_column_for_path(&mut wanted, key, reader);
        }
    }
    if let Some(sort) = &options.sort {
        for key in sort {
            push_column_for_path(&mut wanted, &key.field, reader);
        }
    }
    Some(wanted)
}

fn push_column_for_path(wanted: &mut Vec<String>, path: &str, reader: &ColumnarReader) {
    let name = if reader.footer().schema.column(path).is_some() {
        path.to_string()
    } else {
        path.split('.').next().unwrap_or(path).to_string()
    };
    if !wanted.contains(&name) {
        wanted.push(name);
    }
}

/// Statistics-based row-group exclusion. Conservative: a group is skipped
/// only when a predicate provably matches no row. String prefix and regex
/// predicates never push down.
fn group_can_match(group: &RowGroupMeta, filter: &JsonValue) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };

    for (key, condition) in conditions {
        match key.as_str() {
            "$and" => {
                if let Some(clauses) = condition.as_array() {
                    if clauses.iter().any(|clause| !group_can_match(group, clause)) {
                        return false;
                    }
                }
            }
            key if key.starts_with('$') => {}
            field => {
                let Some(chunk) = group.column(field) else {
                    continue;
                };
                let (Some(min), Some(max)) = (&chunk.stats.min, &chunk.stats.max) else {
                    continue;
                };
                if !condition_can_match(condition, min, max) {
                    return false;
                }
            }
        }
    }
    true
}

fn condition_can_match(condition: &JsonValue, min: &JsonValue, max: &JsonValue) -> bool {
    match condition.as_object() {
        None => value_in_bounds(condition, min, max),
        Some(map) if map.keys().all(|key| key.starts_with('$')) => {
            map.iter().all(|(op, operand)| match op.as_str() {
                "$eq" => value_in_bounds(operand, min, max),
                "$gt" => compare_ordered(max, operand).map(|ord| ord.is_gt()).unwrap_or(true),
                "$gte" => compare_ordered(max, operand).map(|ord| ord.is_ge()).unwrap_or(true),
                "$lt" => compare_ordered(min, operand).map(|ord| ord.is_lt()).unwrap_or(true),
                "$lte" => compare_ordered(min, operand).map(|ord| ord.is_le()).unwrap_or(true),
                "$in" => operand
                    .as_array()
                    .map(|choices| {
                        choices.iter().any(|choice| value_in_bounds(choice, min, max))
                    })
                    .unwrap_or(true),
                _ => true,
            })
        }
        Some(_) => true,
    }
}

fn value_in_bounds(value: &JsonValue, min: &JsonValue, max: &JsonValue) -> bool {
    // Arrays match element-wise at evaluation time; bounds say nothing.
    if value.is_array() || value.is_object() || value.is_null() {
        return true;
    }
    let above_min = compare_ordered(value, min).map(|ord| ord.is_ge()).unwrap_or(true);
    let below_max = compare_ordered(value, max).map(|ord| ord.is_le()).unwrap_or(true);
    above_min && below_max
}

/// Total order over sort keys: the partial value order, then a rank across
/// kinds, then insertion sequence for stability.
struct HeapEntry {
    row: JsonValue,
    keys: Vec<(JsonValue, SortOrder)>,
    sequence: u64,
}

impl HeapEntry {
    fn new(row: JsonValue, sort: &[SortKey], sequence: u64) -> Self {
        let keys = sort
            .iter()
            .map(|key| {
                (
                    get_path(&row, &key.field).cloned().unwrap_or(JsonValue::Null),
                    key.order,
                )
            })
            .collect();
        Self {
            row,
            keys,
            sequence,
        }
    }
}

/// Stable in-place sort of materialized rows by the same key comparison
/// the scan's top-K heap uses.
pub(crate) fn sort_rows(rows: &mut [JsonValue], keys: &[SortKey]) {
    rows.sort_by(|a, b| {
        for key in keys {
            let left = get_path(a, &key.field).cloned().unwrap_or(JsonValue::Null);
            let right = get_path(b, &key.field).cloned().unwrap_or(JsonValue::Null);
            let ord = total_compare(&left, &right);
            let ord = match key.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn kind_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Bool(_) => 1,
        JsonValue::Number(_) => 2,
        JsonValue::String(_) => 3,
        JsonValue::Array(_) => 4,
        JsonValue::Object(_) => 5,
    }
}

fn total_compare(a: &JsonValue, b: &JsonValue) -> Ordering {
    compare_ordered(a, b).unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b)))
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((left, order), (right, _)) in self.keys.iter().zip(other.keys.iter()) {
            let ord = total_compare(left, right);
            let ord = match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.sequence.cmp(&other.sequence)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{scan, ScanOptions, SortKey};
    use crate::columnar::{write_columnar, ColumnDef, ColumnType, ColumnarReader, FileSchema, WriteOptions};
    use crate::storage::MemoryBackend;
    use crate::types::CancelToken;
    use serde_json::json;

    async fn reader_with_groups(groups: usize, rows_per_group: usize) -> Arc<ColumnarReader> {
        let storage = Arc::new(MemoryBackend::new());
        let schema = FileSchema::new(vec![
            ColumnDef::new("id", ColumnType::String),
            ColumnDef::new("n", ColumnType::Number),
        ]);
        let rows: Vec<_> = (0..groups * rows_per_group)
            .map(|i| json!({"id": format!("r{i:04}"), "n": i}))
            .collect();
        write_columnar(
            storage.as_ref(),
            "s.parquet",
            &rows,
            &schema,
            &WriteOptions {
                row_group_size: rows_per_group,
                ..WriteOptions::default()
            },
        )
        .await
        .unwrap();
        Arc::new(ColumnarReader::open(storage, "s.parquet").await.unwrap())
    }

    #[tokio::test]
    async fn limit_without_sort_terminates_early() {
        let reader = reader_with_groups(10, 100).await;
        let scan = scan(
            reader,
            ScanOptions {
                limit: Some(10),
                ..ScanOptions::default()
            },
        );
        let (rows, stats) = scan.collect().await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(stats.row_groups_total, 10);
        assert_eq!(stats.row_groups_read, 1);
        assert!(stats.terminated_early);
    }

    #[tokio::test]
    async fn sort_with_limit_reads_every_group() {
        let reader = reader_with_groups(4, 10).await;
        let scan = scan(
            reader,
            ScanOptions {
                sort: Some(vec![SortKey::desc("n")]),
                limit: Some(3),
                ..ScanOptions::default()
            },
        );
        let (rows, stats) = scan.collect().await.unwrap();
        assert_eq!(stats.row_groups_read, 4);
        assert!(!stats.terminated_early);
        let ns: Vec<i64> = rows.iter().map(|row| row["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![39, 38, 37]);
    }

    #[tokio::test]
    async fn skip_without_filter_skips_whole_groups() {
        let reader = reader_with_groups(5, 10).await;
        let scan = scan(
            reader,
            ScanOptions {
                skip: 25,
                limit: Some(5),
                ..ScanOptions::default()
            },
        );
        let (rows, stats) = scan.collect().await.unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0]["n"], json!(25));
        // Two whole groups are skipped without a read; the third covers
        // the remainder of the skip and the limit.
        assert_eq!(stats.row_groups_read, 1);
        assert!(stats.terminated_early);
    }

    #[tokio::test]
    async fn statistics_prune_groups_the_filter_excludes() {
        let reader = reader_with_groups(10, 100).await;
        let scan = scan(
            reader,
            ScanOptions {
                filter: Some(json!({"n": {"$gte": 850}})),
                ..ScanOptions::default()
            },
        );
        let (rows, stats) = scan.collect().await.unwrap();
        assert_eq!(rows.len(), 150);
        assert_eq!(stats.row_groups_read, 2);
    }

    #[tokio::test]
    async fn equality_pushdown_skips_non_overlapping_groups() {
        let reader = reader_with_groups(10, 100).await;
        let scan = scan(
            reader,
            ScanOptions {
                filter: Some(json!({"n": 250})),
                ..ScanOptions::default()
            },
        );
        let (rows, stats) = scan.collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(stats.row_groups_read, 1);
    }

    #[tokio::test]
    async fn concurrency_preserves_row_group_order() {
        let reader = reader_with_groups(6, 10).await;
        let scan = scan(
            reader,
            ScanOptions {
                concurrency: 4,
                ..ScanOptions::default()
            },
        );
        let (rows, stats) = scan.collect().await.unwrap();
        assert_eq!(stats.row_groups_read, 6);
        let ns: Vec<i64> = rows.iter().map(|row| row["n"].as_i64().unwrap()).collect();
        let expected: Vec<i64> = (0..60).collect();
        assert_eq!(ns, expected);
    }

    #[tokio::test]
    async fn cancellation_stops_the_scan() {
        let reader = reader_with_groups(4, 10).await;
        let cancel = CancelToken::new();
        let mut scan = scan(
            reader,
            ScanOptions {
                cancel: cancel.clone(),
                ..ScanOptions::default()
            },
        );
        assert!(scan.next().await.unwrap().is_some());
        cancel.cancel();
        let error = scan.next().await.unwrap_err();
        assert!(matches!(error, crate::ParqueError::Cancelled(_)));
    }

    #[tokio::test]
    async fn projection_strips_to_requested_columns() {
        let reader = reader_with_groups(1, 5).await;
        let scan = scan(
            reader,
            ScanOptions {
                filter: Some(json!({"n": {"$gte": 3}})),
                columns: Some(vec!["id".to_string()]),
                ..ScanOptions::default()
            },
        );
        let (rows, _) = scan.collect().await.unwrap();
        assert_eq!(rows, vec![json!({"id": "r0003"}), json!({"id": "r0004"})]);
    }
}
