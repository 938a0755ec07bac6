use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::columnar::{
    write_columnar, ColumnDef, ColumnType, ColumnarReader, Compression, FileSchema, WriteOptions,
};
use crate::filter::parse_date;
use crate::storage::StorageBackend;
use crate::ParqueError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub batch_id: String,
    pub ns: String,
    pub path: String,
    pub row_count: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
}

/// One staged row: the entity id and its full document, or a tombstone
/// (`doc: None`) recording a deletion that the merge applies physically.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub id: String,
    pub doc: Option<JsonValue>,
}

pub fn data_file_path(ns: &str) -> String {
    format!("data/{ns}/data.parquet")
}

pub fn pending_dir(ns: &str) -> String {
    format!("data/{ns}/pending/")
}

fn pending_index_path(ns: &str) -> String {
    format!("_meta/pending/{ns}.json")
}

/// Staging area and merge driver for bulk writes. Bulk writes land as
/// `data/{ns}/pending/{batch_id}.parquet` immediately; merges fold them
/// into `data/{ns}/data.parquet` and delete the staged files.
pub struct PendingStore {
    storage: Arc<dyn StorageBackend>,
    merge_locks: Mutex<HashMap<String, Arc<futures_util::lock::Mutex<()>>>>,
}

impl PendingStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            merge_locks: Mutex::new(HashMap::new()),
        }
    }

    fn merge_lock(&self, ns: &str) -> Arc<futures_util::lock::Mutex<()>> {
        let mut locks = self.merge_locks.lock().unwrap();
        Arc::clone(locks.entry(ns.to_string()).or_default())
    }

    /// Stages a batch of rows as a pending row group and records it in the
    /// pending index.
    pub async fn stage_batch(
        &self,
        ns: &str,
        rows: &[StagedRow],
        first_seq: u64,
        last_seq: u64,
    ) -> Result<PendingBatch, ParqueError> {
        let batch_id = uuid::Uuid::now_v7().to_string();
        let path = format!("{}{batch_id}.parquet", pending_dir(ns));

        let schema = FileSchema::new(vec![
            ColumnDef::new("id", ColumnType::String),
            ColumnDef::new("data", ColumnType::Variant),
        ]);
        let file_rows: Vec<JsonValue> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "id": row.id,
                    "data": row.doc.clone().unwrap_or(JsonValue::Null),
                })
            })
            .collect();
        write_columnar(
            self.storage.as_ref(),
            &path,
            &file_rows,
            &schema,
            &WriteOptions {
                row_group_size: 1_000,
                compression: Compression::Gzip,
            },
        )
        .await?;

        let batch = PendingBatch {
            batch_id,
            ns: ns.to_string(),
            path,
            row_count: rows.len() as u64,
            first_seq,
            last_seq,
            created_at: Utc::now(),
        };

        let mut index = self.read_index(ns).await?;
        index.push(batch.clone());
        index.sort_by_key(|entry| entry.first_seq);
        self.write_index(ns, &index).await?;
        Ok(batch)
    }

    pub async fn pending_batches(&self, ns: &str) -> Result<Vec<PendingBatch>, ParqueError> {
        let mut index = self.read_index(ns).await?;
        self.adopt_orphans(ns, &mut index).await?;
        index.sort_by_key(|entry| entry.first_seq);
        Ok(index)
    }

    /// Merges all pending batches into the committed collection file.
    ///
    /// Ordering: the merged file is durably replaced before any pending
    /// file is deleted, so a crash between the steps leaves a re-merge
    /// that is idempotent (later-wins by id makes replay harmless).
    /// Returns the number of pending rows consumed; 0 when nothing was
    /// pending. One merge runs at a time per namespace.
    pub async fn flush_pending_to_committed(&self, ns: &str) -> Result<u64, ParqueError> {
        let lock = self.merge_lock(ns);
        let _guard = lock.lock().await;

        let batches = self.pending_batches(ns).await?;
        if batches.is_empty() {
            return Ok(0);
        }

        // Existing rows first, in their current order.
        let mut order: Vec<String> = Vec::new();
        let mut docs: HashMap<String, Option<JsonValue>> = HashMap::new();
        let data_path = data_file_path(ns);
        if self.storage.exists(&data_path).await? {
            let reader = ColumnarReader::open(Arc::clone(&self.storage), data_path.clone()).await?;
            let group_count = reader.footer().row_groups.len();
            for index in 0..group_count {
                for row in reader.read_row_group(index, None).await? {
                    let Some(id) = row.get("$id").and_then(JsonValue::as_str) else {
                        continue;
                    };
                    order.push(id.to_string());
                    docs.insert(id.to_string(), Some(row));
                }
            }
        }

        // Pending rows in sequence order; later wins for duplicate ids.
        let mut consumed_rows = 0u64;
        for batch in &batches {
            let reader = ColumnarReader::open(Arc::clone(&self.storage), batch.path.clone()).await?;
            let group_count = reader.footer().row_groups.len();
            for index in 0..group_count {
                for row in reader.read_row_group(index, None).await? {
                    consumed_rows += 1;
                    let Some(id) = row.get("id").and_then(JsonValue::as_str) else {
                        continue;
                    };
                    let doc = match row.get("data") {
                        None | Some(JsonValue::Null) => None,
                        Some(doc) => Some(doc.clone()),
                    };
                    if !docs.contains_key(id) {
                        order.push(id.to_string());
                    }
                    docs.insert(id.to_string(), doc);
                }
            }
        }

        let merged: Vec<JsonValue> = order
            .iter()
            .filter_map(|id| docs.get(id).cloned().flatten())
            .collect();

        let schema = infer_collection_schema(&merged);
        write_columnar(
            self.storage.as_ref(),
            &data_path,
            &merged,
            &schema,
            &WriteOptions::default(),
        )
        .await?;

        // The merged file is durable; now drop the staged inputs. Partial
        // deletion cannot lose data because every row is already merged.
        for batch in &batches {
            self.storage.delete(&batch.path).await?;
        }

        let merged_last_seq = batches.iter().map(|batch| batch.last_seq).max().unwrap_or(0);
        let remaining: Vec<PendingBatch> = self
            .read_index(ns)
            .await?
            .into_iter()
            .filter(|entry| entry.last_seq > merged_last_seq)
            .collect();
        self.write_index(ns, &remaining).await?;

        Ok(consumed_rows)
    }

    async fn read_index(&self, ns: &str) -> Result<Vec<PendingBatch>, ParqueError> {
        match self.storage.read(&pending_index_path(ns)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.is_not_found() => Ok(Vec::new()),
            Err(error) => Err(error),
        }
    }

    async fn write_index(&self, ns: &str, index: &[PendingBatch]) -> Result<(), ParqueError> {
        let bytes = serde_json::to_vec(index)?;
        self.storage.write(&pending_index_path(ns), &bytes).await
    }

    /// Re-adopts pending files that exist on disk but have no index entry
    /// (a crash between the file write and the index update). Batch ids
    /// are time-ordered, so orphans keep their write order.
    async fn adopt_orphans(
        &self,
        ns: &str,
        index: &mut Vec<PendingBatch>,
    ) -> Result<(), ParqueError> {
        let listed = self.storage.list(&pending_dir(ns)).await?;
        for path in listed {
            if !path.ends_with(".parquet") || index.iter().any(|entry| entry.path == path) {
                continue;
            }
            let Some(batch_id) = path
                .rsplit('/')
                .next()
                .and_then(|name| name.strip_suffix(".parquet"))
            else {
                continue;
            };
            let reader = ColumnarReader::open(Arc::clone(&self.storage), path.clone()).await?;
            let row_count = reader.footer().total_rows();
            index.push(PendingBatch {
                batch_id: batch_id.to_string(),
                ns: ns.to_string(),
                path,
                row_count,
                first_seq: 0,
                last_seq: 0,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }
}

/// Infers the columnar schema for a merged collection file from its
/// documents: one typed column per top-level field where the type is
/// uniform, `Variant` otherwise.
pub(crate) fn infer_collection_schema(docs: &[JsonValue]) -> FileSchema {
    use std::collections::BTreeMap;

    let mut kinds: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();
    for doc in docs {
        let Some(map) = doc.as_object() else { continue };
        for (key, value) in map {
            let kind = match value {
                JsonValue::Null => continue,
                JsonValue::Bool(_) => ColumnType::Boolean,
                JsonValue::Number(_) => ColumnType::Number,
                JsonValue::String(text) => {
                    if parse_date(text).is_some() {
                        ColumnType::Timestamp
                    } else {
                        ColumnType::String
                    }
                }
                JsonValue::Array(_) | JsonValue::Object(_) => ColumnType::Variant,
            };
            kinds
                .entry(key.clone())
                .and_modify(|existing| {
                    if *existing != Some(kind) {
                        *existing = merge_kinds(*existing, kind);
                    }
                })
                .or_insert(Some(kind));
        }
    }

    let columns = kinds
        .into_iter()
        .map(|(name, kind)| ColumnDef::new(name, kind.unwrap_or(ColumnType::Variant)))
        .collect();
    FileSchema::new(columns)
}

fn merge_kinds(existing: Option<ColumnType>, new: ColumnType) -> Option<ColumnType> {
    match existing {
        None => Some(new),
        Some(existing) if existing == new => Some(existing),
        // Timestamps degrade to plain strings when values stop parsing.
        Some(ColumnType::Timestamp) if new == ColumnType::String => Some(ColumnType::String),
        Some(ColumnType::String) if new == ColumnType::Timestamp => Some(ColumnType::String),
        _ => Some(ColumnType::Variant),
    }
}
