use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::columnar::{scan, sort_rows, ColumnarReader, ScanOptions, ScanStats, SortKey};
use crate::filter::{get_path, matches_filter, set_path};
use crate::pending::{data_file_path, PendingStore};
use crate::rels::{BatchLoader, RelQuery, RelatedEntity, RelatedFetcher, RelationshipStore};
use crate::types::{CancelToken, EntityRef};
use crate::ParqueError;

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Vec<SortKey>>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub columns: Option<Vec<String>>,
    /// Relationship fields to resolve through the batch loader.
    pub hydrate: Vec<String>,
    pub concurrency: usize,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub struct GetOptions {
    pub hydrate: Vec<String>,
    pub max_depth: usize,
    /// When set, attach up to this many inbound edges as `$inbound`.
    pub max_inbound: Option<usize>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            hydrate: Vec::new(),
            max_depth: 2,
            max_inbound: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindResult {
    pub items: Vec<JsonValue>,
    pub stats: ScanStats,
}

/// Reads one namespace across its two regions: the merged collection
/// file and the pending overlay (staged batches not yet merged). Pending
/// rows shadow merged rows with the same id; tombstones hide them.
pub struct RegionReader {
    storage: Arc<dyn crate::storage::StorageBackend>,
    pending: Arc<PendingStore>,
}

/// The pending region folded to its latest state: ids in first-seen
/// order, each mapped to the winning doc or a tombstone.
struct PendingOverlay {
    order: Vec<String>,
    docs: HashMap<String, Option<JsonValue>>,
}

impl PendingOverlay {
    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn shadows(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }
}

impl RegionReader {
    pub fn new(
        storage: Arc<dyn crate::storage::StorageBackend>,
        pending: Arc<PendingStore>,
    ) -> Self {
        Self { storage, pending }
    }

    async fn merged_reader(&self, ns: &str) -> Result<Option<Arc<ColumnarReader>>, ParqueError> {
        let path = data_file_path(ns);
        if !self.storage.exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(Arc::new(
            ColumnarReader::open(Arc::clone(&self.storage), path).await?,
        )))
    }

    async fn pending_overlay(&self, ns: &str) -> Result<PendingOverlay, ParqueError> {
        let mut overlay = PendingOverlay {
            order: Vec::new(),
            docs: HashMap::new(),
        };
        for batch in self.pending.pending_batches(ns).await? {
            let reader =
                ColumnarReader::open(Arc::clone(&self.storage), batch.path.clone()).await?;
            for index in 0..reader.footer().row_groups.len() {
                for row in reader.read_row_group(index, None).await? {
                    let Some(id) = row.get("id").and_then(JsonValue::as_str) else {
                        continue;
                    };
                    let doc = match row.get("data") {
                        None | Some(JsonValue::Null) => None,
                        Some(doc) => Some(doc.clone()),
                    };
                    if !overlay.docs.contains_key(id) {
                        overlay.order.push(id.to_string());
                    }
                    overlay.docs.insert(id.to_string(), doc);
                }
            }
        }
        Ok(overlay)
    }

    /// Point lookup by full id, preferring the pending overlay.
    pub async fn fetch_doc(
        &self,
        ns: &str,
        full_id: &str,
    ) -> Result<Option<JsonValue>, ParqueError> {
        let overlay = self.pending_overlay(ns).await?;
        if let Some(doc) = overlay.docs.get(full_id) {
            return Ok(doc.clone());
        }

        let Some(reader) = self.merged_reader(ns).await? else {
            return Ok(None);
        };
        let mut stream = scan(
            reader,
            ScanOptions {
                filter: Some(serde_json::json!({"$id": full_id})),
                limit: Some(1),
                ..ScanOptions::default()
            },
        );
        stream.next().await
    }
}

/// `find` / `get` / `count` over merged and pending regions, with
/// statistics pushdown in the merged region and batched hydration.
pub struct QueryEngine {
    reader: Arc<RegionReader>,
    loader: Arc<BatchLoader>,
    rels: Arc<RelationshipStore>,
}

impl QueryEngine {
    pub fn new(
        reader: Arc<RegionReader>,
        loader: Arc<BatchLoader>,
        rels: Arc<RelationshipStore>,
    ) -> Self {
        Self {
            reader,
            loader,
            rels,
        }
    }

    pub async fn find(
        &self,
        ns: &str,
        filter: Option<&JsonValue>,
        options: &FindOptions,
    ) -> Result<FindResult, ParqueError> {
        let mut result = if options.sort.is_some() {
            self.find_sorted(ns, filter, options).await?
        } else {
            self.find_streaming(ns, filter, options).await?
        };

        if !options.hydrate.is_empty() {
            let mut visited = HashSet::new();
            self.hydrate_docs(&mut result.items, &options.hydrate, 2, &mut visited)
                .await?;
        }
        Ok(result)
    }

    pub async fn get(
        &self,
        ns: &str,
        id: &str,
        options: &GetOptions,
    ) -> Result<Option<JsonValue>, ParqueError> {
        let full_id = if id.contains('/') {
            id.to_string()
        } else {
            format!("{ns}/{id}")
        };
        let Some(mut doc) = self.reader.fetch_doc(ns, &full_id).await? else {
            return Ok(None);
        };

        if let Some(max_inbound) = options.max_inbound {
            let local_id = full_id.split_once('/').map(|(_, id)| id).unwrap_or(&full_id);
            let inbound = self.rels.inbound_edges(ns, local_id, max_inbound).await?;
            let listed: Vec<JsonValue> = inbound
                .iter()
                .map(|edge| {
                    serde_json::json!({
                        "fromNs": edge.from_ns,
                        "fromId": edge.from_id,
                        "predicate": edge.predicate,
                        "reverse": edge.reverse,
                    })
                })
                .collect();
            set_path(&mut doc, "$inbound", JsonValue::Array(listed));
        }

        let mut docs = vec![doc];
        if !options.hydrate.is_empty() {
            let mut visited = HashSet::new();
            visited.insert(full_id);
            self.hydrate_docs(&mut docs, &options.hydrate, options.max_depth, &mut visited)
                .await?;
        }
        Ok(docs.pop())
    }

    pub async fn count(&self, ns: &str, filter: Option<&JsonValue>) -> Result<u64, ParqueError> {
        let result = self
            .find_streaming(ns, filter, &FindOptions::default())
            .await?;
        Ok(result.items.len() as u64)
    }

    /// Unsorted path: stream merged row groups (early termination when a
    /// limit is reachable), then replay the pending overlay in order.
    async fn find_streaming(
        &self,
        ns: &str,
        filter: Option<&JsonValue>,
        options: &FindOptions,
    ) -> Result<FindResult, ParqueError> {
        let overlay = self.reader.pending_overlay(ns).await?;
        let mut items: Vec<JsonValue> = Vec::new();
        let mut stats = ScanStats::default();
        let mut to_skip = options.skip;

        if let Some(reader) = self.reader.merged_reader(ns).await? {
            if overlay.is_empty() {
                // Clean region: skip and limit push straight down.
                let stream = scan(
                    Arc::clone(&reader),
                    ScanOptions {
                        filter: filter.cloned(),
                        skip: options.skip,
                        limit: options.limit,
                        columns: options.columns.clone(),
                        concurrency: options.concurrency,
                        cancel: options.cancel.clone(),
                        sort: None,
                    },
                );
                let (rows, merged_stats) = stream.collect().await?;
                items = rows;
                stats = merged_stats;
                to_skip = 0;
            } else {
                // Shadowed region: the overlay decides row visibility, so
                // skip/limit accounting stays up here. Rows load without a
                // projection because shadowing needs `$id`.
                let mut stream = scan(
                    Arc::clone(&reader),
                    ScanOptions {
                        filter: filter.cloned(),
                        concurrency: options.concurrency,
                        cancel: options.cancel.clone(),
                        ..ScanOptions::default()
                    },
                );
                while let Some(row) = stream.next().await? {
                    let id = row.get("$id").and_then(JsonValue::as_str).unwrap_or("");
                    if overlay.shadows(id) {
                        continue;
                    }
                    if to_skip > 0 {
                        to_skip -= 1;
                        continue;
                    }
                    items.push(project(row, options.columns.as_deref()));
                    if options.limit.is_some_and(|limit| items.len() >= limit) {
                        break;
                    }
                }
                stats = stream.stats();
            }
        }

        let limit_reached =
            |items: &Vec<JsonValue>| options.limit.is_some_and(|limit| items.len() >= limit);

        if !limit_reached(&items) {
            for id in &overlay.order {
                let Some(Some(doc)) = overlay.docs.get(id).map(Clone::clone) else {
                    continue;
                };
                stats.rows_scanned += 1;
                let matches = filter.map(|f| matches_filter(&doc, f)).unwrap_or(true);
                if !matches {
                    continue;
                }
                if to_skip > 0 {
                    to_skip -= 1;
                    continue;
                }
                items.push(project(doc, options.columns.as_deref()));
                if limit_reached(&items) {
                    break;
                }
            }
        }

        stats.rows_yielded = items.len() as u64;
        Ok(FindResult { items, stats })
    }

    /// Sorted path: collect matches from both regions, order, then page.
    async fn find_sorted(
        &self,
        ns: &str,
        filter: Option<&JsonValue>,
        options: &FindOptions,
    ) -> Result<FindResult, ParqueError> {
        let overlay = self.reader.pending_overlay(ns).await?;
        let mut rows: Vec<JsonValue> = Vec::new();
        let mut stats = ScanStats::default();

        if let Some(reader) = self.reader.merged_reader(ns).await? {
            let stream = scan(
                Arc::clone(&reader),
                ScanOptions {
                    filter: filter.cloned(),
                    concurrency: options.concurrency,
                    cancel: options.cancel.clone(),
                    ..ScanOptions::default()
                },
            );
            let (merged_rows, merged_stats) = stream.collect().await?;
            stats = merged_stats;
            rows.extend(merged_rows.into_iter().filter(|row| {
                row.get("$id")
                    .and_then(JsonValue::as_str)
                    .map(|id| !overlay.shadows(id))
                    .unwrap_or(true)
            }));
        }

        for id in &overlay.order {
            let Some(Some(doc)) = overlay.docs.get(id).map(Clone::clone) else {
                continue;
            };
            stats.rows_scanned += 1;
            if filter.map(|f| matches_filter(&doc, f)).unwrap_or(true) {
                rows.push(doc);
            }
        }

        let keys = options.sort.clone().unwrap_or_default();
        sort_rows(&mut rows, &keys);

        let items: Vec<JsonValue> = rows
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|row| project(row, options.columns.as_deref()))
            .collect();
        stats.rows_yielded = items.len() as u64;
        Ok(FindResult { items, stats })
    }

    /// Resolves hydrate fields through the batch loader. The visited set
    /// breaks user → posts → author → user cycles; depth caps the rest.
    fn hydrate_docs<'a>(
        &'a self,
        docs: &'a mut [JsonValue],
        fields: &'a [String],
        depth: usize,
        visited: &'a mut HashSet<String>,
    ) -> futures_util::future::BoxFuture<'a, Result<(), ParqueError>> {
        Box::pin(async move {
            if depth == 0 {
                return Ok(());
            }
            for doc in docs.iter_mut() {
                let Some(full_id) = doc.get("$id").and_then(JsonValue::as_str) else {
                    continue;
                };
                let Ok(entity) = EntityRef::parse(full_id) else {
                    continue;
                };
                visited.insert(full_id.to_string());

                for field in fields {
                    let related = self.loader.load_ns(&entity.ns, &entity.id, field).await?;
                    let mut related_docs: Vec<JsonValue> = Vec::new();
                    for item in related {
                        let target_id = item.entity.full_id();
                        let Some(mut target_doc) = item.doc.clone() else {
                            continue;
                        };
                        if !visited.contains(&target_id) {
                            visited.insert(target_id);
                            let mut nested = vec![std::mem::take(&mut target_doc)];
                            self.hydrate_docs(&mut nested, fields, depth - 1, visited)
                                .await?;
                            target_doc = nested.pop().unwrap_or(JsonValue::Null);
                        }
                        related_docs.push(target_doc);
                    }
                    set_path(doc, field, JsonValue::Array(related_docs));
                }
            }
            Ok(())
        })
    }
}

fn project(row: JsonValue, columns: Option<&[String]>) -> JsonValue {
    let Some(columns) = columns else {
        return row;
    };
    let mut out = JsonValue::Object(serde_json::Map::new());
    for column in columns {
        if let Some(value) = get_path(&row, column) {
            set_path(&mut out, column, value.clone());
        }
    }
    out
}

/// `RelatedFetcher` over the relationship store: resolves edges for one
/// entity and hydrates each target document from its collection.
pub struct StoreFetcher {
    rels: Arc<RelationshipStore>,
    reader: Arc<RegionReader>,
}

impl StoreFetcher {
    pub fn new(rels: Arc<RelationshipStore>, reader: Arc<RegionReader>) -> Self {
        Self { rels, reader }
    }
}

#[async_trait]
impl RelatedFetcher for StoreFetcher {
    async fn get_related(
        &self,
        ns: &str,
        id: &str,
        relation: &str,
    ) -> Result<Vec<RelatedEntity>, ParqueError> {
        let page = self
            .rels
            .get_related(ns, id, relation, &RelQuery::default())
            .await?;

        let mut related = Vec::with_capacity(page.items.len());
        for edge in page.items {
            let full_id = format!("{}/{}", edge.to_ns, edge.to_id);
            let doc = self.reader.fetch_doc(&edge.to_ns, &full_id).await?;
            related.push(RelatedEntity {
                entity: EntityRef::new(edge.to_ns.clone(), edge.to_id.clone()),
                predicate: edge.predicate.clone(),
                doc,
            });
        }
        Ok(related)
    }
}
