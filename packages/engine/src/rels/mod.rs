mod batch;
mod shred;

pub use batch::{BatchLoader, BatchLoaderOptions, RelatedEntity, RelatedFetcher};
pub use shred::{
    extract_metadata, merge_shredded, validate_match_quality, MatchMode, ShreddedMetadata,
};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::columnar::{
    write_columnar, ColumnDef, ColumnType, ColumnarReader, FileSchema, WriteOptions,
};
use crate::filter::matches_filter;
use crate::storage::StorageBackend;
use crate::ParqueError;

pub const FORWARD_PATH: &str = "rels/forward.parquet";
pub const REVERSE_PATH: &str = "rels/reverse.parquet";

/// One directed, typed edge. Deletions are logical: a tombstone row with
/// `deleted_at` set and a bumped version supersedes the live row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from_ns: String,
    pub from_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub predicate: String,
    pub reverse: String,
    pub to_ns: String,
    pub to_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_mode: Option<MatchMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// Residual metadata, variant-encoded in the column file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    pub version: u64,
}

impl Edge {
    fn key(&self) -> (String, String, String, String, String) {
        (
            self.from_ns.clone(),
            self.from_id.clone(),
            self.predicate.clone(),
            self.to_ns.clone(),
            self.to_id.clone(),
        )
    }

    pub fn metadata(&self) -> JsonValue {
        merge_shredded(&ShreddedMetadata {
            match_mode: self.match_mode,
            similarity: self.similarity,
            residual: self
                .data
                .as_ref()
                .and_then(JsonValue::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EdgeDraft {
    pub from_ns: String,
    pub from_id: String,
    pub from_type: Option<String>,
    pub from_name: Option<String>,
    pub predicate: String,
    pub reverse: String,
    pub to_ns: String,
    pub to_id: String,
    pub to_type: Option<String>,
    pub to_name: Option<String>,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Default)]
pub struct RelQuery {
    /// Secondary filter evaluated against the edge row.
    pub filter: Option<JsonValue>,
    pub match_mode: Option<MatchMode>,
    pub min_similarity: Option<f64>,
    pub max_similarity: Option<f64>,
    pub skip: usize,
    pub limit: Option<usize>,
    /// Include tombstoned edges (history reads).
    pub include_deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Edge>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelFileHashes {
    pub forward_hash: String,
    pub reverse_hash: String,
}

fn edge_file_schema() -> FileSchema {
    FileSchema::new(vec![
        ColumnDef::new("fromNs", ColumnType::String),
        ColumnDef::new("fromId", ColumnType::String),
        ColumnDef::new("fromType", ColumnType::String),
        ColumnDef::new("fromName", ColumnType::String),
        ColumnDef::new("predicate", ColumnType::String),
        ColumnDef::new("reverse", ColumnType::String),
        ColumnDef::new("toNs", ColumnType::String),
        ColumnDef::new("toId", ColumnType::String),
        ColumnDef::new("toType", ColumnType::String),
        ColumnDef::new("toName", ColumnType::String),
        ColumnDef::new("matchMode", ColumnType::String),
        ColumnDef::new("similarity", ColumnType::Number),
        ColumnDef::new("data", ColumnType::Variant),
        ColumnDef::new("createdAt", ColumnType::Timestamp),
        ColumnDef::new("createdBy", ColumnType::String),
        ColumnDef::new("deletedAt", ColumnType::Timestamp),
        ColumnDef::new("deletedBy", ColumnType::String),
        ColumnDef::new("version", ColumnType::Number),
    ])
}

/// Persistent store for typed edges with forward and reverse column
/// files. Writes accumulate in memory until `save`; queries see both the
/// persisted rows and unsaved writes.
pub struct RelationshipStore {
    storage: Arc<dyn StorageBackend>,
    pending: Mutex<Vec<Edge>>,
    loaded: Mutex<Option<Vec<Edge>>>,
}

impl RelationshipStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            pending: Mutex::new(Vec::new()),
            loaded: Mutex::new(None),
        }
    }

    /// Adds an edge, shredding its metadata. The edge version supersedes
    /// any prior row with the same key.
    pub async fn add_edge(
        &self,
        draft: EdgeDraft,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Edge, ParqueError> {
        let shredded = match &draft.metadata {
            Some(metadata) => extract_metadata(metadata)?,
            None => ShreddedMetadata::default(),
        };

        let version = self.next_version(&draft).await?;
        let edge = Edge {
            from_ns: draft.from_ns,
            from_id: draft.from_id,
            from_type: draft.from_type,
            from_name: draft.from_name,
            predicate: draft.predicate,
            reverse: draft.reverse,
            to_ns: draft.to_ns,
            to_id: draft.to_id,
            to_type: draft.to_type,
            to_name: draft.to_name,
            match_mode: shredded.match_mode,
            similarity: shredded.similarity,
            data: if shredded.residual.is_empty() {
                None
            } else {
                Some(JsonValue::Object(shredded.residual))
            },
            created_at: now,
            created_by: actor.to_string(),
            deleted_at: None,
            deleted_by: None,
            version,
        };

        self.pending.lock().unwrap().push(edge.clone());
        Ok(edge)
    }

    /// Tombstones an edge. Missing edges are a no-op returning false.
    pub async fn remove_edge(
        &self,
        from_ns: &str,
        from_id: &str,
        predicate: &str,
        to_ns: &str,
        to_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ParqueError> {
        let all = self.all_edges().await?;
        let Some(live) = latest_versions(&all)
            .into_iter()
            .find(|edge| {
                edge.deleted_at.is_none()
                    && edge.from_ns == from_ns
                    && edge.from_id == from_id
                    && edge.predicate == predicate
                    && edge.to_ns == to_ns
                    && edge.to_id == to_id
            })
        else {
            return Ok(false);
        };

        let mut tombstone = live.clone();
        tombstone.deleted_at = Some(now);
        tombstone.deleted_by = Some(actor.to_string());
        tombstone.version = live.version + 1;
        self.pending.lock().unwrap().push(tombstone);
        Ok(true)
    }

    async fn next_version(&self, draft: &EdgeDraft) -> Result<u64, ParqueError> {
        let all = self.all_edges().await?;
        Ok(all
            .iter()
            .filter(|edge| {
                edge.from_ns == draft.from_ns
                    && edge.from_id == draft.from_id
                    && edge.predicate == draft.predicate
                    && edge.to_ns == draft.to_ns
                    && edge.to_id == draft.to_id
            })
            .map(|edge| edge.version)
            .max()
            .map(|version| version + 1)
            .unwrap_or(1))
    }

    /// Every edge row: persisted file rows plus unsaved writes.
    async fn all_edges(&self) -> Result<Vec<Edge>, ParqueError> {
        self.ensure_loaded().await?;
        let loaded = self.loaded.lock().unwrap();
        let mut edges = loaded.clone().unwrap_or_default();
        edges.extend(self.pending.lock().unwrap().iter().cloned());
        Ok(edges)
    }

    async fn ensure_loaded(&self) -> Result<(), ParqueError> {
        {
            let loaded = self.loaded.lock().unwrap();
            if loaded.is_some() {
                return Ok(());
            }
        }

        let mut edges = Vec::new();
        if self.storage.exists(FORWARD_PATH).await? {
            let reader =
                ColumnarReader::open(Arc::clone(&self.storage), FORWARD_PATH.to_string()).await?;
            for index in 0..reader.footer().row_groups.len() {
                for row in reader.read_row_group(index, None).await? {
                    let edge: Edge = serde_json::from_value(row).map_err(|error| {
                        ParqueError::fatal(format!("edge row parse: {error}"))
                    })?;
                    edges.push(edge);
                }
            }
        }

        let mut loaded = self.loaded.lock().unwrap();
        if loaded.is_none() {
            *loaded = Some(edges);
        }
        Ok(())
    }

    /// Writes both edge files (forward keyed on from, reverse keyed on
    /// to) and returns their content hashes.
    pub async fn save(&self) -> Result<RelFileHashes, ParqueError> {
        let mut edges = self.all_edges().await?;

        edges.sort_by(|a, b| {
            (&a.from_ns, &a.from_id, &a.predicate, a.version).cmp(&(
                &b.from_ns,
                &b.from_id,
                &b.predicate,
                b.version,
            ))
        });
        let forward_rows: Vec<JsonValue> = edges
            .iter()
            .map(|edge| serde_json::to_value(edge).map_err(ParqueError::from))
            .collect::<Result<_, _>>()?;
        write_columnar(
            self.storage.as_ref(),
            FORWARD_PATH,
            &forward_rows,
            &edge_file_schema(),
            &WriteOptions::default(),
        )
        .await?;

        edges.sort_by(|a, b| {
            (&a.to_ns, &a.to_id, &a.reverse, a.version).cmp(&(
                &b.to_ns,
                &b.to_id,
                &b.reverse,
                b.version,
            ))
        });
        let reverse_rows: Vec<JsonValue> = edges
            .iter()
            .map(|edge| serde_json::to_value(edge).map_err(ParqueError::from))
            .collect::<Result<_, _>>()?;
        write_columnar(
            self.storage.as_ref(),
            REVERSE_PATH,
            &reverse_rows,
            &edge_file_schema(),
            &WriteOptions::default(),
        )
        .await?;

        {
            let mut loaded = self.loaded.lock().unwrap();
            let mut pending = self.pending.lock().unwrap();
            let mut all = loaded.take().unwrap_or_default();
            all.append(&mut pending);
            *loaded = Some(all);
        }

        let forward_bytes = self.storage.read(FORWARD_PATH).await?;
        let reverse_bytes = self.storage.read(REVERSE_PATH).await?;
        Ok(RelFileHashes {
            forward_hash: blake3::hash(&forward_bytes).to_hex().to_string(),
            reverse_hash: blake3::hash(&reverse_bytes).to_hex().to_string(),
        })
    }

    /// Forward traversal: edges out of `(from_ns, from_id)` along
    /// `predicate`. Missing entities simply return an empty page.
    pub async fn get_related(
        &self,
        from_ns: &str,
        from_id: &str,
        predicate: &str,
        query: &RelQuery,
    ) -> Result<Page, ParqueError> {
        let matching = |edge: &Edge| {
            edge.from_ns == from_ns && edge.from_id == from_id && edge.predicate == predicate
        };
        self.query_edges(matching, query).await
    }

    /// Reverse traversal: edges into `(to_ns, to_id)` along the reverse
    /// predicate name.
    pub async fn get_referencing(
        &self,
        to_ns: &str,
        to_id: &str,
        reverse: &str,
        query: &RelQuery,
    ) -> Result<Page, ParqueError> {
        let matching =
            |edge: &Edge| edge.to_ns == to_ns && edge.to_id == to_id && edge.reverse == reverse;
        self.query_edges(matching, query).await
    }

    /// All live edges pointing at one entity, regardless of predicate,
    /// capped at `limit`.
    pub async fn inbound_edges(
        &self,
        to_ns: &str,
        to_id: &str,
        limit: usize,
    ) -> Result<Vec<Edge>, ParqueError> {
        let all = self.all_edges().await?;
        let mut edges: Vec<Edge> = latest_versions(&all)
            .into_iter()
            .filter(|edge| {
                edge.deleted_at.is_none() && edge.to_ns == to_ns && edge.to_id == to_id
            })
            .cloned()
            .collect();
        edges.sort_by(|a, b| {
            (&a.from_ns, &a.from_id, &a.predicate).cmp(&(&b.from_ns, &b.from_id, &b.predicate))
        });
        edges.truncate(limit);
        Ok(edges)
    }

    async fn query_edges(
        &self,
        matching: impl Fn(&Edge) -> bool,
        query: &RelQuery,
    ) -> Result<Page, ParqueError> {
        let all = self.all_edges().await?;
        let mut edges: Vec<Edge> = latest_versions(&all)
            .into_iter()
            .filter(|edge| matching(edge))
            .filter(|edge| query.include_deleted || edge.deleted_at.is_none())
            .cloned()
            .collect();

        if let Some(mode) = query.match_mode {
            edges.retain(|edge| edge.match_mode == Some(mode));
        }
        if let Some(min) = query.min_similarity {
            edges.retain(|edge| edge.similarity.is_some_and(|s| s >= min));
        }
        if let Some(max) = query.max_similarity {
            edges.retain(|edge| edge.similarity.is_some_and(|s| s <= max));
        }
        if let Some(filter) = &query.filter {
            edges.retain(|edge| {
                serde_json::to_value(edge)
                    .map(|row| matches_filter(&row, filter))
                    .unwrap_or(false)
            });
        }

        edges.sort_by(|a, b| (&a.to_ns, &a.to_id).cmp(&(&b.to_ns, &b.to_id)));
        let total = edges.len();
        let items: Vec<Edge> = edges
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        let has_more = query.skip + items.len() < total;

        Ok(Page {
            items,
            total,
            has_more,
        })
    }
}

/// Collapses the edge history to the highest version per edge key.
fn latest_versions(edges: &[Edge]) -> Vec<&Edge> {
    let mut latest: BTreeMap<(String, String, String, String, String), &Edge> = BTreeMap::new();
    for edge in edges {
        let key = edge.key();
        match latest.get(&key) {
            Some(existing) if existing.version >= edge.version => {}
            _ => {
                latest.insert(key, edge);
            }
        }
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{EdgeDraft, MatchMode, RelQuery, RelationshipStore};
    use crate::storage::MemoryBackend;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn now() -> chrono::DateTime<chrono::Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn draft(from: &str, predicate: &str, to: &str, metadata: Option<serde_json::Value>) -> EdgeDraft {
        EdgeDraft {
            from_ns: "posts".to_string(),
            from_id: from.to_string(),
            from_type: Some("Post".to_string()),
            from_name: None,
            predicate: predicate.to_string(),
            reverse: "posts".to_string(),
            to_ns: "users".to_string(),
            to_id: to.to_string(),
            to_type: Some("User".to_string()),
            to_name: None,
            metadata,
        }
    }

    #[tokio::test]
    async fn forward_and_reverse_lookups_are_symmetric() {
        let store = RelationshipStore::new(Arc::new(MemoryBackend::new()));
        store.add_edge(draft("p1", "author", "u1", None), "tester", now()).await.unwrap();
        store.add_edge(draft("p2", "author", "u1", None), "tester", now()).await.unwrap();
        store.save().await.unwrap();

        let forward = store
            .get_related("posts", "p1", "author", &RelQuery::default())
            .await
            .unwrap();
        assert_eq!(forward.total, 1);
        assert_eq!(forward.items[0].to_id, "u1");

        let reverse = store
            .get_referencing("users", "u1", "posts", &RelQuery::default())
            .await
            .unwrap();
        assert_eq!(reverse.total, 2);
    }

    #[tokio::test]
    async fn missing_entity_returns_an_empty_page() {
        let store = RelationshipStore::new(Arc::new(MemoryBackend::new()));
        let page = store
            .get_related("posts", "nope", "author", &RelQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn tombstones_hide_edges_but_keep_history() {
        let store = RelationshipStore::new(Arc::new(MemoryBackend::new()));
        store.add_edge(draft("p1", "author", "u1", None), "tester", now()).await.unwrap();
        let removed = store
            .remove_edge("posts", "p1", "author", "users", "u1", "tester", now())
            .await
            .unwrap();
        assert!(removed);

        let live = store
            .get_related("posts", "p1", "author", &RelQuery::default())
            .await
            .unwrap();
        assert_eq!(live.total, 0);

        let history = store
            .get_related(
                "posts",
                "p1",
                "author",
                &RelQuery {
                    include_deleted: true,
                    ..RelQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.items[0].version, 2);
    }

    #[tokio::test]
    async fn shredded_filters_select_by_match_quality() {
        let store = RelationshipStore::new(Arc::new(MemoryBackend::new()));
        store
            .add_edge(
                draft("p1", "mentions", "u1", Some(json!({"matchMode": "fuzzy", "similarity": 0.9}))),
                "tester",
                now(),
            )
            .await
            .unwrap();
        store
            .add_edge(
                draft("p1", "mentions", "u2", Some(json!({"matchMode": "fuzzy", "similarity": 0.4}))),
                "tester",
                now(),
            )
            .await
            .unwrap();
        store
            .add_edge(
                draft("p1", "mentions", "u3", Some(json!({"matchMode": "exact"}))),
                "tester",
                now(),
            )
            .await
            .unwrap();

        let confident = store
            .get_related(
                "posts",
                "p1",
                "mentions",
                &RelQuery {
                    match_mode: Some(MatchMode::Fuzzy),
                    min_similarity: Some(0.5),
                    ..RelQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(confident.total, 1);
        assert_eq!(confident.items[0].to_id, "u1");

        let exact = store
            .get_related(
                "posts",
                "p1",
                "mentions",
                &RelQuery {
                    match_mode: Some(MatchMode::Exact),
                    ..RelQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(exact.total, 1);
        assert_eq!(exact.items[0].to_id, "u3");
    }

    #[tokio::test]
    async fn residual_metadata_round_trips_through_save() {
        let storage = Arc::new(MemoryBackend::new());
        let store = RelationshipStore::new(storage.clone());
        let metadata = json!({"matchMode": "fuzzy", "similarity": 0.7, "origin": "linker"});
        store
            .add_edge(draft("p1", "mentions", "u1", Some(metadata.clone())), "tester", now())
            .await
            .unwrap();
        store.save().await.unwrap();

        let reopened = RelationshipStore::new(storage);
        let page = reopened
            .get_related("posts", "p1", "mentions", &RelQuery::default())
            .await
            .unwrap();
        assert_eq!(page.items[0].metadata(), metadata);
    }

    #[tokio::test]
    async fn inbound_edges_cap_at_the_requested_limit() {
        let store = RelationshipStore::new(Arc::new(MemoryBackend::new()));
        for i in 0..4 {
            store
                .add_edge(draft(&format!("p{i}"), "author", "u1", None), "tester", now())
                .await
                .unwrap();
        }

        let inbound = store.inbound_edges("users", "u1", 2).await.unwrap();
        assert_eq!(inbound.len(), 2);
        assert!(inbound.iter().all(|edge| edge.to_id == "u1"));
    }

    #[tokio::test]
    async fn pagination_reports_totals_and_has_more() {
        let store = RelationshipStore::new(Arc::new(MemoryBackend::new()));
        for i in 0..5 {
            store
                .add_edge(draft("p1", "mentions", &format!("u{i}"), None), "tester", now())
                .await
                .unwrap();
        }

        let page = store
            .get_related(
                "posts",
                "p1",
                "mentions",
                &RelQuery {
                    skip: 1,
                    limit: Some(2),
                    ..RelQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
    }
}
