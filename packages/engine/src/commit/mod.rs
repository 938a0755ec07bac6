mod refs;
mod snapshot;

pub use refs::{HeadState, RefStore};
pub use snapshot::{
    diff_schemas, SchemaChange, SchemaChangeKind, SchemaDiff, SchemaSnapshot, SnapshotCollection,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::hex_digest;
use crate::storage::StorageBackend;
use crate::ParqueError;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionState {
    pub data_hash: String,
    pub schema_hash: String,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelationshipsState {
    pub forward_hash: String,
    pub reverse_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventLogPosition {
    pub segment_id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommitState {
    pub collections: BTreeMap<String, CollectionState>,
    pub relationships: RelationshipsState,
    pub event_log_position: EventLogPosition,
    /// Per-namespace event high-water marks at commit time; the merge
    /// engine diffs event histories against these.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_positions: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaSnapshot>,
}

/// Immutable commit object. `hash` is the SHA-256 of the canonical JSON
/// of every other field; canonical here means serde's ordered maps, so
/// serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub parents: Vec<String>,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub state: CommitState,
}

#[derive(Debug, Clone, Default)]
pub struct CommitMeta {
    pub message: String,
    pub author: Option<String>,
    pub parents: Vec<String>,
    /// Injectable clock for deterministic commit hashes in tests.
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn commit_path(hash: &str) -> String {
    format!("commits/{hash}.json")
}

pub(crate) fn compute_commit_hash(
    parents: &[String],
    state: &CommitState,
    message: &str,
    author: &str,
    timestamp: &DateTime<Utc>,
) -> Result<String, ParqueError> {
    let canonical = serde_json::to_vec(&serde_json::json!({
        "author": author,
        "message": message,
        "parents": parents,
        "state": state,
        "timestamp": timestamp.to_rfc3339(),
    }))?;
    Ok(hex_digest(&canonical))
}

/// Content-addressed commit storage under `commits/<hash>.json`.
pub struct CommitStore {
    storage: Arc<dyn StorageBackend>,
}

impl CommitStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn create_commit(
        &self,
        state: CommitState,
        meta: CommitMeta,
    ) -> Result<Commit, ParqueError> {
        let timestamp = meta.timestamp.unwrap_or_else(Utc::now);
        let author = meta.author.unwrap_or_else(|| "anonymous".to_string());
        for parent in &meta.parents {
            if !self.exists(parent).await? {
                return Err(ParqueError::not_found(format!("parent commit {parent}")));
            }
        }

        let hash =
            compute_commit_hash(&meta.parents, &state, &meta.message, &author, &timestamp)?;
        let commit = Commit {
            hash: hash.clone(),
            parents: meta.parents,
            message: meta.message,
            author,
            timestamp,
            state,
        };

        let bytes = serde_json::to_vec_pretty(&commit)?;
        self.storage.write(&commit_path(&hash), &bytes).await?;
        Ok(commit)
    }

    /// Attaches a schema snapshot to the commit state and backfills the
    /// snapshot's `commit_hash` with the resulting hash.
    pub async fn create_commit_with_schema(
        &self,
        mut state: CommitState,
        mut schema: SchemaSnapshot,
        meta: CommitMeta,
    ) -> Result<Commit, ParqueError> {
        schema.commit_hash = None;
        state.schema = Some(schema);
        let mut commit = self.create_commit(state, meta).await?;

        if let Some(embedded) = commit.state.schema.as_mut() {
            embedded.commit_hash = Some(commit.hash.clone());
        }
        let bytes = serde_json::to_vec_pretty(&commit)?;
        self.storage.write(&commit_path(&commit.hash), &bytes).await?;
        Ok(commit)
    }

    pub async fn read_commit(&self, hash: &str) -> Result<Commit, ParqueError> {
        let bytes = self.storage.read(&commit_path(hash)).await.map_err(|error| {
            if error.is_not_found() {
                ParqueError::not_found(format!("commit {hash}"))
            } else {
                error
            }
        })?;
        let commit: Commit = serde_json::from_slice(&bytes)
            .map_err(|error| ParqueError::fatal(format!("commit {hash} parse: {error}")))?;
        Ok(commit)
    }

    pub async fn exists(&self, hash: &str) -> Result<bool, ParqueError> {
        self.storage.exists(&commit_path(hash)).await
    }

    /// Reads the schema embedded in a commit, falling back to the legacy
    /// side-file under `_meta/schemas/<schema_hash>.json`.
    pub async fn load_schema_at_commit(
        &self,
        hash: &str,
    ) -> Result<Option<SchemaSnapshot>, ParqueError> {
        let commit = self.read_commit(hash).await?;
        if let Some(schema) = commit.state.schema {
            return Ok(Some(schema));
        }

        // Legacy layout: one snapshot per collection schema hash.
        for (_, collection) in commit.state.collections.iter() {
            let side_path = format!("_meta/schemas/{}.json", collection.schema_hash);
            match self.storage.read(&side_path).await {
                Ok(bytes) => {
                    let snapshot: SchemaSnapshot = serde_json::from_slice(&bytes)?;
                    return Ok(Some(snapshot));
                }
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{CommitMeta, CommitState, CommitStore, CollectionState};
    use crate::commit::compute_commit_hash;
    use crate::storage::MemoryBackend;
    use chrono::{TimeZone, Utc};

    fn state_with(ns: &str, data_hash: &str) -> CommitState {
        let mut state = CommitState::default();
        state.collections.insert(
            ns.to_string(),
            CollectionState {
                data_hash: data_hash.to_string(),
                schema_hash: "s0".to_string(),
                row_count: 1,
            },
        );
        state
    }

    fn meta(message: &str) -> CommitMeta {
        CommitMeta {
            message: message.to_string(),
            author: Some("tester".to_string()),
            parents: Vec::new(),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn commit_hash_is_deterministic_over_canonical_fields() {
        let state = state_with("posts", "d1");
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let a = compute_commit_hash(&[], &state, "init", "tester", &ts).unwrap();
        let b = compute_commit_hash(&[], &state, "init", "tester", &ts).unwrap();
        assert_eq!(a, b);
        let c = compute_commit_hash(&[], &state, "other", "tester", &ts).unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn created_commits_read_back_by_hash() {
        let store = CommitStore::new(Arc::new(MemoryBackend::new()));
        let commit = store
            .create_commit(state_with("posts", "d1"), meta("initial"))
            .await
            .unwrap();
        let loaded = store.read_commit(&commit.hash).await.unwrap();
        assert_eq!(loaded, commit);
    }

    #[tokio::test]
    async fn unknown_parent_is_rejected() {
        let store = CommitStore::new(Arc::new(MemoryBackend::new()));
        let mut bad = meta("child");
        bad.parents = vec!["deadbeef".to_string()];
        let error = store
            .create_commit(state_with("posts", "d1"), bad)
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn missing_commit_is_not_found() {
        let store = CommitStore::new(Arc::new(MemoryBackend::new()));
        assert!(store.read_commit("nope").await.unwrap_err().is_not_found());
    }
}
