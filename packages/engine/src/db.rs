use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value as JsonValue;

use crate::commit::{
    Commit, CommitMeta, CommitState, CommitStore, CollectionState, EventLogPosition, HeadState,
    RefStore, RelationshipsState, SchemaSnapshot,
};
use crate::event::{Event, EventOp};
use crate::filter::{apply_update, parse_update, validate_update, UpdateContext};
use crate::merge::{MergeEngine, MergeOptions, MergePlan};
use crate::mv::MvEngine;
use crate::pending::{data_file_path, PendingStore, StagedRow};
use crate::query::{FindOptions, FindResult, GetOptions, QueryEngine, RegionReader, StoreFetcher};
use crate::rels::{BatchLoader, BatchLoaderOptions, EdgeDraft, Page, RelQuery, RelationshipStore};
use crate::schema::CollectionSchema;
use crate::storage::StorageBackend;
use crate::subscribe::{SubscriptionManager, SubscriptionManagerOptions, SubscriptionWriter};
use crate::types::{
    EntityRef, FIELD_CREATED_AT, FIELD_CREATED_BY, FIELD_ID, FIELD_TYPE, FIELD_UPDATED_AT,
    FIELD_UPDATED_BY, FIELD_VERSION,
};
use crate::wal::{EventLog, EventLogOptions};
use crate::ParqueError;

#[derive(Clone, Default)]
pub struct ParqueDbOptions {
    pub wal: EventLogOptions,
    pub subscriptions: SubscriptionManagerOptions,
    pub loader: BatchLoaderOptions,
}

/// The assembled database: event-sourced writes through the WAL and the
/// pending region, queries over both regions, relationships, the commit
/// DAG, materialized views, and subscriptions, all over one storage root.
pub struct ParqueDb {
    storage: Arc<dyn StorageBackend>,
    wal: Arc<EventLog>,
    pending: Arc<PendingStore>,
    rels: Arc<RelationshipStore>,
    region: Arc<RegionReader>,
    query: QueryEngine,
    commits: Arc<CommitStore>,
    refs: Arc<RefStore>,
    merge: MergeEngine,
    mv: Arc<MvEngine>,
    subs: Arc<SubscriptionManager>,
    schemas: Mutex<BTreeMap<String, CollectionSchema>>,
}

impl ParqueDb {
    pub fn open(storage: Arc<dyn StorageBackend>, options: ParqueDbOptions) -> Arc<Self> {
        let wal = Arc::new(EventLog::new(Arc::clone(&storage), options.wal));
        let pending = Arc::new(PendingStore::new(Arc::clone(&storage)));
        let rels = Arc::new(RelationshipStore::new(Arc::clone(&storage)));
        let region = Arc::new(RegionReader::new(Arc::clone(&storage), Arc::clone(&pending)));
        let fetcher = Arc::new(StoreFetcher::new(Arc::clone(&rels), Arc::clone(&region)));
        let loader = Arc::new(BatchLoader::new(fetcher, options.loader));
        let query = QueryEngine::new(Arc::clone(&region), loader, Arc::clone(&rels));
        let commits = Arc::new(CommitStore::new(Arc::clone(&storage)));
        let refs = Arc::new(RefStore::new(Arc::clone(&storage)));
        let merge = MergeEngine::new(Arc::clone(&commits), Arc::clone(&refs), Arc::clone(&wal));
        let mv = Arc::new(MvEngine::new(Arc::clone(&wal)));
        let subs = Arc::new(SubscriptionManager::new(options.subscriptions));

        Arc::new(Self {
            storage,
            wal,
            pending,
            rels,
            region,
            query,
            commits,
            refs,
            merge,
            mv,
            subs,
            schemas: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn register_schema(&self, schema: CollectionSchema) {
        let mut schemas = self.schemas.lock().unwrap();
        schemas.insert(schema.name.clone(), schema);
    }

    pub fn wal(&self) -> &Arc<EventLog> {
        &self.wal
    }

    pub fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    pub fn relationships(&self) -> &Arc<RelationshipStore> {
        &self.rels
    }

    pub fn commits(&self) -> &Arc<CommitStore> {
        &self.commits
    }

    pub fn refs(&self) -> &Arc<RefStore> {
        &self.refs
    }

    pub fn mv(&self) -> &Arc<MvEngine> {
        &self.mv
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subs
    }

    /// Creates one entity: stamps system fields, validates against the
    /// registered schema, appends a CREATE event, stages the projection,
    /// and fans out to views and subscribers.
    pub async fn create(
        &self,
        ns: &str,
        local_id: &str,
        doc: JsonValue,
        actor: &str,
    ) -> Result<JsonValue, ParqueError> {
        let created = self.create_many(ns, vec![(local_id.to_string(), doc)], actor).await?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| ParqueError::fatal("create returned no document"))
    }

    /// Bulk create: one staged batch, one WAL append.
    pub async fn create_many(
        &self,
        ns: &str,
        docs: Vec<(String, JsonValue)>,
        actor: &str,
    ) -> Result<Vec<JsonValue>, ParqueError> {
        let now = Utc::now();
        let mut events = Vec::with_capacity(docs.len());
        let mut stamped_docs = Vec::with_capacity(docs.len());

        for (local_id, mut doc) in docs {
            if let Some(schema) = self.schemas.lock().unwrap().get(ns) {
                schema.validate_doc(&doc)?;
            }

            let entity = EntityRef::new(ns, local_id);
            if self.region.fetch_doc(ns, &entity.full_id()).await?.is_some() {
                return Err(ParqueError::conflict(format!(
                    "entity {} already exists",
                    entity.full_id()
                )));
            }

            let Some(map) = doc.as_object_mut() else {
                return Err(ParqueError::invariant("documents must be objects"));
            };
            map.insert(FIELD_ID.to_string(), JsonValue::String(entity.full_id()));
            map.insert(FIELD_TYPE.to_string(), JsonValue::String(ns.to_string()));
            map.insert(
                FIELD_CREATED_AT.to_string(),
                JsonValue::String(now.to_rfc3339()),
            );
            map.insert(
                FIELD_CREATED_BY.to_string(),
                JsonValue::String(actor.to_string()),
            );
            map.insert(
                FIELD_UPDATED_AT.to_string(),
                JsonValue::String(now.to_rfc3339()),
            );
            map.insert(
                FIELD_UPDATED_BY.to_string(),
                JsonValue::String(actor.to_string()),
            );
            map.insert(FIELD_VERSION.to_string(), JsonValue::from(1));

            events.push(Event {
                id: uuid::Uuid::now_v7().to_string(),
                seq: 0,
                ts: now,
                op: EventOp::Create,
                target: entity.target(),
                before: None,
                after: Some(doc.clone()),
                actor: actor.to_string(),
                metadata: None,
            });
            stamped_docs.push(doc);
        }

        let events = self.wal.append(ns, events).await?;
        let rows: Vec<StagedRow> = stamped_docs
            .iter()
            .map(|doc| StagedRow {
                id: doc
                    .get(FIELD_ID)
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                doc: Some(doc.clone()),
            })
            .collect();
        let first_seq = events.first().map(|event| event.seq).unwrap_or(0);
        let last_seq = events.last().map(|event| event.seq).unwrap_or(0);
        self.pending.stage_batch(ns, &rows, first_seq, last_seq).await?;

        self.fan_out(&events).await;
        Ok(stamped_docs)
    }

    /// Applies an update spec to one entity. The spec rides on the event
    /// metadata so the merge engine can reason about commutativity.
    pub async fn update(
        &self,
        ns: &str,
        id: &str,
        update: &JsonValue,
        actor: &str,
    ) -> Result<JsonValue, ParqueError> {
        let entity = self.entity_ref(ns, id);
        let Some(before) = self.region.fetch_doc(ns, &entity.full_id()).await? else {
            return Err(ParqueError::not_found(format!("entity {}", entity.full_id())));
        };

        let spec = parse_update(update)?;
        validate_update(&spec)?;
        let now = Utc::now();
        let mut after = apply_update(&before, &spec, &UpdateContext::at(now))?;

        if let Some(map) = after.as_object_mut() {
            map.insert(
                FIELD_UPDATED_AT.to_string(),
                JsonValue::String(now.to_rfc3339()),
            );
            map.insert(
                FIELD_UPDATED_BY.to_string(),
                JsonValue::String(actor.to_string()),
            );
            let version = before.get(FIELD_VERSION).and_then(JsonValue::as_u64).unwrap_or(0);
            map.insert(FIELD_VERSION.to_string(), JsonValue::from(version + 1));
        }
        if let Some(schema) = self.schemas.lock().unwrap().get(ns) {
            schema.validate_doc(&after)?;
        }

        let events = self
            .wal
            .append(
                ns,
                vec![Event {
                    id: uuid::Uuid::now_v7().to_string(),
                    seq: 0,
                    ts: now,
                    op: EventOp::Update,
                    target: entity.target(),
                    before: Some(before),
                    after: Some(after.clone()),
                    actor: actor.to_string(),
                    metadata: Some(serde_json::json!({"update": update})),
                }],
            )
            .await?;

        let seq = events.first().map(|event| event.seq).unwrap_or(0);
        self.pending
            .stage_batch(
                ns,
                &[StagedRow {
                    id: entity.full_id(),
                    doc: Some(after.clone()),
                }],
                seq,
                seq,
            )
            .await?;

        self.fan_out(&events).await;
        Ok(after)
    }

    /// Logically deletes an entity. Deleting a missing entity is not an
    /// error; it returns false.
    pub async fn delete(&self, ns: &str, id: &str, actor: &str) -> Result<bool, ParqueError> {
        let entity = self.entity_ref(ns, id);
        let Some(before) = self.region.fetch_doc(ns, &entity.full_id()).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let events = self
            .wal
            .append(
                ns,
                vec![Event {
                    id: uuid::Uuid::now_v7().to_string(),
                    seq: 0,
                    ts: now,
                    op: EventOp::Delete,
                    target: entity.target(),
                    before: Some(before),
                    after: None,
                    actor: actor.to_string(),
                    metadata: None,
                }],
            )
            .await?;

        let seq = events.first().map(|event| event.seq).unwrap_or(0);
        self.pending
            .stage_batch(
                ns,
                &[StagedRow {
                    id: entity.full_id(),
                    doc: None,
                }],
                seq,
                seq,
            )
            .await?;

        self.fan_out(&events).await;
        Ok(true)
    }

    async fn fan_out(&self, events: &[Event]) {
        for event in events {
            self.subs.dispatch(event).await;
        }
        if let Err(error) = self.mv.flush().await {
            tracing::warn!(%error, "materialized view flush after write failed");
        }
    }

    fn entity_ref(&self, ns: &str, id: &str) -> EntityRef {
        match EntityRef::parse(id) {
            Ok(entity) if entity.ns == ns => entity,
            _ => EntityRef::new(ns, id),
        }
    }

    pub async fn find(
        &self,
        ns: &str,
        filter: Option<&JsonValue>,
        options: &FindOptions,
    ) -> Result<FindResult, ParqueError> {
        self.query.find(ns, filter, options).await
    }

    pub async fn get(
        &self,
        ns: &str,
        id: &str,
        options: &GetOptions,
    ) -> Result<Option<JsonValue>, ParqueError> {
        self.query.get(ns, id, options).await
    }

    pub async fn count(&self, ns: &str, filter: Option<&JsonValue>) -> Result<u64, ParqueError> {
        self.query.count(ns, filter).await
    }

    pub async fn relate(&self, draft: EdgeDraft, actor: &str) -> Result<(), ParqueError> {
        self.rels.add_edge(draft, actor, Utc::now()).await?;
        Ok(())
    }

    pub async fn get_related(
        &self,
        from_ns: &str,
        from_id: &str,
        predicate: &str,
        query: &RelQuery,
    ) -> Result<Page, ParqueError> {
        self.rels.get_related(from_ns, from_id, predicate, query).await
    }

    /// Namespaces that have a merged or pending data region.
    pub async fn namespaces(&self) -> Result<Vec<String>, ParqueError> {
        let listed = self.storage.list("data/").await?;
        let mut namespaces = BTreeSet::new();
        for path in listed {
            if let Some(rest) = path.strip_prefix("data/") {
                if let Some((ns, _)) = rest.split_once('/') {
                    namespaces.insert(ns.to_string());
                }
            }
        }
        Ok(namespaces.into_iter().collect())
    }

    /// Snapshots the database into a commit: flushes the WAL and every
    /// pending region, saves relationship files, hashes collection files,
    /// embeds the schema snapshot, and advances the checked-out ref.
    pub async fn commit(&self, message: &str, author: &str) -> Result<Commit, ParqueError> {
        self.wal.flush_all().await?;
        let namespaces = self.namespaces().await?;
        for ns in &namespaces {
            self.pending.flush_pending_to_committed(ns).await?;
        }
        let rel_hashes = self.rels.save().await?;

        let mut state = CommitState {
            relationships: RelationshipsState {
                forward_hash: rel_hashes.forward_hash,
                reverse_hash: rel_hashes.reverse_hash,
            },
            ..CommitState::default()
        };

        let schemas = self.schemas.lock().unwrap().clone();
        let mut top_position: (String, u64) = (String::new(), 0);
        for ns in &namespaces {
            let path = data_file_path(ns);
            let (data_hash, row_count) = if self.storage.exists(&path).await? {
                let bytes = self.storage.read(&path).await?;
                let reader = crate::columnar::ColumnarReader::open(
                    Arc::clone(&self.storage),
                    path.clone(),
                )
                .await?;
                (
                    blake3::hash(&bytes).to_hex().to_string(),
                    reader.footer().total_rows(),
                )
            } else {
                (String::new(), 0)
            };

            state.collections.insert(
                ns.clone(),
                CollectionState {
                    data_hash,
                    schema_hash: schemas.get(ns).map(|schema| schema.hash()).unwrap_or_default(),
                    row_count,
                },
            );

            let (segment_id, offset) = self.wal.position(ns).await?;
            state.namespace_positions.insert(ns.clone(), offset);
            if offset >= top_position.1 {
                top_position = (segment_id, offset);
            }
        }
        state.event_log_position = EventLogPosition {
            segment_id: top_position.0,
            offset: top_position.1,
        };

        let head_commit = self.refs.resolve_ref("HEAD").await?;
        let parents = head_commit.clone().into_iter().collect();
        let snapshot =
            SchemaSnapshot::capture(&schemas.values().cloned().collect::<Vec<_>>(), Utc::now())?;

        let commit = self
            .commits
            .create_commit_with_schema(
                state,
                snapshot,
                CommitMeta {
                    message: message.to_string(),
                    author: Some(author.to_string()),
                    parents,
                    timestamp: None,
                },
            )
            .await?;

        match self.refs.get_head().await? {
            HeadState::Branch(branch) => {
                self.refs.update_ref(&branch, &commit.hash).await?;
            }
            HeadState::Detached(_) => {
                self.refs.detach_head(&commit.hash).await?;
            }
        }
        Ok(commit)
    }

    /// Creates a branch at the current HEAD commit.
    pub async fn branch(&self, name: &str) -> Result<(), ParqueError> {
        let Some(head) = self.refs.resolve_ref("HEAD").await? else {
            return Err(ParqueError::invariant("cannot branch before the first commit"));
        };
        self.refs.update_ref(name, &head).await
    }

    pub async fn checkout(&self, branch: &str) -> Result<(), ParqueError> {
        if self.refs.resolve_ref(branch).await?.is_none() {
            return Err(ParqueError::not_found(format!("branch {branch}")));
        }
        self.refs.set_head(branch).await
    }

    pub async fn merge_branches(
        &self,
        source: &str,
        target: &str,
        options: &MergeOptions,
    ) -> Result<MergePlan, ParqueError> {
        self.merge.merge_branches(source, target, options).await
    }

    pub async fn attach_subscriber(
        &self,
        writer: Arc<dyn SubscriptionWriter>,
    ) -> String {
        self.subs.add_connection(writer).await
    }
}
