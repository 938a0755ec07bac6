mod auth;
mod columnar;
mod commit;
mod db;
mod error;
mod event;
mod filter;
mod merge;
mod mv;
mod pending;
mod query;
mod rels;
mod schema;
mod storage;
mod subscribe;
mod types;
mod wal;

pub use auth::{AuthContext, ADMIN_SCOPE};
pub use columnar::{
    scan, write_columnar, ColumnChunkMeta, ColumnDef, ColumnStats, ColumnType, ColumnarReader,
    Compression, FileSchema, Footer, RowGroupMeta, Scan, ScanOptions, ScanStats, SortKey,
    SortOrder, WriteOptions, FOOTER_MAGIC,
};
pub use commit::{
    commit_path, diff_schemas, Commit, CommitMeta, CommitState, CommitStore, CollectionState,
    EventLogPosition, HeadState, RefStore, RelationshipsState, SchemaChange, SchemaChangeKind,
    SchemaDiff, SchemaSnapshot, SnapshotCollection,
};
pub use db::{ParqueDb, ParqueDbOptions};
pub use error::{AuthErrorKind, ParqueError};
pub use event::{Event, EventOp};
pub use filter::{
    apply_update, get_path, matches_filter, parse_update, remove_path, set_path, validate_update,
    BitOpKind, CurrentDateKind, PopDirection, PushSpec, UpdateContext, UpdateOp, UpdateSpec,
};
pub use merge::{
    find_common_ancestor, merge_events, AncestorResult, EventMergeResult, MergeConflict,
    MergeEngine, MergeOptions, MergePlan, MergeStats, MergeStrategy,
};
pub use mv::{
    percentile, BucketSummary, EvalScores, EvalScoresOptions, GroupBy, MvEngine, MvEngineStats,
    MvHandler, MvOptions, RefreshMode, RequestBuffer, RequestBufferOptions, RequestRecord,
    ScoreDimension, ScoreRecord, ScoreStats, TimeBucket, WorkerRequests, WorkerRequestsOptions,
};
pub use pending::{data_file_path, pending_dir, PendingBatch, PendingStore, StagedRow};
pub use query::{
    FindOptions, FindResult, GetOptions, QueryEngine, RegionReader, StoreFetcher,
};
pub use rels::{
    extract_metadata, merge_shredded, validate_match_quality, BatchLoader, BatchLoaderOptions,
    Edge, EdgeDraft, MatchMode, Page, RelFileHashes, RelQuery, RelatedEntity, RelatedFetcher,
    RelationshipStore, ShreddedMetadata, FORWARD_PATH, REVERSE_PATH,
};
pub use schema::{CollectionOptions, CollectionSchema, FieldDef, FieldType, RelationshipDef};
pub use storage::{
    LocalBackend, MemoryBackend, ReadStreamOptions, StorageBackend, StorageChunkReader,
    StorageChunkWriter, StorageStat,
};
pub use subscribe::{
    sse_frame, ws_frame, AckStatus, BufferWriter, ChangePayload, ClientMessage, ResumeRequest,
    ResumeResult, ServerMessage, SubOp, SubscribeRequest, SubscriptionManager,
    SubscriptionManagerOptions, SubscriptionStats, SubscriptionWriter,
};
pub use types::{pluralize_type, strip_ns_prefix, CancelToken, EntityRef};
pub use wal::{
    decode_batch, encode_batch, is_compressed, EventLog, EventLogOptions, SegmentMeta, TailHandle,
    TailMode, TailReader, GZIP_MAGIC,
};
