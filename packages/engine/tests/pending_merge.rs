mod support;

use std::sync::Arc;

use parquedb_engine::{ColumnarReader, MemoryBackend, PendingStore, StagedRow, StorageBackend};
use serde_json::json;

fn staged(ns: &str, local: &str, n: i64) -> StagedRow {
    StagedRow {
        id: format!("{ns}/{local}"),
        doc: Some(json!({
            "$id": format!("{ns}/{local}"),
            "$type": ns,
            "n": n,
        })),
    }
}

/// Two pending files of 5 and 7 entities merge into a 12-row collection
/// file; the staged files disappear and a second flush is a no-op.
#[tokio::test]
async fn pending_merge_consumes_staged_batches() {
    let storage = Arc::new(MemoryBackend::new());
    let store = PendingStore::new(storage.clone());

    let first: Vec<StagedRow> = (0..5).map(|i| staged("posts", &format!("a{i}"), i)).collect();
    let second: Vec<StagedRow> = (0..7).map(|i| staged("posts", &format!("b{i}"), i)).collect();
    store.stage_batch("posts", &first, 1, 5).await.unwrap();
    store.stage_batch("posts", &second, 6, 12).await.unwrap();

    let staged_files = storage.list("data/posts/pending/").await.unwrap();
    assert_eq!(staged_files.len(), 2);

    let merged = store.flush_pending_to_committed("posts").await.unwrap();
    assert_eq!(merged, 12);

    assert!(storage.exists("data/posts/data.parquet").await.unwrap());
    let reader = ColumnarReader::open(storage.clone(), "data/posts/data.parquet")
        .await
        .unwrap();
    assert_eq!(reader.footer().total_rows(), 12);

    assert!(storage.list("data/posts/pending/").await.unwrap().is_empty());
    assert_eq!(store.flush_pending_to_committed("posts").await.unwrap(), 0);
}

#[tokio::test]
async fn merges_for_different_namespaces_are_independent() {
    let storage = Arc::new(MemoryBackend::new());
    let store = Arc::new(PendingStore::new(storage.clone()));

    store
        .stage_batch("posts", &[staged("posts", "x", 1)], 1, 1)
        .await
        .unwrap();
    store
        .stage_batch("users", &[staged("users", "y", 2)], 1, 1)
        .await
        .unwrap();

    let posts = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.flush_pending_to_committed("posts").await })
    };
    let users = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.flush_pending_to_committed("users").await })
    };

    assert_eq!(posts.await.unwrap().unwrap(), 1);
    assert_eq!(users.await.unwrap().unwrap(), 1);
    assert!(storage.exists("data/posts/data.parquet").await.unwrap());
    assert!(storage.exists("data/users/data.parquet").await.unwrap());
}

/// The write path stages every mutation; a merge folds creates, updates,
/// and deletes into the collection file with later-wins semantics.
#[tokio::test]
async fn full_write_path_merges_into_collection_file() {
    let (storage, db) = support::open_db();
    support::seed_posts(&db, 3).await;
    db.update("posts", "p0001", &json!({"$set": {"status": "archived"}}), "editor")
        .await
        .unwrap();
    db.delete("posts", "p0002", "editor").await.unwrap();

    db.pending().flush_pending_to_committed("posts").await.unwrap();

    let reader = ColumnarReader::open(storage.clone(), "data/posts/data.parquet")
        .await
        .unwrap();
    assert_eq!(reader.footer().total_rows(), 2);

    let archived = db
        .count("posts", Some(&json!({"status": "archived"})))
        .await
        .unwrap();
    assert_eq!(archived, 1);
    assert!(db
        .get("posts", "p0002", &parquedb_engine::GetOptions::default())
        .await
        .unwrap()
        .is_none());
}
