use std::sync::Arc;

use parquedb_engine::{MemoryBackend, ParqueDb, ParqueDbOptions};
use serde_json::{json, Value as JsonValue};

pub fn open_db() -> (Arc<MemoryBackend>, Arc<ParqueDb>) {
    let storage = Arc::new(MemoryBackend::new());
    let db = ParqueDb::open(storage.clone(), ParqueDbOptions::default());
    (storage, db)
}

pub fn post_doc(title: &str, status: &str, views: i64) -> JsonValue {
    json!({
        "title": title,
        "status": status,
        "views": views,
    })
}

#[allow(dead_code)]
pub async fn seed_posts_range(db: &ParqueDb, from: usize, to: usize) {
    let docs: Vec<(String, JsonValue)> = (from..to)
        .map(|i| {
            (
                format!("p{i:04}"),
                post_doc(&format!("post {i}"), if i % 2 == 0 { "published" } else { "draft" }, i as i64),
            )
        })
        .collect();
    db.create_many("posts", docs, "seeder").await.expect("seed posts");
}

#[allow(dead_code)]
pub async fn seed_posts(db: &ParqueDb, count: usize) {
    let docs: Vec<(String, JsonValue)> = (0..count)
        .map(|i| {
            (
                format!("p{i:04}"),
                post_doc(&format!("post {i}"), if i % 2 == 0 { "published" } else { "draft" }, i as i64),
            )
        })
        .collect();
    db.create_many("posts", docs, "seeder").await.expect("seed posts");
}
