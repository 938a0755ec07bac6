mod support;

use std::sync::Arc;

use parquedb_engine::{
    EvalScores, EvalScoresOptions, GetOptions, HeadState, MergeOptions, MvOptions, ScoreDimension,
    TailMode,
};
use serde_json::json;

/// Create, update, delete: system fields are stamped, versions move, and
/// the event log records one event per mutation in order.
#[tokio::test]
async fn mutations_stamp_system_fields_and_log_events() {
    let (_, db) = support::open_db();

    let created = db
        .create("posts", "p1", json!({"title": "hello"}), "alice")
        .await
        .unwrap();
    assert_eq!(created["$id"], json!("posts/p1"));
    assert_eq!(created["version"], json!(1));
    assert_eq!(created["createdBy"], json!("alice"));

    let updated = db
        .update("posts", "p1", &json!({"$set": {"title": "hello again"}}), "bob")
        .await
        .unwrap();
    assert_eq!(updated["version"], json!(2));
    assert_eq!(updated["updatedBy"], json!("bob"));
    assert_eq!(updated["createdBy"], json!("alice"));

    assert!(db.delete("posts", "p1", "bob").await.unwrap());
    // Deleting an already-gone entity is not an error.
    assert!(!db.delete("posts", "p1", "bob").await.unwrap());

    let events = db.wal().read_from("posts", 1).await.unwrap();
    let ops: Vec<&str> = events.iter().map(|event| event.op.as_str()).collect();
    assert_eq!(ops, vec!["CREATE", "UPDATE", "DELETE"]);
    assert_eq!(
        events.iter().map(|event| event.seq).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn duplicate_create_conflicts() {
    let (_, db) = support::open_db();
    db.create("posts", "p1", json!({}), "alice").await.unwrap();
    let error = db.create("posts", "p1", json!({}), "alice").await.unwrap_err();
    assert!(matches!(error, parquedb_engine::ParqueError::Conflict(_)));
}

#[tokio::test]
async fn commits_snapshot_state_and_advance_the_branch() {
    let (_, db) = support::open_db();
    support::seed_posts(&db, 4).await;

    let first = db.commit("initial posts", "alice").await.unwrap();
    assert!(first.parents.is_empty());
    assert_eq!(first.state.collections["posts"].row_count, 4);
    assert!(!first.state.collections["posts"].data_hash.is_empty());
    assert_eq!(first.state.namespace_positions["posts"], 4);
    assert!(first.state.schema.is_some());

    assert_eq!(
        db.refs().resolve_ref("main").await.unwrap(),
        Some(first.hash.clone())
    );
    assert_eq!(
        db.refs().get_head().await.unwrap(),
        HeadState::Branch("main".to_string())
    );

    db.create("posts", "p9999", json!({"title": "late"}), "alice")
        .await
        .unwrap();
    let second = db.commit("one more", "alice").await.unwrap();
    assert_eq!(second.parents, vec![first.hash.clone()]);
    assert_eq!(second.state.collections["posts"].row_count, 5);
    assert_ne!(
        second.state.collections["posts"].data_hash,
        first.state.collections["posts"].data_hash
    );
}

#[tokio::test]
async fn branch_merge_composes_disjoint_counters() {
    let (_, db) = support::open_db();
    db.create("posts", "p1", json!({"views": 0, "likes": 0}), "alice")
        .await
        .unwrap();
    db.commit("base", "alice").await.unwrap();
    db.branch("feature").await.unwrap();

    // Divergence: likes bumped on the feature branch, views on main.
    db.checkout("feature").await.unwrap();
    db.update("posts", "p1", &json!({"$inc": {"likes": 5}}), "alice")
        .await
        .unwrap();
    db.commit("likes", "alice").await.unwrap();

    db.checkout("main").await.unwrap();
    let plan = db
        .merge_branches("feature", "main", &MergeOptions::default())
        .await
        .unwrap();

    assert!(plan.success);
    assert!(plan.merge_commit.is_some());
    let posts_merge = &plan.namespaces["posts"];
    assert!(posts_merge.conflicts.is_empty());
    assert_eq!(posts_merge.stats.from_theirs, 1);

    let merged_hash = db.refs().resolve_ref("main").await.unwrap().unwrap();
    let merged = db.commits().read_commit(&merged_hash).await.unwrap();
    assert_eq!(merged.parents.len(), 2);
}

#[tokio::test]
async fn dry_run_merge_leaves_refs_untouched() {
    let (_, db) = support::open_db();
    db.create("posts", "p1", json!({"views": 0}), "alice").await.unwrap();
    db.commit("base", "alice").await.unwrap();
    db.branch("feature").await.unwrap();
    let main_before = db.refs().resolve_ref("main").await.unwrap();

    let plan = db
        .merge_branches(
            "feature",
            "main",
            &MergeOptions {
                dry_run: true,
                ..MergeOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(plan.success);
    assert!(plan.merge_commit.is_none());
    assert_eq!(db.refs().resolve_ref("main").await.unwrap(), main_before);
}

#[tokio::test]
async fn materialized_views_follow_db_writes() {
    let (_, db) = support::open_db();
    let scores = Arc::new(EvalScores::new(EvalScoresOptions::default()));
    db.mv().register(scores.clone(), MvOptions::default());
    db.mv().start();

    db.create(
        "scores",
        "s1",
        json!({"runId": "r1", "suiteName": "suite", "scorerName": "accuracy", "score": 0.8}),
        "evals",
    )
    .await
    .unwrap();
    db.create(
        "scores",
        "s2",
        json!({"runId": "r1", "suiteName": "suite", "scorerName": "accuracy", "score": 0.6}),
        "evals",
    )
    .await
    .unwrap();

    let stats = scores.stats(ScoreDimension::Scorer, "accuracy").unwrap();
    assert_eq!(stats.count, 2);
    assert!((stats.average - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn wal_tail_follows_new_mutations() {
    let (_, db) = support::open_db();
    db.create("posts", "p1", json!({}), "alice").await.unwrap();

    let mut tail = db.wal().tail("posts", 1, TailMode::ToEnd);
    let first = tail.next().await.unwrap().unwrap();
    assert_eq!(first.target, "posts:p1");
    assert!(tail.next().await.unwrap().is_none());
}

#[tokio::test]
async fn schema_validation_guards_writes() {
    use parquedb_engine::{CollectionSchema, FieldDef, FieldType};

    let (_, db) = support::open_db();
    db.register_schema(
        CollectionSchema::new("posts")
            .with_field("title", FieldDef::of(FieldType::String).required()),
    );

    assert!(db.create("posts", "ok", json!({"title": "fine"}), "alice").await.is_ok());
    let error = db
        .create("posts", "bad", json!({"nope": 1}), "alice")
        .await
        .unwrap_err();
    assert!(matches!(error, parquedb_engine::ParqueError::Invariant(_)));

    let error = db
        .update("posts", "ok", &json!({"$unset": {"title": ""}}), "alice")
        .await
        .unwrap_err();
    assert!(matches!(error, parquedb_engine::ParqueError::Invariant(_)));

    let _ = db
        .get("posts", "ok", &GetOptions::default())
        .await
        .unwrap()
        .expect("still present");
}
