use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::{hex_digest, CollectionSchema};
use crate::ParqueError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCollection {
    pub name: String,
    pub hash: String,
    pub version: u32,
    pub schema: CollectionSchema,
}

/// Content-addressed snapshot of every collection schema at a point in
/// time. `commit_hash` is backfilled when the snapshot is embedded in a
/// commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub hash: String,
    pub config_hash: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub collections: BTreeMap<String, SnapshotCollection>,
}

impl SchemaSnapshot {
    pub fn capture(
        schemas: &[CollectionSchema],
        captured_at: DateTime<Utc>,
    ) -> Result<Self, ParqueError> {
        let mut collections = BTreeMap::new();
        for schema in schemas {
            collections.insert(
                schema.name.clone(),
                SnapshotCollection {
                    name: schema.name.clone(),
                    hash: schema.hash(),
                    version: schema.version,
                    schema: schema.clone(),
                },
            );
        }

        let canonical = serde_json::to_vec(&collections)?;
        let hash = hex_digest(&canonical);
        let config_hash = hex_digest(format!("config:{hash}").as_bytes());
        Ok(Self {
            hash,
            config_hash,
            captured_at,
            commit_hash: None,
            collections,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaChangeKind {
    AddCollection,
    DropCollection,
    AddField,
    RemoveField,
    ChangeType,
    AddIndex,
    RemoveIndex,
    ChangeRequired,
    ChangeArray,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    #[serde(rename = "type")]
    pub kind: SchemaChangeKind,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub breaking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub changes: Vec<SchemaChange>,
    pub breaking_changes: Vec<SchemaChange>,
    pub compatible: bool,
    pub summary: String,
}

/// Structural diff between two snapshots. Breaking: dropped collections,
/// removed fields, type changes, and newly required fields.
pub fn diff_schemas(a: &SchemaSnapshot, b: &SchemaSnapshot) -> SchemaDiff {
    let mut changes: Vec<SchemaChange> = Vec::new();

    for (name, _) in b.collections.iter() {
        if !a.collections.contains_key(name) {
            changes.push(change(SchemaChangeKind::AddCollection, name, None, false));
        }
    }
    for (name, _) in a.collections.iter() {
        if !b.collections.contains_key(name) {
            changes.push(change(SchemaChangeKind::DropCollection, name, None, true));
        }
    }

    for (name, before) in a.collections.iter() {
        let Some(after) = b.collections.get(name) else {
            continue;
        };
        diff_collection(name, &before.schema, &after.schema, &mut changes);
    }

    let breaking_changes: Vec<SchemaChange> = changes
        .iter()
        .filter(|change| change.breaking)
        .cloned()
        .collect();
    let compatible = breaking_changes.is_empty();
    let summary = format!(
        "{} change(s), {} breaking",
        changes.len(),
        breaking_changes.len()
    );

    SchemaDiff {
        changes,
        breaking_changes,
        compatible,
        summary,
    }
}

fn diff_collection(
    collection: &str,
    before: &CollectionSchema,
    after: &CollectionSchema,
    changes: &mut Vec<SchemaChange>,
) {
    for (field, def) in after.fields.iter() {
        if !before.fields.contains_key(field) {
            // Adding a required field breaks existing documents.
            changes.push(change(
                SchemaChangeKind::AddField,
                collection,
                Some(field),
                def.required,
            ));
        }
    }

    for (field, before_def) in before.fields.iter() {
        let Some(after_def) = after.fields.get(field) else {
            changes.push(change(
                SchemaChangeKind::RemoveField,
                collection,
                Some(field),
                true,
            ));
            continue;
        };

        if before_def.field_type != after_def.field_type {
            changes.push(change(
                SchemaChangeKind::ChangeType,
                collection,
                Some(field),
                true,
            ));
        }
        if before_def.indexed != after_def.indexed {
            let kind = if after_def.indexed {
                SchemaChangeKind::AddIndex
            } else {
                SchemaChangeKind::RemoveIndex
            };
            changes.push(change(kind, collection, Some(field), false));
        }
        if before_def.required != after_def.required {
            changes.push(change(
                SchemaChangeKind::ChangeRequired,
                collection,
                Some(field),
                after_def.required,
            ));
        }
        if before_def.array != after_def.array {
            changes.push(change(
                SchemaChangeKind::ChangeArray,
                collection,
                Some(field),
                true,
            ));
        }
    }
}

fn change(
    kind: SchemaChangeKind,
    collection: &str,
    field: Option<&str>,
    breaking: bool,
) -> SchemaChange {
    SchemaChange {
        kind,
        collection: collection.to_string(),
        field: field.map(str::to_string),
        breaking,
    }
}

#[cfg(test)]
mod tests {
    use super::{diff_schemas, SchemaChangeKind, SchemaSnapshot};
    use crate::schema::{CollectionSchema, FieldDef, FieldType};
    use chrono::{TimeZone, Utc};

    fn snapshot(schemas: &[CollectionSchema]) -> SchemaSnapshot {
        SchemaSnapshot::capture(schemas, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
            .unwrap()
    }

    #[test]
    fn removing_a_field_is_breaking() {
        let before = snapshot(&[CollectionSchema::new("User")
            .with_field("age", FieldDef::of(FieldType::Number))]);
        let after = snapshot(&[CollectionSchema::new("User")]);

        let diff = diff_schemas(&before, &after);
        assert!(!diff.compatible);
        assert_eq!(diff.breaking_changes.len(), 1);
        assert_eq!(diff.breaking_changes[0].kind, SchemaChangeKind::RemoveField);
        assert_eq!(diff.breaking_changes[0].collection, "User");
        assert_eq!(diff.breaking_changes[0].field.as_deref(), Some("age"));
    }

    #[test]
    fn adding_an_optional_field_is_compatible() {
        let before = snapshot(&[CollectionSchema::new("User")]);
        let after = snapshot(&[
            CollectionSchema::new("User").with_field("bio", FieldDef::of(FieldType::String))
        ]);

        let diff = diff_schemas(&before, &after);
        assert!(diff.compatible);
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].kind, SchemaChangeKind::AddField);
    }

    #[test]
    fn adding_a_required_field_is_breaking() {
        let before = snapshot(&[CollectionSchema::new("User")]);
        let after = snapshot(&[CollectionSchema::new("User")
            .with_field("email", FieldDef::of(FieldType::String).required())]);

        let diff = diff_schemas(&before, &after);
        assert!(!diff.compatible);
    }

    #[test]
    fn index_changes_are_compatible() {
        let before = snapshot(&[CollectionSchema::new("User")
            .with_field("name", FieldDef::of(FieldType::String))]);
        let after = snapshot(&[CollectionSchema::new("User")
            .with_field("name", FieldDef::of(FieldType::String).indexed())]);

        let diff = diff_schemas(&before, &after);
        assert!(diff.compatible);
        assert_eq!(diff.changes[0].kind, SchemaChangeKind::AddIndex);
    }

    #[test]
    fn type_change_and_collection_drop_are_breaking() {
        let before = snapshot(&[
            CollectionSchema::new("User").with_field("age", FieldDef::of(FieldType::Number)),
            CollectionSchema::new("Audit"),
        ]);
        let after = snapshot(&[
            CollectionSchema::new("User").with_field("age", FieldDef::of(FieldType::String))
        ]);

        let diff = diff_schemas(&before, &after);
        let kinds: Vec<SchemaChangeKind> =
            diff.breaking_changes.iter().map(|change| change.kind).collect();
        assert!(kinds.contains(&SchemaChangeKind::ChangeType));
        assert!(kinds.contains(&SchemaChangeKind::DropCollection));
    }
}
