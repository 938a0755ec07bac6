use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ParqueError;

/// System fields stamped onto every entity projection.
pub const FIELD_ID: &str = "$id";
pub const FIELD_TYPE: &str = "$type";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_CREATED_BY: &str = "createdBy";
pub const FIELD_UPDATED_AT: &str = "updatedAt";
pub const FIELD_UPDATED_BY: &str = "updatedBy";
pub const FIELD_VERSION: &str = "version";

/// A globally unique entity address: `namespace/local_id`.
///
/// Event targets use the colon form `namespace:local_id`; both forms parse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub ns: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(ns: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            id: id.into(),
        }
    }

    /// Parses `ns/local` or `ns:local`. The local id may itself contain the
    /// separator; only the first occurrence splits.
    pub fn parse(raw: &str) -> Result<Self, ParqueError> {
        let split = raw
            .find('/')
            .or_else(|| raw.find(':'))
            .ok_or_else(|| ParqueError::invariant(format!("entity ref without separator: {raw}")))?;
        let (ns, rest) = raw.split_at(split);
        let id = &rest[1..];
        if ns.is_empty() || id.is_empty() {
            return Err(ParqueError::invariant(format!(
                "entity ref with empty segment: {raw}"
            )));
        }
        Ok(Self::new(ns, id))
    }

    /// `ns/local` — the stable addressable form.
    pub fn full_id(&self) -> String {
        format!("{}/{}", self.ns, self.id)
    }

    /// `ns:local` — the event target form.
    pub fn target(&self) -> String {
        format!("{}:{}", self.ns, self.id)
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ns, self.id)
    }
}

/// Strips a `ns/` prefix off a caller-supplied id. Callers may pass raw
/// local ids or fully namespaced ids interchangeably.
pub fn strip_ns_prefix<'a>(id: &'a str, ns: &str) -> &'a str {
    id.strip_prefix(ns)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(id)
}

/// Pluralizes a type name into its namespace (`Post` -> `posts`).
pub fn pluralize_type(type_name: &str) -> String {
    let lower = type_name.to_ascii_lowercase();
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem
            .chars()
            .last()
            .is_some_and(|c| !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'))
        {
            format!("{stem}ies")
        } else {
            format!("{lower}s")
        }
    } else {
        format!("{lower}s")
    }
}

/// Cooperative cancellation signal. Cloning shares the flag; long-running
/// operations check it between suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
