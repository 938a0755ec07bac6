use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::types::EntityRef;
use crate::ParqueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

impl EventOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// One durable mutation record. Sequences are monotonic per namespace and
/// assigned at append time; global order is only `(ts, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub op: EventOp,
    /// `ns:local_id`
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<JsonValue>,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl Event {
    pub fn entity_ref(&self) -> Result<EntityRef, ParqueError> {
        EntityRef::parse(&self.target)
    }

    /// The state slot a subscription filter evaluates against: `after` for
    /// creates/updates, `before` for deletes.
    pub fn filter_state(&self) -> Option<&JsonValue> {
        match self.op {
            EventOp::Create | EventOp::Update => self.after.as_ref(),
            EventOp::Delete => self.before.as_ref(),
        }
    }
}
