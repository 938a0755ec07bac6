use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{AuthErrorKind, ParqueError};

/// Scope granting every permission.
pub const ADMIN_SCOPE: &str = "admin";

/// Authenticated caller context produced by the authenticator
/// collaborator and consumed here for scope checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonValue>,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|granted| granted == scope || granted == ADMIN_SCOPE)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Scope check as an error: `ExpiredToken` / `InsufficientScope`.
    pub fn require_scope(&self, scope: &str, now: DateTime<Utc>) -> Result<(), ParqueError> {
        if self.is_expired(now) {
            return Err(ParqueError::auth(
                AuthErrorKind::ExpiredToken,
                format!("token for {} expired", self.client_id),
            ));
        }
        if !self.has_scope(scope) {
            return Err(ParqueError::auth(
                AuthErrorKind::InsufficientScope,
                format!("scope '{scope}' required"),
            ));
        }
        Ok(())
    }
}
