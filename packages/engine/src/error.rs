use thiserror::Error;

/// Auth failures reported by the authenticator collaborator. Carried as a
/// distinct kind so transports can map them to their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    MissingToken,
    InvalidToken,
    ExpiredToken,
    InsufficientScope,
    ServerError,
}

impl AuthErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
            Self::ExpiredToken => "expired_token",
            Self::InsufficientScope => "insufficient_scope",
            Self::ServerError => "server_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ParqueError {
    /// Entity, file, commit, or ref absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate unique key, conflicting update operators, duplicate
    /// subscription.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A documented invariant was violated by the caller or by stored data.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Operation cancelled by the caller.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Transient storage or backend failure; retryable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Data corruption, unparseable footer, unrecoverable state.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("auth failure ({}): {message}", .kind.as_str())]
    Auth {
        kind: AuthErrorKind,
        message: String,
    },
}

impl ParqueError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn invariant(what: impl Into<String>) -> Self {
        Self::Invariant(what.into())
    }

    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled(what.into())
    }

    pub fn unavailable(what: impl Into<String>) -> Self {
        Self::Unavailable(what.into())
    }

    pub fn fatal(what: impl Into<String>) -> Self {
        Self::Fatal(what.into())
    }

    pub fn auth(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self::Auth {
            kind,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<std::io::Error> for ParqueError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(error.to_string()),
            _ => Self::Unavailable(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for ParqueError {
    fn from(error: serde_json::Error) -> Self {
        Self::Fatal(format!("json: {error}"))
    }
}
