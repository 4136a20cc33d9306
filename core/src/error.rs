//! Error taxonomy shared by both client layers.
//!
//! # Design
//! Remote failures are classified from the HTTP response status and body
//! (see `session`); everything else is raised locally with a dedicated
//! variant so callers can match on exactly the failure they care about.
//! Codec and cache failures keep their own small types and convert in.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// 400 with a structured body flagged as a user-facing validation error.
    #[error("{message}")]
    User {
        message: String,
        code: Option<String>,
        description: Option<String>,
    },

    /// The server returned 401.
    #[error("authentication failed: {message}")]
    Authentication { message: String, status: u16 },

    /// Any other 4xx.
    #[error("client error ({status}): {message}")]
    Client { message: String, status: u16 },

    /// 5xx, with the incident id from the `X-Sentry-ID` header when present.
    #[error("server error ({status}): {message}")]
    Server {
        message: String,
        status: u16,
        incident_id: Option<String>,
    },

    /// Connection-level failure before any status was received.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// `one()` matched no rows, or a required row vanished remotely.
    #[error("no result found")]
    NoResultFound,

    /// `one()` matched more than one row.
    #[error("multiple results found")]
    MultipleResultsFound,

    /// A typed setter rejected a value for a declared field.
    #[error("invalid value for field '{field}': expected {expected}, got {got}")]
    InvalidFieldValue {
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    /// Field name not declared on the schema.
    #[error("unknown field '{field}' on '{entity}'")]
    UnknownField { entity: String, field: String },

    /// Entity type not registered with the registry.
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    /// Entity type registered twice with the same registry.
    #[error("entity type '{0}' is already registered")]
    DuplicateEntityType(String),

    /// Schema builder finished without the pieces it needs.
    #[error("schema definition error: {0}")]
    SchemaDefinition(String),

    /// Operation requires a saved record (an id).
    #[error("record has no id: {0}")]
    UnsavedRecord(&'static str),

    /// Reserved surface with no implementation yet.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl Error {
    /// Incident id for server-side failures, when the vendor reported one.
    pub fn incident_id(&self) -> Option<&str> {
        match self {
            Error::Server { incident_id, .. } => incident_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }
}

/// Failures in the typed JSON codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A decoder for this `__class__` kind is already registered.
    #[error("codec kind '{0}' is already registered")]
    DuplicateKind(String),

    /// An envelope carried a recognized kind but invalid contents.
    #[error("malformed '{kind}' envelope: {reason}")]
    MalformedEnvelope { kind: String, reason: String },

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    pub(crate) fn malformed(kind: &str, reason: impl Into<String>) -> Self {
        CodecError::MalformedEnvelope {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure raised by a cache backend.
#[derive(Debug, Error)]
#[error("cache backend error: {0}")]
pub struct CacheError(pub String);
