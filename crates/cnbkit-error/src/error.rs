use crate::id::{generate_error_id, ErrorId};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

type SharedSource = Arc<dyn StdError + Send + Sync + 'static>;

/// A structured, attributable build failure.
///
/// `error_type` and `status` always hold the same value; both are kept
/// because consumers of the builder output read both JSON fields. The
/// source chain is never serialized but stays reachable through
/// [`std::error::Error::source`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildError {
    #[serde(rename = "buildpackId", default)]
    pub buildpack_id: String,
    #[serde(rename = "buildpackVersion", default)]
    pub buildpack_version: String,
    #[serde(rename = "errorType", default)]
    pub error_type: Status,
    #[serde(rename = "canonicalCode", default)]
    pub status: Status,
    #[serde(rename = "errorId", default)]
    pub id: ErrorId,
    #[serde(rename = "errorMessage", default)]
    pub message: String,
    #[serde(skip)]
    source: Option<SharedSource>,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(error ID: {}):\n{}", self.id, self.message)
    }
}

// The shared pointer is not itself the cause: expose the error inside it.
impl StdError for BuildError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl BuildError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            buildpack_id: String::new(),
            buildpack_version: String::new(),
            error_type: status,
            status,
            id: generate_error_id([message.as_str()]),
            message,
            source: None,
        }
    }

    /// Platform-attributed error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Status::Internal, message)
    }

    /// User-attributed error with the default user status.
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(Status::Unknown, message)
    }

    /// Wrap `source` under `context`, rendering the message as `"{context}: {source}"`.
    ///
    /// The ID is derived from the rendered message, so a wrapped
    /// [`BuildError`] contributes its own `(error ID: ..)` text to the outer ID.
    pub fn wrap<E>(status: Status, context: impl fmt::Display, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let mut err = Self::new(status, format!("{context}: {source}"));
        err.source = Some(Arc::new(source));
        err
    }

    /// Attach a cause without changing the message or ID.
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: ErrorId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_buildpack(mut self, id: &str, version: &str) -> Self {
        id.clone_into(&mut self.buildpack_id);
        version.clone_into(&mut self.buildpack_version);
        self
    }

    /// Replace the status, keeping `error_type` in sync.
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self.error_type = status;
        self
    }

    pub fn is_user_attributed(&self) -> bool {
        self.status.is_user_attributed()
    }

    pub fn is_internal(&self) -> bool {
        self.status == Status::Internal
    }
}

impl PartialEq for BuildError {
    fn eq(&self, other: &Self) -> bool {
        self.buildpack_id == other.buildpack_id
            && self.buildpack_version == other.buildpack_version
            && self.error_type == other.error_type
            && self.status == other.status
            && self.id == other.id
            && self.message == other.message
    }
}

impl From<std::io::Error> for BuildError {
    fn from(e: std::io::Error) -> Self {
        Self::wrap(Status::Internal, "I/O error", e)
    }
}
