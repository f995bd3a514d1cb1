//! Unified error type for danmaku enrichment.
//!
//! Provider clients, the download guard and the host collaborators all
//! funnel their failures into [`Error`]. The dispatcher never matches on
//! concrete variants to decide control flow; it asks the error how it should
//! be handled through [`Error::stops_provider_loop`],
//! [`Error::is_recoverable`] and [`Error::is_fatal_to_entity`].

use std::fmt;

/// Unified error type covering all failure modes in danmu-sync.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity or remote resource could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of thing looked up (e.g. "entity", "season").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The remote service signalled rate limiting or risk control.
    #[error("Throttled by provider [{provider}]")]
    Throttled {
        /// Name of the provider that throttled us.
        provider: String,
    },

    /// A provider returned nothing usable (no stream, or a stream too small
    /// to be plausible).
    #[error("Empty result from [{provider}]: {reason}")]
    EmptyResult {
        /// Name of the provider.
        provider: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The entity lacks a field required to process it.
    #[error("Entity {entity} is missing required field `{field}`")]
    MissingField {
        /// Identifier of the entity.
        entity: String,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A network request failed or returned an unexpected status.
    #[error("HTTP error [{provider}]: {message}")]
    Http {
        /// Name of the provider.
        provider: String,
        /// Human-readable error description.
        message: String,
    },

    /// A provider response could not be decoded.
    #[error("Parse error [{provider}]: {message}")]
    Parse {
        /// Name of the provider.
        provider: String,
        /// Human-readable error description.
        message: String,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Configuration is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// Work was abandoned because shutdown was requested.
    #[error("Operation cancelled")]
    Cancelled,

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error must abort the whole provider loop for the current
    /// entity instead of falling back to the next provider.
    pub fn stops_provider_loop(&self) -> bool {
        matches!(self, Error::Throttled { .. } | Error::Cancelled)
    }

    /// Whether the next provider should be tried after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::EmptyResult { .. }
                | Error::NotFound { .. }
                | Error::Http { .. }
                | Error::Parse { .. }
        )
    }

    /// Whether the entity itself cannot be processed.
    pub fn is_fatal_to_entity(&self) -> bool {
        matches!(self, Error::MissingField { .. })
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Throttled`].
    pub fn throttled(provider: impl Into<String>) -> Self {
        Error::Throttled {
            provider: provider.into(),
        }
    }

    /// Convenience constructor for [`Error::EmptyResult`].
    pub fn empty(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::EmptyResult {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`Error::MissingField`].
    pub fn missing_field(entity: impl fmt::Display, field: &'static str) -> Self {
        Error::MissingField {
            entity: entity.to_string(),
            field,
        }
    }

    /// Convenience constructor for [`Error::Http`].
    pub fn http(provider: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Http {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Parse`].
    pub fn parse(provider: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Parse {
            provider: provider.into(),
            message: message.to_string(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
