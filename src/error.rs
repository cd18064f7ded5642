//! Error types for fedistry
//!
//! Failures split into two public types: `RouterError` for everything that
//! goes wrong while wiring the registry (duplicate routes, bad templates,
//! missing dispatchers) and `FederationError` for everything that goes
//! wrong while serving requests or delivering activities.

use http::StatusCode;
use thiserror::Error;

/// Registration-time and URL-building errors
///
/// Raised by `Router::add`, the `Federation::set_*` registration methods,
/// and the `Context` URL builders. These are caller bugs, not runtime
/// conditions, so they are cheap, cloneable values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// A route with the same name was already added
    #[error("duplicate route name: {0:?}")]
    DuplicateName(String),

    /// The URI template could not be parsed
    #[error("malformed route template {template:?}: {reason}")]
    MalformedTemplate { template: String, reason: String },

    /// The template's variable set does not match what the surface requires
    #[error("route {route:?} must use exactly the variables {{{expected}}}, its template declares {{{actual}}}")]
    VariableMismatch {
        route: &'static str,
        expected: String,
        actual: String,
    },

    /// An object path template declared no variables at all
    #[error("object path template {0:?} must declare at least one variable")]
    MissingVariables(String),

    /// The surface was registered twice
    #[error("the {0} dispatcher is already set")]
    AlreadyRegistered(&'static str),

    /// A listener for this activity class was registered twice
    #[error("a listener for {0} is already registered")]
    DuplicateListener(&'static str),

    /// A URL builder was called before its surface was registered
    #[error("No {0} dispatcher registered.")]
    NotRegistered(&'static str),

    /// Reverse build failed because a template variable had no value
    #[error("could not build a path for route {route:?}: missing or invalid variable values")]
    BuildFailed { route: String },
}

/// Runtime errors of the federation core
#[derive(Debug, Error)]
pub enum FederationError {
    /// Routing or registration failure surfaced at runtime
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Malformed input (bad JSON, missing required fields, bad URLs)
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP signature could not be created or verified
    #[error("invalid signature: {0}")]
    Signature(String),

    /// A remote JSON-LD document could not be loaded
    #[error("document load failed: {0}")]
    DocumentLoader(String),

    /// An outbound POST was rejected or never completed
    #[error("delivery to {inbox} failed: {message}")]
    Delivery { inbox: String, message: String },

    /// The key-value store failed
    #[error("key-value store error: {0}")]
    KvStore(String),

    /// The message queue failed
    #[error("message queue error: {0}")]
    Queue(String),

    /// An inbox listener returned an error
    #[error("inbox listener failed: {0}")]
    Listener(String),

    /// Transport-level HTTP client failure
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Anything that should never happen in a correct deployment
    #[error("internal error: {0}")]
    Internal(String),
}

impl FederationError {
    /// HTTP status this error maps to when it reaches a response boundary
    pub fn status(&self) -> StatusCode {
        match self {
            FederationError::Validation(_) => StatusCode::BAD_REQUEST,
            FederationError::Signature(_) => StatusCode::UNAUTHORIZED,
            FederationError::Delivery { .. }
            | FederationError::HttpClient(_)
            | FederationError::DocumentLoader(_) => StatusCode::BAD_GATEWAY,
            FederationError::Router(_)
            | FederationError::KvStore(_)
            | FederationError::Queue(_)
            | FederationError::Listener(_)
            | FederationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias using FederationError
pub type Result<T> = std::result::Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dispatcher_message_is_stable() {
        // Callers match on this text when a URL builder runs before setup.
        let error = RouterError::NotRegistered("actor");
        assert_eq!(error.to_string(), "No actor dispatcher registered.");
    }

    #[test]
    fn statuses_follow_the_response_table() {
        assert_eq!(
            FederationError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            FederationError::Signature("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            FederationError::Delivery {
                inbox: "https://remote.example/inbox".into(),
                message: "HTTP 500".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
