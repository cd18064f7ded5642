//! Callback contracts
//!
//! Every extension point the host plugs into the registry is a boxed
//! async closure over owned arguments. Dispatchers answer `Ok(None)` for
//! "not found" (a 404 to the client); any other error bubbles as a 500.
//! Authorize predicates answer `Ok(false)` for a 401.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::activity::Activity;
use crate::context::{CryptographicKey, KeyPair, RequestContext};
use crate::error::FederationError;
use crate::nodeinfo::NodeInfo;

/// Future returned by every async callback
pub type CallbackFuture<T> = BoxFuture<'static, T>;

/// Produces the actor document for a local handle
///
/// Receives the actor's public key when a key-pair dispatcher is set.
pub type ActorDispatcher<T> = Arc<
    dyn Fn(
            RequestContext<T>,
            String,
            Option<CryptographicKey>,
        ) -> CallbackFuture<Result<Option<Value>, FederationError>>
        + Send
        + Sync,
>;

/// Produces the signing key pair for a local handle
pub type KeyPairDispatcher<T> =
    Arc<dyn Fn(T, String) -> CallbackFuture<Result<Option<KeyPair>, FederationError>> + Send + Sync>;

/// Gate on actor and collection surfaces, keyed by handle
pub type AuthorizePredicate<T> = Arc<
    dyn Fn(
            RequestContext<T>,
            String,
            Option<CryptographicKey>,
            Option<Value>,
        ) -> CallbackFuture<Result<bool, FederationError>>
        + Send
        + Sync,
>;

/// Produces a typed object document from its template variables
pub type ObjectDispatcher<T> = Arc<
    dyn Fn(
            RequestContext<T>,
            HashMap<String, String>,
        ) -> CallbackFuture<Result<Option<Value>, FederationError>>
        + Send
        + Sync,
>;

/// Gate on object surfaces, keyed by the full variable map
pub type ObjectAuthorizePredicate<T> = Arc<
    dyn Fn(
            RequestContext<T>,
            HashMap<String, String>,
            Option<CryptographicKey>,
            Option<Value>,
        ) -> CallbackFuture<Result<bool, FederationError>>
        + Send
        + Sync,
>;

/// One page of a collection
#[derive(Debug, Clone, Default)]
pub struct CollectionPage {
    pub items: Vec<Value>,
    /// Cursor of the following page, when there is one
    pub next_cursor: Option<String>,
}

/// Produces the page of a collection at a cursor
pub type CollectionDispatcher<T> = Arc<
    dyn Fn(
            RequestContext<T>,
            String,
            String,
        ) -> CallbackFuture<Result<Option<CollectionPage>, FederationError>>
        + Send
        + Sync,
>;

/// Produces a collection's `totalItems`
pub type CollectionCounter<T> = Arc<
    dyn Fn(RequestContext<T>, String) -> CallbackFuture<Result<Option<u64>, FederationError>>
        + Send
        + Sync,
>;

/// Produces a collection's first or last cursor
pub type CollectionCursor<T> = Arc<
    dyn Fn(RequestContext<T>, String) -> CallbackFuture<Result<Option<String>, FederationError>>
        + Send
        + Sync,
>;

/// Handles one inbound activity
///
/// Returning an error makes the inbox answer 500; the idempotence claim
/// stays in place either way, so the sender's retries are deduplicated.
pub type InboxListener<T> = Arc<
    dyn Fn(RequestContext<T>, Activity) -> CallbackFuture<Result<(), FederationError>>
        + Send
        + Sync,
>;

/// Observes inbox failures (parse errors and listener errors)
///
/// `activity` is `None` when the body never parsed. Infallible: there is
/// nothing the core could do with a failing error handler.
pub type InboxErrorHandler<T> =
    Arc<dyn Fn(&RequestContext<T>, &FederationError, Option<&Activity>) + Send + Sync>;

/// Produces the NodeInfo document
pub type NodeInfoDispatcher<T> =
    Arc<dyn Fn(RequestContext<T>) -> CallbackFuture<Result<NodeInfo, FederationError>> + Send + Sync>;

/// Observes outbound delivery failures, once per failed attempt
///
/// `activity` is `None` when the queued message could not be decoded.
pub type OutboxErrorHandler =
    Arc<dyn Fn(&FederationError, Option<&Activity>) + Send + Sync>;

/// Hook overriding one of the default plain-text error responses
pub type ErrorResponseHook =
    Arc<dyn Fn(&http::Request<bytes::Bytes>) -> http::Response<bytes::Bytes> + Send + Sync>;
