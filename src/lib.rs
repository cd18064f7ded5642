//! fedistry - embeddable ActivityPub federation middleware
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Host HTTP server (Axum)                   │
//! │  - forwards unclaimed requests into Federation::handle      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation registry                       │
//! │  - URI-template router (forward match + reverse build)      │
//! │  - per-surface handlers (actor, objects, collections,       │
//! │    inboxes, WebFinger, NodeInfo)                            │
//! │  - outbound fan-out, signing, retry queue                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Host-provided backends                      │
//! │  - KvStore (idempotence claims, document cache)             │
//! │  - MessageQueue (durable outbound deliveries)               │
//! │  - dispatchers and listeners (the application's data)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `federation`: the registry, registration setters, request dispatch
//! - `context`: `Context` / `RequestContext` handed to callbacks
//! - `router`: URI-template matching and URL building
//! - `activity`: activity classes, the `Activity` wrapper, object classes
//! - `handlers`: per-surface HTTP semantics
//! - `signature`: HTTP Signatures (cavage, rsa-sha256)
//! - `loader`: JSON-LD document loaders (fetch, cached, authenticated)
//! - `send`: inbox extraction and outbound delivery
//! - `kv`, `queue`: backend abstractions with in-memory defaults
//! - `webfinger`, `nodeinfo`: discovery documents
//! - `error`: `RouterError` and `FederationError`
//! - `metrics`: prometheus instruments
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fedistry::{Federation, FederationOptions, MemoryKvStore};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), fedistry::RouterError> {
//! let mut federation: Federation<()> =
//!     Federation::new(FederationOptions::new(Arc::new(MemoryKvStore::new())));
//!
//! federation.set_actor_dispatcher("/users/{handle}", |ctx, handle, _key| async move {
//!     if handle != "alice" {
//!         return Ok(None);
//!     }
//!     Ok(Some(json!({
//!         "type": "Person",
//!         "id": ctx.actor_uri(&handle)?.to_string(),
//!         "preferredUsername": handle,
//!     })))
//! })?;
//!
//! let _federation = Arc::new(federation);
//! // mount: federation.into_router(()) and serve with axum
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod callbacks;
pub mod context;
pub mod error;
pub mod federation;
mod handlers;
mod integration;
pub mod kv;
pub mod loader;
pub mod metrics;
pub mod nodeinfo;
pub mod queue;
pub mod router;
pub mod send;
pub mod signature;
pub mod webfinger;

pub use activity::{Activity, ActivityClass, ObjectClass};
pub use callbacks::CollectionPage;
pub use context::{Context, CryptographicKey, KeyPair, RequestContext, SenderKey};
pub use error::{FederationError, Result, RouterError};
pub use federation::{Federation, FederationOptions, FetchOptions, KvPrefixes};
pub use kv::{KvKey, KvStore, MemoryKvStore};
pub use loader::{DocumentLoader, RemoteDocument};
pub use nodeinfo::{NodeInfo, NodeInfoSoftware, NodeInfoUsage, NodeInfoUsers};
pub use queue::{InProcessQueue, MessageQueue};
pub use send::{extract_inboxes, OutboxMessage, SendActivityOptions};
