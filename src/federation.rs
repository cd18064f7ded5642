//! The federation registry
//!
//! A `Federation` owns the route table, the registered dispatchers and
//! listeners, the key-value store and the outbound queue. Inbound, it
//! routes `http` requests to the per-surface handlers; outbound, it fans
//! activities out to remote inboxes, retrying per the backoff schedule.
//!
//! Registration happens once, before the first request, through `&mut`
//! methods; afterwards the registry is shared behind an `Arc` and treated
//! as read-only.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use serde_json::Value;
use url::Url;

use crate::activity::{Activity, ActivityClass, ObjectClass};
use crate::callbacks::{
    ActorDispatcher, AuthorizePredicate, CollectionCounter, CollectionCursor,
    CollectionDispatcher, CollectionPage, ErrorResponseHook, InboxErrorHandler, InboxListener,
    KeyPairDispatcher, NodeInfoDispatcher, ObjectAuthorizePredicate, ObjectDispatcher,
    OutboxErrorHandler,
};
use crate::context::{Context, CryptographicKey, KeyPair, RequestContext};
use crate::error::{FederationError, Result, RouterError};
use crate::handlers::{self, CollectionKind, FetchHooks};
use crate::kv::{KvKey, KvStore};
use crate::loader::{
    AuthenticatedDocumentLoader, DocumentLoader, FetchDocumentLoader, KvCachedDocumentLoader,
};
use crate::metrics::FEDERATION_REQUESTS_TOTAL;
use crate::nodeinfo::NodeInfo;
use crate::queue::MessageQueue;
use crate::router::Router;
use crate::send::{self, OutboxMessage, SendActivityOptions};

/// How long remote documents stay in the KV cache.
const REMOTE_DOCUMENT_TTL: Duration = Duration::from_secs(60 * 60);

/// Builds a document loader bound to one actor's key material
pub type AuthenticatedLoaderFactory =
    Arc<dyn Fn(Url, String) -> Arc<dyn DocumentLoader> + Send + Sync>;

/// Key prefixes the registry writes under
#[derive(Debug, Clone)]
pub struct KvPrefixes {
    /// Claimed activity ids, for receive-side idempotence
    pub activity_idempotence: KvKey,
    /// Cached remote JSON-LD documents
    pub remote_document: KvKey,
}

impl Default for KvPrefixes {
    fn default() -> Self {
        Self {
            activity_idempotence: KvKey::new(["_fedistry", "activity_idempotence"]),
            remote_document: KvKey::new(["_fedistry", "remote_document"]),
        }
    }
}

/// Constructor parameters of a `Federation`
///
/// Only `kv` is required; everything else has the documented default.
pub struct FederationOptions {
    pub kv: Arc<dyn KvStore>,
    pub kv_prefixes: Option<KvPrefixes>,
    /// Queue for outbound deliveries; without one every send is immediate
    pub queue: Option<Arc<dyn MessageQueue>>,
    /// Loader for remote documents; defaults to a fetch loader wrapped in
    /// the KV cache under `remote_document`
    pub document_loader: Option<Arc<dyn DocumentLoader>>,
    pub authenticated_loader_factory: Option<AuthenticatedLoaderFactory>,
    /// Rewrite `http` request origins to `https` (for reverse proxies)
    pub treat_https: bool,
    /// Observer of outbound delivery failures
    pub on_outbox_error: Option<OutboxErrorHandler>,
    /// Delays between delivery retries; total attempts are `1 + len`
    pub backoff_schedule: Option<Vec<Duration>>,
}

impl FederationOptions {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            kv_prefixes: None,
            queue: None,
            document_loader: None,
            authenticated_loader_factory: None,
            treat_https: false,
            on_outbox_error: None,
            backoff_schedule: None,
        }
    }
}

fn default_backoff_schedule() -> Vec<Duration> {
    vec![
        Duration::from_secs(3),
        Duration::from_secs(15),
        Duration::from_secs(60),
        Duration::from_secs(15 * 60),
        Duration::from_secs(60 * 60),
    ]
}

pub(crate) struct ActorDispatcherEntry<T> {
    pub dispatcher: ActorDispatcher<T>,
    pub key_pair_dispatcher: Option<KeyPairDispatcher<T>>,
    pub authorize: Option<AuthorizePredicate<T>>,
}

pub(crate) struct ObjectDispatcherEntry<T> {
    pub dispatcher: ObjectDispatcher<T>,
    pub parameters: BTreeSet<String>,
    pub authorize: Option<ObjectAuthorizePredicate<T>>,
}

pub(crate) struct CollectionDispatcherEntry<T> {
    pub dispatcher: CollectionDispatcher<T>,
    pub counter: Option<CollectionCounter<T>>,
    pub first_cursor: Option<CollectionCursor<T>>,
    pub last_cursor: Option<CollectionCursor<T>>,
    pub authorize: Option<AuthorizePredicate<T>>,
}

pub(crate) struct InboxRegistry<T> {
    /// Listener per activity class, in registration order
    pub listeners: Vec<(ActivityClass, InboxListener<T>)>,
    pub error_handler: Option<InboxErrorHandler<T>>,
}

/// The registry: turns an HTTP server into a federated peer
///
/// Long-lived and process-wide. Register dispatchers while the value is
/// still exclusively owned, then wrap it in an `Arc` and call
/// [`Federation::handle`] from the HTTP server and
/// [`Federation::send_activity`] from application code.
pub struct Federation<T> {
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) kv_prefixes: KvPrefixes,
    pub(crate) queue: Option<Arc<dyn MessageQueue>>,
    pub(crate) router: Router,
    pub(crate) actor: Option<ActorDispatcherEntry<T>>,
    pub(crate) objects: HashMap<String, ObjectDispatcherEntry<T>>,
    pub(crate) outbox: Option<CollectionDispatcherEntry<T>>,
    pub(crate) following: Option<CollectionDispatcherEntry<T>>,
    pub(crate) followers: Option<CollectionDispatcherEntry<T>>,
    pub(crate) inbox: Option<InboxRegistry<T>>,
    pub(crate) node_info: Option<NodeInfoDispatcher<T>>,
    pub(crate) document_loader: Arc<dyn DocumentLoader>,
    pub(crate) authenticated_loader_factory: AuthenticatedLoaderFactory,
    pub(crate) treat_https: bool,
    on_outbox_error: Option<OutboxErrorHandler>,
    backoff_schedule: Vec<Duration>,
    http_client: reqwest::Client,
    queue_started: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Federation<T> {
    /// Create a registry with the well-known routes pre-registered
    pub fn new(options: FederationOptions) -> Self {
        let http_client = reqwest::Client::new();
        let kv = options.kv;
        let kv_prefixes = options.kv_prefixes.unwrap_or_default();

        let document_loader = options.document_loader.unwrap_or_else(|| {
            Arc::new(KvCachedDocumentLoader::new(
                Arc::new(FetchDocumentLoader::new(http_client.clone())),
                kv.clone(),
                kv_prefixes.remote_document.clone(),
                REMOTE_DOCUMENT_TTL,
            ))
        });
        let authenticated_loader_factory =
            options.authenticated_loader_factory.unwrap_or_else(|| {
                let client = http_client.clone();
                Arc::new(move |key_id: Url, private_key_pem: String| {
                    Arc::new(AuthenticatedDocumentLoader::new(
                        client.clone(),
                        key_id,
                        private_key_pem,
                    )) as Arc<dyn DocumentLoader>
                })
            });

        let mut router = Router::new();
        // A fresh router cannot collide on the two fixed routes.
        router
            .add("/.well-known/webfinger", "webfinger")
            .expect("well-known webfinger route is valid");
        router
            .add("/.well-known/nodeinfo", "nodeinfo_jrd")
            .expect("well-known nodeinfo route is valid");

        Self {
            kv,
            kv_prefixes,
            queue: options.queue,
            router,
            actor: None,
            objects: HashMap::new(),
            outbox: None,
            following: None,
            followers: None,
            inbox: None,
            node_info: None,
            document_loader,
            authenticated_loader_factory,
            treat_https: options.treat_https,
            on_outbox_error: options.on_outbox_error,
            backoff_schedule: options
                .backoff_schedule
                .unwrap_or_else(default_backoff_schedule),
            http_client,
            queue_started: AtomicBool::new(false),
        }
    }

    pub(crate) fn collection_entry(
        &self,
        kind: CollectionKind,
    ) -> Option<&CollectionDispatcherEntry<T>> {
        match kind {
            CollectionKind::Outbox => self.outbox.as_ref(),
            CollectionKind::Following => self.following.as_ref(),
            CollectionKind::Followers => self.followers.as_ref(),
        }
    }

    fn require_variables(
        variables: &BTreeSet<String>,
        required: &[&str],
        route: &'static str,
    ) -> std::result::Result<(), RouterError> {
        let required: BTreeSet<String> = required.iter().map(|s| s.to_string()).collect();
        if *variables != required {
            return Err(RouterError::VariableMismatch {
                route,
                expected: required.into_iter().collect::<Vec<_>>().join(", "),
                actual: variables.iter().cloned().collect::<Vec<_>>().join(", "),
            });
        }
        Ok(())
    }

    /// Register the NodeInfo dispatcher; the path takes no variables
    pub fn set_node_info_dispatcher<F, Fut>(
        &mut self,
        path: &str,
        dispatcher: F,
    ) -> std::result::Result<(), RouterError>
    where
        F: Fn(RequestContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeInfo>> + Send + 'static,
    {
        if self.node_info.is_some() {
            return Err(RouterError::AlreadyRegistered("NodeInfo"));
        }
        let variables = self.router.add(path, "nodeinfo")?;
        Self::require_variables(&variables, &[], "nodeinfo")?;
        self.node_info = Some(Arc::new(move |ctx| Box::pin(dispatcher(ctx))));
        Ok(())
    }

    /// Register the actor dispatcher; the path must use exactly `{handle}`
    ///
    /// The returned setters chain the key-pair dispatcher and the
    /// authorize predicate onto the same surface.
    pub fn set_actor_dispatcher<F, Fut>(
        &mut self,
        path: &str,
        dispatcher: F,
    ) -> std::result::Result<ActorCallbackSetters<'_, T>, RouterError>
    where
        F: Fn(RequestContext<T>, String, Option<CryptographicKey>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        if self.actor.is_some() {
            return Err(RouterError::AlreadyRegistered("actor"));
        }
        let variables = self.router.add(path, "actor")?;
        Self::require_variables(&variables, &["handle"], "actor")?;

        let entry = self.actor.insert(ActorDispatcherEntry {
            dispatcher: Arc::new(move |ctx, handle, key| Box::pin(dispatcher(ctx, handle, key))),
            key_pair_dispatcher: None,
            authorize: None,
        });
        Ok(ActorCallbackSetters { entry })
    }

    /// Register an object dispatcher for a class; the path must declare at
    /// least one variable
    pub fn set_object_dispatcher<F, Fut>(
        &mut self,
        class: ObjectClass,
        path: &str,
        dispatcher: F,
    ) -> std::result::Result<ObjectCallbackSetters<'_, T>, RouterError>
    where
        F: Fn(RequestContext<T>, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let type_iri = class.type_iri().to_string();
        if self.objects.contains_key(&type_iri) {
            return Err(RouterError::AlreadyRegistered("object"));
        }
        let variables = self.router.add(path, &format!("object:{type_iri}"))?;
        if variables.is_empty() {
            return Err(RouterError::MissingVariables(path.to_string()));
        }

        let slot = match self.objects.entry(type_iri) {
            Entry::Occupied(_) => return Err(RouterError::AlreadyRegistered("object")),
            Entry::Vacant(vacant) => vacant.insert(ObjectDispatcherEntry {
                dispatcher: Arc::new(move |ctx, values| Box::pin(dispatcher(ctx, values))),
                parameters: variables,
                authorize: None,
            }),
        };
        Ok(ObjectCallbackSetters { entry: slot })
    }

    fn register_collection<'a>(
        router: &mut Router,
        slot: &'a mut Option<CollectionDispatcherEntry<T>>,
        surface: &'static str,
        path: &str,
        dispatcher: CollectionDispatcher<T>,
    ) -> std::result::Result<CollectionCallbackSetters<'a, T>, RouterError> {
        if slot.is_some() {
            return Err(RouterError::AlreadyRegistered(surface));
        }
        let variables = router.add(path, surface)?;
        Self::require_variables(&variables, &["handle"], surface)?;

        let entry = slot.insert(CollectionDispatcherEntry {
            dispatcher,
            counter: None,
            first_cursor: None,
            last_cursor: None,
            authorize: None,
        });
        Ok(CollectionCallbackSetters { entry })
    }

    /// Register the outbox dispatcher; the path must use exactly `{handle}`
    pub fn set_outbox_dispatcher<F, Fut>(
        &mut self,
        path: &str,
        dispatcher: F,
    ) -> std::result::Result<CollectionCallbackSetters<'_, T>, RouterError>
    where
        F: Fn(RequestContext<T>, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<CollectionPage>>> + Send + 'static,
    {
        Self::register_collection(
            &mut self.router,
            &mut self.outbox,
            "outbox",
            path,
            Arc::new(move |ctx, handle, cursor| Box::pin(dispatcher(ctx, handle, cursor))),
        )
    }

    /// Register the following dispatcher; the path must use exactly `{handle}`
    pub fn set_following_dispatcher<F, Fut>(
        &mut self,
        path: &str,
        dispatcher: F,
    ) -> std::result::Result<CollectionCallbackSetters<'_, T>, RouterError>
    where
        F: Fn(RequestContext<T>, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<CollectionPage>>> + Send + 'static,
    {
        Self::register_collection(
            &mut self.router,
            &mut self.following,
            "following",
            path,
            Arc::new(move |ctx, handle, cursor| Box::pin(dispatcher(ctx, handle, cursor))),
        )
    }

    /// Register the followers dispatcher; the path must use exactly `{handle}`
    pub fn set_followers_dispatcher<F, Fut>(
        &mut self,
        path: &str,
        dispatcher: F,
    ) -> std::result::Result<CollectionCallbackSetters<'_, T>, RouterError>
    where
        F: Fn(RequestContext<T>, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<CollectionPage>>> + Send + 'static,
    {
        Self::register_collection(
            &mut self.router,
            &mut self.followers,
            "followers",
            path,
            Arc::new(move |ctx, handle, cursor| Box::pin(dispatcher(ctx, handle, cursor))),
        )
    }

    /// Register the inbox routes
    ///
    /// The personal path must use exactly `{handle}`; the shared path, when
    /// given, takes no variables. Listeners are attached through the
    /// returned setter.
    pub fn set_inbox_listeners(
        &mut self,
        inbox_path: &str,
        shared_inbox_path: Option<&str>,
    ) -> std::result::Result<InboxListenerSetter<'_, T>, RouterError> {
        if self.inbox.is_some() {
            return Err(RouterError::AlreadyRegistered("inbox"));
        }
        let variables = self.router.add(inbox_path, "inbox")?;
        Self::require_variables(&variables, &["handle"], "inbox")?;
        if let Some(shared_inbox_path) = shared_inbox_path {
            let variables = self.router.add(shared_inbox_path, "shared_inbox")?;
            Self::require_variables(&variables, &[], "shared_inbox")?;
        }

        let registry = self.inbox.insert(InboxRegistry {
            listeners: Vec::new(),
            error_handler: None,
        });
        Ok(InboxListenerSetter { registry })
    }

    /// Build a plain context for application code (outside any request)
    pub fn context(self: &Arc<Self>, origin: Url, data: T) -> Context<T> {
        let origin = canonical_origin(origin, self.treat_https);
        Context::new(
            self.clone(),
            origin,
            data,
            self.document_loader.clone(),
        )
    }

    /// Dispatch one inbound request
    ///
    /// Routes by path and hands the request to the matching per-surface
    /// handler. Unknown paths, failed content negotiation and failed
    /// authorization go through the `on_*` hooks in `options`, which
    /// default to plain-text 404/406/401 responses.
    pub async fn handle(
        self: &Arc<Self>,
        request: Request<Bytes>,
        options: FetchOptions<T>,
    ) -> Response<Bytes> {
        let hooks = FetchHooks {
            not_found: options
                .on_not_found
                .unwrap_or_else(|| Arc::new(handlers::default_not_found)),
            not_acceptable: options
                .on_not_acceptable
                .unwrap_or_else(|| Arc::new(handlers::default_not_acceptable)),
            unauthorized: options
                .on_unauthorized
                .unwrap_or_else(|| Arc::new(handlers::default_unauthorized)),
        };

        let url = match request_url(&request, self.treat_https) {
            Ok(url) => url,
            Err(error) => {
                tracing::debug!(error = %error, "unroutable request");
                return handlers::default_not_found(&request);
            }
        };
        let Some(matched) = self.router.route(url.path()) else {
            return (hooks.not_found)(&request);
        };

        let origin = canonical_origin(url.clone(), self.treat_https);
        let context = Context::new(
            self.clone(),
            origin,
            options.context_data,
            self.document_loader.clone(),
        );
        let request = Arc::new(request);
        let ctx = RequestContext::new(context, request.clone(), url);

        let handle_value = matched.values.get("handle").cloned();
        let (surface, response) = match matched.name.as_str() {
            "webfinger" => (
                "webfinger",
                handlers::handle_webfinger(&ctx, &hooks).await,
            ),
            "nodeinfo_jrd" => (
                "nodeinfo_jrd",
                handlers::handle_nodeinfo_jrd(&ctx, &hooks).await,
            ),
            "nodeinfo" => ("nodeinfo", handlers::handle_nodeinfo(&ctx, &hooks).await),
            "actor" => (
                "actor",
                match handle_value {
                    Some(handle) => handlers::handle_actor(&ctx, &handle, &hooks).await,
                    None => (hooks.not_found)(&request),
                },
            ),
            "outbox" | "following" | "followers" => {
                let kind = match matched.name.as_str() {
                    "outbox" => CollectionKind::Outbox,
                    "following" => CollectionKind::Following,
                    _ => CollectionKind::Followers,
                };
                (
                    kind.route_name(),
                    match handle_value {
                        Some(handle) => {
                            handlers::handle_collection(&ctx, kind, &handle, &hooks).await
                        }
                        None => (hooks.not_found)(&request),
                    },
                )
            }
            "inbox" => (
                "inbox",
                match handle_value {
                    Some(handle) => {
                        // The personal inbox verifies and loads documents as
                        // the receiving actor, not anonymously.
                        let ctx = self.actor_inbox_context(ctx, &handle).await;
                        handlers::handle_inbox(&ctx, Some(&handle), &hooks).await
                    }
                    None => (hooks.not_found)(&request),
                },
            ),
            "shared_inbox" => (
                "shared_inbox",
                handlers::handle_inbox(&ctx, None, &hooks).await,
            ),
            name if name.starts_with("object:") => {
                let type_iri = name.trim_start_matches("object:").to_string();
                (
                    "object",
                    handlers::handle_object(&ctx, &type_iri, matched.values, &hooks).await,
                )
            }
            _ => ("unknown", (hooks.not_found)(&request)),
        };

        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&[surface, response.status().as_str()])
            .inc();
        response
    }

    /// Swap the context's loader for the actor's authenticated one
    async fn actor_inbox_context(
        self: &Arc<Self>,
        ctx: RequestContext<T>,
        handle: &str,
    ) -> RequestContext<T> {
        let Some(dispatcher) = self
            .actor
            .as_ref()
            .and_then(|entry| entry.key_pair_dispatcher.clone())
        else {
            return ctx;
        };
        let pair = match dispatcher(ctx.data().clone(), handle.to_string()).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return ctx,
            Err(error) => {
                tracing::warn!(handle, error = %error, "key pair lookup failed; inbox keeps the default loader");
                return ctx;
            }
        };
        let Ok(mut key_id) = ctx.actor_uri(handle) else {
            return ctx;
        };
        key_id.set_fragment(Some("main-key"));
        let loader = (self.authenticated_loader_factory)(key_id, pair.private_key_pem);
        ctx.with_document_loader(loader)
    }

    /// Send an activity to the recipients' inboxes
    ///
    /// Mints a `urn:uuid:` id when the activity has none, signs one POST
    /// per de-duplicated inbox, and — when a queue is configured and
    /// `immediate` is off — enqueues instead of delivering inline.
    pub async fn send_activity(
        self: &Arc<Self>,
        key_id: &Url,
        private_key_pem: &str,
        recipients: &[Value],
        activity: Activity,
        options: SendActivityOptions,
    ) -> Result<()> {
        let activity = match activity.id() {
            Some(_) => activity,
            None => activity.with_id(format!("urn:uuid:{}", uuid::Uuid::new_v4())),
        };
        if activity.actor_id().is_none() {
            return Err(FederationError::Validation(
                "activity to send must have an actor".to_string(),
            ));
        }

        let inboxes = send::extract_inboxes(recipients, options.prefer_shared_inbox);
        if inboxes.is_empty() {
            tracing::debug!("no inboxes to deliver to");
            return Ok(());
        }

        let document = activity.to_json_ld();

        if let (Some(queue), false) = (self.queue.clone(), options.immediate) {
            self.ensure_queue_listener()?;
            for inbox in &inboxes {
                let message =
                    OutboxMessage::new(key_id, private_key_pem, document.clone(), inbox);
                let payload = serde_json::to_vec(&message).map_err(|e| {
                    FederationError::Internal(format!("outbox message serialization: {e}"))
                })?;
                queue.enqueue(payload, None).await?;
            }
            tracing::info!(
                activity_id = activity.id(),
                inboxes = inboxes.len(),
                "activity enqueued for delivery"
            );
            return Ok(());
        }

        let body = serde_json::to_vec(&document).map_err(|e| {
            FederationError::Internal(format!("activity serialization: {e}"))
        })?;
        let deliveries = inboxes.iter().map(|inbox| {
            send::deliver_activity(&self.http_client, key_id, private_key_pem, inbox, &body)
        });
        let failures: Vec<FederationError> = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter_map(std::result::Result::err)
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                self.notify_outbox_error(failure, Some(&activity));
            }
            let (inbox, message) = match &failures[0] {
                FederationError::Delivery { inbox, message } => (inbox.clone(), message.clone()),
                other => (String::new(), other.to_string()),
            };
            Err(FederationError::Delivery {
                inbox,
                message: format!("{message} ({} of {} deliveries failed)", failures.len(), inboxes.len()),
            })
        }
    }

    fn notify_outbox_error(&self, error: &FederationError, activity: Option<&Activity>) {
        if let Some(on_outbox_error) = &self.on_outbox_error {
            on_outbox_error(error, activity);
        }
    }

    /// Start the queue consumer exactly once
    fn ensure_queue_listener(self: &Arc<Self>) -> Result<()> {
        if self.queue_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(queue) = self.queue.clone() else {
            return Ok(());
        };
        let federation = self.clone();
        queue.listen(Arc::new(move |payload| {
            let federation = federation.clone();
            Box::pin(async move {
                federation.process_queued_message(payload).await;
            })
        }))?;
        tracing::info!("outbox queue listener started");
        Ok(())
    }

    /// Replay one queued delivery; on failure, reschedule per the backoff
    async fn process_queued_message(self: &Arc<Self>, payload: Vec<u8>) {
        let message = match serde_json::from_slice::<OutboxMessage>(&payload) {
            Ok(message) if message.message_type == OutboxMessage::MESSAGE_TYPE => message,
            Ok(message) => {
                let error = FederationError::Validation(format!(
                    "unexpected queue message type {:?}",
                    message.message_type
                ));
                tracing::error!(error = %error, "dropping queue message");
                self.notify_outbox_error(&error, None);
                return;
            }
            Err(e) => {
                let error =
                    FederationError::Validation(format!("undecodable queue message: {e}"));
                tracing::error!(error = %error, "dropping queue message");
                self.notify_outbox_error(&error, None);
                return;
            }
        };

        // Rehydrate; failures here are deserialization failures and drop
        // the message, there is nothing sensible to retry.
        let hydrated = (|| {
            let activity = Activity::from_document(message.activity.clone())
                .map_err(|e| FederationError::Validation(format!("queued activity: {e}")))?;
            let inbox = Url::parse(&message.inbox)
                .map_err(|_| FederationError::Validation("queued inbox URL is invalid".to_string()))?;
            let key_id = Url::parse(&message.key_id)
                .map_err(|_| FederationError::Validation("queued keyId is invalid".to_string()))?;
            Ok::<_, FederationError>((activity, inbox, key_id))
        })();
        let (activity, inbox, key_id) = match hydrated {
            Ok(parts) => parts,
            Err(error) => {
                tracing::error!(error = %error, "dropping queue message");
                self.notify_outbox_error(&error, None);
                return;
            }
        };

        let body = match serde_json::to_vec(&message.activity) {
            Ok(body) => body,
            Err(e) => {
                let error =
                    FederationError::Internal(format!("queued activity serialization: {e}"));
                self.notify_outbox_error(&error, None);
                return;
            }
        };

        match send::deliver_activity(
            &self.http_client,
            &key_id,
            &message.private_key,
            &inbox,
            &body,
        )
        .await
        {
            Ok(()) => {
                tracing::info!(
                    activity_id = activity.id(),
                    inbox = %inbox,
                    trial = message.trial,
                    "queued activity delivered"
                );
            }
            Err(error) => {
                self.notify_outbox_error(&error, Some(&activity));
                let trial = message.trial as usize;
                if trial < self.backoff_schedule.len() {
                    let delay = self.backoff_schedule[trial];
                    tracing::warn!(
                        activity_id = activity.id(),
                        inbox = %inbox,
                        trial = message.trial,
                        delay_secs = delay.as_secs_f64(),
                        error = %error,
                        "delivery failed, retrying"
                    );
                    let retry = OutboxMessage {
                        trial: message.trial + 1,
                        ..message
                    };
                    let enqueued = match serde_json::to_vec(&retry) {
                        Ok(payload) => {
                            if let Some(queue) = self.queue.clone() {
                                queue.enqueue(payload, Some(delay)).await
                            } else {
                                Ok(())
                            }
                        }
                        Err(e) => Err(FederationError::Internal(format!(
                            "retry serialization: {e}"
                        ))),
                    };
                    if let Err(e) = enqueued {
                        tracing::error!(error = %e, "could not reschedule delivery");
                    }
                } else {
                    tracing::error!(
                        activity_id = activity.id(),
                        inbox = %inbox,
                        trials = message.trial + 1,
                        error = %error,
                        "delivery failed, giving up"
                    );
                }
            }
        }
    }
}

/// Options of one `Federation::handle` call
pub struct FetchOptions<T> {
    /// Opaque per-request data handed to every callback
    pub context_data: T,
    pub on_not_found: Option<ErrorResponseHook>,
    pub on_not_acceptable: Option<ErrorResponseHook>,
    pub on_unauthorized: Option<ErrorResponseHook>,
}

impl<T> FetchOptions<T> {
    pub fn new(context_data: T) -> Self {
        Self {
            context_data,
            on_not_found: None,
            on_not_acceptable: None,
            on_unauthorized: None,
        }
    }
}

/// Chained setters of the actor surface
pub struct ActorCallbackSetters<'a, T> {
    entry: &'a mut ActorDispatcherEntry<T>,
}

impl<T: Clone + Send + Sync + 'static> ActorCallbackSetters<'_, T> {
    /// Attach the key-pair dispatcher used for signing and `actor_key`
    pub fn set_key_pair_dispatcher<F, Fut>(self, dispatcher: F) -> Self
    where
        F: Fn(T, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<KeyPair>>> + Send + 'static,
    {
        self.entry.key_pair_dispatcher =
            Some(Arc::new(move |data, handle| Box::pin(dispatcher(data, handle))));
        self
    }

    /// Gate the actor document behind a predicate
    pub fn authorize<F, Fut>(self, predicate: F) -> Self
    where
        F: Fn(RequestContext<T>, String, Option<CryptographicKey>, Option<Value>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.entry.authorize = Some(Arc::new(move |ctx, handle, key, owner| {
            Box::pin(predicate(ctx, handle, key, owner))
        }));
        self
    }
}

/// Chained setters of an object surface
pub struct ObjectCallbackSetters<'a, T> {
    entry: &'a mut ObjectDispatcherEntry<T>,
}

impl<T: Clone + Send + Sync + 'static> ObjectCallbackSetters<'_, T> {
    /// Gate the object document behind a predicate
    pub fn authorize<F, Fut>(self, predicate: F) -> Self
    where
        F: Fn(
                RequestContext<T>,
                HashMap<String, String>,
                Option<CryptographicKey>,
                Option<Value>,
            ) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.entry.authorize = Some(Arc::new(move |ctx, values, key, owner| {
            Box::pin(predicate(ctx, values, key, owner))
        }));
        self
    }
}

/// Chained setters of a collection surface
pub struct CollectionCallbackSetters<'a, T> {
    entry: &'a mut CollectionDispatcherEntry<T>,
}

impl<T: Clone + Send + Sync + 'static> CollectionCallbackSetters<'_, T> {
    /// Attach the `totalItems` counter
    pub fn set_counter<F, Fut>(self, counter: F) -> Self
    where
        F: Fn(RequestContext<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<u64>>> + Send + 'static,
    {
        self.entry.counter = Some(Arc::new(move |ctx, handle| Box::pin(counter(ctx, handle))));
        self
    }

    /// Attach the first-page cursor callback
    pub fn set_first_cursor<F, Fut>(self, cursor: F) -> Self
    where
        F: Fn(RequestContext<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.entry.first_cursor = Some(Arc::new(move |ctx, handle| Box::pin(cursor(ctx, handle))));
        self
    }

    /// Attach the last-page cursor callback
    pub fn set_last_cursor<F, Fut>(self, cursor: F) -> Self
    where
        F: Fn(RequestContext<T>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.entry.last_cursor = Some(Arc::new(move |ctx, handle| Box::pin(cursor(ctx, handle))));
        self
    }

    /// Gate the collection behind a predicate
    pub fn authorize<F, Fut>(self, predicate: F) -> Self
    where
        F: Fn(RequestContext<T>, String, Option<CryptographicKey>, Option<Value>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.entry.authorize = Some(Arc::new(move |ctx, handle, key, owner| {
            Box::pin(predicate(ctx, handle, key, owner))
        }));
        self
    }
}

/// Attaches listeners to the registered inbox
pub struct InboxListenerSetter<'a, T> {
    registry: &'a mut InboxRegistry<T>,
}

impl<T: Clone + Send + Sync + 'static> InboxListenerSetter<'_, T> {
    /// Register the listener for an activity class
    ///
    /// Dispatch walks an inbound activity's class chain most-specific
    /// first, so a `Create` listener also sees nothing but `Create`s while
    /// an `Activity` listener catches everything unhandled.
    pub fn on<F, Fut>(self, class: ActivityClass, listener: F) -> std::result::Result<Self, RouterError>
    where
        F: Fn(RequestContext<T>, Activity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self
            .registry
            .listeners
            .iter()
            .any(|(registered, _)| *registered == class)
        {
            return Err(RouterError::DuplicateListener(class.name()));
        }
        self.registry.listeners.push((
            class,
            Arc::new(move |ctx, activity| Box::pin(listener(ctx, activity))),
        ));
        Ok(self)
    }

    /// Replace the inbox error handler
    ///
    /// Called for body-parse failures (with no activity) and listener
    /// failures (with the activity). A failing listener leaves the
    /// idempotence claim in place, so the sender's retries are
    /// deduplicated rather than re-dispatched.
    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&RequestContext<T>, &FederationError, Option<&Activity>) + Send + Sync + 'static,
    {
        self.registry.error_handler = Some(Arc::new(handler));
        self
    }
}

/// Canonical origin: scheme and authority only, query and fragment gone
fn canonical_origin(mut url: Url, treat_https: bool) -> Url {
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    if treat_https && url.scheme() == "http" {
        // Behind a TLS-terminating proxy the request scheme lies.
        let _ = url.set_scheme("https");
    }
    url
}

/// Absolute URL of an inbound request
///
/// Servers usually hand over origin-form URIs; the authority then comes
/// from the `Host` header.
fn request_url(request: &Request<Bytes>, treat_https: bool) -> Result<Url> {
    let uri = request.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let scheme = if treat_https && scheme == "http" {
        "https"
    } else {
        scheme
    };
    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            request
                .headers()
                .get("host")
                .and_then(|host| host.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            FederationError::Validation("request has no authority or Host header".to_string())
        })?;
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Url::parse(&format!("{scheme}://{authority}{path_and_query}"))
        .map_err(|_| FederationError::Validation("request URL does not parse".to_string()))
}
