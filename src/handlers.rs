//! Per-surface request handlers
//!
//! Every negotiated surface follows the same evaluation order: existence
//! (404), authorization (401), content negotiation (406), then the 200
//! document. The inbox is POST-only and adds the signature, parse and
//! idempotence gates in front of listener dispatch.

use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use serde_json::{json, Value};
use url::Url;

use crate::activity::{Activity, ACTIVITY_CONTEXT};
use crate::callbacks::ErrorResponseHook;
use crate::context::RequestContext;
use crate::error::FederationError;
use crate::nodeinfo;
use crate::signature;
use crate::webfinger::{self, ResourceRef};

pub(crate) type HttpResponse = Response<Bytes>;

/// How long a processed activity id blocks re-dispatch.
const IDEMPOTENCE_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

const ACTIVITY_JSON: &str = "application/activity+json";
const JRD_JSON: &str = "application/jrd+json";

/// Resolved error-response hooks for one `handle` call
pub(crate) struct FetchHooks {
    pub not_found: ErrorResponseHook,
    pub not_acceptable: ErrorResponseHook,
    pub unauthorized: ErrorResponseHook,
}

fn plain(status: StatusCode, body: &'static str, vary: bool) -> HttpResponse {
    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8");
    if vary {
        builder = builder.header("Vary", "Accept, Signature");
    }
    builder
        .body(Bytes::from_static(body.as_bytes()))
        .unwrap_or_default()
}

pub(crate) fn default_not_found(_request: &Request<Bytes>) -> HttpResponse {
    plain(StatusCode::NOT_FOUND, "Not Found", false)
}

pub(crate) fn default_not_acceptable(_request: &Request<Bytes>) -> HttpResponse {
    plain(StatusCode::NOT_ACCEPTABLE, "Not Acceptable", true)
}

pub(crate) fn default_unauthorized(_request: &Request<Bytes>) -> HttpResponse {
    plain(StatusCode::UNAUTHORIZED, "Unauthorized", true)
}

pub(crate) fn method_not_allowed() -> HttpResponse {
    plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed", false)
}

fn accepted() -> HttpResponse {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::ACCEPTED;
    response
}

fn bad_request(message: &'static str) -> HttpResponse {
    plain(StatusCode::BAD_REQUEST, message, false)
}

/// 5xx response with the detail kept out of the body
fn internal_error(error: &FederationError) -> HttpResponse {
    tracing::error!(error = %error, "request failed");
    plain(error.status(), "Internal Server Error", false)
}

fn json_response(document: &Value, content_type: &'static str) -> HttpResponse {
    let body = serde_json::to_vec(document).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type)
        .header("Vary", "Accept, Signature")
        .body(Bytes::from(body))
        .unwrap_or_default()
}

fn ensure_context(mut document: Value) -> Value {
    if let Some(map) = document.as_object_mut() {
        map.entry("@context").or_insert_with(|| json!(ACTIVITY_CONTEXT));
    }
    document
}

/// Whether the request accepts an ActivityStreams-compatible media type
pub(crate) fn accepts_json_ld(request: &Request<Bytes>) -> bool {
    let Some(accept) = request.headers().get("accept") else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    accept
        .split(',')
        .filter_map(|item| item.split(';').next())
        .map(str::trim)
        .any(|media_type| {
            matches!(
                media_type,
                "application/activity+json"
                    | "application/ld+json"
                    | "application/json"
                    | "application/*"
                    | "*/*"
            )
        })
}

fn is_activity_content_type(request: &Request<Bytes>) -> bool {
    request
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .is_some_and(|media_type| {
            media_type == "application/activity+json" || media_type == "application/ld+json"
        })
}

/// GET `{actor_path}` — the actor document
pub(crate) async fn handle_actor<T>(
    ctx: &RequestContext<T>,
    handle: &str,
    hooks: &FetchHooks,
) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    if ctx.federation.actor.is_none() {
        return (hooks.not_found)(ctx.request());
    }
    let actor = match ctx.get_actor(handle).await {
        Ok(Some(actor)) => actor,
        Ok(None) => return (hooks.not_found)(ctx.request()),
        Err(error) => return internal_error(&error),
    };

    if let Some(authorize) = ctx
        .federation
        .actor
        .as_ref()
        .and_then(|entry| entry.authorize.clone())
    {
        let key = ctx.get_signed_key().await.unwrap_or(None);
        let owner = ctx.get_signed_key_owner().await.unwrap_or(None);
        match authorize(ctx.clone(), handle.to_string(), key, owner).await {
            Ok(true) => {}
            Ok(false) => return (hooks.unauthorized)(ctx.request()),
            Err(error) => return internal_error(&error),
        }
    }

    if !accepts_json_ld(ctx.request()) {
        return (hooks.not_acceptable)(ctx.request());
    }
    json_response(&ensure_context(actor), ACTIVITY_JSON)
}

/// GET `{object_path}` — a typed object document
pub(crate) async fn handle_object<T>(
    ctx: &RequestContext<T>,
    type_iri: &str,
    values: std::collections::HashMap<String, String>,
    hooks: &FetchHooks,
) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    let Some(entry) = ctx.federation.objects.get(type_iri) else {
        return (hooks.not_found)(ctx.request());
    };
    let authorize = entry.authorize.clone();

    let object = match ctx.invoke_object_dispatcher(type_iri, values.clone()).await {
        Ok(Some(object)) => object,
        Ok(None) => return (hooks.not_found)(ctx.request()),
        Err(error) => return internal_error(&error),
    };

    if let Some(authorize) = authorize {
        let key = ctx.get_signed_key().await.unwrap_or(None);
        let owner = ctx.get_signed_key_owner().await.unwrap_or(None);
        match authorize(ctx.clone(), values, key, owner).await {
            Ok(true) => {}
            Ok(false) => return (hooks.unauthorized)(ctx.request()),
            Err(error) => return internal_error(&error),
        }
    }

    if !accepts_json_ld(ctx.request()) {
        return (hooks.not_acceptable)(ctx.request());
    }
    json_response(&ensure_context(object), ACTIVITY_JSON)
}

/// Which collection surface a request hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionKind {
    Outbox,
    Following,
    Followers,
}

impl CollectionKind {
    pub(crate) fn route_name(self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Following => "following",
            Self::Followers => "followers",
        }
    }
}

/// GET `{outbox,following,followers}` — collection index or page
pub(crate) async fn handle_collection<T>(
    ctx: &RequestContext<T>,
    kind: CollectionKind,
    handle: &str,
    hooks: &FetchHooks,
) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    let Some(entry) = ctx.federation.collection_entry(kind) else {
        return (hooks.not_found)(ctx.request());
    };

    if let Some(authorize) = entry.authorize.clone() {
        let key = ctx.get_signed_key().await.unwrap_or(None);
        let owner = ctx.get_signed_key_owner().await.unwrap_or(None);
        match authorize(ctx.clone(), handle.to_string(), key, owner).await {
            Ok(true) => {}
            Ok(false) => return (hooks.unauthorized)(ctx.request()),
            Err(error) => return internal_error(&error),
        }
    }

    if !accepts_json_ld(ctx.request()) {
        return (hooks.not_acceptable)(ctx.request());
    }

    let collection_uri = match collection_uri(ctx, kind, handle) {
        Ok(uri) => uri,
        Err(error) => return internal_error(&error),
    };
    let cursor = ctx
        .url()
        .query_pairs()
        .find(|(name, _)| name == "cursor")
        .map(|(_, value)| value.into_owned());

    match cursor {
        None => {
            // Index document: total and first/last links, no items.
            let mut document = json!({
                "@context": ACTIVITY_CONTEXT,
                "id": collection_uri.to_string(),
                "type": "OrderedCollection",
            });
            if let Some(counter) = entry.counter.clone() {
                match counter(ctx.clone(), handle.to_string()).await {
                    Ok(Some(total)) => document["totalItems"] = json!(total),
                    Ok(None) => {}
                    Err(error) => return internal_error(&error),
                }
            }
            if let Some(first_cursor) = entry.first_cursor.clone() {
                match first_cursor(ctx.clone(), handle.to_string()).await {
                    Ok(Some(cursor)) => {
                        document["first"] = json!(page_uri(&collection_uri, &cursor).to_string())
                    }
                    Ok(None) => {}
                    Err(error) => return internal_error(&error),
                }
            }
            if let Some(last_cursor) = entry.last_cursor.clone() {
                match last_cursor(ctx.clone(), handle.to_string()).await {
                    Ok(Some(cursor)) => {
                        document["last"] = json!(page_uri(&collection_uri, &cursor).to_string())
                    }
                    Ok(None) => {}
                    Err(error) => return internal_error(&error),
                }
            }
            json_response(&document, ACTIVITY_JSON)
        }
        Some(cursor) => {
            let page = match (entry.dispatcher)(ctx.clone(), handle.to_string(), cursor.clone())
                .await
            {
                Ok(Some(page)) => page,
                Ok(None) => return (hooks.not_found)(ctx.request()),
                Err(error) => return internal_error(&error),
            };
            let mut document = json!({
                "@context": ACTIVITY_CONTEXT,
                "id": page_uri(&collection_uri, &cursor).to_string(),
                "type": "OrderedCollectionPage",
                "partOf": collection_uri.to_string(),
                "orderedItems": page.items,
            });
            if let Some(next) = page.next_cursor {
                document["next"] = json!(page_uri(&collection_uri, &next).to_string());
            }
            json_response(&document, ACTIVITY_JSON)
        }
    }
}

fn collection_uri<T>(
    ctx: &RequestContext<T>,
    kind: CollectionKind,
    handle: &str,
) -> Result<Url, FederationError>
where
    T: Clone + Send + Sync + 'static,
{
    let uri = match kind {
        CollectionKind::Outbox => ctx.outbox_uri(handle)?,
        CollectionKind::Following => ctx.following_uri(handle)?,
        CollectionKind::Followers => ctx.followers_uri(handle)?,
    };
    Ok(uri)
}

fn page_uri(collection_uri: &Url, cursor: &str) -> Url {
    let mut uri = collection_uri.clone();
    uri.query_pairs_mut().clear().append_pair("cursor", cursor);
    uri
}

/// POST `{inbox_path}` / `{shared_inbox_path}` — activity intake
///
/// `handle` is `None` on the shared inbox.
pub(crate) async fn handle_inbox<T>(
    ctx: &RequestContext<T>,
    handle: Option<&str>,
    hooks: &FetchHooks,
) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    if ctx.request().method() != http::Method::POST {
        return method_not_allowed();
    }
    let Some(registry) = ctx.federation.inbox.as_ref() else {
        return (hooks.not_found)(ctx.request());
    };

    // A personal inbox only exists when its actor does.
    if let Some(handle) = handle {
        if ctx.federation.actor.is_some() {
            match ctx.get_actor(handle).await {
                Ok(Some(_)) => {}
                Ok(None) => return (hooks.not_found)(ctx.request()),
                Err(error) => return internal_error(&error),
            }
        }
    }

    if !is_activity_content_type(ctx.request()) {
        return bad_request("activity must be application/activity+json or application/ld+json");
    }

    let Ok(Some(key)) = ctx.get_signed_key().await else {
        return (hooks.unauthorized)(ctx.request());
    };

    let activity = serde_json::from_slice::<Value>(ctx.request().body())
        .map_err(|e| FederationError::Validation(format!("invalid JSON body: {e}")))
        .and_then(Activity::from_document);
    let activity = match activity {
        Ok(activity) => activity,
        Err(error) => {
            if let Some(on_error) = registry.error_handler.clone() {
                on_error(ctx, &error, None);
            }
            return bad_request("invalid activity");
        }
    };

    // The signer must be the activity's actor.
    let Some(actor_id) = activity.actor_id() else {
        return bad_request("activity has no actor");
    };
    match signature::key_id_matches_actor(key.id.as_str(), actor_id) {
        Ok(true) => {}
        Ok(false) | Err(_) => return (hooks.unauthorized)(ctx.request()),
    }

    // Claim the idempotence key; a lost claim means an earlier POST of the
    // same activity already dispatched (or is dispatching) it.
    if let Some(activity_id) = activity.id() {
        let key = ctx
            .federation
            .kv_prefixes
            .activity_idempotence
            .child(activity_id);
        match ctx
            .federation
            .kv
            .set_if_absent(&key, b"1", Some(IDEMPOTENCE_TTL))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(activity_id, "duplicate activity, skipping dispatch");
                return accepted();
            }
            Err(error) => return internal_error(&error),
        }
    }

    let listener = activity.class().chain().into_iter().find_map(|class| {
        registry
            .listeners
            .iter()
            .find(|(registered, _)| *registered == class)
            .map(|(_, listener)| listener.clone())
    });
    let Some(listener) = listener else {
        tracing::debug!(
            activity_type = activity.class().name(),
            "no inbox listener registered for activity"
        );
        return accepted();
    };

    match listener(ctx.clone(), activity.clone()).await {
        Ok(()) => accepted(),
        Err(error) => {
            tracing::error!(
                activity_type = activity.class().name(),
                error = %error,
                "inbox listener failed"
            );
            if let Some(on_error) = registry.error_handler.clone() {
                on_error(ctx, &error, Some(&activity));
            }
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                false,
            )
        }
    }
}

/// GET `/.well-known/webfinger?resource=…`
pub(crate) async fn handle_webfinger<T>(
    ctx: &RequestContext<T>,
    hooks: &FetchHooks,
) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    let Some(resource) = ctx
        .url()
        .query_pairs()
        .find(|(name, _)| name == "resource")
        .map(|(_, value)| value.into_owned())
    else {
        return bad_request("missing resource parameter");
    };

    let handle = match webfinger::parse_resource(&resource) {
        Ok(ResourceRef::Account { username, domain }) => {
            if domain != ctx.authority() {
                return (hooks.not_found)(ctx.request());
            }
            username
        }
        Ok(ResourceRef::Url(url)) => match ctx.handle_from_actor_uri(&url) {
            Some(handle) => handle,
            None => return (hooks.not_found)(ctx.request()),
        },
        Err(_) => return bad_request("invalid resource parameter"),
    };

    if ctx.federation.actor.is_none() {
        return (hooks.not_found)(ctx.request());
    }
    let actor = match ctx.get_actor(&handle).await {
        Ok(Some(actor)) => actor,
        Ok(None) => return (hooks.not_found)(ctx.request()),
        Err(error) => return internal_error(&error),
    };

    let actor_uri = match ctx.actor_uri(&handle) {
        Ok(uri) => uri,
        Err(error) => return internal_error(&error.into()),
    };
    let profile_url = actor
        .get("url")
        .and_then(|value| match value {
            Value::String(url) => Some(url.as_str()),
            Value::Object(_) => value.get("href").and_then(Value::as_str),
            _ => None,
        });

    let jrd = webfinger::actor_jrd(&handle, &ctx.authority(), &actor_uri, profile_url);
    match serde_json::to_value(&jrd) {
        Ok(document) => json_response(&document, JRD_JSON),
        Err(e) => internal_error(&FederationError::Internal(format!(
            "JRD serialization: {e}"
        ))),
    }
}

/// GET `/.well-known/nodeinfo` — discovery JRD
pub(crate) async fn handle_nodeinfo_jrd<T>(
    ctx: &RequestContext<T>,
    hooks: &FetchHooks,
) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    if ctx.federation.node_info.is_none() {
        return (hooks.not_found)(ctx.request());
    }
    let node_info_uri = match ctx.node_info_uri() {
        Ok(uri) => uri,
        Err(error) => return internal_error(&error.into()),
    };
    json_response(&nodeinfo::discovery_jrd(&node_info_uri), JRD_JSON)
}

/// GET `{node_info_path}` — the schema-validated NodeInfo document
pub(crate) async fn handle_nodeinfo<T>(
    ctx: &RequestContext<T>,
    hooks: &FetchHooks,
) -> HttpResponse
where
    T: Clone + Send + Sync + 'static,
{
    let Some(dispatcher) = ctx.federation.node_info.clone() else {
        return (hooks.not_found)(ctx.request());
    };
    let info = match dispatcher(ctx.clone()).await {
        Ok(info) => info,
        Err(error) => return internal_error(&error),
    };
    match info.to_document() {
        Ok(document) => json_response(&document, "application/json"),
        Err(error) => internal_error(&error),
    }
}
