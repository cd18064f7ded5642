//! Context values handed to dispatchers and listeners
//!
//! A `Context` carries the host's data, the canonical origin, and the
//! reverse-URL builders; a `RequestContext` adds the inbound request,
//! dispatcher access with a re-entrancy warning, and lazily verified,
//! memoized signature material.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use url::Url;

use crate::activity::{Activity, ObjectClass};
use crate::error::{FederationError, Result, RouterError};
use crate::federation::Federation;
use crate::loader::DocumentLoader;
use crate::send::SendActivityOptions;
use crate::signature;

/// PEM key pair of a local actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

/// A public key together with its id and owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptographicKey {
    /// Key URL, usually `<actor>#main-key`
    pub id: Url,
    /// URL of the actor document owning the key
    pub owner: Url,
    pub public_key_pem: String,
}

/// Identity an activity is sent as
#[derive(Debug, Clone)]
pub enum SenderKey {
    /// A local handle; resolved through the key-pair dispatcher
    Handle(String),
    /// Explicit key material
    KeyPair {
        key_id: Url,
        private_key_pem: String,
    },
}

impl From<&str> for SenderKey {
    fn from(handle: &str) -> Self {
        Self::Handle(handle.to_string())
    }
}

/// Registry-backed context for building URLs and sending activities
pub struct Context<T> {
    pub(crate) federation: Arc<Federation<T>>,
    pub(crate) origin: Url,
    pub(crate) data: T,
    pub(crate) document_loader: Arc<dyn DocumentLoader>,
}

impl<T: Clone> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            federation: self.federation.clone(),
            origin: self.origin.clone(),
            data: self.data.clone(),
            document_loader: self.document_loader.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Context<T> {
    pub(crate) fn new(
        federation: Arc<Federation<T>>,
        origin: Url,
        data: T,
        document_loader: Arc<dyn DocumentLoader>,
    ) -> Self {
        Self {
            federation,
            origin,
            data,
            document_loader,
        }
    }

    /// The host's per-request data
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Canonical origin of this federation host
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Hostname serving federation
    pub fn host(&self) -> &str {
        self.origin.host_str().unwrap_or_default()
    }

    /// Host with its explicit port, as used in `acct:` addresses
    pub fn authority(&self) -> String {
        match self.origin.port() {
            Some(port) => format!("{}:{port}", self.host()),
            None => self.host().to_string(),
        }
    }

    /// The effective document loader
    pub fn document_loader(&self) -> &Arc<dyn DocumentLoader> {
        &self.document_loader
    }

    fn build_uri(
        &self,
        name: &str,
        surface: &'static str,
        values: &HashMap<String, String>,
    ) -> std::result::Result<Url, RouterError> {
        if !self.federation.router.has(name) {
            return Err(RouterError::NotRegistered(surface));
        }
        let path = self
            .federation
            .router
            .build(name, values)
            .ok_or_else(|| RouterError::BuildFailed {
                route: name.to_string(),
            })?;
        self.origin
            .join(&path)
            .map_err(|_| RouterError::BuildFailed {
                route: name.to_string(),
            })
    }

    fn handle_values(handle: &str) -> HashMap<String, String> {
        HashMap::from([("handle".to_string(), handle.to_string())])
    }

    pub fn node_info_uri(&self) -> std::result::Result<Url, RouterError> {
        self.build_uri("nodeinfo", "NodeInfo", &HashMap::new())
    }

    pub fn actor_uri(&self, handle: &str) -> std::result::Result<Url, RouterError> {
        self.build_uri("actor", "actor", &Self::handle_values(handle))
    }

    pub fn object_uri(
        &self,
        class: ObjectClass,
        values: &HashMap<String, String>,
    ) -> std::result::Result<Url, RouterError> {
        let name = format!("object:{}", class.type_iri());
        if !self.federation.router.has(&name) {
            return Err(RouterError::NotRegistered("object"));
        }
        let path = self
            .federation
            .router
            .build(&name, values)
            .ok_or_else(|| RouterError::BuildFailed { route: name.clone() })?;
        self.origin
            .join(&path)
            .map_err(|_| RouterError::BuildFailed { route: name })
    }

    pub fn outbox_uri(&self, handle: &str) -> std::result::Result<Url, RouterError> {
        self.build_uri("outbox", "outbox", &Self::handle_values(handle))
    }

    /// Inbox URL of a handle, or the shared inbox when `handle` is `None`
    pub fn inbox_uri(&self, handle: Option<&str>) -> std::result::Result<Url, RouterError> {
        match handle {
            Some(handle) => self.build_uri("inbox", "inbox", &Self::handle_values(handle)),
            None => self.build_uri("shared_inbox", "shared inbox", &HashMap::new()),
        }
    }

    pub fn following_uri(&self, handle: &str) -> std::result::Result<Url, RouterError> {
        self.build_uri("following", "following", &Self::handle_values(handle))
    }

    pub fn followers_uri(&self, handle: &str) -> std::result::Result<Url, RouterError> {
        self.build_uri("followers", "followers", &Self::handle_values(handle))
    }

    /// Recover the handle from an actor URL minted by this registry
    ///
    /// Answers `None` for foreign origins and for local paths that are not
    /// the actor route.
    pub fn handle_from_actor_uri(&self, url: &Url) -> Option<String> {
        let same_origin = url.scheme() == self.origin.scheme()
            && url.host_str() == self.origin.host_str()
            && url.port_or_known_default() == self.origin.port_or_known_default();
        if !same_origin {
            return None;
        }
        let matched = self.federation.router.route(url.path())?;
        if matched.name != "actor" {
            return None;
        }
        matched.values.get("handle").cloned()
    }

    /// Public key of a local actor, from the key-pair dispatcher
    ///
    /// `None` when no key-pair dispatcher is registered or the dispatcher
    /// does not know the handle.
    pub async fn actor_key(&self, handle: &str) -> Result<Option<CryptographicKey>> {
        let Some(dispatcher) = self
            .federation
            .actor
            .as_ref()
            .and_then(|entry| entry.key_pair_dispatcher.clone())
        else {
            return Ok(None);
        };
        let Some(pair) = dispatcher(self.data.clone(), handle.to_string()).await? else {
            return Ok(None);
        };

        let owner = self.actor_uri(handle)?;
        let mut id = owner.clone();
        id.set_fragment(Some("main-key"));
        Ok(Some(CryptographicKey {
            id,
            owner,
            public_key_pem: pair.public_key_pem,
        }))
    }

    /// Resolve a sender identity to concrete signing material
    pub(crate) async fn resolve_sender(&self, sender: &SenderKey) -> Result<(Url, String)> {
        match sender {
            SenderKey::KeyPair {
                key_id,
                private_key_pem,
            } => Ok((key_id.clone(), private_key_pem.clone())),
            SenderKey::Handle(handle) => {
                let Some(dispatcher) = self
                    .federation
                    .actor
                    .as_ref()
                    .and_then(|entry| entry.key_pair_dispatcher.clone())
                else {
                    return Err(RouterError::NotRegistered("key pair").into());
                };
                let pair = dispatcher(self.data.clone(), handle.clone())
                    .await?
                    .ok_or_else(|| {
                        FederationError::Validation(format!("no key pair found for handle {handle:?}"))
                    })?;
                let mut key_id = self.actor_uri(handle)?;
                key_id.set_fragment(Some("main-key"));
                Ok((key_id, pair.private_key_pem))
            }
        }
    }

    /// Document loader authenticated as the given identity
    pub async fn authenticated_document_loader(
        &self,
        identity: &SenderKey,
    ) -> Result<Arc<dyn DocumentLoader>> {
        let (key_id, private_key_pem) = self.resolve_sender(identity).await?;
        Ok((self.federation.authenticated_loader_factory)(
            key_id,
            private_key_pem,
        ))
    }

    /// Send an activity to the recipients' inboxes as the given sender
    ///
    /// Delegates to the registry after resolving handle senders to their
    /// key material.
    pub async fn send_activity(
        &self,
        sender: &SenderKey,
        recipients: &[Value],
        activity: Activity,
        options: SendActivityOptions,
    ) -> Result<()> {
        let (key_id, private_key_pem) = self.resolve_sender(sender).await?;
        self.federation
            .send_activity(&key_id, &private_key_pem, recipients, activity, options)
            .await
    }
}

/// Three-state memo cell: distinct states for "not yet computed" and
/// "computed as absent".
enum Memo<V> {
    Unresolved,
    Absent,
    Present(V),
}

/// Context of one inbound request
pub struct RequestContext<T> {
    context: Context<T>,
    request: Arc<http::Request<Bytes>>,
    url: Url,
    signed_key: Arc<Mutex<Memo<CryptographicKey>>>,
    signed_key_owner: Arc<Mutex<Memo<Value>>>,
    inside_actor_dispatch: bool,
    inside_object_dispatch: bool,
}

impl<T: Clone> Clone for RequestContext<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            request: self.request.clone(),
            url: self.url.clone(),
            signed_key: self.signed_key.clone(),
            signed_key_owner: self.signed_key_owner.clone(),
            inside_actor_dispatch: self.inside_actor_dispatch,
            inside_object_dispatch: self.inside_object_dispatch,
        }
    }
}

impl<T> std::ops::Deref for RequestContext<T> {
    type Target = Context<T>;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl<T: Clone + Send + Sync + 'static> RequestContext<T> {
    pub(crate) fn new(context: Context<T>, request: Arc<http::Request<Bytes>>, url: Url) -> Self {
        Self {
            context,
            request,
            url,
            signed_key: Arc::new(Mutex::new(Memo::Unresolved)),
            signed_key_owner: Arc::new(Mutex::new(Memo::Unresolved)),
            inside_actor_dispatch: false,
            inside_object_dispatch: false,
        }
    }

    /// Swap the document loader, keeping the memoized signature state
    pub(crate) fn with_document_loader(mut self, loader: Arc<dyn DocumentLoader>) -> Self {
        self.context.document_loader = loader;
        self
    }

    /// The inbound request
    pub fn request(&self) -> &http::Request<Bytes> {
        &self.request
    }

    /// The request URL, absolute against the canonical origin
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Invoke the actor dispatcher for a handle
    ///
    /// Calling this from inside an actor dispatcher logs a recursion
    /// warning; the call still proceeds.
    pub async fn get_actor(&self, handle: &str) -> Result<Option<Value>> {
        let entry = self
            .context
            .federation
            .actor
            .as_ref()
            .ok_or(RouterError::NotRegistered("actor"))?;
        if self.inside_actor_dispatch {
            tracing::warn!(
                handle,
                "get_actor called from inside an actor dispatcher; this recursion does not terminate on its own"
            );
        }
        let key = self.actor_key(handle).await?;
        let mut reentrant = self.clone();
        reentrant.inside_actor_dispatch = true;
        (entry.dispatcher)(reentrant, handle.to_string(), key).await
    }

    /// Invoke the object dispatcher registered for a class
    ///
    /// `values` must provide every template variable the object path
    /// declares.
    pub async fn get_object(
        &self,
        class: ObjectClass,
        values: &HashMap<String, String>,
    ) -> Result<Option<Value>> {
        let entry = self
            .context
            .federation
            .objects
            .get(class.type_iri())
            .ok_or(RouterError::NotRegistered("object"))?;
        for parameter in &entry.parameters {
            if !values.contains_key(parameter) {
                return Err(FederationError::Validation(format!(
                    "missing object parameter {{{parameter}}} for {}",
                    class.name()
                )));
            }
        }
        self.invoke_object_dispatcher(class.type_iri(), values.clone())
            .await
    }

    /// Dispatcher invocation shared by `get_object` and the HTTP handler;
    /// the callee's context carries the re-entrancy marker.
    pub(crate) async fn invoke_object_dispatcher(
        &self,
        type_iri: &str,
        values: HashMap<String, String>,
    ) -> Result<Option<Value>> {
        let entry = self
            .context
            .federation
            .objects
            .get(type_iri)
            .ok_or(RouterError::NotRegistered("object"))?;
        if self.inside_object_dispatch {
            tracing::warn!(
                type_iri,
                "get_object called from inside an object dispatcher; this recursion does not terminate on its own"
            );
        }
        let mut reentrant = self.clone();
        reentrant.inside_object_dispatch = true;
        (entry.dispatcher)(reentrant, values).await
    }

    /// The verified key that signed this request, if any
    ///
    /// Verification runs once per request; later calls return the
    /// memoized value, including the memoized absence.
    pub async fn get_signed_key(&self) -> Result<Option<CryptographicKey>> {
        let mut cell = self.signed_key.lock().await;
        match &*cell {
            Memo::Absent => return Ok(None),
            Memo::Present(key) => return Ok(Some(key.clone())),
            Memo::Unresolved => {}
        }

        let resolved = self.verify_request_signature().await;
        *cell = match &resolved {
            Some(key) => Memo::Present(key.clone()),
            None => Memo::Absent,
        };
        Ok(resolved)
    }

    /// The actor document owning the signed key, if any
    ///
    /// Depends only on `get_signed_key`; memoized the same way.
    pub async fn get_signed_key_owner(&self) -> Result<Option<Value>> {
        {
            let cell = self.signed_key_owner.lock().await;
            match &*cell {
                Memo::Absent => return Ok(None),
                Memo::Present(owner) => return Ok(Some(owner.clone())),
                Memo::Unresolved => {}
            }
        }

        let owner = match self.get_signed_key().await? {
            None => None,
            Some(key) => match self.context.document_loader.load(key.owner.as_str()).await {
                Ok(remote) => Some(remote.document),
                Err(e) => {
                    tracing::debug!("could not load signed key owner: {e}");
                    None
                }
            },
        };

        let mut cell = self.signed_key_owner.lock().await;
        *cell = match &owner {
            Some(owner) => Memo::Present(owner.clone()),
            None => Memo::Absent,
        };
        Ok(owner)
    }

    async fn verify_request_signature(&self) -> Option<CryptographicKey> {
        let headers = self.request.headers();
        let header = headers.get("signature")?.to_str().ok()?;
        let parsed = match signature::parse_signature_header(header) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("unusable Signature header: {e}");
                return None;
            }
        };

        // The key document lives at the keyId minus its fragment.
        let key_url = signature::parse_actor_url(&parsed.key_id).ok()?;
        let remote = match self.context.document_loader.load(key_url.as_str()).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::debug!(key_id = %parsed.key_id, "could not load key document: {e}");
                return None;
            }
        };
        let (owner, public_key_pem) = extract_public_key(&remote.document, &parsed.key_id)?;

        let body = self.request.body();
        let body = (!body.is_empty()).then(|| body.as_ref());
        let target = match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        };
        if let Err(e) = signature::verify_signature(
            self.request.method().as_str(),
            &target,
            headers,
            body,
            &public_key_pem,
        ) {
            tracing::debug!("signature verification failed: {e}");
            return None;
        }

        Some(CryptographicKey {
            id: Url::parse(&parsed.key_id).ok()?,
            owner,
            public_key_pem,
        })
    }
}

/// Pull the matching public key out of a key or actor document
fn extract_public_key(document: &Value, key_id: &str) -> Option<(Url, String)> {
    let candidates: Vec<&Value> = match document.get("publicKey") {
        Some(Value::Array(keys)) => keys.iter().collect(),
        Some(key) => vec![key],
        None => vec![document],
    };

    let chosen = candidates
        .iter()
        .find(|key| key.get("id").and_then(Value::as_str) == Some(key_id))
        .or_else(|| candidates.first())?;

    let pem = chosen.get("publicKeyPem").and_then(Value::as_str)?;
    let owner = chosen
        .get("owner")
        .and_then(Value::as_str)
        .or_else(|| document.get("id").and_then(Value::as_str))?;
    Some((Url::parse(owner).ok()?, pem.to_string()))
}
