//! JSON-LD document loading
//!
//! Remote actors, keys and objects all arrive through a `DocumentLoader`.
//! The default stack is a plain fetch loader wrapped in a KV cache under
//! the registry's `remote_document` prefix; per-actor authenticated
//! loaders sign their GETs so locked-down servers answer them.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{FederationError, Result};
use crate::kv::{KvKey, KvStore};
use crate::signature;

const ACCEPT_DOCUMENT: &str = "application/activity+json, \
     application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// A fetched JSON-LD document
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    /// URL of a remote context, when the server pointed at one
    pub context_url: Option<String>,
    /// Final URL the document was served from
    pub document_url: String,
    pub document: Value,
}

/// Source of remote JSON-LD documents
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<RemoteDocument>;
}

fn blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_unspecified()
                || v6.is_multicast()
        }
    }
}

/// Refuse URLs a federated peer has no business fetching
pub(crate) fn validate_remote_url(url: &Url) -> Result<()> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(FederationError::Validation(
            "remote documents must use http or https".to_string(),
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| FederationError::Validation("remote URL has no host".to_string()))?
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if host == "localhost" || host.ends_with(".localhost") {
        return Err(FederationError::Validation(
            "remote URL host is not allowed".to_string(),
        ));
    }
    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        if blocked_ip(ip) {
            return Err(FederationError::Validation(
                "remote URL host is not allowed".to_string(),
            ));
        }
    }
    Ok(())
}

async fn decode_response(response: reqwest::Response) -> Result<RemoteDocument> {
    if !response.status().is_success() {
        return Err(FederationError::DocumentLoader(format!(
            "{} answered HTTP {}",
            response.url(),
            response.status()
        )));
    }
    let document_url = response.url().to_string();
    let document = response
        .json::<Value>()
        .await
        .map_err(|e| FederationError::DocumentLoader(format!("undecodable document: {e}")))?;
    Ok(RemoteDocument {
        context_url: None,
        document_url,
        document,
    })
}

/// Unauthenticated fetch loader
#[derive(Clone)]
pub struct FetchDocumentLoader {
    client: reqwest::Client,
}

impl FetchDocumentLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentLoader for FetchDocumentLoader {
    async fn load(&self, url: &str) -> Result<RemoteDocument> {
        let parsed = Url::parse(url)
            .map_err(|_| FederationError::Validation(format!("invalid document URL: {url}")))?;
        validate_remote_url(&parsed)?;

        let response = self
            .client
            .get(parsed)
            .header("Accept", ACCEPT_DOCUMENT)
            .send()
            .await
            .map_err(|e| FederationError::DocumentLoader(format!("fetch of {url} failed: {e}")))?;
        decode_response(response).await
    }
}

/// Loader bound to a key pair; its GETs carry an HTTP signature
pub struct AuthenticatedDocumentLoader {
    client: reqwest::Client,
    key_id: Url,
    private_key_pem: String,
}

impl AuthenticatedDocumentLoader {
    pub fn new(client: reqwest::Client, key_id: Url, private_key_pem: String) -> Self {
        Self {
            client,
            key_id,
            private_key_pem,
        }
    }
}

#[async_trait]
impl DocumentLoader for AuthenticatedDocumentLoader {
    async fn load(&self, url: &str) -> Result<RemoteDocument> {
        let parsed = Url::parse(url)
            .map_err(|_| FederationError::Validation(format!("invalid document URL: {url}")))?;
        validate_remote_url(&parsed)?;

        let signed = signature::sign_request(
            "GET",
            &parsed,
            None,
            &self.private_key_pem,
            self.key_id.as_str(),
        )?;
        let response = self
            .client
            .get(parsed)
            .header("Accept", ACCEPT_DOCUMENT)
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .send()
            .await
            .map_err(|e| FederationError::DocumentLoader(format!("fetch of {url} failed: {e}")))?;
        decode_response(response).await
    }
}

/// Cached document entry, as persisted under the `remote_document` prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedDocument {
    document: Value,
    context_url: Option<String>,
    document_url: String,
    expires_at: DateTime<Utc>,
}

/// KV cache in front of another loader
pub struct KvCachedDocumentLoader {
    inner: Arc<dyn DocumentLoader>,
    kv: Arc<dyn KvStore>,
    prefix: KvKey,
    ttl: Duration,
}

impl KvCachedDocumentLoader {
    pub fn new(
        inner: Arc<dyn DocumentLoader>,
        kv: Arc<dyn KvStore>,
        prefix: KvKey,
        ttl: Duration,
    ) -> Self {
        Self {
            inner,
            kv,
            prefix,
            ttl,
        }
    }
}

#[async_trait]
impl DocumentLoader for KvCachedDocumentLoader {
    async fn load(&self, url: &str) -> Result<RemoteDocument> {
        let key = self.prefix.child(url);

        if let Some(bytes) = self.kv.get(&key).await? {
            match serde_json::from_slice::<CachedDocument>(&bytes) {
                Ok(cached) if cached.expires_at > Utc::now() => {
                    tracing::debug!(%url, "remote document cache hit");
                    return Ok(RemoteDocument {
                        context_url: cached.context_url,
                        document_url: cached.document_url,
                        document: cached.document,
                    });
                }
                Ok(_) => tracing::debug!(%url, "remote document cache expired"),
                Err(e) => tracing::warn!(%url, "discarding undecodable cache entry: {e}"),
            }
        }

        let fresh = self.inner.load(url).await?;
        let entry = CachedDocument {
            document: fresh.document.clone(),
            context_url: fresh.context_url.clone(),
            document_url: fresh.document_url.clone(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(1)),
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| FederationError::Internal(format!("cache entry serialization: {e}")))?;
        self.kv.set(&key, &bytes, Some(self.ttl)).await?;
        Ok(fresh)
    }
}
