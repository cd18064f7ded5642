//! Common test utilities for the end-to-end tests
//!
//! Builds a real `Federation` with in-memory backends, a canned remote
//! actor whose documents resolve through a static loader, and serves the
//! whole thing on a random local port the way a host application would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::{pkcs1v15, RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use url::Url;

use fedistry::loader::{DocumentLoader, RemoteDocument};
use fedistry::{
    ActivityClass, CollectionPage, Federation, FederationOptions, FederationError, InProcessQueue,
    KeyPair, MemoryKvStore, NodeInfo, NodeInfoSoftware, NodeInfoUsage, NodeInfoUsers, ObjectClass,
};

/// One PEM key pair per process; 2048-bit keygen is too slow per test.
pub fn test_keypair() -> &'static (String, String) {
    static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();
    KEYPAIR.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        let public_key = RsaPublicKey::from(&private_key);
        (
            private_key
                .to_pkcs8_pem(LineEnding::LF)
                .expect("pem")
                .to_string(),
            public_key.to_public_key_pem(LineEnding::LF).expect("pem"),
        )
    })
}

/// Second key pair, for the remote peer
pub fn remote_keypair() -> &'static (String, String) {
    static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();
    KEYPAIR.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        let public_key = RsaPublicKey::from(&private_key);
        (
            private_key
                .to_pkcs8_pem(LineEnding::LF)
                .expect("pem")
                .to_string(),
            public_key.to_public_key_pem(LineEnding::LF).expect("pem"),
        )
    })
}

pub const REMOTE_ACTOR: &str = "https://remote.example/users/alice";

/// Loader answering from a fixed document set; counts loads per URL
pub struct StaticLoader {
    documents: Mutex<HashMap<String, Value>>,
    pub loads: AtomicUsize,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, url: &str, document: Value) {
        self.documents
            .lock()
            .expect("documents lock")
            .insert(url.to_string(), document);
    }
}

#[async_trait]
impl DocumentLoader for StaticLoader {
    async fn load(&self, url: &str) -> Result<RemoteDocument, FederationError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let documents = self.documents.lock().expect("documents lock");
        documents
            .get(url)
            .cloned()
            .map(|document| RemoteDocument {
                context_url: None,
                document_url: url.to_string(),
                document,
            })
            .ok_or_else(|| FederationError::DocumentLoader(format!("no such document: {url}")))
    }
}

/// The remote peer's actor document, key included
pub fn remote_actor_document() -> Value {
    let (_, public_pem) = remote_keypair();
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "type": "Person",
        "id": REMOTE_ACTOR,
        "preferredUsername": "alice",
        "inbox": format!("{REMOTE_ACTOR}/inbox"),
        "publicKey": {
            "id": format!("{REMOTE_ACTOR}#main-key"),
            "owner": REMOTE_ACTOR,
            "publicKeyPem": public_pem,
        },
    })
}

/// What the inbox listener observed
#[derive(Default)]
pub struct ListenerState {
    pub calls: AtomicUsize,
    /// keyId seen by two successive `get_signed_key` calls in the listener
    pub signed_key_ids: Mutex<Vec<(Option<String>, Option<String>)>>,
}

/// A federation served over real HTTP on a random port
pub struct TestServer {
    pub addr: String,
    pub federation: Arc<Federation<()>>,
    pub client: reqwest::Client,
    pub loader: Arc<StaticLoader>,
    pub listener_state: Arc<ListenerState>,
}

impl TestServer {
    pub async fn new() -> Self {
        init_tracing();

        let loader = Arc::new(StaticLoader::new());
        loader.insert(REMOTE_ACTOR, remote_actor_document());

        let mut options = FederationOptions::new(Arc::new(MemoryKvStore::new()));
        options.queue = Some(Arc::new(InProcessQueue::new()));
        options.document_loader = Some(loader.clone());
        // Authenticated loaders must resolve the same canned documents.
        let static_loader = loader.clone();
        options.authenticated_loader_factory = Some(Arc::new(move |_key_id, _private_key_pem| {
            static_loader.clone() as Arc<dyn DocumentLoader>
        }));
        let mut federation: Federation<()> = Federation::new(options);

        let (private_pem, public_pem) = test_keypair().clone();
        federation
            .set_actor_dispatcher("/users/{handle}", |ctx, handle, key| async move {
                if handle != "john" {
                    return Ok(None);
                }
                let actor_uri = ctx.actor_uri(&handle)?;
                let mut actor = json!({
                    "@context": [
                        "https://www.w3.org/ns/activitystreams",
                        "https://w3id.org/security/v1",
                    ],
                    "type": "Person",
                    "id": actor_uri.to_string(),
                    "preferredUsername": handle,
                    "inbox": ctx.inbox_uri(Some(&handle))?.to_string(),
                    "outbox": ctx.outbox_uri(&handle)?.to_string(),
                    "url": actor_uri.to_string(),
                });
                if let Some(key) = key {
                    actor["publicKey"] = json!({
                        "id": key.id.to_string(),
                        "owner": key.owner.to_string(),
                        "publicKeyPem": key.public_key_pem,
                    });
                }
                Ok(Some(actor))
            })
            .expect("actor dispatcher registers")
            .set_key_pair_dispatcher(move |_data, handle| {
                let pair = KeyPair {
                    private_key_pem: private_pem.clone(),
                    public_key_pem: public_pem.clone(),
                };
                async move {
                    if handle == "john" {
                        Ok(Some(pair))
                    } else {
                        Ok(None)
                    }
                }
            });

        federation
            .set_object_dispatcher(
                ObjectClass::NOTE,
                "/users/{handle}/notes/{id}",
                |ctx, values| async move {
                    if values.get("handle").map(String::as_str) != Some("john") {
                        return Ok(None);
                    }
                    let id = values.get("id").cloned().unwrap_or_default();
                    if id == "missing" {
                        return Ok(None);
                    }
                    Ok(Some(json!({
                        "type": "Note",
                        "id": ctx.url().to_string(),
                        "content": format!("note {id}"),
                    })))
                },
            )
            .expect("object dispatcher registers");

        federation
            .set_outbox_dispatcher("/users/{handle}/outbox", |_ctx, _handle, cursor| async move {
                match cursor.as_str() {
                    "0" => Ok(Some(CollectionPage {
                        items: vec![
                            json!({"type": "Create", "id": "https://local.test/a1"}),
                            json!({"type": "Create", "id": "https://local.test/a2"}),
                        ],
                        next_cursor: Some("2".to_string()),
                    })),
                    "2" => Ok(Some(CollectionPage {
                        items: vec![json!({"type": "Create", "id": "https://local.test/a3"})],
                        next_cursor: None,
                    })),
                    _ => Ok(None),
                }
            })
            .expect("outbox dispatcher registers")
            .set_counter(|_ctx, _handle| async { Ok(Some(3)) })
            .set_first_cursor(|_ctx, _handle| async { Ok(Some("0".to_string())) })
            .set_last_cursor(|_ctx, _handle| async { Ok(Some("2".to_string())) });

        let listener_state = Arc::new(ListenerState::default());
        let state = listener_state.clone();
        federation
            .set_inbox_listeners("/users/{handle}/inbox", Some("/inbox"))
            .expect("inbox listeners register")
            .on(ActivityClass::Create, move |ctx, _activity| {
                let state = state.clone();
                async move {
                    state.calls.fetch_add(1, Ordering::SeqCst);
                    let first = ctx.get_signed_key().await?.map(|k| k.id.to_string());
                    let second = ctx.get_signed_key().await?.map(|k| k.id.to_string());
                    state
                        .signed_key_ids
                        .lock()
                        .expect("signed key lock")
                        .push((first, second));
                    Ok(())
                }
            })
            .expect("Create listener registers");

        federation
            .set_node_info_dispatcher("/nodeinfo/2.1", |_ctx| async {
                Ok(NodeInfo {
                    software: NodeInfoSoftware {
                        name: "fedistry-test".to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        repository: None,
                    },
                    protocols: vec!["activitypub".to_string()],
                    usage: NodeInfoUsage {
                        users: NodeInfoUsers {
                            total: Some(1),
                            ..Default::default()
                        },
                        local_posts: Some(0),
                        local_comments: None,
                    },
                    open_registrations: false,
                })
            })
            .expect("nodeinfo dispatcher registers");

        let federation = Arc::new(federation);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = format!("http://{}", listener.local_addr().expect("local addr"));
        let app = federation.clone().into_router(());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("client");

        Self {
            addr,
            federation,
            client,
            loader,
            listener_state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// POST a signed activity to a local inbox, as the remote peer
    pub async fn post_signed_activity(&self, path: &str, activity: &Value) -> reqwest::Response {
        let (private_pem, _) = remote_keypair();
        let body = serde_json::to_vec(activity).expect("body");
        let url = Url::parse(&self.url(path)).expect("url");
        let headers = sign_for_test(
            "POST",
            &url,
            &body,
            private_pem,
            &format!("{REMOTE_ACTOR}#main-key"),
        );

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/activity+json")
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        request.send().await.expect("inbox POST")
    }
}

/// Sign a request the way a remote cavage implementation would
pub fn sign_for_test(
    method: &str,
    url: &Url,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> Vec<(&'static str, String)> {
    let host = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().expect("host")),
        None => url.host_str().expect("host").to_string(),
    };
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = {
        let mut hasher = Sha256::new();
        hasher.update(body);
        format!("SHA-256={}", BASE64.encode(hasher.finalize()))
    };
    let signing_string = format!(
        "(request-target): {} {}\nhost: {}\ndate: {}\ndigest: {}",
        method.to_lowercase(),
        url.path(),
        host,
        date,
        digest,
    );

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).expect("private key");
    let signing_key = pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date digest\",signature=\"{}\"",
        BASE64.encode(signature.to_bytes()),
    );

    vec![
        ("Host", host),
        ("Date", date),
        ("Digest", digest),
        ("Signature", signature_header),
    ]
}

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedistry=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
