//! HTTP Signatures (cavage draft)
//!
//! Signs outbound requests and verifies inbound ones over
//! `(request-target) host date [digest]` with rsa-sha256, the profile
//! Mastodon-compatible servers interoperate on.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{pkcs1v15, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use url::Url;

use crate::error::FederationError;

/// Headers that must be covered by every accepted signature.
const REQUIRED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// Maximum tolerated clock skew on the signed Date header.
const MAX_DATE_SKEW_SECONDS: i64 = 300;

/// Header values produced for a signed outbound request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// `Signature` header value
    pub signature: String,
    /// `Date` header value (RFC 2822)
    pub date: String,
    /// `Digest` header value when the request has a body
    pub digest: Option<String>,
}

/// Sign an outbound request
///
/// Builds the cavage signing string over `(request-target)`, `host`,
/// `date` and, when a body is present, `digest`, and signs it with
/// rsa-sha256. `key_id` should point at the sender's `#main-key`.
///
/// # Errors
/// `FederationError::Signature` when the key does not parse;
/// `FederationError::Validation` when the target URL is unusable.
pub fn sign_request(
    method: &str,
    url: &Url,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignedHeaders, FederationError> {
    let host = url
        .host_str()
        .ok_or_else(|| FederationError::Validation("request URL has no host".to_string()))?;
    // Non-default ports are part of the Host header and must be signed.
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let request_target = match url.query() {
        Some(query) => format!("{} {}?{}", method.to_lowercase(), url.path(), query),
        None => format!("{} {}", method.to_lowercase(), url.path()),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let mut covered = vec![
        format!("(request-target): {request_target}"),
        format!("host: {host}"),
        format!("date: {date}"),
    ];
    let mut header_names = REQUIRED_HEADERS.to_vec();
    if let Some(ref digest) = digest {
        covered.push(format!("digest: {digest}"));
        header_names.push("digest");
    }
    let signing_string = covered.join("\n");

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| FederationError::Signature(format!("invalid private key: {e}")))?;
    let signing_key = pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        header_names.join(" "),
        BASE64.encode(signature.to_bytes())
    );

    Ok(SignedHeaders {
        signature,
        date,
        digest,
    })
}

/// SHA-256 body digest in `SHA-256=<base64>` form
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

/// Parsed `Signature` header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// URL of the public key, usually `<actor>#main-key`
    pub key_id: String,
    pub algorithm: String,
    /// Names of the covered headers, lowercased
    pub headers: Vec<String>,
    /// Base64 signature bytes
    pub signature: String,
}

/// Parse a `Signature: keyId="…",algorithm="…",headers="…",signature="…"` header
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, FederationError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match name.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|h| h.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    let missing = |field| move || FederationError::Signature(format!("missing {field}"));
    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(missing("keyId"))?,
        algorithm: algorithm.ok_or_else(missing("algorithm"))?,
        headers: headers.ok_or_else(missing("headers"))?,
        signature: signature.ok_or_else(missing("signature"))?,
    })
}

fn algorithm_is_supported(algorithm: &str) -> bool {
    // hs2019 is an opaque token; we still verify as rsa-sha256.
    algorithm.eq_ignore_ascii_case("rsa-sha256") || algorithm.eq_ignore_ascii_case("hs2019")
}

fn header_value<'a>(
    headers: &'a http::HeaderMap,
    name: &str,
) -> Result<&'a str, FederationError> {
    headers
        .get(name)
        .ok_or_else(|| FederationError::Signature(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| FederationError::Signature(format!("invalid {name} header")))
}

/// Verify an inbound request signature against a known public key
///
/// Checks, in order: the algorithm token, coverage of the required
/// headers, Date skew, body digest, and finally the RSA signature over
/// the reconstructed signing string.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), FederationError> {
    let parsed = parse_signature_header(header_value(headers, "signature")?)?;

    if !algorithm_is_supported(&parsed.algorithm) {
        return Err(FederationError::Signature(format!(
            "unsupported algorithm: {}",
            parsed.algorithm
        )));
    }
    let covered: HashSet<&str> = parsed.headers.iter().map(String::as_str).collect();
    for required in REQUIRED_HEADERS {
        if !covered.contains(required) {
            return Err(FederationError::Signature(format!(
                "signature must cover the {required} header"
            )));
        }
    }

    let date = DateTime::parse_from_rfc2822(header_value(headers, "date")?)
        .map_err(|_| FederationError::Signature("invalid Date header".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECONDS {
        return Err(FederationError::Signature(
            "Date header too old or in the future".to_string(),
        ));
    }

    if let Some(body) = body {
        if !covered.contains("digest") {
            return Err(FederationError::Signature(
                "signature must cover the digest header for requests with a body".to_string(),
            ));
        }
        if header_value(headers, "digest")? != generate_digest(body) {
            return Err(FederationError::Signature("digest mismatch".to_string()));
        }
    }

    let mut covered_lines = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let line = match name.as_str() {
            "(request-target)" => {
                format!("(request-target): {} {}", method.to_lowercase(), path)
            }
            "host" | "date" | "digest" => format!("{name}: {}", header_value(headers, name)?),
            other => {
                return Err(FederationError::Signature(format!(
                    "unsupported covered header: {other}"
                )))
            }
        };
        covered_lines.push(line);
    }
    let signing_string = covered_lines.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| FederationError::Signature("invalid signature encoding".to_string()))?;
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| FederationError::Signature(format!("invalid public key: {e}")))?;
    let verifying_key = pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature = pkcs1v15::Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| FederationError::Signature(format!("invalid signature format: {e}")))?;

    verifying_key
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| FederationError::Signature("signature verification failed".to_string()))
}

/// Reduce a keyId or actor reference to its actor document URL
pub(crate) fn parse_actor_url(raw: &str) -> Result<Url, FederationError> {
    let mut url = Url::parse(raw)
        .map_err(|_| FederationError::Validation("invalid actor URL".to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(FederationError::Validation(
            "actor URL must use http or https".to_string(),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(FederationError::Validation(
            "actor URL must not include user info".to_string(),
        ));
    }
    if url.host_str().is_none() {
        return Err(FederationError::Validation(
            "actor URL must include a host".to_string(),
        ));
    }
    url.set_fragment(None);
    Ok(url)
}

/// Whether the signature's keyId designates the activity's actor document
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> Result<bool, FederationError> {
    Ok(parse_actor_url(key_id)? == parse_actor_url(actor_id)?)
}

/// PEM key pair for tests; 2048-bit keygen is slow, call sparingly.
#[cfg(test)]
pub(crate) fn generate_test_keypair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
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
}
