//! WebFinger support
//!
//! Parses `resource=` queries and builds JRD responses for local actors.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FederationError;

/// A parsed `resource=` query value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    /// `acct:user@host`
    Account { username: String, domain: String },
    /// A bare actor URL (`https://host/users/user`)
    Url(Url),
}

/// Parse a WebFinger `resource` parameter
///
/// Accepts the `acct:` form (with or without the prefix) and plain
/// `http(s)` actor URLs.
///
/// # Errors
/// `FederationError::Validation` on anything else.
pub fn parse_resource(resource: &str) -> Result<ResourceRef, FederationError> {
    let trimmed = resource.trim();

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let url = Url::parse(trimmed)
            .map_err(|_| FederationError::Validation("invalid resource URL".to_string()))?;
        return Ok(ResourceRef::Url(url));
    }

    let without_prefix = trimmed.strip_prefix("acct:").unwrap_or(trimmed);
    let mut segments = without_prefix.split('@');
    let username = segments.next().unwrap_or_default();
    let domain = segments.next().unwrap_or_default();
    if username.is_empty() || domain.is_empty() || segments.next().is_some() {
        return Err(FederationError::Validation(
            "resource must be an acct:user@domain address or an actor URL".to_string(),
        ));
    }

    Ok(ResourceRef::Account {
        username: username.to_string(),
        domain: domain.to_string(),
    })
}

/// WebFinger JRD response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Build the JRD for a local actor
///
/// Always contains the `self` link; the `profile-page` link is added when
/// the actor document exposes a profile URL.
pub fn actor_jrd(
    handle: &str,
    domain: &str,
    actor_uri: &Url,
    profile_url: Option<&str>,
) -> WebFingerResponse {
    let mut links = vec![WebFingerLink {
        rel: "self".to_string(),
        link_type: Some("application/activity+json".to_string()),
        href: Some(actor_uri.to_string()),
    }];
    let mut aliases = vec![actor_uri.to_string()];

    if let Some(profile_url) = profile_url {
        links.push(WebFingerLink {
            rel: "http://webfinger.net/rel/profile-page".to_string(),
            link_type: Some("text/html".to_string()),
            href: Some(profile_url.to_string()),
        });
        if profile_url != actor_uri.as_str() {
            aliases.push(profile_url.to_string());
        }
    }

    WebFingerResponse {
        subject: format!("acct:{handle}@{domain}"),
        aliases: Some(aliases),
        links,
    }
}
