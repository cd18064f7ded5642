//! NodeInfo 2.1 documents
//!
//! The discovery JRD at `/.well-known/nodeinfo` points at the registered
//! NodeInfo path; the document itself is produced by the host's
//! dispatcher and schema-validated before it goes out.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::error::FederationError;

/// `rel` of the NodeInfo discovery link.
pub const NODEINFO_SCHEMA_REL: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";

/// NodeInfo 2.1 document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub software: NodeInfoSoftware,
    pub protocols: Vec<String>,
    pub usage: NodeInfoUsage,
    #[serde(default)]
    pub open_registrations: bool,
}

/// Software block of a NodeInfo document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoSoftware {
    /// Canonical software name: lowercase letters, digits, hyphens
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// Usage counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsage {
    pub users: NodeInfoUsers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_posts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_comments: Option<u64>,
}

/// User counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_month: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_halfyear: Option<u64>,
}

impl NodeInfo {
    /// Check the document against the NodeInfo 2.1 schema constraints
    ///
    /// # Errors
    /// `FederationError::Validation` naming the violated field.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.software.name.is_empty()
            || !self
                .software
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(FederationError::Validation(format!(
                "NodeInfo software name {:?} must match [a-z0-9-]+",
                self.software.name
            )));
        }
        if self.software.version.is_empty() {
            return Err(FederationError::Validation(
                "NodeInfo software version must not be empty".to_string(),
            ));
        }
        if self.protocols.is_empty() {
            return Err(FederationError::Validation(
                "NodeInfo must list at least one protocol".to_string(),
            ));
        }
        Ok(())
    }

    /// The document as served, with the fixed schema version stamped in
    pub fn to_document(&self) -> Result<Value, FederationError> {
        self.validate()?;
        let mut document = serde_json::to_value(self)
            .map_err(|e| FederationError::Internal(format!("NodeInfo serialization: {e}")))?;
        if let Some(map) = document.as_object_mut() {
            map.insert("version".to_string(), json!("2.1"));
        }
        Ok(document)
    }
}

/// Discovery JRD pointing at the NodeInfo path
pub fn discovery_jrd(node_info_uri: &Url) -> Value {
    json!({
        "links": [
            {
                "rel": NODEINFO_SCHEMA_REL,
                "href": node_info_uri.to_string(),
            }
        ]
    })
}
