//! ActivityStreams vocabulary surface
//!
//! The core does not model the full AS2 vocabulary; it needs just enough
//! to dispatch: the activity subtype table with its parent chain (inbox
//! listeners are keyed by canonical type IRI and looked up most-specific
//! first), a thin `Activity` wrapper over the JSON-LD document, and
//! `ObjectClass` identifiers for typed-object dispatch.

use serde_json::{json, Value};

use crate::error::FederationError;

const AS_NAMESPACE: &str = "https://www.w3.org/ns/activitystreams#";

/// Default `@context` stamped onto outbound documents lacking one.
pub const ACTIVITY_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// AS2 activity subtypes the core can dispatch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityClass {
    Activity,
    IntransitiveActivity,
    Accept,
    TentativeAccept,
    Add,
    Announce,
    Arrive,
    Block,
    Create,
    Delete,
    Dislike,
    Flag,
    Follow,
    Ignore,
    Invite,
    Join,
    Leave,
    Like,
    Listen,
    Move,
    Offer,
    Question,
    Read,
    Reject,
    TentativeReject,
    Remove,
    Travel,
    Undo,
    Update,
    View,
}

impl ActivityClass {
    /// Short AS2 type name, as it appears in a document's `type` property
    pub fn name(self) -> &'static str {
        match self {
            Self::Activity => "Activity",
            Self::IntransitiveActivity => "IntransitiveActivity",
            Self::Accept => "Accept",
            Self::TentativeAccept => "TentativeAccept",
            Self::Add => "Add",
            Self::Announce => "Announce",
            Self::Arrive => "Arrive",
            Self::Block => "Block",
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Dislike => "Dislike",
            Self::Flag => "Flag",
            Self::Follow => "Follow",
            Self::Ignore => "Ignore",
            Self::Invite => "Invite",
            Self::Join => "Join",
            Self::Leave => "Leave",
            Self::Like => "Like",
            Self::Listen => "Listen",
            Self::Move => "Move",
            Self::Offer => "Offer",
            Self::Question => "Question",
            Self::Read => "Read",
            Self::Reject => "Reject",
            Self::TentativeReject => "TentativeReject",
            Self::Remove => "Remove",
            Self::Travel => "Travel",
            Self::Undo => "Undo",
            Self::Update => "Update",
            Self::View => "View",
        }
    }

    /// Canonical type IRI; the key of the listener registry
    pub fn type_iri(self) -> &'static str {
        match self {
            Self::Activity => "https://www.w3.org/ns/activitystreams#Activity",
            Self::IntransitiveActivity => {
                "https://www.w3.org/ns/activitystreams#IntransitiveActivity"
            }
            Self::Accept => "https://www.w3.org/ns/activitystreams#Accept",
            Self::TentativeAccept => "https://www.w3.org/ns/activitystreams#TentativeAccept",
            Self::Add => "https://www.w3.org/ns/activitystreams#Add",
            Self::Announce => "https://www.w3.org/ns/activitystreams#Announce",
            Self::Arrive => "https://www.w3.org/ns/activitystreams#Arrive",
            Self::Block => "https://www.w3.org/ns/activitystreams#Block",
            Self::Create => "https://www.w3.org/ns/activitystreams#Create",
            Self::Delete => "https://www.w3.org/ns/activitystreams#Delete",
            Self::Dislike => "https://www.w3.org/ns/activitystreams#Dislike",
            Self::Flag => "https://www.w3.org/ns/activitystreams#Flag",
            Self::Follow => "https://www.w3.org/ns/activitystreams#Follow",
            Self::Ignore => "https://www.w3.org/ns/activitystreams#Ignore",
            Self::Invite => "https://www.w3.org/ns/activitystreams#Invite",
            Self::Join => "https://www.w3.org/ns/activitystreams#Join",
            Self::Leave => "https://www.w3.org/ns/activitystreams#Leave",
            Self::Like => "https://www.w3.org/ns/activitystreams#Like",
            Self::Listen => "https://www.w3.org/ns/activitystreams#Listen",
            Self::Move => "https://www.w3.org/ns/activitystreams#Move",
            Self::Offer => "https://www.w3.org/ns/activitystreams#Offer",
            Self::Question => "https://www.w3.org/ns/activitystreams#Question",
            Self::Read => "https://www.w3.org/ns/activitystreams#Read",
            Self::Reject => "https://www.w3.org/ns/activitystreams#Reject",
            Self::TentativeReject => "https://www.w3.org/ns/activitystreams#TentativeReject",
            Self::Remove => "https://www.w3.org/ns/activitystreams#Remove",
            Self::Travel => "https://www.w3.org/ns/activitystreams#Travel",
            Self::Undo => "https://www.w3.org/ns/activitystreams#Undo",
            Self::Update => "https://www.w3.org/ns/activitystreams#Update",
            Self::View => "https://www.w3.org/ns/activitystreams#View",
        }
    }

    /// Direct AS2 superclass; `None` for the `Activity` root
    pub fn parent(self) -> Option<ActivityClass> {
        match self {
            Self::Activity => None,
            Self::TentativeAccept => Some(Self::Accept),
            Self::TentativeReject => Some(Self::Reject),
            Self::Invite => Some(Self::Offer),
            Self::Block => Some(Self::Ignore),
            Self::Arrive | Self::Question | Self::Travel => Some(Self::IntransitiveActivity),
            _ => Some(Self::Activity),
        }
    }

    /// Class chain from `self` up to `Activity`, most specific first
    pub fn chain(self) -> Vec<ActivityClass> {
        let mut out = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            out.push(parent);
            current = parent;
        }
        out
    }

    /// Resolve a short type name from a document's `type` property
    pub fn from_name(name: &str) -> Option<ActivityClass> {
        // Accept the expanded IRI form too; remote documents vary.
        let name = name.strip_prefix(AS_NAMESPACE).unwrap_or(name);
        [
            Self::Activity,
            Self::IntransitiveActivity,
            Self::Accept,
            Self::TentativeAccept,
            Self::Add,
            Self::Announce,
            Self::Arrive,
            Self::Block,
            Self::Create,
            Self::Delete,
            Self::Dislike,
            Self::Flag,
            Self::Follow,
            Self::Ignore,
            Self::Invite,
            Self::Join,
            Self::Leave,
            Self::Like,
            Self::Listen,
            Self::Move,
            Self::Offer,
            Self::Question,
            Self::Read,
            Self::Reject,
            Self::TentativeReject,
            Self::Remove,
            Self::Travel,
            Self::Undo,
            Self::Update,
            Self::View,
        ]
        .into_iter()
        .find(|class| class.name() == name)
    }
}

/// Identifier of a non-activity object class served by an object dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectClass {
    name: &'static str,
    iri: &'static str,
}

impl ObjectClass {
    pub const NOTE: Self = Self::new("Note", "https://www.w3.org/ns/activitystreams#Note");
    pub const ARTICLE: Self = Self::new("Article", "https://www.w3.org/ns/activitystreams#Article");
    pub const DOCUMENT: Self =
        Self::new("Document", "https://www.w3.org/ns/activitystreams#Document");
    pub const EVENT: Self = Self::new("Event", "https://www.w3.org/ns/activitystreams#Event");
    pub const IMAGE: Self = Self::new("Image", "https://www.w3.org/ns/activitystreams#Image");
    pub const VIDEO: Self = Self::new("Video", "https://www.w3.org/ns/activitystreams#Video");
    pub const PLACE: Self = Self::new("Place", "https://www.w3.org/ns/activitystreams#Place");
    pub const TOMBSTONE: Self =
        Self::new("Tombstone", "https://www.w3.org/ns/activitystreams#Tombstone");

    /// An object class outside the bundled set
    pub const fn new(name: &'static str, iri: &'static str) -> Self {
        Self { name, iri }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_iri(&self) -> &'static str {
        self.iri
    }
}

/// A parsed inbound or outbound activity
///
/// Thin wrapper over the JSON-LD document: the core reads `id`, `actor`
/// and the resolved class, and otherwise passes the document through
/// untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    class: ActivityClass,
    document: Value,
}

fn type_name(document: &Value) -> Option<&str> {
    match document.get("type") {
        Some(Value::String(name)) => Some(name),
        Some(Value::Array(names)) => names.iter().find_map(|n| n.as_str()),
        _ => None,
    }
}

fn reference_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id),
        Value::Object(_) => value.get("id").and_then(Value::as_str),
        Value::Array(values) => values.iter().find_map(reference_id),
        _ => None,
    }
}

impl Activity {
    /// Parse a JSON-LD document into an activity
    ///
    /// # Errors
    /// `FederationError::Validation` when the document is not an object,
    /// lacks a `type`, or names a type outside the activity vocabulary.
    pub fn from_document(document: Value) -> Result<Self, FederationError> {
        if !document.is_object() {
            return Err(FederationError::Validation(
                "activity must be a JSON object".to_string(),
            ));
        }
        let name = type_name(&document).ok_or_else(|| {
            FederationError::Validation("activity is missing a type".to_string())
        })?;
        let class = ActivityClass::from_name(name).ok_or_else(|| {
            FederationError::Validation(format!("unknown activity type: {name}"))
        })?;
        Ok(Self { class, document })
    }

    /// Build an activity of a known class from its properties
    pub fn build(class: ActivityClass, mut properties: Value) -> Self {
        if let Some(map) = properties.as_object_mut() {
            map.insert("type".to_string(), json!(class.name()));
        }
        Self {
            class,
            document: properties,
        }
    }

    pub fn class(&self) -> ActivityClass {
        self.class
    }

    pub fn id(&self) -> Option<&str> {
        self.document.get("id").and_then(Value::as_str)
    }

    /// The `actor` property, reduced to its id
    pub fn actor_id(&self) -> Option<&str> {
        self.document.get("actor").and_then(reference_id)
    }

    /// Clone with `id` set; used to mint `urn:uuid:` ids before sending
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        if let Some(map) = self.document.as_object_mut() {
            map.insert("id".to_string(), json!(id.into()));
        }
        self
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The document with `@context` defaulted for the wire
    pub fn to_json_ld(&self) -> Value {
        let mut document = self.document.clone();
        if let Some(map) = document.as_object_mut() {
            map.entry("@context")
                .or_insert_with(|| json!(ACTIVITY_CONTEXT));
        }
        document
    }

    pub fn into_document(self) -> Value {
        self.document
    }
}
