//! Ticket-granting-ticket types.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use crate::store::Expiring;

/// Random bytes behind a ticket id.
const TICKET_ID_BYTES: usize = 32;

/// Opaque, URL-safe ticket identifier (32 random bytes, base64url).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId(String);

impl TicketId {
    /// Generate a new random ticket id.
    pub fn generate() -> Self {
        let bytes: [u8; TICKET_ID_BYTES] = rand::random();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse an id received from a client (cookie, form field).
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(s).ok()?;
        if bytes.len() != TICKET_ID_BYTES {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute value: one string or an ordered list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    Scalar(String),
    List(Vec<String>),
}

impl AttributeValue {
    /// First value, for consumers that only handle single values.
    pub fn first(&self) -> Option<&str> {
        match self {
            AttributeValue::Scalar(s) => Some(s.as_str()),
            AttributeValue::List(values) => values.first().map(|s| s.as_str()),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            AttributeValue::Scalar(s) => vec![s.as_str()],
            AttributeValue::List(values) => values.iter().map(|s| s.as_str()).collect(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Scalar(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Scalar(s)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(values: Vec<String>) -> Self {
        AttributeValue::List(values)
    }
}

/// Flat attribute bag, used for the owner's attributes.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Authenticated principal owning a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    /// Principal identifier.
    pub user_id: String,

    /// Realm or organization the principal authenticated in.
    pub organization: Option<String>,

    /// Attributes gathered about the principal.
    pub attributes: AttributeMap,
}

impl Owner {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization: None,
            attributes: AttributeMap::new(),
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

/// One authentication method that contributed to a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthnProfileEntry {
    /// Authentication method id.
    pub method_id: String,

    /// Method-specific authentication context (e.g. level, IdP session index).
    pub context: BTreeMap<String, String>,

    pub authenticated_at: DateTime<Utc>,
}

impl AuthnProfileEntry {
    pub fn new(method_id: impl Into<String>) -> Self {
        Self {
            method_id: method_id.into(),
            context: BTreeMap::new(),
            authenticated_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Ticket attributes, namespaced by consumer class and component id.
///
/// Two components that happen to use the same attribute name never see
/// each other's values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketAttributes {
    namespaces: BTreeMap<String, BTreeMap<String, AttributeMap>>,
}

impl TicketAttributes {
    pub fn get(&self, consumer_class: &str, component_id: &str, name: &str) -> Option<&AttributeValue> {
        self.namespaces
            .get(consumer_class)?
            .get(component_id)?
            .get(name)
    }

    pub fn put(
        &mut self,
        consumer_class: &str,
        component_id: &str,
        name: impl Into<String>,
        value: AttributeValue,
    ) {
        self.namespaces
            .entry(consumer_class.to_string())
            .or_default()
            .entry(component_id.to_string())
            .or_default()
            .insert(name.into(), value);
    }

    pub fn remove(&mut self, consumer_class: &str, component_id: &str, name: &str) -> Option<AttributeValue> {
        let components = self.namespaces.get_mut(consumer_class)?;
        let attributes = components.get_mut(component_id)?;
        let removed = attributes.remove(name);

        if attributes.is_empty() {
            components.remove(component_id);
        }
        if components.is_empty() {
            self.namespaces.remove(consumer_class);
        }
        removed
    }

    /// All attributes of one component.
    pub fn component(&self, consumer_class: &str, component_id: &str) -> Option<&AttributeMap> {
        self.namespaces.get(consumer_class)?.get(component_id)
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

/// Server-side SSO session shared by every requestor that joined it.
///
/// Equality and hashing use the id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketGrantingTicket {
    pub id: TicketId,
    pub owner: Owner,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,

    /// Methods that authenticated the owner, in order; unique by method id.
    pub authn_profile: Vec<AuthnProfileEntry>,

    /// Requestors that used this ticket.
    pub requestors: BTreeSet<String>,

    pub attributes: TicketAttributes,
}

impl TicketGrantingTicket {
    /// New ticket for `owner`, authenticated by `method`.
    ///
    /// The expiry is set by the store when the ticket is first stored.
    pub fn new(owner: Owner, method: AuthnProfileEntry) -> Self {
        let now = Utc::now();
        Self {
            id: TicketId::generate(),
            owner,
            created_at: now,
            expire_at: now,
            authn_profile: vec![method],
            requestors: BTreeSet::new(),
            attributes: TicketAttributes::default(),
        }
    }

    /// Mark the ticket expired. There is no way back.
    pub fn expire(&mut self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        if self.expire_at > past {
            self.expire_at = past;
        }
    }

    /// Add `entry` to the profile; an existing entry for the same method gets
    /// its context merged and its timestamp refreshed.
    pub fn add_authn_profile(&mut self, entry: AuthnProfileEntry) {
        match self
            .authn_profile
            .iter_mut()
            .find(|e| e.method_id == entry.method_id)
        {
            Some(existing) => {
                existing.context.extend(entry.context);
                existing.authenticated_at = entry.authenticated_at;
            }
            None => self.authn_profile.push(entry),
        }
    }

    pub fn has_method(&self, method_id: &str) -> bool {
        self.authn_profile.iter().any(|e| e.method_id == method_id)
    }

    /// Returns whether the requestor was newly added.
    pub fn add_requestor(&mut self, requestor: &str) -> bool {
        self.requestors.insert(requestor.to_string())
    }

    /// Returns whether the requestor was registered.
    pub fn remove_requestor(&mut self, requestor: &str) -> bool {
        self.requestors.remove(requestor)
    }
}

impl Expiring for TicketGrantingTicket {
    fn expire_at(&self) -> DateTime<Utc> {
        self.expire_at
    }

    fn set_expire_at(&mut self, at: DateTime<Utc>) {
        self.expire_at = at;
    }
}

impl PartialEq for TicketGrantingTicket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TicketGrantingTicket {}

impl Hash for TicketGrantingTicket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
