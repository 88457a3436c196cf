//! Protocol message model and declarative builder.
//!
//! A [`Message`] is immutable once built. Construction goes through
//! [`MessageBuilder`] (or the [`MessageFactory`] shortcuts), which enforces:
//!
//! - the operation is always set
//! - REQUEST and PUSH messages get a fresh sequence from the process-wide
//!   counter ([`next_sequence`])
//! - a RESPONSE reuses the sequence of the REQUEST it answers and cannot be
//!   built without one
//! - every message records the [`PeerRole`] of its sender; a RESPONSE
//!   defaults to the counterpart of the request's sender
//!
//! Building is pure: no I/O, safe from any thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CrosslineError, ErrorBody, Result};
use crate::ids::SystemId;
use crate::object_type::ObjectType;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Allocate the next message sequence number.
///
/// Monotonic for the lifetime of the process and shared by every connection.
pub fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Message direction/kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Initiates an exchange.
    Request,
    /// Answers a request; carries the request's sequence.
    Response,
    /// Unsolicited data delivery to a subscriber.
    Push,
}

/// Operation carried by a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Read parameters or state.
    Query,
    /// Change parameters or state.
    Set,
    /// Notification that expects no response.
    Notify,
    /// Start receiving pushes for an object type.
    Subscribe,
    /// Stop receiving pushes for an object type.
    Unsubscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Query => "QUERY",
            Self::Set => "SET",
            Self::Notify => "NOTIFY",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
        };
        f.write_str(s)
    }
}

/// Which end of the link this process is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Traffic-information control platform (issues commands).
    Upper,
    /// Signal-control system (owns the intersections).
    #[default]
    Lower,
}

impl PeerRole {
    /// The role at the other end of the link.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Upper => Self::Lower,
            Self::Lower => Self::Upper,
        }
    }
}

/// A typed payload object inside a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayloadObject {
    /// Object type name.
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    /// Object body.
    pub data: Value,
}

impl PayloadObject {
    /// Serialize a value into a payload object.
    pub fn new<T: Serialize>(object_type: ObjectType, data: &T) -> Result<Self> {
        let data = serde_json::to_value(data)
            .map_err(|e| CrosslineError::internal(format!("serialize {object_type}: {e}")))?;
        Ok(Self { object_type, data })
    }

    /// Wrap an already-built JSON value.
    pub fn from_value(object_type: ObjectType, data: Value) -> Self {
        Self { object_type, data }
    }

    /// Decode the body into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            CrosslineError::validation(format!("invalid {} payload: {e}", self.object_type))
        })
    }

    /// Whether the body is null or an empty object/array.
    pub fn is_empty(&self) -> bool {
        match &self.data {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }
}

/// An immutable protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    sequence: u64,
    kind: MessageKind,
    operation: Operation,
    #[serde(default)]
    role: PeerRole,
    from: SystemId,
    to: SystemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default)]
    objects: Vec<PayloadObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Sequence number (a RESPONSE carries its request's sequence).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Operation.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Role of the sending system.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Sending system.
    pub fn from(&self) -> &SystemId {
        &self.from
    }

    /// Receiving system.
    pub fn to(&self) -> &SystemId {
        &self.to
    }

    /// Auth token, if attached.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Payload objects in order.
    pub fn objects(&self) -> &[PayloadObject] {
        &self.objects
    }

    /// Error body (RESPONSE only).
    pub fn error(&self) -> Option<&ErrorBody> {
        self.error.as_ref()
    }

    /// Creation timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Type of the first payload object, used for routing.
    pub fn object_type(&self) -> Option<ObjectType> {
        self.objects.first().map(|o| o.object_type)
    }

    /// Consume a RESPONSE and return its objects, or the peer's error.
    pub fn into_result(self) -> Result<Vec<PayloadObject>> {
        match self.error {
            Some(body) => Err(CrosslineError::from_error_body(&body)),
            None => Ok(self.objects),
        }
    }
}

/// Declarative message construction.
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    kind: MessageKind,
    operation: Option<Operation>,
    role: PeerRole,
    from: Option<SystemId>,
    to: Option<SystemId>,
    token: Option<String>,
    objects: Vec<PayloadObject>,
    reply_to: Option<u64>,
    error: Option<ErrorBody>,
}

impl MessageBuilder {
    /// Start a message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            operation: None,
            role: PeerRole::default(),
            from: None,
            to: None,
            token: None,
            objects: Vec::new(),
            reply_to: None,
            error: None,
        }
    }

    /// Start a REQUEST.
    pub fn request(operation: Operation) -> Self {
        Self::new(MessageKind::Request).operation(operation)
    }

    /// Start a PUSH (operation NOTIFY).
    pub fn push() -> Self {
        Self::new(MessageKind::Push).operation(Operation::Notify)
    }

    /// Start a RESPONSE answering `request`.
    ///
    /// Copies the request's sequence and operation, swaps sender and
    /// recipient and takes the counterpart of the request's role.
    pub fn response_to(request: &Message) -> Self {
        Self::new(MessageKind::Response)
            .operation(request.operation)
            .role(request.role.counterpart())
            .reply_to(request.sequence)
            .from(request.to.clone())
            .to(request.from.clone())
    }

    /// Set the operation.
    #[must_use]
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Set the sender's role.
    #[must_use]
    pub fn role(mut self, role: PeerRole) -> Self {
        self.role = role;
        self
    }

    /// Set the sender.
    #[must_use]
    pub fn from(mut self, from: impl Into<SystemId>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Set the recipient.
    #[must_use]
    pub fn to(mut self, to: impl Into<SystemId>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Attach an auth token.
    #[must_use]
    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Append one payload object.
    #[must_use]
    pub fn object(mut self, object: PayloadObject) -> Self {
        self.objects.push(object);
        self
    }

    /// Append several payload objects.
    #[must_use]
    pub fn objects(mut self, objects: impl IntoIterator<Item = PayloadObject>) -> Self {
        self.objects.extend(objects);
        self
    }

    /// Reference the originating request's sequence.
    #[must_use]
    pub fn reply_to(mut self, sequence: u64) -> Self {
        self.reply_to = Some(sequence);
        self
    }

    /// Attach an error body (RESPONSE only).
    #[must_use]
    pub fn error(mut self, error: ErrorBody) -> Self {
        self.error = Some(error);
        self
    }

    /// Validate and build the message.
    pub fn build(self) -> Result<Message> {
        let operation = self
            .operation
            .ok_or_else(|| CrosslineError::validation("message operation is not set"))?;
        let from = self
            .from
            .ok_or_else(|| CrosslineError::validation("message sender is not set"))?;
        let to = self
            .to
            .ok_or_else(|| CrosslineError::validation("message recipient is not set"))?;

        let sequence = match self.kind {
            MessageKind::Response => self.reply_to.ok_or_else(|| {
                CrosslineError::validation("response does not reference a request sequence")
            })?,
            MessageKind::Request | MessageKind::Push => {
                if self.error.is_some() {
                    return Err(CrosslineError::validation(
                        "only responses may carry an error",
                    ));
                }
                next_sequence()
            }
        };

        Ok(Message {
            sequence,
            kind: self.kind,
            operation,
            role: self.role,
            from,
            to,
            token: self.token,
            objects: self.objects,
            error: self.error,
            timestamp: Utc::now(),
        })
    }
}

/// Shortcut constructors bound to the local system identity and role.
///
/// Every message built here, responses included, is stamped with the
/// factory's role.
#[derive(Clone, Debug)]
pub struct MessageFactory {
    local: SystemId,
    role: PeerRole,
    token: Option<String>,
}

impl MessageFactory {
    /// Create a factory for the local system.
    pub fn new(local: impl Into<SystemId>, role: PeerRole) -> Self {
        Self {
            local: local.into(),
            role,
            token: None,
        }
    }

    /// Attach an auth token to every request built afterwards.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Local system id.
    pub fn local(&self) -> &SystemId {
        &self.local
    }

    /// Local peer role.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    fn request(&self, operation: Operation, to: &SystemId) -> MessageBuilder {
        MessageBuilder::request(operation)
            .role(self.role)
            .from(self.local.clone())
            .to(to.clone())
            .token(self.token.clone())
    }

    /// QUERY request.
    pub fn query(&self, to: &SystemId, objects: Vec<PayloadObject>) -> Result<Message> {
        self.request(Operation::Query, to).objects(objects).build()
    }

    /// SET request.
    pub fn set(&self, to: &SystemId, objects: Vec<PayloadObject>) -> Result<Message> {
        self.request(Operation::Set, to).objects(objects).build()
    }

    /// NOTIFY request (no response expected).
    pub fn notify(&self, to: &SystemId, objects: Vec<PayloadObject>) -> Result<Message> {
        self.request(Operation::Notify, to).objects(objects).build()
    }

    /// SUBSCRIBE request for one object type.
    pub fn subscribe(&self, to: &SystemId, object_type: ObjectType) -> Result<Message> {
        let body = SubscriptionPayload { object_type };
        self.request(Operation::Subscribe, to)
            .object(PayloadObject::new(ObjectType::Subscription, &body)?)
            .build()
    }

    /// UNSUBSCRIBE request for one object type.
    pub fn unsubscribe(&self, to: &SystemId, object_type: ObjectType) -> Result<Message> {
        let body = SubscriptionPayload { object_type };
        self.request(Operation::Unsubscribe, to)
            .object(PayloadObject::new(ObjectType::Subscription, &body)?)
            .build()
    }

    /// PUSH carrying one object.
    pub fn push(&self, to: &SystemId, object: PayloadObject) -> Result<Message> {
        MessageBuilder::push()
            .role(self.role)
            .from(self.local.clone())
            .to(to.clone())
            .object(object)
            .build()
    }

    /// Successful RESPONSE to `request`.
    pub fn response(&self, request: &Message, objects: Vec<PayloadObject>) -> Result<Message> {
        MessageBuilder::response_to(request)
            .role(self.role)
            .objects(objects)
            .build()
    }

    /// Error RESPONSE to `request`.
    pub fn error_response(&self, request: &Message, error: &CrosslineError) -> Result<Message> {
        MessageBuilder::response_to(request)
            .role(self.role)
            .error(error.to_error_body())
            .build()
    }
}

/// Body of a `Subscription` object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    /// Object type the peer wants pushed.
    pub object_type: ObjectType,
}

/// Body of a `Login` object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPayload {
    /// Auth token validated by the peer.
    pub token: String,
}
