//! Request and response envelopes and their mapping onto broker messages.
//!
//! A request travels as a [`BrokerMessage`] whose `content_type` carries
//! `"<origin>|<method>"`, whose `correlation_id` carries the RPC token, and whose payload is
//! the JSON-encoded request body. The responder copies the correlation id verbatim and
//! answers with a JSON [`ResponseEnvelope`]:
//!
//! ```json
//! { "method": "read_file", "status": "ok", "data": { "content": "..." } }
//! ```

use crate::broker::BrokerMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Separator between the origin tag and the method in the content-type property.
pub const CONTENT_TYPE_SEPARATOR: char = '|';

/// Errors raised while decoding envelopes from broker messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The message carried no correlation id
    #[error("message has no correlation id")]
    MissingCorrelationId,

    /// The content-type property is absent or not `"<origin>|<method>"`
    #[error("invalid content type: {0:?}")]
    InvalidContentType(Option<String>),

    /// The payload is not valid JSON for the expected shape
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Logical method name carried by a request.
///
/// Method names are opaque to the RPC layer. The constants cover the vocabulary the
/// storefront responders understand; any other name can be built with [`Method::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(Cow<'static, str>);

impl Method {
    /// Report an exception to the remote side.
    pub const EXCEPTION: Self = Self(Cow::Borrowed("exception"));
    /// Dispatch an email.
    pub const SEND_EMAIL: Self = Self(Cow::Borrowed("send_email"));
    /// Store a file.
    pub const SAVE_FILE: Self = Self(Cow::Borrowed("save_file"));
    /// Read a stored file.
    pub const READ_FILE: Self = Self(Cow::Borrowed("read_file"));
    /// Delete a stored file.
    pub const DELETE_FILE: Self = Self(Cow::Borrowed("delete_file"));
    /// Push a notification.
    pub const SEND_NOTIFICATION: Self = Self(Cow::Borrowed("send_notification"));
    /// Fallback for unrecognised methods.
    pub const UNKNOWN: Self = Self(Cow::Borrowed("unknown"));

    /// Create a method from any name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The method name as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Method {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Opaque token linking a request to its response.
///
/// Generated tokens are random 128-bit UUIDs, so collisions among outstanding requests are
/// not a practical concern; the response table still checks for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The token as carried in the message properties.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for CorrelationId {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Parsed `"<origin>|<method>"` content-type property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// The logical sender that produced the message
    pub origin_tag: String,
    /// The method the message belongs to
    pub method: Method,
}

impl ContentType {
    /// Parse a content-type property value.
    ///
    /// Only the first separator splits; method names may not contain `|` but anything after
    /// the first separator is kept as the method.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidContentType`] when the separator is missing or either
    /// side is empty.
    pub fn parse(value: &str) -> Result<Self, EnvelopeError> {
        match value.split_once(CONTENT_TYPE_SEPARATOR) {
            Some((origin, method)) if !origin.is_empty() && !method.is_empty() => Ok(Self {
                origin_tag: origin.to_string(),
                method: Method::new(method),
            }),
            _ => Err(EnvelopeError::InvalidContentType(Some(value.to_string()))),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{CONTENT_TYPE_SEPARATOR}{}", self.origin_tag, self.method)
    }
}

/// An outbound RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Method to invoke on the remote side
    pub method: Method,
    /// Which logical sender produced the request (several processes may share a queue)
    pub origin_tag: String,
    /// JSON request body
    pub body: Value,
}

impl RequestEnvelope {
    /// Create a request envelope.
    #[must_use]
    pub fn new(method: impl Into<Method>, origin_tag: impl Into<String>, body: Value) -> Self {
        Self {
            method: method.into(),
            origin_tag: origin_tag.into(),
            body,
        }
    }

    /// The content-type property value for this request.
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        ContentType {
            origin_tag: self.origin_tag.clone(),
            method: self.method.clone(),
        }
    }

    /// Encode the request as a broker message tagged with `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the body cannot be encoded.
    pub fn to_message(&self, correlation_id: &CorrelationId) -> Result<BrokerMessage, serde_json::Error> {
        Ok(BrokerMessage {
            content_type: Some(self.content_type().to_string()),
            correlation_id: Some(correlation_id.as_str().to_string()),
            payload: serde_json::to_vec(&self.body)?,
        })
    }

    /// Decode a request received by a responder.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the correlation id is missing, the content type is not
    /// `"<origin>|<method>"`, or the payload is not JSON.
    pub fn from_message(message: &BrokerMessage) -> Result<(Self, CorrelationId), EnvelopeError> {
        let correlation_id = message
            .correlation_id
            .clone()
            .map(CorrelationId::from)
            .ok_or(EnvelopeError::MissingCorrelationId)?;
        let content_type = message
            .content_type
            .as_deref()
            .ok_or(EnvelopeError::InvalidContentType(None))
            .and_then(ContentType::parse)?;
        let body = serde_json::from_slice(&message.payload)
            .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))?;

        Ok((
            Self {
                method: content_type.method,
                origin_tag: content_type.origin_tag,
                body,
            },
            correlation_id,
        ))
    }
}

/// Outcome reported by the remote responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The method succeeded; `data` holds the result
    Ok,
    /// The method failed; `data` holds the error message
    Error,
}

/// A response produced by the remote responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Method the response answers
    pub method: Method,
    /// Success or failure
    pub status: ResponseStatus,
    /// Result data, or the error message when `status` is `error`
    #[serde(default)]
    pub data: Value,
}

impl ResponseEnvelope {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn ok(method: impl Into<Method>, data: Value) -> Self {
        Self {
            method: method.into(),
            status: ResponseStatus::Ok,
            data,
        }
    }

    /// Failed response carrying `message`.
    #[must_use]
    pub fn error(method: impl Into<Method>, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            status: ResponseStatus::Error,
            data: Value::String(message.into()),
        }
    }

    /// Whether the remote side reported success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// The remote-supplied error message.
    ///
    /// String data is returned as is; any other JSON is rendered compactly.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.data {
            Value::String(message) => message.clone(),
            Value::Null => String::from("remote method failed without a message"),
            other => other.to_string(),
        }
    }

    /// Decode a response body.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidPayload`] if the payload is not a response envelope.
    pub fn from_slice(payload: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(payload).map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))
    }

    /// Encode the response as a broker message answering `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `data` cannot be encoded.
    pub fn to_message(
        &self,
        origin_tag: &str,
        correlation_id: &CorrelationId,
    ) -> Result<BrokerMessage, serde_json::Error> {
        Ok(BrokerMessage {
            content_type: Some(format!("{origin_tag}{CONTENT_TYPE_SEPARATOR}{}", self.method)),
            correlation_id: Some(correlation_id.as_str().to_string()),
            payload: serde_json::to_vec(self)?,
        })
    }
}
