//! Wire envelope carried on the message bus.
//!
//! Envelopes are JSON-encoded with camelCase field names so that services
//! written in other languages can consume them. An envelope is immutable once
//! published; its `id` is unique per process and time (`"{millis}-{suffix}"`)
//! and is what consumers use to drop duplicate deliveries.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::ClockSource;

/// Length of the random suffix appended to message ids.
const ID_SUFFIX_LEN: usize = 9;

/// Generates a message id from the current time and a random suffix.
#[must_use]
pub fn generate_message_id(now_ms: u64) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{now_ms}-{suffix}")
}

/// A published notification, request, or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    /// Notification type; doubles as the default routing key.
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    /// Milliseconds since Unix epoch at creation.
    pub timestamp: u64,
    /// Name of the publishing service.
    pub publisher: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
}

impl MessageEnvelope {
    /// Builds a fresh envelope stamped with a new id and the clock's time.
    pub fn new(
        kind: impl Into<String>,
        data: serde_json::Value,
        publisher: impl Into<String>,
        clock: &dyn ClockSource,
    ) -> Self {
        let now = clock.now();
        Self {
            id: generate_message_id(now),
            kind: kind.into(),
            data,
            timestamp: now,
            publisher: publisher.into(),
            target_id: None,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target_id: Option<String>) -> Self {
        self.target_id = target_id;
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Encodes the envelope as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error only if `data` contains a value serde cannot encode
    /// (e.g. a map with non-string keys produced by a custom serializer).
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a well-formed envelope. Callers
    /// treat this as a poison message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Body of a reply published back to a requester.
///
/// Carried as the `data` of a reply envelope. A failed handler still produces
/// a reply with `success = false` so the caller is not left waiting for its
/// timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ReplyPayload {
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
