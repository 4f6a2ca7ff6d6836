//! Handler traits for notifications and request/reply.
//!
//! Both traits have blanket impls for async closures, so tests and small
//! services can register `|envelope| async move { ... }` directly.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use shopmesh_core::MessageEnvelope;

/// Consumes one delivered notification.
///
/// Returning `Err` requeues the message for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// Envelope fields a request handler may want besides the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub message_id: String,
    pub kind: String,
    pub publisher: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub target_id: Option<String>,
    pub timestamp: u64,
}

impl RequestMeta {
    pub(crate) fn from_envelope(envelope: &MessageEnvelope, reply_to: Option<String>) -> Self {
        Self {
            message_id: envelope.id.clone(),
            kind: envelope.kind.clone(),
            publisher: envelope.publisher.clone(),
            correlation_id: envelope.correlation_id.clone(),
            reply_to,
            target_id: envelope.target_id.clone(),
            timestamp: envelope.timestamp,
        }
    }
}

/// Serves one request type; the returned value becomes the reply's `data`.
///
/// An `Err` is sent back to the caller as an error reply.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, data: Value, meta: RequestMeta) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Value, RequestMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, data: Value, meta: RequestMeta) -> anyhow::Result<Value> {
        (self)(data, meta).await
    }
}
