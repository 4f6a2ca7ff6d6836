//! Outstanding request/reply calls keyed by correlation id.

use std::sync::Arc;

use dashmap::DashMap;
use shopmesh_core::MessageEnvelope;
use tokio::sync::oneshot;

/// Table of in-flight requests awaiting a reply.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: DashMap<String, oneshot::Sender<MessageEnvelope>>,
}

/// Removes its entry when dropped, so a timed-out or cancelled request never
/// leaves a slot behind for a late reply to hit.
#[derive(Debug)]
pub struct PendingGuard {
    table: Arc<PendingRequests>,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.entries.remove(&self.correlation_id);
    }
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `correlation_id` and returns the guard plus the reply receiver.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: impl Into<String>,
    ) -> (PendingGuard, oneshot::Receiver<MessageEnvelope>) {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(correlation_id.clone(), tx);
        (
            PendingGuard {
                table: Arc::clone(self),
                correlation_id,
            },
            rx,
        )
    }

    /// Completes the request matching `reply.correlation_id`.
    ///
    /// Returns `false` for replies nobody is waiting on (late or unknown).
    pub fn resolve(&self, reply: MessageEnvelope) -> bool {
        let Some(correlation_id) = reply.correlation_id.as_deref() else {
            return false;
        };
        match self.entries.remove(correlation_id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops every waiter; their receivers observe a closed channel.
    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
