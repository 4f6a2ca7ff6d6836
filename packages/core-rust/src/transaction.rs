//! Payment transaction record swept by the reconciliation job.
//!
//! Status moves monotonically toward a terminal state. The only cycle allowed
//! is `Processing <-> Retry`, and it is bounded by `RetryInfo::max_attempts`.
//!
//! ```text
//! Initiated -> Processing -> Completed
//!     |            |  ^
//!     |            v  |
//!     |          Retry ----> Failed
//!     +--> Cancelled / Failed
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle status of a payment transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retry,
}

impl TransactionStatus {
    /// Terminal statuses never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Retry => "RETRY",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use TransactionStatus::{Cancelled, Completed, Failed, Initiated, Processing, Retry};
        matches!(
            (self, next),
            (Initiated, Processing | Cancelled | Failed)
                | (Processing, Completed | Failed | Retry | Cancelled)
                | (Retry, Processing | Failed | Cancelled)
        )
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("transaction {tx_id} cannot move from {from} to {to}")]
    Invalid {
        tx_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("transaction {tx_id} exhausted {max_attempts} attempts")]
    AttemptsExhausted { tx_id: String, max_attempts: u32 },
}

/// Bounded retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub count: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_attempt_at: Option<u64>,
}

impl RetryInfo {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            count: 0,
            max_attempts,
            last_attempt_at: None,
        }
    }

    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.count >= self.max_attempts
    }
}

/// An ordered product and quantity, used to correct inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub quantity: u32,
}

/// A payment transaction owned by the payment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub order_id: String,
    /// Unique transaction id.
    pub tx_id: String,
    pub status: TransactionStatus,
    /// Amount in minor currency units.
    pub amount: u64,
    #[serde(default)]
    pub items: Vec<LineItem>,
    pub retry: RetryInfo,
    /// Whether the inventory decrement for this order has been confirmed.
    #[serde(default)]
    pub inventory_synced: bool,
    /// Products whose inventory correction has already been published.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced_items: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PaymentTransaction {
    #[must_use]
    pub fn new(
        order_id: impl Into<String>,
        tx_id: impl Into<String>,
        amount: u64,
        items: Vec<LineItem>,
        max_attempts: u32,
        now_ms: u64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            tx_id: tx_id.into(),
            status: TransactionStatus::Initiated,
            amount,
            items,
            retry: RetryInfo::new(max_attempts),
            inventory_synced: false,
            synced_items: Vec::new(),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Moves to `next`, enforcing the status graph.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Invalid`] for any edge not in the graph,
    /// including every edge out of a terminal status.
    pub fn transition(&mut self, next: TransactionStatus, now_ms: u64) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                tx_id: self.tx_id.clone(),
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = now_ms;
        Ok(())
    }

    /// Records a new attempt and moves the transaction into `Processing`.
    ///
    /// If the attempt budget is already spent the transaction is marked
    /// `Failed` and an error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::AttemptsExhausted`] when no attempts remain,
    /// or [`TransitionError::Invalid`] if the transaction is terminal.
    pub fn begin_attempt(&mut self, now_ms: u64) -> Result<u32, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Invalid {
                tx_id: self.tx_id.clone(),
                from: self.status.as_str(),
                to: TransactionStatus::Processing.as_str(),
            });
        }
        if self.retry.exhausted() {
            self.transition(TransactionStatus::Failed, now_ms)?;
            return Err(TransitionError::AttemptsExhausted {
                tx_id: self.tx_id.clone(),
                max_attempts: self.retry.max_attempts,
            });
        }
        if self.status != TransactionStatus::Processing {
            self.transition(TransactionStatus::Processing, now_ms)?;
        }
        self.retry.count += 1;
        self.retry.last_attempt_at = Some(now_ms);
        self.updated_at = now_ms;
        Ok(self.retry.count)
    }

    /// Applies the outcome of the attempt started by [`begin_attempt`](Self::begin_attempt).
    ///
    /// Failure leads to `Retry` while attempts remain, otherwise `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Invalid`] if called outside `Processing`.
    pub fn finish_attempt(&mut self, succeeded: bool, now_ms: u64) -> Result<TransactionStatus, TransitionError> {
        let next = if succeeded {
            TransactionStatus::Completed
        } else if self.retry.exhausted() {
            TransactionStatus::Failed
        } else {
            TransactionStatus::Retry
        };
        self.transition(next, now_ms)?;
        Ok(next)
    }

    /// Non-terminal and untouched for at least `stale_after_ms`.
    #[must_use]
    pub fn is_stuck(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        let last_touch = self.retry.last_attempt_at.unwrap_or(self.updated_at);
        !self.status.is_terminal() && now_ms.saturating_sub(last_touch) >= stale_after_ms
    }

    /// Confirms the inventory decrement for this order.
    ///
    /// Called by the order flow once stock was taken, so the sweep never
    /// publishes a correction for it.
    pub fn mark_inventory_synced(&mut self, now_ms: u64) {
        self.inventory_synced = true;
        self.updated_at = now_ms;
    }

    /// Completed, unconfirmed, and untouched for at least `stale_after_ms`.
    #[must_use]
    pub fn needs_inventory_sync(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        self.status == TransactionStatus::Completed
            && !self.inventory_synced
            && now_ms.saturating_sub(self.updated_at) >= stale_after_ms
    }

    /// Line items whose correction has not gone out yet.
    pub fn unsynced_items(&self) -> impl Iterator<Item = &LineItem> {
        self.items
            .iter()
            .filter(|item| !self.synced_items.contains(&item.product_id))
    }

    /// Records a published correction for `product_id`; once every item is
    /// covered the transaction counts as synced.
    pub fn record_item_synced(&mut self, product_id: &str) {
        if !self.synced_items.iter().any(|p| p == product_id) {
            self.synced_items.push(product_id.to_string());
        }
        if self.unsynced_items().next().is_none() {
            self.inventory_synced = true;
        }
    }
}
