//! Reconciliation sweep for payment transactions stuck in a non-terminal
//! state, and the scheduler that runs each sweep in isolation.
//!
//! Every sweep runs in its own task with its own bus connection and a hard
//! deadline shorter than the schedule interval. A sweep that overruns is
//! aborted, so a stuck pass can never pile up behind the next tick or hold
//! resources of the serving process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use shopmesh_core::{
    ClockSource, PaymentTransaction, SystemClock, TransactionStatus, TransitionError,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{DocumentStore, StoreError};
use crate::bus::{BrokerConnector, BusConfig, BusError, EventPublisher, MessageBusClient};
use crate::service::{BackgroundRunnable, BackgroundWorker};

/// Event asking the inventory service to apply a missed decrement.
pub const INVENTORY_RECONCILE: &str = "inventory.reconcile";

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Hard limit for one sweep; must be shorter than `interval`.
    pub deadline: Duration,
    /// A non-terminal transaction untouched for this long counts as stuck.
    pub stale_after: Duration,
    /// Maximum transactions handled per sweep.
    pub batch_size: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            deadline: Duration::from_secs(45),
            stale_after: Duration::from_secs(300),
            batch_size: 100,
        }
    }
}

/// Re-attempts the side effect of a stuck transaction.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// `Ok(())` means the side effect went through.
    async fn process(&self, transaction: &PaymentTransaction) -> anyhow::Result<()>;
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub retried: usize,
    pub completed: usize,
    pub failed: usize,
    /// Attempted but left in `RETRY` for a later sweep.
    pub retrying: usize,
    /// Transactions whose inventory correction was published.
    pub reconciled: usize,
    pub errors: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("failed to open sweep publisher: {0}")]
    Publisher(#[source] BusError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sweep exceeded its {deadline:?} deadline")]
    DeadlineExceeded { deadline: Duration },
    #[error("sweep worker terminated without reporting")]
    Crashed,
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// One pass over stuck transactions.
pub struct ReconciliationSweep {
    store: Arc<dyn DocumentStore<PaymentTransaction>>,
    processor: Arc<dyn PaymentProcessor>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn ClockSource>,
    config: ReconciliationConfig,
}

impl ReconciliationSweep {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore<PaymentTransaction>>,
        processor: Arc<dyn PaymentProcessor>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn ClockSource>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            processor,
            events,
            clock,
            config,
        }
    }

    /// Retries stuck transactions and publishes inventory corrections for
    /// completed ones whose decrement was never confirmed within
    /// `stale_after`.
    ///
    /// # Errors
    ///
    /// Fails only if the transaction list cannot be read; per-transaction
    /// problems are counted in [`SweepReport::errors`].
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let now = self.clock.now();
        let stale_ms = u64::try_from(self.config.stale_after.as_millis()).unwrap_or(u64::MAX);
        let candidates: Vec<PaymentTransaction> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|tx| tx.is_stuck(now, stale_ms) || tx.needs_inventory_sync(now, stale_ms))
            .take(self.config.batch_size)
            .collect();

        let mut report = SweepReport::default();
        for mut tx in candidates {
            report.scanned += 1;
            if tx.status != TransactionStatus::Completed {
                self.retry(&mut tx, now, &mut report).await;
            }
            // A transaction completed by this sweep waits a full stale window
            // for the order flow to confirm its decrement.
            if tx.needs_inventory_sync(now, stale_ms) {
                self.sync_inventory(&mut tx, &mut report).await;
            }
            if let Err(e) = self.store.update(&tx.tx_id, tx.clone()).await {
                warn!(tx = %tx.tx_id, error = %e, "failed to persist reconciled transaction");
                report.errors += 1;
            }
        }
        Ok(report)
    }

    async fn retry(&self, tx: &mut PaymentTransaction, now: u64, report: &mut SweepReport) {
        let attempt = match tx.begin_attempt(now) {
            Ok(attempt) => attempt,
            Err(TransitionError::AttemptsExhausted { max_attempts, .. }) => {
                info!(tx = %tx.tx_id, max_attempts, "retry budget spent, marking failed");
                report.failed += 1;
                return;
            }
            Err(e) => {
                warn!(tx = %tx.tx_id, error = %e, "cannot retry transaction");
                report.errors += 1;
                return;
            }
        };

        report.retried += 1;
        let succeeded = match self.processor.process(tx).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tx = %tx.tx_id, attempt, error = %e, "transaction retry failed");
                false
            }
        };
        match tx.finish_attempt(succeeded, now) {
            Ok(TransactionStatus::Completed) => report.completed += 1,
            Ok(TransactionStatus::Failed) => report.failed += 1,
            Ok(_) => report.retrying += 1,
            Err(e) => {
                warn!(tx = %tx.tx_id, error = %e, "invalid transaction state after retry");
                report.errors += 1;
            }
        }
    }

    /// Publishes one correction per item not yet covered. Each published
    /// item is recorded on the transaction, so a partial failure resumes
    /// with the remaining items on the next sweep.
    async fn sync_inventory(&self, tx: &mut PaymentTransaction, report: &mut SweepReport) {
        let pending: Vec<_> = tx.unsynced_items().cloned().collect();
        for item in pending {
            let correction = json!({
                "productId": item.product_id,
                "quantity": item.quantity,
                "orderId": tx.order_id,
                "txId": tx.tx_id,
            });
            if let Err(e) = self.events.publish_event(INVENTORY_RECONCILE, correction).await {
                warn!(tx = %tx.tx_id, product = %item.product_id, error = %e, "failed to publish inventory correction");
                report.errors += 1;
                return;
            }
            tx.record_item_synced(&item.product_id);
        }
        // Covers transactions without line items too.
        tx.inventory_synced = true;
        report.reconciled += 1;
        debug!(tx = %tx.tx_id, items = tx.items.len(), "inventory correction published");
    }
}

/// Records that the order flow applied the stock decrement for `tx_id`, so
/// the sweep never publishes a correction for it. Returns `false` when the
/// transaction is unknown.
///
/// # Errors
///
/// Propagates store failures.
pub async fn confirm_inventory(
    store: &dyn DocumentStore<PaymentTransaction>,
    tx_id: &str,
    now_ms: u64,
) -> Result<bool, StoreError> {
    let Some(mut tx) = store.get(tx_id).await? else {
        return Ok(false);
    };
    if !tx.inventory_synced {
        tx.mark_inventory_synced(now_ms);
        store.update(tx_id, tx).await?;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Isolated scheduling
// ---------------------------------------------------------------------------

/// Opens a dedicated publisher for a single sweep.
#[async_trait]
pub trait PublisherFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn EventPublisher>, BusError>;
}

/// Gives each sweep its own [`MessageBusClient`] connection.
pub struct BusPublisherFactory {
    config: BusConfig,
    connector: Arc<dyn BrokerConnector>,
}

impl BusPublisherFactory {
    #[must_use]
    pub fn new(config: BusConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self { config, connector }
    }
}

#[async_trait]
impl PublisherFactory for BusPublisherFactory {
    async fn open(&self) -> Result<Arc<dyn EventPublisher>, BusError> {
        let client = MessageBusClient::new(self.config.clone(), Arc::clone(&self.connector));
        if let Err(e) = client.connect().await {
            client.disconnect().await;
            return Err(e);
        }
        Ok(Arc::new(client))
    }
}

/// Closes the publisher even when the sweep task is aborted.
struct CloseOnDrop(Option<Arc<dyn EventPublisher>>);

impl CloseOnDrop {
    async fn close(mut self) {
        if let Some(publisher) = self.0.take() {
            publisher.close().await;
        }
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(publisher) = self.0.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { publisher.close().await });
            }
        }
    }
}

/// On-demand sweep request; the result is sent back on the channel.
pub struct SweepNow(pub oneshot::Sender<Result<SweepReport, SweepError>>);

/// Runs a [`ReconciliationSweep`] every interval, each in an isolated task.
pub struct ReconciliationScheduler {
    store: Arc<dyn DocumentStore<PaymentTransaction>>,
    processor: Arc<dyn PaymentProcessor>,
    publishers: Arc<dyn PublisherFactory>,
    clock: Arc<dyn ClockSource>,
    config: ReconciliationConfig,
}

impl ReconciliationScheduler {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore<PaymentTransaction>>,
        processor: Arc<dyn PaymentProcessor>,
        publishers: Arc<dyn PublisherFactory>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            processor,
            publishers,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawns the scheduler as a background worker owned by `parent`.
    #[must_use]
    pub fn start(self, parent: &CancellationToken) -> BackgroundWorker<Self> {
        let interval = self.config.interval;
        BackgroundWorker::start("reconciliation", self, interval, parent)
    }

    /// Runs one sweep in its own task and waits for its report.
    ///
    /// # Errors
    ///
    /// [`SweepError::DeadlineExceeded`] if the sweep overran and was aborted,
    /// [`SweepError::Crashed`] if it died without reporting, or the sweep's
    /// own error.
    pub async fn run_isolated(&self) -> Result<SweepReport, SweepError> {
        let (report_tx, report_rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let processor = Arc::clone(&self.processor);
        let publishers = Arc::clone(&self.publishers);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();

        let worker = tokio::spawn(async move {
            let result = async {
                let publisher = publishers.open().await.map_err(SweepError::Publisher)?;
                let guard = CloseOnDrop(Some(Arc::clone(&publisher)));
                let sweep = ReconciliationSweep::new(store, processor, publisher, clock, config);
                let report = sweep.run().await;
                guard.close().await;
                report
            }
            .await;
            let _ = report_tx.send(result);
        });

        let deadline = self.config.deadline;
        match tokio::time::timeout(deadline, report_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SweepError::Crashed),
            Err(_) => {
                worker.abort();
                Err(SweepError::DeadlineExceeded { deadline })
            }
        }
    }

    fn record(result: &Result<SweepReport, SweepError>) {
        match result {
            Ok(report) => {
                info!(
                    scanned = report.scanned,
                    completed = report.completed,
                    failed = report.failed,
                    retrying = report.retrying,
                    reconciled = report.reconciled,
                    errors = report.errors,
                    "reconciliation sweep finished"
                );
                metrics::counter!("reconciliation_completed_total").increment(report.completed as u64);
                metrics::counter!("reconciliation_failed_total").increment(report.failed as u64);
                metrics::counter!("reconciliation_events_total").increment(report.reconciled as u64);
            }
            Err(e) => {
                error!(error = %e, "reconciliation sweep failed");
                metrics::counter!("reconciliation_sweep_errors_total").increment(1);
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for ReconciliationScheduler {
    type Task = SweepNow;

    async fn run(&mut self, task: SweepNow) {
        let result = self.run_isolated().await;
        Self::record(&result);
        let _ = task.0.send(result);
    }

    async fn on_tick(&mut self) {
        let result = self.run_isolated().await;
        Self::record(&result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use parking_lot::Mutex;
    use serde_json::Value;
    use shopmesh_core::{LineItem, ManualClock};

    use super::*;
    use crate::bus::MemoryBroker;
    use crate::saga::store::MemoryStore;

    const MINUTE_MS: u64 = 60_000;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Value)>>,
        closed: AtomicBool,
        fail: bool,
        /// 1-based publish call that fails once.
        fail_call: Option<u32>,
        calls: AtomicU32,
    }

    impl Recorder {
        fn products(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(_, data)| data["productId"].as_str().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for Recorder {
        async fn publish_event(&self, kind: &str, data: Value) -> Result<String, BusError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail || self.fail_call == Some(call) {
                return Err(BusError::NotConnected);
            }
            self.sent.lock().push((kind.to_string(), data));
            Ok("evt".to_string())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct SharedRecorder(Arc<Recorder>);

    #[async_trait]
    impl PublisherFactory for SharedRecorder {
        async fn open(&self) -> Result<Arc<dyn EventPublisher>, BusError> {
            Ok(Arc::clone(&self.0) as Arc<dyn EventPublisher>)
        }
    }

    /// Succeeds for transaction ids in `ok`, fails the rest.
    struct Scripted {
        ok: Vec<&'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PaymentProcessor for Scripted {
        async fn process(&self, tx: &PaymentTransaction) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ok.iter().any(|id| *id == tx.tx_id) {
                Ok(())
            } else {
                anyhow::bail!("gateway declined")
            }
        }
    }

    struct Hanging;

    #[async_trait]
    impl PaymentProcessor for Hanging {
        async fn process(&self, _tx: &PaymentTransaction) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn transaction(id: &str, max_attempts: u32) -> PaymentTransaction {
        PaymentTransaction::new(
            format!("order-{id}"),
            id,
            1_000,
            vec![LineItem {
                product_id: "p-1".into(),
                quantity: 2,
            }],
            max_attempts,
            0,
        )
    }

    async fn seeded(txs: Vec<PaymentTransaction>) -> Arc<MemoryStore<PaymentTransaction>> {
        let store = Arc::new(MemoryStore::new());
        for tx in txs {
            store.insert(&tx.tx_id.clone(), tx).await.unwrap();
        }
        store
    }

    fn completed(id: &str, items: &[&str]) -> PaymentTransaction {
        let mut tx = transaction(id, 3);
        tx.items = items
            .iter()
            .map(|product| LineItem {
                product_id: (*product).into(),
                quantity: 1,
            })
            .collect();
        tx.transition(TransactionStatus::Processing, 1).unwrap();
        tx.transition(TransactionStatus::Completed, 2).unwrap();
        tx
    }

    fn sweep_at(
        store: &Arc<MemoryStore<PaymentTransaction>>,
        processor: Arc<dyn PaymentProcessor>,
        events: &Arc<Recorder>,
        clock: Arc<ManualClock>,
    ) -> ReconciliationSweep {
        ReconciliationSweep::new(
            Arc::clone(store) as Arc<dyn DocumentStore<PaymentTransaction>>,
            processor,
            Arc::clone(events) as Arc<dyn EventPublisher>,
            clock,
            ReconciliationConfig::default(),
        )
    }

    fn sweep(
        store: &Arc<MemoryStore<PaymentTransaction>>,
        processor: Arc<dyn PaymentProcessor>,
        events: &Arc<Recorder>,
    ) -> ReconciliationSweep {
        sweep_at(store, processor, events, Arc::new(ManualClock::new(10 * MINUTE_MS)))
    }

    fn declining() -> Arc<dyn PaymentProcessor> {
        Arc::new(Scripted {
            ok: vec![],
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn retries_stuck_transactions_and_reconciles_inventory_once_stale() {
        let store = seeded(vec![transaction("ok", 3), transaction("bad", 3)]).await;
        let events = Arc::new(Recorder::default());
        let processor = Arc::new(Scripted {
            ok: vec!["ok"],
            calls: AtomicU32::new(0),
        });
        let clock = Arc::new(ManualClock::new(10 * MINUTE_MS));
        let sweep = sweep_at(&store, processor.clone(), &events, clock.clone());

        let report = sweep.run().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.retried, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.reconciled, 0);

        let ok = store.get("ok").await.unwrap().unwrap();
        assert_eq!(ok.status, TransactionStatus::Completed);
        assert!(!ok.inventory_synced);
        let bad = store.get("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, TransactionStatus::Retry);
        assert_eq!(bad.retry.count, 1);
        assert!(events.sent.lock().is_empty());

        // Nobody confirmed the decrement within the stale window.
        clock.advance(5 * MINUTE_MS);
        let report = sweep.run().await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert!(store.get("ok").await.unwrap().unwrap().inventory_synced);

        let sent = events.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, INVENTORY_RECONCILE);
        assert_eq!(sent[0].1["productId"], "p-1");
        assert_eq!(sent[0].1["quantity"], 2);
        assert_eq!(sent[0].1["txId"], "ok");
    }

    #[tokio::test]
    async fn transaction_completed_just_now_is_not_reconciled() {
        let mut recent = completed("recent", &["p-1"]);
        recent.updated_at = 10 * MINUTE_MS - 1_000;
        let store = seeded(vec![recent]).await;
        let events = Arc::new(Recorder::default());

        let report = sweep(&store, declining(), &events).run().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(events.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn confirmation_from_order_flow_suppresses_correction() {
        let store = seeded(vec![completed("paid", &["p-1"])]).await;
        assert!(confirm_inventory(&*store, "paid", 5).await.unwrap());
        assert!(!confirm_inventory(&*store, "missing", 5).await.unwrap());

        let events = Arc::new(Recorder::default());
        let report = sweep(&store, declining(), &events).run().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(events.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn partial_publish_failure_resumes_with_remaining_items() {
        let store = seeded(vec![completed("two", &["p-1", "p-2"])]).await;
        let events = Arc::new(Recorder {
            fail_call: Some(2),
            ..Recorder::default()
        });
        let clock = Arc::new(ManualClock::new(10 * MINUTE_MS));
        let sweep = sweep_at(&store, declining(), &events, clock.clone());

        let report = sweep.run().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.reconciled, 0);
        let stored = store.get("two").await.unwrap().unwrap();
        assert_eq!(stored.synced_items, ["p-1"]);
        assert!(!stored.inventory_synced);

        clock.advance(MINUTE_MS);
        let report = sweep.run().await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(events.products(), ["p-1", "p-2"]);
        assert!(store.get("two").await.unwrap().unwrap().inventory_synced);

        clock.advance(MINUTE_MS);
        assert_eq!(sweep.run().await.unwrap(), SweepReport::default());
        assert_eq!(events.products(), ["p-1", "p-2"]);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let store = seeded(vec![transaction("bad", 2)]).await;
        let events = Arc::new(Recorder::default());
        let processor = Arc::new(Scripted {
            ok: vec![],
            calls: AtomicU32::new(0),
        });

        let clock = Arc::new(ManualClock::new(10 * MINUTE_MS));
        let sweep = ReconciliationSweep::new(
            Arc::clone(&store) as Arc<dyn DocumentStore<PaymentTransaction>>,
            processor.clone(),
            Arc::clone(&events) as Arc<dyn EventPublisher>,
            clock.clone(),
            ReconciliationConfig::default(),
        );
        for _ in 0..4 {
            sweep.run().await.unwrap();
            clock.advance(10 * MINUTE_MS);
        }

        let bad = store.get("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, TransactionStatus::Failed);
        assert_eq!(bad.retry.count, 2);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert!(events.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn fresh_and_terminal_transactions_are_skipped() {
        let mut fresh = transaction("fresh", 3);
        fresh.updated_at = 10 * MINUTE_MS;
        let mut done = completed("done", &["p-1"]);
        done.mark_inventory_synced(3);
        let store = seeded(vec![fresh, done]).await;

        let events = Arc::new(Recorder::default());
        let processor = Arc::new(Scripted {
            ok: vec![],
            calls: AtomicU32::new(0),
        });
        let report = sweep(&store, processor, &events).run().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn unsynced_completed_transaction_is_retried_on_next_sweep() {
        let store = seeded(vec![completed("done", &["p-1"])]).await;
        let processor = declining();

        let failing = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let report = sweep(&store, Arc::clone(&processor), &failing).run().await.unwrap();
        assert_eq!(report.errors, 1);
        assert!(!store.get("done").await.unwrap().unwrap().inventory_synced);

        let working = Arc::new(Recorder::default());
        let report = sweep(&store, processor, &working).run().await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.retried, 0);
        assert!(store.get("done").await.unwrap().unwrap().inventory_synced);
    }

    #[tokio::test]
    async fn isolated_run_reports_and_closes_publisher() {
        let store = seeded(vec![transaction("ok", 3)]).await;
        let recorder = Arc::new(Recorder::default());
        let scheduler = ReconciliationScheduler::new(
            store,
            Arc::new(Scripted {
                ok: vec!["ok"],
                calls: AtomicU32::new(0),
            }),
            Arc::new(SharedRecorder(Arc::clone(&recorder))),
            ReconciliationConfig::default(),
        )
        .with_clock(Arc::new(ManualClock::new(10 * MINUTE_MS)));

        let report = scheduler.run_isolated().await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(recorder.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_sweep_is_aborted_at_deadline() {
        let store = seeded(vec![transaction("stuck", 3)]).await;
        let recorder = Arc::new(Recorder::default());
        let config = ReconciliationConfig {
            deadline: Duration::from_secs(5),
            ..ReconciliationConfig::default()
        };
        let scheduler = ReconciliationScheduler::new(
            store,
            Arc::new(Hanging),
            Arc::new(SharedRecorder(Arc::clone(&recorder))),
            config,
        )
        .with_clock(Arc::new(ManualClock::new(10 * MINUTE_MS)));

        let started = tokio::time::Instant::now();
        let err = scheduler.run_isolated().await.unwrap_err();
        assert!(matches!(err, SweepError::DeadlineExceeded { .. }));
        assert!(started.elapsed() >= Duration::from_secs(5));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(recorder.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn bus_factory_uses_a_dedicated_connection() {
        let broker = MemoryBroker::new();
        let config = BusConfig {
            uri: "memory://sweep".into(),
            ..BusConfig::for_service("reconciliation")
        };
        let store = seeded(vec![completed("done", &["p-1"])]).await;
        let scheduler = ReconciliationScheduler::new(
            store,
            declining(),
            Arc::new(BusPublisherFactory::new(config, Arc::new(broker.clone()))),
            ReconciliationConfig::default(),
        )
        .with_clock(Arc::new(ManualClock::new(10 * MINUTE_MS)));

        let report = scheduler.run_isolated().await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(broker.published_count(), 1);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn worker_serves_on_demand_sweeps() {
        let store = seeded(vec![transaction("ok", 3)]).await;
        let scheduler = ReconciliationScheduler::new(
            store,
            Arc::new(Scripted {
                ok: vec!["ok"],
                calls: AtomicU32::new(0),
            }),
            Arc::new(SharedRecorder(Arc::new(Recorder::default()))),
            ReconciliationConfig::default(),
        )
        .with_clock(Arc::new(ManualClock::new(10 * MINUTE_MS)));

        let shutdown = CancellationToken::new();
        let mut worker = scheduler.start(&shutdown);
        let (tx, rx) = oneshot::channel();
        worker.submit(SweepNow(tx)).await.unwrap();
        let report = rx.await.unwrap().unwrap();
        assert_eq!(report.completed, 1);
        worker.stop().await;
    }
}
