use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::action::{ScheduledAction, UNREGISTER_FLAG_KEY};
use crate::scheduler::dispatch::ActionDispatcher;
use crate::store::{key_base, CoordinationStore, QueryOptions};

/// Running actions of one activation, keyed by action id.
///
/// Shared between the reconciliation loop and `stop_scheduling`; every
/// mutation happens under the lock.
pub type ActionRegistry = Arc<Mutex<HashMap<String, Arc<ScheduledAction>>>>;

/// What a reconciliation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// False when the watch returned without a keyspace change
    pub changed: bool,
    pub started: Vec<String>,
    pub unregistered: Vec<String>,
    pub failed: Vec<String>,
}

/// Long-polls the actions keyspace and reconciles it with the registry.
pub struct Reconciler {
    store: Arc<dyn CoordinationStore>,
    dispatcher: Arc<ActionDispatcher>,
    config: SchedulerConfig,
    registry: ActionRegistry,
    stop: CancellationToken,
    shutdown: CancellationToken,
    wait_index: u64,
    retry_pending: bool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        dispatcher: Arc<ActionDispatcher>,
        config: SchedulerConfig,
        registry: ActionRegistry,
        stop: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            registry,
            stop,
            shutdown,
            wait_index: 0,
            retry_pending: false,
        }
    }

    /// Index observed by the last cycle that saw a change.
    pub fn wait_index(&self) -> u64 {
        self.wait_index
    }

    fn should_exit(&self) -> bool {
        if self.stop.is_cancelled() {
            tracing::debug!("Ending scheduling service has been requested: stop it now");
            return true;
        }
        if self.shutdown.is_cancelled() {
            tracing::debug!("Shutdown has been sent: stop scheduled actions now");
            return true;
        }
        false
    }

    /// Run cycles until the activation or the process is cancelled.
    pub async fn run(mut self) {
        loop {
            if self.should_exit() {
                return;
            }

            if let Err(e) = self.run_cycle().await {
                tracing::warn!(error = %e, "Error during polling scheduled actions");
                // Keep a failing store from turning this into a busy loop
                tokio::select! {
                    _ = self.stop.cancelled() => {}
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.config.store_retry_delay) => {}
                }
            }
        }
    }

    /// One blocking list plus the per-action reconciliation that follows it.
    ///
    /// Per-action failures are logged and reported; only the list call itself
    /// returns an error.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let prefix = self.config.actions_prefix();
        let opts = QueryOptions::blocking(self.wait_index, self.config.watch_wait);
        let (keys, meta) = self.store.keys(&prefix, Some("/"), &opts).await?;
        tracing::debug!(count = keys.len(), "Found scheduled actions");

        let mut report = CycleReport::default();
        if meta.last_index < self.wait_index {
            tracing::warn!(
                previous = self.wait_index,
                current = meta.last_index,
                "Store index went backwards, resetting watch"
            );
            self.wait_index = 0;
            return Ok(report);
        }
        if meta.last_index == self.wait_index && !self.retry_pending {
            // Long poll ended on its timeout, nothing new
            return Ok(report);
        }
        report.changed = meta.last_index != self.wait_index;
        self.wait_index = meta.last_index;
        tracing::debug!(wait_index = self.wait_index, "Scheduling wait index");

        for key in keys {
            if self.stop.is_cancelled() || self.shutdown.is_cancelled() {
                break;
            }
            if !key.ends_with('/') {
                tracing::debug!(key = %key, "Ignoring key outside of an action subtree");
                continue;
            }
            let id = key_base(&key).to_string();
            if let Err(e) = self.reconcile_action(&id, &mut report).await {
                tracing::warn!(action_id = %id, error = %e, "Failed to reconcile scheduled action");
                report.failed.push(id);
            }
        }

        self.retry_pending = !report.failed.is_empty();
        Ok(report)
    }

    async fn reconcile_action(&self, id: &str, report: &mut CycleReport) -> Result<()> {
        let root = self.config.action_path(id);

        let flag = self
            .store
            .get(&format!("{}/{}", root, UNREGISTER_FLAG_KEY))
            .await?;
        if flag.is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            tracing::debug!(
                action_id = %id,
                "Scheduled action has been requested to be stopped and unregistered"
            );
            let removed = self.registry.lock().await.remove(id);
            if let Some(action) = removed {
                action.stop(self.config.stop_grace).await;
            }
            self.store
                .delete_tree(&format!("{}/", root))
                .await
                .map_err(|e| {
                    SchedulerError::store(format!("failed to delete scheduled action {}", id), e)
                })?;
            tracing::info!(action_id = %id, "Scheduled action unregistered");
            report.unregistered.push(id.to_string());
            return Ok(());
        }

        let pairs = self.store.list(&format!("{}/", root)).await?;
        let action = ScheduledAction::from_kv_pairs(id, &root, &pairs)?;

        let mut registry = self.registry.lock().await;
        // Leadership may have been lost while reading the store
        if self.stop.is_cancelled() {
            return Ok(());
        }
        if registry.contains_key(id) {
            return Ok(());
        }
        tracing::debug!(action_id = %id, "Start scheduled action");
        let action = Arc::new(action);
        action.start(self.dispatcher.clone());
        registry.insert(id.to_string(), action);
        report.started.push(id.to_string());
        Ok(())
    }
}
