use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::election::{LeaderElection, LeadershipHandler};
use crate::scheduler::action::ScheduledAction;
use crate::scheduler::dispatch::ActionDispatcher;
use crate::scheduler::reconciler::{ActionRegistry, Reconciler};
use crate::store::CoordinationStore;

/// State of the current activation, guarded by one lock so start and stop
/// never observe a half-updated flag.
#[derive(Default)]
struct Activation {
    active: bool,
    stop: Option<CancellationToken>,
    registry: Option<ActionRegistry>,
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn CoordinationStore>,
    dispatcher: Arc<ActionDispatcher>,
    shutdown: CancellationToken,
    activation: Mutex<Activation>,
    election: Mutex<Option<JoinHandle<()>>>,
}

/// Leader-gated scheduling service.
///
/// Lifecycle:
/// 1. [`Scheduler::new`] validates the config and builds an inactive scheduler
/// 2. [`Scheduler::start`] launches the leader election and returns
/// 3. On election, [`Scheduler::start_scheduling`] spawns the reconciliation
///    loop; on demotion, [`Scheduler::stop_scheduling`] stops it and every
///    tracked action (persisted definitions stay in the store)
/// 4. [`Scheduler::stop`] stops scheduling and ends the election for good
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn CoordinationStore>,
        dispatcher: ActionDispatcher,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                dispatcher: Arc::new(dispatcher),
                shutdown: CancellationToken::new(),
                activation: Mutex::new(Activation::default()),
                election: Mutex::new(None),
            }),
        })
    }

    fn activation(&self) -> MutexGuard<'_, Activation> {
        self.inner
            .activation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.inner.store.clone()
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.inner.dispatcher
    }

    /// Process-level shutdown signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_active(&self) -> bool {
        self.activation().active
    }

    /// Launch the leader election gate. Returns immediately; calling it again
    /// has no effect.
    pub fn start(&self) {
        let mut election = self
            .inner
            .election
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if election.is_some() {
            tracing::warn!("Scheduler already started");
            return;
        }

        let gate = LeaderElection::new(self.inner.store.clone(), &self.inner.config);
        let shutdown = self.inner.shutdown.clone();
        let handler: Arc<dyn LeadershipHandler> = Arc::new(self.clone());
        *election = Some(tokio::spawn(async move {
            gate.run(shutdown, handler).await;
        }));
    }

    /// Stop scheduling and end the leader election. The held lock is released.
    pub async fn stop(&self) {
        self.stop_scheduling().await;
        self.inner.shutdown.cancel();

        let election = self
            .inner
            .election
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = election {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Leader election task failed");
            }
        }
    }

    /// Become active: spawn a reconciliation loop over a fresh registry.
    ///
    /// Returns false if the scheduler was already active or is shut down.
    pub fn start_scheduling(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        let mut activation = self.activation();
        if activation.active {
            tracing::info!("Scheduling service is already running");
            return false;
        }

        let stop = CancellationToken::new();
        let registry: ActionRegistry = Arc::new(AsyncMutex::new(HashMap::new()));
        activation.active = true;
        activation.stop = Some(stop.clone());
        activation.registry = Some(registry.clone());
        drop(activation);

        let reconciler = Reconciler::new(
            self.inner.store.clone(),
            self.inner.dispatcher.clone(),
            self.inner.config.clone(),
            registry,
            stop,
            self.inner.shutdown.clone(),
        );
        tokio::spawn(reconciler.run());
        tracing::info!("Scheduling service started");
        true
    }

    /// Become inactive: end the reconciliation loop and stop every tracked
    /// action. No-op when inactive.
    pub async fn stop_scheduling(&self) {
        let (stop, registry) = {
            let mut activation = self.activation();
            if !activation.active {
                return;
            }
            tracing::debug!("Scheduling service is about to be stopped");
            activation.active = false;
            (activation.stop.take(), activation.registry.take())
        };

        // Cancel before taking the registry lock so the loop cannot start
        // anything once we drain it
        if let Some(stop) = stop {
            stop.cancel();
        }

        if let Some(registry) = registry {
            let actions: Vec<Arc<ScheduledAction>> =
                registry.lock().await.drain().map(|(_, a)| a).collect();
            let grace = self.inner.config.stop_grace;
            join_all(actions.iter().map(|action| action.stop(grace))).await;
            tracing::info!(stopped = actions.len(), "Scheduling service stopped");
        }
    }

    /// Actions tracked by the current activation, sorted by id.
    pub async fn tracked_actions(&self) -> Vec<Arc<ScheduledAction>> {
        let registry = self.activation().registry.clone();
        let Some(registry) = registry else {
            return Vec::new();
        };
        let mut actions: Vec<Arc<ScheduledAction>> =
            registry.lock().await.values().cloned().collect();
        actions.sort_by(|a, b| a.id.cmp(&b.id));
        actions
    }
}

#[async_trait]
impl LeadershipHandler for Scheduler {
    async fn on_elected(&self) {
        self.start_scheduling();
    }

    async fn on_demoted(&self) {
        self.stop_scheduling().await;
    }
}
