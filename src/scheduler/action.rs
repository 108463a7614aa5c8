use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::scheduler::dispatch::{ActionContext, ActionDispatcher};
use crate::scheduler::interval::parse_interval;
use crate::store::KvPair;

pub const DEPLOYMENT_ID_KEY: &str = "deploymentID";
pub const TYPE_KEY: &str = "type";
pub const INTERVAL_KEY: &str = "interval";
pub const UNREGISTER_FLAG_KEY: &str = ".unregisterFlag";

/// Keys of an action subtree that never end up in [`ScheduledAction::data`].
pub const RESERVED_KEYS: [&str; 4] = [DEPLOYMENT_ID_KEY, TYPE_KEY, INTERVAL_KEY, UNREGISTER_FLAG_KEY];

#[derive(Debug)]
struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    dispatcher: Arc<ActionDispatcher>,
}

/// A recurring action materialized from its store subtree.
///
/// Identity and timing fields are fixed at build time. The only mutable part
/// is the ticker task, owned by the action and driven by [`start`](Self::start)
/// and [`stop`](Self::stop).
#[derive(Debug)]
pub struct ScheduledAction {
    pub id: String,
    pub action_type: String,
    pub deployment_id: String,
    pub interval: Duration,
    pub data: HashMap<String, String>,
    task: Mutex<Option<RunningTask>>,
}

impl ScheduledAction {
    /// Build an action from the pairs listed under `root` (the action path
    /// without trailing slash).
    ///
    /// Custom keys are stored relative to `root`. Empty values are ignored,
    /// like absent keys.
    pub fn from_kv_pairs(id: &str, root: &str, pairs: &[KvPair]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(SchedulerError::ActionNotFound(id.to_string()));
        }

        let mut action_type = None;
        let mut deployment_id = String::new();
        let mut interval = None;
        let mut data = HashMap::new();

        let root = format!("{}/", root.trim_end_matches('/'));
        for pair in pairs {
            let Some(key) = pair.key.strip_prefix(&root) else {
                continue;
            };
            if key.is_empty() || pair.value.is_empty() {
                continue;
            }
            match key {
                DEPLOYMENT_ID_KEY => deployment_id = pair.value.clone(),
                TYPE_KEY => action_type = Some(pair.value.clone()),
                INTERVAL_KEY => {
                    let parsed = parse_interval(&pair.value).map_err(|reason| {
                        SchedulerError::InvalidInterval {
                            id: id.to_string(),
                            value: pair.value.clone(),
                            reason,
                        }
                    })?;
                    interval = Some(parsed);
                }
                UNREGISTER_FLAG_KEY => {}
                custom => {
                    data.insert(custom.to_string(), pair.value.clone());
                }
            }
        }

        let action_type = action_type.ok_or_else(|| SchedulerError::MissingField {
            id: id.to_string(),
            field: TYPE_KEY,
        })?;
        let interval = interval.ok_or_else(|| SchedulerError::MissingField {
            id: id.to_string(),
            field: INTERVAL_KEY,
        })?;

        Ok(Self {
            id: id.to_string(),
            action_type,
            deployment_id,
            interval,
            data,
            task: Mutex::new(None),
        })
    }

    fn task(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn context(&self) -> ActionContext {
        ActionContext {
            action_id: self.id.clone(),
            action_type: self.action_type.clone(),
            deployment_id: self.deployment_id.clone(),
            data: self.data.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().is_some()
    }

    /// Spawn the ticker. No-op if it is already running.
    ///
    /// The first dispatch happens one full interval after start.
    pub fn start(&self, dispatcher: Arc<ActionDispatcher>) {
        let mut task = self.task();
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ticker(
            self.context(),
            self.interval,
            dispatcher.clone(),
            cancel.clone(),
        ));
        *task = Some(RunningTask {
            cancel,
            handle,
            dispatcher,
        });

        tracing::info!(
            action_id = %self.id,
            action_type = %self.action_type,
            interval_ms = self.interval.as_millis() as u64,
            "Scheduled action started"
        );
    }

    /// Stop the ticker. No-op if it is not running.
    ///
    /// Once this returns no new dispatch begins. A dispatch already running
    /// gets up to `grace` to finish before the task is aborted.
    pub async fn stop(&self, grace: Duration) {
        let running = self.task().take();
        let Some(RunningTask {
            cancel,
            mut handle,
            dispatcher,
        }) = running
        else {
            return;
        };
        cancel.cancel();

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {
                tracing::info!(action_id = %self.id, "Scheduled action stopped");
            }
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!(action_id = %self.id, error = %e, "Scheduled action task panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                tracing::warn!(
                    action_id = %self.id,
                    grace_ms = grace.as_millis() as u64,
                    "Dispatch still running after grace period, aborting"
                );
                handle.abort();
            }
        }
        dispatcher.action_stopped(&self.action_type, &self.id);
    }
}

/// Dispatch loop of one action. Ticks that fall due while a dispatch is
/// running are delayed, never queued up or run concurrently.
async fn run_ticker(
    ctx: ActionContext,
    period: Duration,
    dispatcher: Arc<ActionDispatcher>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tracing::debug!(action_id = %ctx.action_id, "Dispatching scheduled action");
        if let Err(e) = dispatcher.dispatch(&ctx).await {
            tracing::warn!(
                action_id = %ctx.action_id,
                action_type = %ctx.action_type,
                deployment_id = %ctx.deployment_id,
                error = %e,
                "Scheduled action dispatch failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &str, value: &str) -> KvPair {
        KvPair {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    const ROOT: &str = "s/actions/a1";

    #[test]
    fn builds_from_pairs() {
        let pairs = vec![
            pair("s/actions/a1/deploymentID", "dep1"),
            pair("s/actions/a1/interval", "30s"),
            pair("s/actions/a1/type", "scale-check"),
            pair("s/actions/a1/node", "compute"),
            pair("s/actions/a1/threshold", "80"),
        ];
        let action = ScheduledAction::from_kv_pairs("a1", ROOT, &pairs).unwrap();

        assert_eq!(action.id, "a1");
        assert_eq!(action.action_type, "scale-check");
        assert_eq!(action.deployment_id, "dep1");
        assert_eq!(action.interval, Duration::from_secs(30));
        assert_eq!(action.data.len(), 2);
        assert_eq!(action.data.get("node").map(String::as_str), Some("compute"));
        assert_eq!(action.data.get("threshold").map(String::as_str), Some("80"));
        assert!(!action.is_running());
    }

    #[test]
    fn reserved_keys_excluded_from_data() {
        let pairs = vec![
            pair("s/actions/a1/deploymentID", "dep1"),
            pair("s/actions/a1/interval", "1s"),
            pair("s/actions/a1/type", "t"),
            pair("s/actions/a1/.unregisterFlag", "false"),
        ];
        let action = ScheduledAction::from_kv_pairs("a1", ROOT, &pairs).unwrap();
        assert!(action.data.is_empty());
    }

    #[test]
    fn nested_custom_keys_are_relative() {
        let pairs = vec![
            pair("s/actions/a1/interval", "1s"),
            pair("s/actions/a1/type", "t"),
            pair("s/actions/a1/check/url", "http://x"),
        ];
        let action = ScheduledAction::from_kv_pairs("a1", ROOT, &pairs).unwrap();
        assert_eq!(action.data.get("check/url").map(String::as_str), Some("http://x"));
    }

    #[test]
    fn empty_values_are_ignored() {
        let pairs = vec![
            pair("s/actions/a1/interval", "1s"),
            pair("s/actions/a1/type", "t"),
            pair("s/actions/a1/deploymentID", ""),
            pair("s/actions/a1/blank", ""),
        ];
        let action = ScheduledAction::from_kv_pairs("a1", ROOT, &pairs).unwrap();
        assert_eq!(action.deployment_id, "");
        assert!(action.data.is_empty());
    }

    #[test]
    fn invalid_interval_fails() {
        let pairs = vec![
            pair("s/actions/a1/interval", "not-a-duration"),
            pair("s/actions/a1/type", "t"),
        ];
        let err = ScheduledAction::from_kv_pairs("a1", ROOT, &pairs).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval { ref value, .. } if value == "not-a-duration"));
    }

    #[test]
    fn missing_fields_fail() {
        let no_type = vec![pair("s/actions/a1/interval", "1s")];
        assert!(matches!(
            ScheduledAction::from_kv_pairs("a1", ROOT, &no_type),
            Err(SchedulerError::MissingField { field: TYPE_KEY, .. })
        ));

        let no_interval = vec![pair("s/actions/a1/type", "t")];
        assert!(matches!(
            ScheduledAction::from_kv_pairs("a1", ROOT, &no_interval),
            Err(SchedulerError::MissingField { field: INTERVAL_KEY, .. })
        ));
    }

    #[test]
    fn no_pairs_is_not_found() {
        assert!(matches!(
            ScheduledAction::from_kv_pairs("a1", ROOT, &[]),
            Err(SchedulerError::ActionNotFound(_))
        ));
    }

    #[derive(Default)]
    struct StopTracking {
        stopped: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::scheduler::dispatch::ActionHandler for StopTracking {
        async fn execute(&self, _ctx: &ActionContext) -> crate::error::Result<()> {
            Ok(())
        }

        fn action_stopped(&self, action_id: &str) {
            self.stopped.lock().unwrap().push(action_id.to_string());
        }
    }

    #[tokio::test]
    async fn stop_notifies_the_handler_once() {
        let pairs = vec![
            pair("s/actions/a1/interval", "1s"),
            pair("s/actions/a1/type", "t"),
        ];
        let action = ScheduledAction::from_kv_pairs("a1", ROOT, &pairs).unwrap();
        let handler = Arc::new(StopTracking::default());
        let mut dispatcher = ActionDispatcher::new();
        dispatcher.register("t", handler.clone());

        action.start(Arc::new(dispatcher));
        action.stop(Duration::from_millis(100)).await;
        action.stop(Duration::from_millis(100)).await;
        assert_eq!(*handler.stopped.lock().unwrap(), vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let pairs = vec![
            pair("s/actions/a1/interval", "1s"),
            pair("s/actions/a1/type", "t"),
        ];
        let action = ScheduledAction::from_kv_pairs("a1", ROOT, &pairs).unwrap();
        action.stop(Duration::from_millis(10)).await;
        action.stop(Duration::from_millis(10)).await;
        assert!(!action.is_running());
    }
}
