use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::store::CoordinationStore;

/// Everything a handler receives for one tick of a scheduled action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub action_id: String,
    pub action_type: String,
    pub deployment_id: String,
    pub data: HashMap<String, String>,
}

/// Performs the work behind one action type.
///
/// Errors are logged by the ticker and do not stop the action; the next tick
/// runs at the configured interval as usual.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, ctx: &ActionContext) -> Result<()>;

    /// Called once the ticker of `action_id` has stopped for good in this
    /// activation. Handlers drop any per-action state here.
    fn action_stopped(&self, _action_id: &str) {}
}

/// Maps action type tags to their handlers. Built once at startup.
#[derive(Clone, Default)]
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("action_types", &self.action_types())
            .finish()
    }
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        action_type: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> Self {
        self.register(action_type, Arc::new(handler));
        self
    }

    /// Register a handler, replacing any previous one for the same tag.
    pub fn register(&mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    pub fn supports(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Registered tags, sorted
    pub fn action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub async fn dispatch(&self, ctx: &ActionContext) -> Result<()> {
        let handler = self
            .handlers
            .get(&ctx.action_type)
            .ok_or_else(|| SchedulerError::UnsupportedActionType(ctx.action_type.clone()))?;
        handler.execute(ctx).await
    }

    pub fn action_stopped(&self, action_type: &str, action_id: &str) {
        if let Some(handler) = self.handlers.get(action_type) {
            handler.action_stopped(action_id);
        }
    }
}

/// Handler that only logs each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogActionHandler;

#[async_trait]
impl ActionHandler for LogActionHandler {
    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        tracing::info!(
            action_id = %ctx.action_id,
            action_type = %ctx.action_type,
            deployment_id = %ctx.deployment_id,
            data = ?ctx.data,
            "Scheduled action triggered"
        );
        Ok(())
    }
}

/// Task status values that mean a worker has not finished with it yet.
const PENDING_TASK_STATUSES: [&str; 2] = ["initial", "running"];

/// Handler that turns each tick into a task record for the task workers.
///
/// Layout written under `<tasks_prefix><task-id>/`:
///
/// ```text
/// actionID, deploymentID, type, status=initial, creationDate, data/<key>
/// ```
///
/// A tick is skipped while the previous task created for the same action is
/// still pending, so a slow worker never sees a backlog of identical tasks.
pub struct TaskRecordHandler {
    store: Arc<dyn CoordinationStore>,
    tasks_prefix: String,
    last_tasks: Mutex<HashMap<String, String>>,
}

impl TaskRecordHandler {
    pub fn new(store: Arc<dyn CoordinationStore>, tasks_prefix: impl Into<String>) -> Self {
        Self {
            store,
            tasks_prefix: tasks_prefix.into(),
            last_tasks: Mutex::new(HashMap::new()),
        }
    }

    fn last_task(&self, action_id: &str) -> Option<String> {
        self.last_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(action_id)
            .cloned()
    }

    fn forget_task(&self, action_id: &str) {
        self.last_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(action_id);
    }

    /// Actions with a remembered last task.
    pub fn remembered_actions(&self) -> usize {
        self.last_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn remember_task(&self, action_id: &str, task_id: String) {
        self.last_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(action_id.to_string(), task_id);
    }

    async fn previous_task_pending(&self, action_id: &str) -> Result<bool> {
        let Some(task_id) = self.last_task(action_id) else {
            return Ok(false);
        };
        let status = self
            .store
            .get(&format!("{}{}/status", self.tasks_prefix, task_id))
            .await?;
        let pending = status
            .as_deref()
            .is_some_and(|s| PENDING_TASK_STATUSES.contains(&s));
        if !pending {
            self.forget_task(action_id);
        }
        Ok(pending)
    }
}

#[async_trait]
impl ActionHandler for TaskRecordHandler {
    async fn execute(&self, ctx: &ActionContext) -> Result<()> {
        if self.previous_task_pending(&ctx.action_id).await? {
            tracing::debug!(
                action_id = %ctx.action_id,
                "Previous task still pending, skipping tick"
            );
            return Ok(());
        }

        let task_id = Uuid::new_v4().to_string();
        let root = format!("{}{}", self.tasks_prefix, task_id);
        let fields = [
            ("actionID", ctx.action_id.as_str()),
            ("deploymentID", ctx.deployment_id.as_str()),
            ("type", ctx.action_type.as_str()),
        ];
        for (key, value) in fields {
            self.store.put(&format!("{}/{}", root, key), value).await?;
        }
        for (key, value) in &ctx.data {
            self.store.put(&format!("{}/data/{}", root, key), value).await?;
        }
        self.store
            .put(&format!("{}/creationDate", root), &Utc::now().to_rfc3339())
            .await?;
        // Status last: workers pick up tasks by status
        self.store.put(&format!("{}/status", root), "initial").await?;

        tracing::info!(
            action_id = %ctx.action_id,
            task_id = %task_id,
            action_type = %ctx.action_type,
            "Task registered for scheduled action"
        );
        self.remember_task(&ctx.action_id, task_id);
        Ok(())
    }

    fn action_stopped(&self, action_id: &str) {
        self.forget_task(action_id);
    }
}
