//! Producer side of the actions keyspace.
//!
//! Registration writes a complete subtree under a fresh id. Unregistration
//! only sets the unregister flag: the leader stops the action and deletes the
//! subtree itself, so a registrar must never delete it directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::action::{
    DEPLOYMENT_ID_KEY, INTERVAL_KEY, RESERVED_KEYS, TYPE_KEY, UNREGISTER_FLAG_KEY,
};
use crate::scheduler::interval::parse_interval;
use crate::store::CoordinationStore;

/// What a registrar submits for a new action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub deployment_id: String,
    pub interval: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl ActionDefinition {
    pub fn new(
        action_type: impl Into<String>,
        deployment_id: impl Into<String>,
        interval: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            action_type: action_type.into(),
            deployment_id: deployment_id.into(),
            interval: interval.into(),
            data: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(ref id) = self.id {
            if id.is_empty() || id.contains('/') {
                return Err(SchedulerError::InvalidDefinition(format!(
                    "id {:?} must be non-empty and contain no '/'",
                    id
                )));
            }
        }
        if self.action_type.is_empty() {
            return Err(SchedulerError::MissingField {
                id: self.id.clone().unwrap_or_default(),
                field: TYPE_KEY,
            });
        }
        parse_interval(&self.interval).map_err(|reason| SchedulerError::InvalidInterval {
            id: self.id.clone().unwrap_or_default(),
            value: self.interval.clone(),
            reason,
        })?;
        if let Some(key) = self.data.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(SchedulerError::InvalidDefinition(format!(
                "data key {:?} is reserved",
                key
            )));
        }
        Ok(())
    }
}

/// Write a new action subtree and return its id.
pub async fn register_action(
    store: &dyn CoordinationStore,
    config: &SchedulerConfig,
    definition: &ActionDefinition,
) -> Result<String> {
    definition.validate()?;
    let id = definition
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let root = config.action_path(&id);

    for (key, value) in &definition.data {
        store.put(&format!("{}/{}", root, key), value).await?;
    }
    store
        .put(
            &format!("{}/{}", root, DEPLOYMENT_ID_KEY),
            &definition.deployment_id,
        )
        .await?;
    store
        .put(&format!("{}/{}", root, TYPE_KEY), &definition.action_type)
        .await?;
    store
        .put(&format!("{}/{}", root, INTERVAL_KEY), &definition.interval)
        .await?;

    tracing::info!(
        action_id = %id,
        action_type = %definition.action_type,
        deployment_id = %definition.deployment_id,
        "Scheduled action registered"
    );
    Ok(id)
}

/// Ask the scheduler to stop and delete an action.
pub async fn unregister_action(
    store: &dyn CoordinationStore,
    config: &SchedulerConfig,
    id: &str,
) -> Result<()> {
    let root = config.action_path(id);
    if store.list(&format!("{}/", root)).await?.is_empty() {
        return Err(SchedulerError::ActionNotFound(id.to_string()));
    }
    store
        .put(&format!("{}/{}", root, UNREGISTER_FLAG_KEY), "true")
        .await?;
    tracing::info!(action_id = %id, "Scheduled action flagged for unregistration");
    Ok(())
}
