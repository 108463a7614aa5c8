use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Connection settings for a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Base URL of the agent HTTP API (e.g., "http://127.0.0.1:8500")
    pub address: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// Datacenter to query instead of the agent's own
    pub datacenter: Option<String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
        }
    }
}

/// Settings of the scheduling service.
///
/// Key layout in the coordination store:
/// - `<scheduling_prefix>/actions/<id>/...` holds action definitions
/// - `<scheduling_prefix>/tasks/<id>/...` holds task records written by dispatch
/// - `<service_prefix>/scheduling/leader` is the leader-election lock
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scheduling_prefix: String,
    pub service_prefix: String,

    /// Upper bound of a blocking list query. The store returns earlier as soon
    /// as the actions keyspace changes.
    pub watch_wait: Duration,

    /// TTL of the leader session. It is renewed every `session_ttl / 2`.
    pub session_ttl: Duration,

    /// Randomised pause between two failed lock attempts
    pub lock_retry_min_ms: u64,
    pub lock_retry_max_ms: u64,

    /// Pause after a failed list call before polling again
    pub store_retry_delay: Duration,

    /// How long stopping an action waits for an in-flight dispatch
    pub stop_grace: Duration,

    /// Optional status API address
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduling_prefix: "_yorc/scheduling".to_string(),
            service_prefix: "_yorc/service".to_string(),
            watch_wait: Duration::from_secs(300),
            session_ttl: Duration::from_secs(15),
            lock_retry_min_ms: 1000,
            lock_retry_max_ms: 3000,
            store_retry_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
            dashboard_addr: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new(scheduling_prefix: impl Into<String>, service_prefix: impl Into<String>) -> Self {
        Self {
            scheduling_prefix: trim_slashes(scheduling_prefix.into()),
            service_prefix: trim_slashes(service_prefix.into()),
            ..Default::default()
        }
    }

    pub fn with_watch_wait(mut self, wait: Duration) -> Self {
        self.watch_wait = wait;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_lock_retry(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.lock_retry_min_ms = min_ms;
        self.lock_retry_max_ms = max_ms.max(min_ms);
        self
    }

    pub fn with_store_retry_delay(mut self, delay: Duration) -> Self {
        self.store_retry_delay = delay;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    /// Reject settings that would turn a loop of the service into a busy loop
    /// or leave the leader session without renewal.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("watch_wait", self.watch_wait),
            ("session_ttl", self.session_ttl),
            ("store_retry_delay", self.store_retry_delay),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(SchedulerError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.lock_retry_max_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "lock_retry_max_ms must be non-zero".to_string(),
            ));
        }
        if self.scheduling_prefix.is_empty() || self.service_prefix.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "key prefixes must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Prefix under which action subtrees live, with a trailing slash.
    pub fn actions_prefix(&self) -> String {
        format!("{}/actions/", self.scheduling_prefix)
    }

    /// Root of a single action's subtree.
    pub fn action_path(&self, id: &str) -> String {
        format!("{}/actions/{}", self.scheduling_prefix, id)
    }

    pub fn tasks_prefix(&self) -> String {
        format!("{}/tasks/", self.scheduling_prefix)
    }

    pub fn leader_key(&self) -> String {
        format!("{}/scheduling/leader", self.service_prefix)
    }
}

fn trim_slashes(prefix: String) -> String {
    prefix.trim_matches('/').to_string()
}
