use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::store::{CoordinationStore, KvPair, QueryMeta, QueryOptions};

/// Wait applied to blocking queries that set a cursor but no wait time.
const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// Tombstones kept before they are reaped into the floor index.
const DEFAULT_TOMBSTONE_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    modify_index: u64,
    session: Option<String>,
}

#[derive(Debug)]
struct SessionEntry {
    ttl: Duration,
    expires_at: Instant,
}

/// Store contents. Every mutation of the keyspace takes a new index from the
/// single global counter, so indexes are strictly increasing.
#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    // Deleted keys keep their deletion index so a prefix index never goes back
    tombstones: BTreeMap<String, u64>,
    // Highest index of a reaped tombstone; every prefix reports at least this
    reaped_index: u64,
    index: u64,
    sessions: HashMap<String, SessionEntry>,
}

impl State {
    /// Next modify index. Starts at 2: index 1 is what an empty prefix reports.
    fn bump(&mut self) -> u64 {
        self.index = self.index.max(1) + 1;
        self.index
    }

    fn prefix_index(&self, prefix: &str) -> u64 {
        let live = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.modify_index)
            .max()
            .unwrap_or(0);
        let deleted = self
            .tombstones
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, idx)| *idx)
            .max()
            .unwrap_or(0);
        live.max(deleted).max(self.reaped_index).max(1)
    }

    /// Fold every tombstone into `reaped_index` once there are more than
    /// `limit`. Prefixes that held one keep an index at least as high, at the
    /// cost of one spurious wake-up for the others.
    fn reap_tombstones(&mut self, limit: usize) {
        if self.tombstones.len() <= limit {
            return;
        }
        let highest = self.tombstones.values().copied().max().unwrap_or(0);
        tracing::debug!(
            reaped = self.tombstones.len(),
            reaped_index = highest,
            "Reaping tombstones"
        );
        self.reaped_index = self.reaped_index.max(highest);
        self.tombstones.clear();
    }

    fn collect_keys(&self, prefix: &str, separator: Option<&str>) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for key in self
            .entries
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
        {
            let rest = &key[prefix.len()..];
            let item = match separator.and_then(|sep| rest.find(sep).map(|pos| pos + sep.len())) {
                Some(end) => format!("{}{}", prefix, &rest[..end]),
                None => key.clone(),
            };
            // Collapsed keys are contiguous in sorted order
            if keys.last() != Some(&item) {
                keys.push(item);
            }
        }
        keys
    }

    /// Drop expired sessions. Returns true if any lock was released.
    fn expire_sessions(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut released = false;
        for id in &expired {
            tracing::debug!(session = %id, "Session expired");
            released |= self.drop_session(id);
        }
        released
    }

    /// Remove a session and release its locks. Returns true if any lock was released.
    fn drop_session(&mut self, id: &str) -> bool {
        if self.sessions.remove(id).is_none() {
            return false;
        }
        let held: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.session.as_deref() == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &held {
            let idx = self.bump();
            if let Some(entry) = self.entries.get_mut(key) {
                entry.session = None;
                entry.modify_index = idx;
            }
        }
        !held.is_empty()
    }
}

/// In-process coordination store.
///
/// Clones share the same data, so a test can hand one clone to the scheduler
/// and use another to play the registrar.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
    tombstone_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changed: Arc::new(Notify::new()),
            tombstone_limit: DEFAULT_TOMBSTONE_LIMIT,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tombstone_limit(mut self, limit: usize) -> Self {
        self.tombstone_limit = limit;
        self
    }

    /// Deleted keys still remembered individually.
    pub fn tombstone_count(&self) -> usize {
        self.state().tombstones.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // No invariant spans a panic inside the critical sections
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge_sessions(&self) -> MutexGuard<'_, State> {
        let mut state = self.state();
        if state.expire_sessions(Instant::now()) {
            self.changed.notify_waiters();
        }
        state
    }

    /// Current global modify index.
    pub fn current_index(&self) -> u64 {
        self.state().index
    }

    /// Invalidate a session as if its TTL had run out. Returns false if the
    /// session did not exist.
    pub fn expire_session(&self, session: &str) -> bool {
        let mut state = self.state();
        let existed = state.sessions.contains_key(session);
        if state.drop_session(session) {
            self.changed.notify_waiters();
        }
        existed
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state().entries.get(key).map(|e| e.value.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let state = self.state();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KvPair {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect())
    }

    async fn keys(
        &self,
        prefix: &str,
        separator: Option<&str>,
        opts: &QueryOptions,
    ) -> Result<(Vec<String>, QueryMeta)> {
        let deadline = Instant::now() + opts.wait_time.unwrap_or(DEFAULT_WAIT);

        loop {
            // Register interest before reading so a write in between is not missed
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.purge_sessions();
                let last_index = state.prefix_index(prefix);
                if opts.wait_index == 0
                    || last_index > opts.wait_index
                    || Instant::now() >= deadline
                {
                    let keys = state.collect_keys(prefix, separator);
                    return Ok((keys, QueryMeta { last_index }));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut state = self.state();
            let idx = state.bump();
            state.tombstones.remove(key);
            let session = state.entries.get(key).and_then(|e| e.session.clone());
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    modify_index: idx,
                    session,
                },
            );
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        {
            let mut state = self.state();
            let doomed: Vec<String> = state
                .entries
                .range(prefix.to_string()..)
                .map(|(k, _)| k.clone())
                .take_while(|k| k.starts_with(prefix))
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            let idx = state.bump();
            for key in doomed {
                state.entries.remove(&key);
                state.tombstones.insert(key, idx);
            }
            state.reap_tombstones(self.tombstone_limit);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn create_session(&self, ttl: Duration) -> Result<String> {
        let mut state = self.purge_sessions();
        let id = Uuid::new_v4().to_string();
        state.sessions.insert(
            id.clone(),
            SessionEntry {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn renew_session(&self, session: &str) -> Result<()> {
        let mut state = self.purge_sessions();
        match state.sessions.get_mut(session) {
            Some(entry) => {
                entry.expires_at = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(SchedulerError::SessionLost(session.to_string())),
        }
    }

    async fn destroy_session(&self, session: &str) -> Result<()> {
        let mut state = self.state();
        if state.drop_session(session) {
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, session: &str) -> Result<bool> {
        {
            let mut state = self.purge_sessions();
            if !state.sessions.contains_key(session) {
                return Err(SchedulerError::SessionLost(session.to_string()));
            }
            if let Some(holder) = state.entries.get(key).and_then(|e| e.session.as_deref()) {
                if holder != session {
                    return Ok(false);
                }
            }
            let idx = state.bump();
            state.tombstones.remove(key);
            let entry = state.entries.entry(key.to_string()).or_insert(Entry {
                value: String::new(),
                modify_index: idx,
                session: None,
            });
            entry.session = Some(session.to_string());
            entry.modify_index = idx;
        }
        self.changed.notify_waiters();
        Ok(true)
    }

    async fn release_lock(&self, key: &str, session: &str) -> Result<bool> {
        {
            let mut state = self.purge_sessions();
            let held = state.entries.get(key).and_then(|e| e.session.as_deref()) == Some(session);
            if !held {
                return Ok(false);
            }
            let idx = state.bump();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.session = None;
                entry.modify_index = idx;
            }
        }
        self.changed.notify_waiters();
        Ok(true)
    }

    async fn lock_holder(&self, key: &str) -> Result<Option<String>> {
        let state = self.purge_sessions();
        Ok(state.entries.get(key).and_then(|e| e.session.clone()))
    }
}
