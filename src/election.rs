//! Leader election over a session lock in the coordination store.
//!
//! Each contender holds a TTL session and tries to take the lock on a single
//! key with it. The holder renews its session every half TTL and checks that
//! the lock still names its session; any failure there counts as lost
//! leadership.
//!
//! The handler sees strictly alternating `on_elected` / `on_demoted` calls from
//! one gate, but a second gate (another process) may be elected before this
//! one has finished demoting, so both callbacks must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::store::CoordinationStore;

#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    async fn on_elected(&self);
    async fn on_demoted(&self);
}

/// How a term of leadership ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermEnd {
    Shutdown,
    Lost,
}

/// Lower bound of the session renewal period.
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// Period at which the holder renews its session: half the TTL.
pub fn renew_period(session_ttl: Duration) -> Duration {
    (session_ttl / 2).max(MIN_RENEW_PERIOD)
}

/// Generates a random delay before the next lock attempt
pub fn random_retry_delay(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms.max(min_ms)))
}

pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    key: String,
    session_ttl: Duration,
    retry_min_ms: u64,
    retry_max_ms: u64,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            key: config.leader_key(),
            session_ttl: config.session_ttl,
            retry_min_ms: config.lock_retry_min_ms,
            retry_max_ms: config.lock_retry_max_ms,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Contend for the lock until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken, handler: Arc<dyn LeadershipHandler>) {
        tracing::info!(key = %self.key, "Watching leader election");

        while !shutdown.is_cancelled() {
            let session = match self.store.create_session(self.session_ttl).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "Failed to create election session");
                    self.pause(&shutdown).await;
                    continue;
                }
            };
            tracing::debug!(key = %self.key, session = %session, "Election session created");

            self.contend(&session, &shutdown, handler.as_ref()).await;

            if let Err(e) = self.store.destroy_session(&session).await {
                tracing::debug!(session = %session, error = %e, "Failed to destroy election session");
            }
        }

        tracing::info!(key = %self.key, "Leader election stopped");
    }

    /// Try to take the lock with `session` until shutdown or until the session
    /// becomes unusable.
    async fn contend(
        &self,
        session: &str,
        shutdown: &CancellationToken,
        handler: &dyn LeadershipHandler,
    ) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.store.acquire_lock(&self.key, session).await {
                Ok(true) => {
                    tracing::info!(key = %self.key, session = %session, "Acquired leadership");
                    handler.on_elected().await;
                    let end = self.hold(session, shutdown).await;
                    handler.on_demoted().await;

                    if end == TermEnd::Shutdown {
                        match self.store.release_lock(&self.key, session).await {
                            Ok(_) => tracing::info!(key = %self.key, "Released leadership"),
                            Err(e) => tracing::warn!(key = %self.key, error = %e, "Failed to release leadership"),
                        }
                    }
                    return;
                }
                Ok(false) => {
                    // Someone else leads; keep our session alive while waiting
                    if self.pause(shutdown).await {
                        return;
                    }
                    if let Err(e) = self.store.renew_session(session).await {
                        tracing::debug!(session = %session, error = %e, "Election session lost while waiting");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "Failed to acquire leadership lock");
                    self.pause(shutdown).await;
                    return;
                }
            }
        }
    }

    /// Keep the session alive while leading.
    async fn hold(&self, session: &str, shutdown: &CancellationToken) -> TermEnd {
        let period = renew_period(self.session_ttl);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return TermEnd::Shutdown,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.store.renew_session(session).await {
                tracing::warn!(key = %self.key, error = %e, "Leadership session lost");
                return TermEnd::Lost;
            }
            match self.store.lock_holder(&self.key).await {
                Ok(Some(holder)) if holder == session => {}
                Ok(holder) => {
                    tracing::warn!(key = %self.key, holder = ?holder, "Leadership lock no longer held");
                    return TermEnd::Lost;
                }
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "Failed to verify leadership");
                    return TermEnd::Lost;
                }
            }
        }
    }

    /// Sleep a random retry delay. Returns true if shutdown fired meanwhile.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        let delay = random_retry_delay(self.retry_min_ms, self.retry_max_ms);
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Transitions {
        elected: AtomicUsize,
        demoted: AtomicUsize,
    }

    #[async_trait]
    impl LeadershipHandler for Transitions {
        async fn on_elected(&self) {
            self.elected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_demoted(&self) {
            self.demoted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Store that, like Consul, never grants a session TTL below `floor`
    struct FlooredTtlStore {
        inner: MemoryStore,
        floor: Duration,
    }

    #[async_trait]
    impl CoordinationStore for FlooredTtlStore {
        async fn get(&self, key: &str) -> crate::error::Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn list(&self, prefix: &str) -> crate::error::Result<Vec<crate::store::KvPair>> {
            self.inner.list(prefix).await
        }
        async fn keys(
            &self,
            prefix: &str,
            separator: Option<&str>,
            opts: &crate::store::QueryOptions,
        ) -> crate::error::Result<(Vec<String>, crate::store::QueryMeta)> {
            self.inner.keys(prefix, separator, opts).await
        }
        async fn put(&self, key: &str, value: &str) -> crate::error::Result<()> {
            self.inner.put(key, value).await
        }
        async fn delete_tree(&self, prefix: &str) -> crate::error::Result<()> {
            self.inner.delete_tree(prefix).await
        }
        async fn create_session(&self, ttl: Duration) -> crate::error::Result<String> {
            self.inner.create_session(ttl.max(self.floor)).await
        }
        async fn renew_session(&self, session: &str) -> crate::error::Result<()> {
            self.inner.renew_session(session).await
        }
        async fn destroy_session(&self, session: &str) -> crate::error::Result<()> {
            self.inner.destroy_session(session).await
        }
        async fn acquire_lock(&self, key: &str, session: &str) -> crate::error::Result<bool> {
            self.inner.acquire_lock(key, session).await
        }
        async fn release_lock(&self, key: &str, session: &str) -> crate::error::Result<bool> {
            self.inner.release_lock(key, session).await
        }
        async fn lock_holder(&self, key: &str) -> crate::error::Result<Option<String>> {
            self.inner.lock_holder(key).await
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig::new("t/sched", "t/svc")
            .with_session_ttl(Duration::from_millis(200))
            .with_lock_retry(20, 40)
    }

    #[test]
    fn retry_delay_in_range() {
        for _ in 0..100 {
            let d = random_retry_delay(10, 20);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(random_retry_delay(5, 1), Duration::from_millis(5));
    }

    #[test]
    fn renew_period_is_half_ttl_with_a_floor() {
        assert_eq!(renew_period(Duration::from_secs(15)), Duration::from_millis(7500));
        assert_eq!(renew_period(Duration::ZERO), MIN_RENEW_PERIOD);
        assert_eq!(renew_period(Duration::from_millis(1)), MIN_RENEW_PERIOD);
    }

    #[tokio::test]
    async fn zero_ttl_still_renews_and_releases() {
        let store = MemoryStore::new();
        let floored = FlooredTtlStore {
            inner: store.clone(),
            floor: Duration::from_millis(500),
        };
        let config = test_config().with_session_ttl(Duration::ZERO);
        let election = LeaderElection::new(Arc::new(floored), &config);
        let handler = Arc::new(Transitions::default());
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            let handler: Arc<dyn LeadershipHandler> = handler.clone();
            tokio::spawn(async move { election.run(shutdown, handler).await })
        };

        // Several renew periods pass, well inside the floored TTL
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.elected.load(Ordering::SeqCst), 1);
        assert_eq!(handler.demoted.load(Ordering::SeqCst), 0);

        shutdown.cancel();
        assert!(task.await.is_ok());
        assert_eq!(handler.demoted.load(Ordering::SeqCst), 1);
        assert!(store.lock_holder("t/svc/scheduling/leader").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn elected_then_demoted_on_shutdown() {
        let store = MemoryStore::new();
        let election = LeaderElection::new(Arc::new(store.clone()), &test_config());
        let handler = Arc::new(Transitions::default());
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            let handler: Arc<dyn LeadershipHandler> = handler.clone();
            tokio::spawn(async move { election.run(shutdown, handler).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.elected.load(Ordering::SeqCst), 1);
        assert!(store.lock_holder("t/svc/scheduling/leader").await.unwrap().is_some());

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(handler.demoted.load(Ordering::SeqCst), 1);
        assert!(store.lock_holder("t/svc/scheduling/leader").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_loss_demotes_and_reelects() {
        let store = MemoryStore::new();
        let election = LeaderElection::new(Arc::new(store.clone()), &test_config());
        let handler = Arc::new(Transitions::default());
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            let handler: Arc<dyn LeadershipHandler> = handler.clone();
            tokio::spawn(async move { election.run(shutdown, handler).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let holder = store
            .lock_holder("t/svc/scheduling/leader")
            .await
            .unwrap()
            .expect("leader holds the lock");
        assert!(store.expire_session(&holder));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(handler.demoted.load(Ordering::SeqCst) >= 1);
        assert_eq!(handler.elected.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(
            handler.elected.load(Ordering::SeqCst),
            handler.demoted.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn only_one_of_two_gates_leads() {
        let store = MemoryStore::new();
        let config = test_config();
        let shutdown = CancellationToken::new();
        let first = Arc::new(Transitions::default());
        let second = Arc::new(Transitions::default());

        let mut tasks = Vec::new();
        for handler in [first.clone(), second.clone()] {
            let election = LeaderElection::new(Arc::new(store.clone()), &config);
            let shutdown = shutdown.clone();
            let handler: Arc<dyn LeadershipHandler> = handler;
            tasks.push(tokio::spawn(async move { election.run(shutdown, handler).await }));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let leaders = first.elected.load(Ordering::SeqCst) + second.elected.load(Ordering::SeqCst);
        assert_eq!(leaders, 1);

        shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
