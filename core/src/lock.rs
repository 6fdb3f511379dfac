//! Per-category import lock on top of the store's named locks.
//!
//! ## Acquisition
//! Each attempt asks the store for the lock with a short timeout. A held lock
//! is retried with exponential backoff plus jitter until the attempt budget
//! runs out; a failing store is never retried. An initial delay of zero turns
//! on no-wait mode: one attempt, then fail.
//!
//! ## Release
//! [`LockGuard::release`] must be awaited on every exit path of the critical
//! section. Dropping a guard that is still held schedules a background
//! release and logs it; the store also drops the lock when the session ends.
//!
//! ## Naming
//! Lock names are `refsync_{instance}_{CATEGORY}`. Names over 64 characters
//! (the limit of SQL named-lock primitives) become `refsync_` followed by 40
//! hex characters of a SHA-256 over the same inputs.

use crate::category::Category;
use crate::errors::{RefSyncError, Result};
use crate::store::{LockHolderId, LockStore};
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const MAX_LOCK_NAME_LEN: usize = 64;
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 300;
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 10;
const MAX_JITTER_SECS: u64 = 10;
const LOCK_NAME_PREFIX: &str = "refsync_";
const HASHED_NAME_HEX_LEN: usize = 40;

/// Retry configuration for one import run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRetryPolicy {
    /// Total acquisition attempts, including the first (>= 1)
    pub max_attempts: u32,
    /// First backoff sleep; 0 selects no-wait mode
    pub initial_delay_secs: u64,
    /// Upper bound of the non-jittered backoff component
    pub backoff_cap_secs: u64,
    /// How long the store may block a single acquire call
    pub attempt_timeout_secs: u64,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_secs: 30,
            backoff_cap_secs: DEFAULT_BACKOFF_CAP_SECS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT_SECS,
        }
    }
}

impl LockRetryPolicy {
    pub fn no_wait() -> Self {
        Self {
            initial_delay_secs: 0,
            ..Self::default()
        }
    }

    pub fn is_no_wait(&self) -> bool {
        self.initial_delay_secs == 0
    }
}

/// Non-jittered part of the next delay.
pub fn backoff_base(delay_secs: u64, cap_secs: u64) -> u64 {
    delay_secs.saturating_mul(2).min(cap_secs)
}

/// Inclusive upper bound of the jitter added after a sleep of `delay_secs`.
pub fn jitter_bound(delay_secs: u64) -> u64 {
    delay_secs.clamp(1, MAX_JITTER_SECS)
}

/// Delay to sleep after the current one: `min(2d, cap) + U[1, min(10, d)]`.
pub fn next_delay<R: Rng>(delay_secs: u64, cap_secs: u64, rng: &mut R) -> u64 {
    let jitter = rng.random_range(1..=jitter_bound(delay_secs));
    backoff_base(delay_secs, cap_secs).saturating_add(jitter)
}

/// Store-wide lock name for `category` on `instance_id`.
pub fn lock_name(instance_id: &str, category: Category) -> String {
    let natural = format!("{LOCK_NAME_PREFIX}{instance_id}_{category}");
    if natural.len() <= MAX_LOCK_NAME_LEN {
        return natural;
    }

    let mut hasher = Sha256::new();
    hasher.update(instance_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(category.as_str().as_bytes());
    let digest = hex::encode(hasher.finalize());
    let hashed = format!("{LOCK_NAME_PREFIX}{}", &digest[..HASHED_NAME_HEX_LEN]);
    tracing::info!(
        natural = %natural,
        hashed = %hashed,
        max_len = MAX_LOCK_NAME_LEN,
        "Lock name too long, using hashed name"
    );
    hashed
}

/// A lock this process holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub lock_name: String,
    pub category: Category,
    pub held_since: DateTime<Utc>,
    /// Our own session identity, if the store could report it
    pub holder_id: Option<LockHolderId>,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Time spent between the first request and the grant
    pub waited: Duration,
    /// Another session held the lock at some point before the grant
    pub contended: bool,
}

impl LockHandle {
    /// Whether another session held the lock before we got it, either in an
    /// earlier attempt or while the granting attempt was blocked.
    pub fn waited_for_lock(&self) -> bool {
        self.contended
    }
}

/// Scoped ownership of an acquired lock.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    handle: LockHandle,
    held: bool,
}

impl LockGuard {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Release the lock. Later calls are no-ops; store failures are logged.
    pub async fn release(&mut self) {
        if !self.held {
            return;
        }
        match self.store.release(&self.handle.lock_name).await {
            Ok(()) => tracing::info!(
                lock = %self.handle.lock_name,
                category = %self.handle.category,
                "Lock released"
            ),
            Err(err) => tracing::warn!(
                lock = %self.handle.lock_name,
                category = %self.handle.category,
                error = %err,
                "Failed to release lock; the store drops it when the session ends"
            ),
        }
        self.held = false;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        let name = self.handle.lock_name.clone();
        tracing::warn!(lock = %name, "Lock guard dropped while held, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = Arc::clone(&self.store);
                runtime.spawn(async move {
                    if let Err(err) = store.release(&name).await {
                        tracing::warn!(lock = %name, error = %err, "Background lock release failed");
                    }
                });
            }
            Err(_) => tracing::warn!(
                lock = %name,
                "No async runtime for background release; lock lives until the session ends"
            ),
        }
    }
}

/// Acquires per-category locks against one store session.
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    policy: LockRetryPolicy,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LockStore>, policy: LockRetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &LockRetryPolicy {
        &self.policy
    }

    pub fn lock_name(&self, category: Category) -> String {
        lock_name(&self.store.instance_id(), category)
    }

    /// Acquire the lock for `category`, retrying per the policy.
    pub async fn acquire(&self, category: Category) -> Result<LockGuard> {
        let name = self.lock_name(category);
        let max_attempts = self.policy.max_attempts.max(1);
        let timeout = Duration::from_secs(self.policy.attempt_timeout_secs);
        let started = Instant::now();
        let mut delay = self.policy.initial_delay_secs;
        let mut holder: Option<String> = None;
        let mut attempt: u32 = 1;
        let mut contended = false;

        loop {
            tracing::debug!(lock = %name, attempt, max_attempts, "Requesting lock");
            let outcome = self
                .store
                .acquire(&name, timeout)
                .await
                .map_err(|err| RefSyncError::store("lock acquire", Some(&name), err))?;
            contended |= outcome.was_contended();

            if outcome.is_granted() {
                let holder_id = match self.store.session_id().await {
                    Ok(id) => Some(id),
                    Err(err) => {
                        tracing::debug!(lock = %name, error = %err, "Could not read own session id");
                        None
                    }
                };
                let handle = LockHandle {
                    lock_name: name,
                    category,
                    held_since: Utc::now(),
                    holder_id,
                    attempts: attempt,
                    waited: started.elapsed(),
                    contended,
                };
                tracing::info!(
                    lock = %handle.lock_name,
                    category = %category,
                    attempts = attempt,
                    waited_secs = handle.waited.as_secs(),
                    contended,
                    holder = ?handle.holder_id.as_ref().map(ToString::to_string),
                    "Lock acquired"
                );
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    handle,
                    held: true,
                });
            }

            holder = self.holder_for_diagnostics(&name).await.or(holder);

            if self.policy.is_no_wait() {
                tracing::warn!(lock = %name, holder = ?holder, "Lock held and no-wait mode is enabled");
                return Err(RefSyncError::NoWaitContention {
                    category,
                    lock_name: name,
                    holder,
                });
            }

            if attempt >= max_attempts {
                let waited_secs = started.elapsed().as_secs();
                tracing::warn!(
                    lock = %name,
                    attempts = attempt,
                    waited_secs,
                    holder = ?holder,
                    "Giving up on lock"
                );
                return Err(RefSyncError::LockContentionExhausted {
                    category,
                    lock_name: name,
                    attempts: attempt,
                    waited_secs,
                    holder,
                });
            }

            tracing::warn!(
                lock = %name,
                attempt,
                max_attempts,
                delay_secs = delay,
                holder = ?holder,
                "Lock held by another session, backing off"
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
            delay = next_delay(delay, self.policy.backoff_cap_secs, &mut rand::rng());
            attempt += 1;
        }
    }

    async fn holder_for_diagnostics(&self, name: &str) -> Option<String> {
        match self.store.current_holder(name).await {
            Ok(holder) => holder.map(|id| id.0),
            Err(err) => {
                tracing::debug!(lock = name, error = %err, "Could not identify lock holder");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, StoreError};
    use crate::memory_store::MemoryStore;
    use crate::store::LockAttempt;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Lock store that answers acquire calls from a script.
    struct ScriptedLockStore {
        instance: String,
        responses: Mutex<VecDeque<std::result::Result<LockAttempt, String>>>,
        calls: Mutex<Vec<Instant>>,
        holder_fails: bool,
    }

    impl ScriptedLockStore {
        fn new(responses: Vec<std::result::Result<LockAttempt, String>>) -> Self {
            Self {
                instance: "main".to_string(),
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
                holder_fails: false,
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl LockStore for ScriptedLockStore {
        fn instance_id(&self) -> String {
            self.instance.clone()
        }

        async fn acquire(
            &self,
            _name: &str,
            _timeout: Duration,
        ) -> std::result::Result<LockAttempt, StoreError> {
            self.calls.lock().expect("calls").push(Instant::now());
            let next = self.responses.lock().expect("responses").pop_front();
            match next {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(message)) => Err(StoreError::Unavailable(message)),
                None => Ok(LockAttempt::Held),
            }
        }

        async fn release(&self, _name: &str) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        async fn current_holder(
            &self,
            _name: &str,
        ) -> std::result::Result<Option<LockHolderId>, StoreError> {
            if self.holder_fails {
                return Err(StoreError::Unavailable("no diagnostics".to_string()));
            }
            Ok(Some(LockHolderId("connection 99".to_string())))
        }

        async fn session_id(&self) -> std::result::Result<LockHolderId, StoreError> {
            Ok(LockHolderId("connection 1".to_string()))
        }
    }

    fn policy(max_attempts: u32, initial_delay_secs: u64) -> LockRetryPolicy {
        LockRetryPolicy {
            max_attempts,
            initial_delay_secs,
            ..LockRetryPolicy::default()
        }
    }

    #[test]
    fn test_short_lock_name_is_natural() {
        assert_eq!(lock_name("openemr", Category::Rxnorm), "refsync_openemr_RXNORM");
    }

    #[test]
    fn test_long_lock_name_is_hashed_and_stable() {
        let instance = "a".repeat(80);
        let first = lock_name(&instance, Category::CqmValueset);
        let second = lock_name(&instance, Category::CqmValueset);
        assert_eq!(first, second);
        assert!(first.len() <= MAX_LOCK_NAME_LEN);
        assert_eq!(first.len(), LOCK_NAME_PREFIX.len() + HASHED_NAME_HEX_LEN);

        assert_ne!(first, lock_name(&instance, Category::Snomed));
        assert_ne!(first, lock_name(&"b".repeat(80), Category::CqmValueset));
    }

    #[test]
    fn test_backoff_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut delay = 5;
        let mut previous_base = 0;
        for _ in 0..20 {
            let base = backoff_base(delay, DEFAULT_BACKOFF_CAP_SECS);
            assert!(base >= previous_base, "non-jittered component must not shrink");
            previous_base = base;

            let next = next_delay(delay, DEFAULT_BACKOFF_CAP_SECS, &mut rng);
            let jitter = next - base;
            assert!((1..=jitter_bound(delay)).contains(&jitter), "jitter {jitter}");
            assert!(jitter <= MAX_JITTER_SECS);
            delay = next;
        }
        assert_eq!(previous_base, DEFAULT_BACKOFF_CAP_SECS);
    }

    #[test]
    fn test_jitter_bound_for_small_delays() {
        assert_eq!(jitter_bound(1), 1);
        assert_eq!(jitter_bound(4), 4);
        assert_eq!(jitter_bound(250), MAX_JITTER_SECS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_mode_makes_one_attempt() {
        let store = Arc::new(ScriptedLockStore::new(vec![Ok(LockAttempt::Held)]));
        let coordinator = LockCoordinator::new(store.clone(), policy(5, 0));
        let start = Instant::now();

        let err = coordinator
            .acquire(Category::Rxnorm)
            .await
            .err()
            .expect("must fail");

        assert_eq!(err.kind(), ErrorKind::NoWaitContention);
        assert_eq!(store.calls().len(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO, "no-wait mode never sleeps");
        match err {
            RefSyncError::NoWaitContention { holder, .. } => {
                assert_eq!(holder.as_deref(), Some("connection 99"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_with_growing_sleeps() {
        let store = Arc::new(ScriptedLockStore::new(vec![
            Ok(LockAttempt::Held),
            Ok(LockAttempt::Held),
            Ok(LockAttempt::Granted),
        ]));
        let coordinator = LockCoordinator::new(store.clone(), policy(3, 5));

        let guard = coordinator
            .acquire(Category::Snomed)
            .await
            .expect("third attempt wins");

        let calls = store.calls();
        assert_eq!(calls.len(), 3);
        let first_sleep = calls[1] - calls[0];
        let second_sleep = calls[2] - calls[1];
        assert_eq!(first_sleep, Duration::from_secs(5));
        assert!(second_sleep >= first_sleep);
        assert!(second_sleep >= Duration::from_secs(11));
        assert!(second_sleep <= Duration::from_secs(15));

        let handle = guard.handle();
        assert_eq!(handle.attempts, 3);
        assert!(handle.waited_for_lock());
        assert_eq!(handle.holder_id, Some(LockHolderId("connection 1".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_report_wait_and_holder() {
        let store = Arc::new(ScriptedLockStore::new(vec![]));
        let coordinator = LockCoordinator::new(store.clone(), policy(2, 4));

        let err = coordinator
            .acquire(Category::Icd10)
            .await
            .err()
            .expect("must fail");

        assert_eq!(store.calls().len(), 2);
        match err {
            RefSyncError::LockContentionExhausted {
                attempts,
                waited_secs,
                holder,
                lock_name,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(waited_secs, 4);
                assert_eq!(holder.as_deref(), Some("connection 99"));
                assert_eq!(lock_name, "refsync_main_ICD10");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_is_not_retried() {
        let store = Arc::new(ScriptedLockStore::new(vec![Err("broken pipe".to_string())]));
        let coordinator = LockCoordinator::new(store.clone(), policy(5, 5));

        let err = coordinator
            .acquire(Category::Rxnorm)
            .await
            .err()
            .expect("must fail");

        assert_eq!(err.kind(), ErrorKind::StoreConnectivity);
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_holder_lookup_failure_does_not_abort_retry() {
        let mut scripted = ScriptedLockStore::new(vec![Ok(LockAttempt::Held), Ok(LockAttempt::Granted)]);
        scripted.holder_fails = true;
        let store = Arc::new(scripted);
        let coordinator = LockCoordinator::new(store.clone(), policy(3, 1));

        let guard = coordinator.acquire(Category::Icd9).await.expect("acquired");
        assert_eq!(guard.handle().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncontended_grant_is_not_a_wait() {
        let store = Arc::new(ScriptedLockStore::new(vec![Ok(LockAttempt::Granted)]));
        let coordinator = LockCoordinator::new(store, policy(3, 5));

        let guard = coordinator.acquire(Category::Rxnorm).await.expect("acquired");
        assert_eq!(guard.handle().attempts, 1);
        assert!(!guard.handle().waited_for_lock());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_after_blocking_in_first_attempt_counts_as_wait() {
        let store = Arc::new(ScriptedLockStore::new(vec![Ok(LockAttempt::GrantedAfterWait)]));
        let coordinator = LockCoordinator::new(store.clone(), policy(3, 5));

        let guard = coordinator.acquire(Category::Rxnorm).await.expect("acquired");
        assert_eq!(guard.handle().attempts, 1);
        assert!(guard.handle().waited_for_lock());
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryStore::new("main");
        let coordinator = LockCoordinator::new(Arc::new(store.connect()), policy(1, 0));

        let mut guard = coordinator.acquire(Category::Rxnorm).await.expect("acquired");
        assert_eq!(store.held_lock_count(), 1);
        guard.release().await;
        guard.release().await;
        assert!(!guard.is_held());
        assert_eq!(store.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let store = MemoryStore::new("main");
        let session = Arc::new(store.connect());
        let coordinator = LockCoordinator::new(session.clone(), policy(1, 0));

        let guard = coordinator.acquire(Category::Snomed).await.expect("acquired");
        assert_eq!(store.held_lock_count(), 1);
        drop(guard);

        for _ in 0..10 {
            if store.held_lock_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.held_lock_count(), 0);
        assert_eq!(session.connection_id(), 1);
    }
}
