use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, instrument, warn};

use crate::backoff::Backoff;
use crate::config::{check_lease_ttl, LockOptions, ReleaseMode, WaitTimeout};
use crate::error::{LockError, StoreError};
use crate::store::StoreClient;
use crate::token::OwnerToken;
use crate::watchdog::{Lease, RenewalPolicy, Watchdog};

/// Ownership state of a held lease, as far as this process can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Held,
    /// The lease expired or could not be renewed. Mutual exclusion no longer
    /// holds for whoever is still running under it.
    Lost,
    Released,
}

/// Result of releasing a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The record carrying this handle's token was deleted.
    Released,
    /// No record carried this handle's token any more; nothing was deleted.
    NotHeld,
    /// The handle had already been released; nothing was sent to the store.
    AlreadyReleased,
}

/// Lock engine over a `StoreClient`.
///
/// Acquisitions from any number of processes only serialize through the
/// store's atomic set-if-absent; the engine keeps no cross-process state of
/// its own. Waiters are not queued, so no fairness is guaranteed under
/// contention.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn StoreClient>,
    options: LockOptions,
}

impl DistributedLock {
    /// Create a lock engine. Fails if `options` do not validate.
    pub fn new(store: Arc<dyn StoreClient>, options: LockOptions) -> Result<Self, LockError> {
        options.validate()?;
        Ok(Self { store, options })
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    /// Acquire `key` with the configured lease and wait policy.
    pub async fn acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        self.try_acquire(key, self.options.lease_ttl, self.options.wait_timeout)
            .await
    }

    /// Acquire `key` for `lease_ttl`, waiting according to `wait`.
    ///
    /// A fresh owner token is generated for the call. Between attempts the
    /// caller sleeps with jittered exponential backoff, never past the wait
    /// deadline; one last attempt is made at the deadline itself.
    ///
    /// # Errors
    /// * `LockError::AcquireTimeout` - The key stayed held for the whole wait
    /// * `LockError::Store` - The final attempt failed against the store
    /// * `LockError::InvalidArgument` - Empty key, zero lease or a lease
    ///   longer than `MAX_LEASE_TTL`
    #[instrument(skip(self, wait), level = "debug")]
    pub async fn try_acquire(
        &self,
        key: &str,
        lease_ttl: Duration,
        wait: impl Into<WaitTimeout>,
    ) -> Result<LockHandle, LockError> {
        let wait = wait.into();
        if key.is_empty() {
            return Err(LockError::InvalidArgument(
                "lock key must not be empty".to_string(),
            ));
        }
        check_lease_ttl(lease_ttl)?;

        let token = OwnerToken::generate();
        let started = Instant::now();
        let deadline = match wait {
            // A wait too long to represent is as good as unbounded
            WaitTimeout::Bounded(timeout) => started.checked_add(timeout),
            WaitTimeout::NoWait | WaitTimeout::Unbounded => None,
        };
        let mut backoff = Backoff::new(self.options.retry_interval, self.options.max_retry_interval);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempted_at = Instant::now();
            let last_error = match self
                .store
                .set_if_absent(key, token.as_str(), lease_ttl)
                .await
            {
                Ok(true) => {
                    debug!(
                        "Acquired lock on {} for {} after {} attempt(s)",
                        key, token, attempts
                    );
                    return Ok(self.grant(key, token, lease_ttl, attempted_at));
                }
                Ok(false) => {
                    debug!("Lock on {} held by another owner (attempt {})", key, attempts);
                    None
                }
                Err(e) => {
                    warn!("Acquisition attempt {} on {} failed: {}", attempts, key, e);
                    Some(e)
                }
            };

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if wait.is_no_wait() || remaining.is_zero() {
                return Err(give_up(key, started, attempts, last_error));
            }

            sleep(backoff.next_delay().min(remaining)).await;
        }
    }

    /// Release `handle`. See `LockHandle::release`.
    pub async fn release(&self, handle: &mut LockHandle) -> Result<ReleaseOutcome, LockError> {
        handle.release().await
    }

    /// Run `critical_section` while holding `key`.
    ///
    /// The lock is released on every exit path; a panic in the critical
    /// section is re-raised after the release. If the lease was lost while
    /// the section ran, or the record was no longer ours at release, the
    /// section's output is discarded and `LockError::LockLost` is returned.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        lease_ttl: Duration,
        wait: impl Into<WaitTimeout>,
        critical_section: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut handle = self.try_acquire(key, lease_ttl, wait).await?;
        let outcome = AssertUnwindSafe(critical_section()).catch_unwind().await;
        let lost = handle.is_lost();
        let released = handle.release().await;

        let value = match outcome {
            Ok(value) => value,
            Err(panic) => {
                warn!("Critical section under {} panicked; lock released", key);
                std::panic::resume_unwind(panic);
            }
        };
        // A record that was gone by release time may already have had
        // another owner while the section ran.
        let lost = lost || matches!(released, Ok(ReleaseOutcome::NotHeld));
        if lost {
            error!("Critical section under {} finished after its lease was lost", key);
            return Err(LockError::LockLost {
                key: key.to_string(),
            });
        }
        released?;
        Ok(value)
    }

    fn grant(
        &self,
        key: &str,
        token: OwnerToken,
        lease_ttl: Duration,
        attempted_at: Instant,
    ) -> LockHandle {
        let lease = Arc::new(Lease::new(attempted_at, lease_ttl));

        let watchdog = if self.options.renewal {
            let policy = RenewalPolicy {
                lease_ttl,
                interval: self.options.renewal_interval(lease_ttl),
                max_failures: self.options.max_renewal_failures,
            };
            Some(Watchdog::spawn(
                self.store.clone(),
                key,
                token.clone(),
                policy,
                lease.clone(),
            ))
        } else {
            None
        };

        LockHandle {
            key: key.to_string(),
            token,
            store: self.store.clone(),
            release_mode: self.options.release_mode,
            release_attempts: self.options.release_attempts,
            retry_interval: self.options.retry_interval,
            lease_ttl,
            acquired_at: Utc::now(),
            watchdog,
            lease,
            released: false,
        }
    }
}

fn give_up(
    key: &str,
    started: Instant,
    attempts: u32,
    last_error: Option<StoreError>,
) -> LockError {
    let waited = started.elapsed();
    debug!(
        "Giving up on lock {} after {} attempt(s) in {:?}",
        key, attempts, waited
    );
    match last_error {
        Some(e) => LockError::Store(e),
        None => LockError::AcquireTimeout {
            key: key.to_string(),
            waited,
        },
    }
}

async fn delete_record(
    store: &dyn StoreClient,
    key: &str,
    token: &OwnerToken,
    mode: ReleaseMode,
) -> Result<bool, StoreError> {
    match mode {
        ReleaseMode::OwnerChecked => store.compare_and_delete(key, token.as_str()).await,
        ReleaseMode::Unconditional => store.delete(key).await,
    }
}

/// One successful acquisition.
///
/// Owns the owner token and the renewal task. Must be released exactly once;
/// later calls are no-ops. A handle dropped without release aborts its
/// watchdog and deletes its record from a background task.
pub struct LockHandle {
    key: String,
    token: OwnerToken,
    store: Arc<dyn StoreClient>,
    release_mode: ReleaseMode,
    release_attempts: u32,
    retry_interval: Duration,
    lease_ttl: Duration,
    acquired_at: DateTime<Utc>,
    watchdog: Option<Watchdog>,
    lease: Arc<Lease>,
    released: bool,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &OwnerToken {
        &self.token
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn is_renewed(&self) -> bool {
        self.watchdog.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// `Lost` once the last confirmed write plus the lease TTL has passed,
    /// whether or not the watchdog has noticed yet.
    pub fn lease_state(&self) -> LeaseState {
        self.lease.state()
    }

    /// Instant the lease runs out unless renewed first.
    pub fn lease_deadline(&self) -> Instant {
        self.lease.deadline()
    }

    pub fn is_lost(&self) -> bool {
        self.lease_state() == LeaseState::Lost
    }

    /// `Err(LockError::LockLost)` once the lease is gone.
    pub fn check(&self) -> Result<(), LockError> {
        if self.is_lost() {
            return Err(LockError::LockLost {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Lease-state updates published by the watchdog.
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.lease.subscribe()
    }

    /// Completes once the lease is lost. Never completes for a lease that is
    /// released first.
    pub async fn wait_lost(&self) {
        if self.released {
            return std::future::pending().await;
        }
        if self.watchdog.is_none() {
            sleep_until(self.lease.deadline()).await;
            return;
        }
        let mut rx = self.lease.subscribe();
        if rx.wait_for(|s| *s == LeaseState::Lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Release the lock.
    ///
    /// Stops the watchdog first, then deletes the record only if it still
    /// carries this handle's token. Store errors are retried a bounded
    /// number of times; if the delete cannot be confirmed the error is
    /// returned and the lease is left to expire. The handle is invalid
    /// afterwards either way.
    #[instrument(skip(self), level = "debug", fields(key = %self.key))]
    pub async fn release(&mut self) -> Result<ReleaseOutcome, LockError> {
        if self.released {
            debug!("Lock on {} already released by {}", self.key, self.token);
            return Ok(ReleaseOutcome::AlreadyReleased);
        }
        self.released = true;

        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop().await;
        }
        let was_lost = self.lease_state() == LeaseState::Lost;
        self.lease.finish(if was_lost {
            LeaseState::Lost
        } else {
            LeaseState::Released
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match delete_record(self.store.as_ref(), &self.key, &self.token, self.release_mode).await
            {
                Ok(true) => {
                    debug!("Released lock on {} by {}", self.key, self.token);
                    return Ok(ReleaseOutcome::Released);
                }
                Ok(false) => {
                    warn!(
                        "Lock on {} no longer held by {} at release (lease lost: {})",
                        self.key, self.token, was_lost
                    );
                    return Ok(ReleaseOutcome::NotHeld);
                }
                Err(e) if attempt < self.release_attempts => {
                    warn!(
                        "Release of {} failed (attempt {}/{}): {}",
                        self.key, attempt, self.release_attempts, e
                    );
                    sleep(self.retry_interval).await;
                }
                Err(e) => {
                    error!(
                        "Could not confirm release of {} by {} after {} attempt(s): {}",
                        self.key, self.token, attempt, e
                    );
                    return Err(e.into());
                }
            }
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("lease_ttl", &self.lease_ttl)
            .field("acquired_at", &self.acquired_at)
            .field("renewed", &self.watchdog.is_some())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropping the watchdog aborts the renewal task.
        self.watchdog.take();

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token.clone();
        let mode = self.release_mode;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match delete_record(store.as_ref(), &key, &token, mode).await {
                        Ok(deleted) => {
                            debug!("Dropped handle for {} released its record: {}", key, deleted)
                        }
                        Err(e) => warn!("Dropped handle for {} could not release: {}", key, e),
                    }
                });
            }
            Err(_) => warn!(
                "Handle for {} dropped outside a runtime; the lease will expire on its own",
                key
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_LEASE_TTL;
    use crate::memory::MemoryStore;
    use tokio_test::assert_ok;

    const TTL: Duration = Duration::from_secs(3);

    fn engine(store: Arc<MemoryStore>, options: LockOptions) -> DistributedLock {
        DistributedLock::new(store, options).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_release() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store.clone(), LockOptions::default());

        let mut handle = lock.try_acquire("product_1001", TTL, WaitTimeout::NoWait).await.unwrap();
        assert_eq!(
            store.get("product_1001").await.unwrap(),
            Some(handle.token().to_string())
        );
        assert!(handle.is_renewed());
        assert_eq!(handle.lease_state(), LeaseState::Held);

        let outcome = lock.release(&mut handle).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
        assert_eq!(handle.lease_state(), LeaseState::Released);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_fresh_per_acquisition() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store, LockOptions::default());

        let mut first = lock.try_acquire("k", TTL, WaitTimeout::NoWait).await.unwrap();
        let first_token = first.token().clone();
        first.release().await.unwrap();

        let mut second = lock.try_acquire("k", TTL, WaitTimeout::NoWait).await.unwrap();
        assert_ne!(&first_token, second.token());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_invalid_arguments() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store, LockOptions::default());

        let err = lock.try_acquire("k", Duration::ZERO, WaitTimeout::NoWait).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));

        let err = lock.try_acquire("", TTL, WaitTimeout::NoWait).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));

        let err = lock.try_acquire("k", Duration::MAX, WaitTimeout::NoWait).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));

        let bad = LockOptions::default().with_renewal_ratio(2.0);
        assert!(DistributedLock::new(Arc::new(MemoryStore::new()), bad).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_lease_and_wait_are_accepted() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store, LockOptions::default());

        let mut handle = lock
            .try_acquire("k", MAX_LEASE_TTL, Duration::MAX)
            .await
            .unwrap();
        assert_eq!(handle.lease_state(), LeaseState::Held);
        assert_ok!(handle.release().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_makes_a_single_attempt() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store, LockOptions::default());
        let _held = lock.try_acquire("k", TTL, WaitTimeout::NoWait).await.unwrap();

        let started = Instant::now();
        let err = lock.try_acquire("k", TTL, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, LockError::AcquireTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lock_after_release() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store, LockOptions::default());
        let mut held = lock.try_acquire("k", TTL, WaitTimeout::NoWait).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.try_acquire("k", TTL, WaitTimeout::Unbounded).await })
        };

        sleep(Duration::from_secs(10)).await;
        assert!(!waiter.is_finished());

        held.release().await.unwrap();
        let mut handle = waiter.await.unwrap().unwrap();
        assert_ok!(handle.release().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_surfaces_as_store_error() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store.clone(), LockOptions::default());
        store.set_available(false);

        let err = lock
            .try_acquire("k", TTL, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Store(StoreError::Unavailable(_))));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_recovers_within_wait_window() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store.clone(), LockOptions::default());
        store.set_available(false);

        let restore = {
            let store = store.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(500)).await;
                store.set_available(true);
            })
        };

        let mut handle = lock.try_acquire("k", TTL, Duration::from_secs(5)).await.unwrap();
        restore.await.unwrap();
        handle.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_gives_up_on_dead_store() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store.clone(), LockOptions::default().with_renewal(false));
        let mut handle = lock.try_acquire("k", TTL, WaitTimeout::NoWait).await.unwrap();

        store.set_available(false);
        let err = handle.release().await.unwrap_err();
        assert!(matches!(err, LockError::Store(_)));

        // The handle is invalidated even though the delete was not confirmed
        assert!(handle.is_released());
        assert_eq!(handle.release().await.unwrap(), ReleaseOutcome::AlreadyReleased);

        store.set_available(true);
        sleep(TTL).await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_releases_in_background() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store.clone(), LockOptions::default());

        let handle = lock.try_acquire("k", TTL, WaitTimeout::NoWait).await.unwrap();
        drop(handle);
        sleep(Duration::from_millis(1)).await;

        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrenewed_lease_reports_lost_after_ttl() {
        let store = Arc::new(MemoryStore::new());
        let lock = engine(store, LockOptions::default().with_renewal(false));
        let mut handle = lock.try_acquire("k", TTL, WaitTimeout::NoWait).await.unwrap();
        assert!(!handle.is_renewed());

        handle.wait_lost().await;
        assert!(handle.is_lost());
        assert!(matches!(handle.check(), Err(LockError::LockLost { .. })));
        assert_eq!(handle.release().await.unwrap(), ReleaseOutcome::NotHeld);
    }
}
