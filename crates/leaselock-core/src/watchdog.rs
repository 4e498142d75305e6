use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::config::MAX_LEASE_TTL;
use crate::lock::LeaseState;
use crate::store::StoreClient;
use crate::token::OwnerToken;

/// Renewal schedule for one held lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// TTL written back on every successful renewal.
    pub lease_ttl: Duration,
    /// Time between renewal ticks; must be well below `lease_ttl`.
    pub interval: Duration,
    /// Consecutive store errors tolerated before giving up.
    pub max_failures: u32,
}

/// Lease state shared between a handle and its watchdog.
///
/// `deadline` is the latest instant at which the record is known to still be
/// ours: the start of the last successful write plus the lease TTL. Past it
/// the store may already have expired the record and handed the key to
/// someone else, so a `Held` state reads as `Lost`.
#[derive(Debug)]
pub struct Lease {
    state: watch::Sender<LeaseState>,
    deadline: watch::Sender<Instant>,
}

impl Lease {
    /// A lease written at `written_at` for `lease_ttl`.
    pub fn new(written_at: Instant, lease_ttl: Duration) -> Self {
        Self {
            state: watch::channel(LeaseState::Held).0,
            deadline: watch::channel(written_at + lease_ttl.min(MAX_LEASE_TTL)).0,
        }
    }

    pub fn state(&self) -> LeaseState {
        let state = *self.state.borrow();
        if state == LeaseState::Held && Instant::now() >= self.deadline() {
            return LeaseState::Lost;
        }
        state
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Record a successful write that started at `written_at`.
    pub(crate) fn extend(&self, written_at: Instant, lease_ttl: Duration) {
        self.deadline
            .send_replace(written_at + lease_ttl.min(MAX_LEASE_TTL));
    }

    /// Move a held lease to `Lost`. No effect once released.
    pub(crate) fn mark_lost(&self) {
        self.state.send_if_modified(|current| {
            if *current == LeaseState::Held {
                *current = LeaseState::Lost;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn finish(&self, state: LeaseState) {
        self.state.send_replace(state);
    }
}

/// Background task that keeps one lease alive.
///
/// Every `interval` it extends the record, conditioned on the owner token.
/// A token mismatch or missing key ends the loop at once and publishes
/// `LeaseState::Lost`. Store errors are retried on the next tick, up to
/// `max_failures` in a row. The lease is also declared lost as soon as its
/// deadline passes without a successful renewal, however few failures have
/// been counted.
///
/// The critical section is never interrupted; it learns about the loss
/// through the lease-state channel.
pub struct Watchdog {
    key: String,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    lease: Arc<Lease>,
}

impl Watchdog {
    /// Spawn the renewal loop on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn StoreClient>,
        key: &str,
        token: OwnerToken,
        policy: RenewalPolicy,
        lease: Arc<Lease>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(renew_loop(
            store,
            key.to_string(),
            token,
            policy,
            stop_rx,
            lease.clone(),
        ));

        debug!(
            "Watchdog started for {} (every {:?}, ttl {:?})",
            key, policy.interval, policy.lease_ttl
        );

        Self {
            key: key.to_string(),
            stop_tx,
            task: Some(task),
            lease,
        }
    }

    /// Current lease state as seen by the renewal loop.
    pub fn state(&self) -> LeaseState {
        self.lease.state()
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Idempotent. Once this returns no further renewal reaches the store.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Watchdog for {} panicked: {}", self.key, e);
                }
            }
            debug!("Watchdog stopped for {}", self.key);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn renew_loop(
    store: Arc<dyn StoreClient>,
    key: String,
    token: OwnerToken,
    policy: RenewalPolicy,
    mut stop_rx: watch::Receiver<bool>,
    lease: Arc<Lease>,
) {
    let interval = policy.interval.clamp(Duration::from_millis(1), MAX_LEASE_TTL);
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = sleep_until(lease.deadline()) => {
                error!(
                    "Lease on {} ran out after {} failed renewal(s); the key may have a new owner",
                    key, failures
                );
                lease.mark_lost();
                break;
            }
            _ = ticker.tick() => {}
        }

        let attempted_at = Instant::now();
        match store
            .compare_and_extend(&key, token.as_str(), policy.lease_ttl)
            .await
        {
            Ok(true) => {
                failures = 0;
                lease.extend(attempted_at, policy.lease_ttl);
                debug!("Renewed lease on {} for {:?}", key, policy.lease_ttl);
            }
            Ok(false) => {
                error!(
                    "Lease on {} is no longer held by {}; stopping renewal",
                    key, token
                );
                lease.mark_lost();
                break;
            }
            Err(e) => {
                failures += 1;
                if failures >= policy.max_failures {
                    error!(
                        "Giving up renewal of {} after {} consecutive failures: {}",
                        key, failures, e
                    );
                    lease.mark_lost();
                    break;
                }
                warn!(
                    "Renewal of {} failed ({}/{}): {}",
                    key, failures, policy.max_failures, e
                );
            }
        }
    }
}
