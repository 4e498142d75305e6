use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Longest lease the engine accepts: one year.
pub const MAX_LEASE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long an acquisition may wait for a held key to become free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitTimeout {
    /// A single attempt; fail immediately if the key is held.
    NoWait,
    /// Retry until the duration has elapsed.
    Bounded(Duration),
    /// Retry until acquired. Waiters are not ordered, so this can starve.
    Unbounded,
}

impl WaitTimeout {
    pub fn is_no_wait(&self) -> bool {
        matches!(self, WaitTimeout::NoWait)
    }
}

impl Default for WaitTimeout {
    fn default() -> Self {
        Self::Bounded(Duration::from_secs(5))
    }
}

impl From<Duration> for WaitTimeout {
    fn from(value: Duration) -> Self {
        if value.is_zero() {
            Self::NoWait
        } else {
            Self::Bounded(value)
        }
    }
}

/// How a handle deletes its record on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    /// Compare-and-delete on the owner token.
    #[default]
    OwnerChecked,
    /// Plain delete of whatever record is under the key.
    ///
    /// A releaser whose lease already expired deletes the next owner's
    /// record. Kept to demonstrate that failure, never for real use.
    Unconditional,
}

/// Options for a `DistributedLock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Lease duration used by `DistributedLock::acquire`.
    pub lease_ttl: Duration,
    /// Wait policy used by `DistributedLock::acquire`.
    pub wait_timeout: WaitTimeout,
    /// Base delay between acquisition attempts.
    pub retry_interval: Duration,
    /// Upper bound on the backoff delay.
    pub max_retry_interval: Duration,
    /// Start a watchdog that keeps the lease alive while held.
    pub renewal: bool,
    /// Fraction of the lease between renewal ticks.
    pub renewal_ratio: f64,
    /// Consecutive failed renewals tolerated before the lease is declared lost.
    pub max_renewal_failures: u32,
    pub release_mode: ReleaseMode,
    /// Attempts made to delete the record on release before giving up.
    pub release_attempts: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            wait_timeout: WaitTimeout::default(),
            retry_interval: Duration::from_millis(100),
            max_retry_interval: Duration::from_secs(1),
            renewal: true,
            renewal_ratio: 1.0 / 3.0,
            max_renewal_failures: 3,
            release_mode: ReleaseMode::OwnerChecked,
            release_attempts: 3,
        }
    }
}

impl LockOptions {
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: impl Into<WaitTimeout>) -> Self {
        self.wait_timeout = wait_timeout.into();
        self
    }

    pub fn with_retry_interval(mut self, base: Duration, max: Duration) -> Self {
        self.retry_interval = base;
        self.max_retry_interval = max;
        self
    }

    pub fn with_renewal(mut self, renewal: bool) -> Self {
        self.renewal = renewal;
        self
    }

    pub fn with_renewal_ratio(mut self, ratio: f64) -> Self {
        self.renewal_ratio = ratio;
        self
    }

    pub fn with_max_renewal_failures(mut self, failures: u32) -> Self {
        self.max_renewal_failures = failures;
        self
    }

    pub fn with_release_mode(mut self, mode: ReleaseMode) -> Self {
        self.release_mode = mode;
        self
    }

    pub fn with_release_attempts(mut self, attempts: u32) -> Self {
        self.release_attempts = attempts;
        self
    }

    /// Interval between renewal ticks for a lease of `lease_ttl`.
    pub fn renewal_interval(&self, lease_ttl: Duration) -> Duration {
        lease_ttl
            .mul_f64(self.renewal_ratio)
            .max(Duration::from_millis(1))
    }

    /// Check the options for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), LockError> {
        check_lease_ttl(self.lease_ttl)?;
        if self.retry_interval.is_zero() {
            return Err(invalid("retry_interval must be greater than zero"));
        }
        if self.max_retry_interval < self.retry_interval {
            return Err(invalid("max_retry_interval must not be below retry_interval"));
        }
        if !(self.renewal_ratio > 0.0 && self.renewal_ratio < 1.0) {
            return Err(invalid("renewal_ratio must be within (0, 1)"));
        }
        if self.max_renewal_failures == 0 {
            return Err(invalid("max_renewal_failures must be at least 1"));
        }
        if self.release_attempts == 0 {
            return Err(invalid("release_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Reject a zero lease or one longer than `MAX_LEASE_TTL`.
pub(crate) fn check_lease_ttl(lease_ttl: Duration) -> Result<(), LockError> {
    if lease_ttl.is_zero() {
        return Err(invalid("lease_ttl must be greater than zero"));
    }
    if lease_ttl > MAX_LEASE_TTL {
        return Err(LockError::InvalidArgument(format!(
            "lease_ttl must not exceed {:?}",
            MAX_LEASE_TTL
        )));
    }
    Ok(())
}

fn invalid(msg: &str) -> LockError {
    LockError::InvalidArgument(msg.to_string())
}
