use std::time::Duration;

use clap::Parser;
use leaselock_core::LockOptions;

/// Configuration for the leaselock inventory demo server.
#[derive(Parser, Debug, Clone)]
#[command(name = "leaselock-server")]
#[command(about = "Inventory demo comparing distributed lock protection levels")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "LEASELOCK_HOST")]
    pub host: String,

    /// Port to bind to
    #[arg(long, default_value = "8080", env = "LEASELOCK_PORT")]
    pub port: u16,

    /// Store backend: memory (single process only) or redis
    #[arg(long, default_value = "memory", env = "LEASELOCK_STORE")]
    pub store: StoreBackend,

    /// Redis URL (only used with --store redis)
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "REDIS_URL")]
    pub redis_url: String,

    /// Lock key guarding the stock item
    #[arg(long, default_value = "product_1001", env = "LEASELOCK_LOCK_KEY")]
    pub lock_key: String,

    /// Store key holding the stock counter
    #[arg(long, default_value = "stock", env = "LEASELOCK_STOCK_KEY")]
    pub stock_key: String,

    /// Seed the stock counter with this value at startup
    #[arg(long, env = "LEASELOCK_INITIAL_STOCK")]
    pub initial_stock: Option<i64>,

    /// Lease duration in milliseconds
    #[arg(long, default_value = "3000", env = "LEASELOCK_LEASE_TTL_MS")]
    pub lease_ttl_ms: u64,

    /// Maximum wait for the renewed lock in milliseconds (0 = single attempt)
    #[arg(long, default_value = "5000", env = "LEASELOCK_WAIT_TIMEOUT_MS")]
    pub wait_timeout_ms: u64,

    /// Base delay between acquisition attempts in milliseconds
    #[arg(long, default_value = "100", env = "LEASELOCK_RETRY_INTERVAL_MS")]
    pub retry_interval_ms: u64,

    /// Upper bound on the acquisition backoff in milliseconds
    #[arg(long, default_value = "1000", env = "LEASELOCK_MAX_RETRY_INTERVAL_MS")]
    pub max_retry_interval_ms: u64,

    /// Fraction of the lease between watchdog renewals
    #[arg(long, default_value = "0.3333333333333333", env = "LEASELOCK_RENEWAL_RATIO")]
    pub renewal_ratio: f64,

    /// Consecutive failed renewals before the lease is declared lost
    #[arg(long, default_value = "3", env = "LEASELOCK_MAX_RENEWAL_FAILURES")]
    pub max_renewal_failures: u32,

    /// Upper bound of the simulated work inside the critical section, in milliseconds
    #[arg(long, default_value = "6000", env = "LEASELOCK_MAX_WORK_MS")]
    pub max_work_ms: u64,
}

impl Config {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn max_work(&self) -> Duration {
        Duration::from_millis(self.max_work_ms)
    }

    /// Lock options shared by every store-backed protection level.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::default()
            .with_lease_ttl(self.lease_ttl())
            .with_wait_timeout(self.wait_timeout())
            .with_retry_interval(
                Duration::from_millis(self.retry_interval_ms),
                Duration::from_millis(self.max_retry_interval_ms),
            )
            .with_renewal_ratio(self.renewal_ratio)
            .with_max_renewal_failures(self.max_renewal_failures)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Redis => write!(f, "redis"),
        }
    }
}
