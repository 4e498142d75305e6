//! Lease-based distributed lock over a shared key-value store.
//!
//! This crate defines the lock protocol and the abstractions it runs on:
//! - `StoreClient`: Atomic primitives every participant reaches (set-if-absent,
//!   compare-and-delete, compare-and-extend)
//! - `DistributedLock`: Acquire with bounded backoff, owner-checked release,
//!   scoped execution
//! - `Watchdog`: Background lease renewal for a held lock
//! - `MemoryStore`: In-process store for single-node use and tests
//!
//! Exclusivity holds only as long as the store itself is a single logical
//! endpoint. Failover or a partition between replicas can still hand the same
//! key to two owners.

mod backoff;
mod config;
mod error;
mod lock;
mod memory;
mod store;
mod token;
mod watchdog;

pub use backoff::Backoff;
pub use config::{LockOptions, ReleaseMode, WaitTimeout, MAX_LEASE_TTL};
pub use error::{LockError, StoreError};
pub use lock::{DistributedLock, LeaseState, LockHandle, ReleaseOutcome};
pub use memory::MemoryStore;
pub use store::StoreClient;
pub use token::OwnerToken;
pub use watchdog::{Lease, RenewalPolicy, Watchdog};
