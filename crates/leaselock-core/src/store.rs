use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Atomic primitives against the shared store that all lock participants reach.
///
/// Every conditional operation must be a single atomic step at the store. A
/// separate get followed by a delete can remove a record that expired and was
/// re-acquired by another owner between the two calls.
///
/// Implementations pass store and network failures through as
/// `StoreError::Unavailable`; they never report success or failure they did
/// not observe.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Short name of the backend, for diagnostics.
    fn backend_name(&self) -> &'static str;

    /// Create `key` with `value` and a time-to-live, only if it is absent.
    ///
    /// # Arguments
    /// * `key` - Lock key (one per protected entity)
    /// * `value` - Owner token of the caller
    /// * `ttl` - Lease duration; the store drops the record once it elapses
    ///
    /// # Returns
    /// * `Ok(true)` - The record was created and is visible to all participants
    /// * `Ok(false)` - A live record already exists
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Read the current value of `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key` iff its current value equals `expected`.
    ///
    /// Returns whether a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Reset the time-to-live of `key` iff its current value equals `expected`.
    ///
    /// Returns whether the lease was extended.
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Unconditional write with no expiry. Used for plain data such as counters.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Unconditional delete.
    ///
    /// Lock release must not use this: it only exists so the fixed-TTL release
    /// mode can reproduce the cross-owner release defect.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
