use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::store::StoreClient;

/// A stored value with an optional expiry.
#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store backed by a concurrent map.
///
/// Each primitive runs under the map's per-shard lock, so it is atomic per
/// key. Expiry is evaluated lazily against the tokio clock, which lets tests
/// drive leases with paused time.
///
/// Only tasks inside one process share a `MemoryStore`; it gives no
/// protection across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable, every operation fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|slot| slot.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let slot = Slot {
            value: value.to_string(),
            expires_at: now.checked_add(ttl),
        };

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Ok(false);
                }
                debug!("Replacing expired record for {}", key);
                entry.insert(slot);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(slot);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone()))
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let removed = self
            .slots
            .remove_if(key, |_, slot| slot.is_live(now) && slot.value == expected);
        Ok(removed.is_some())
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_live(now) && slot.value == expected => {
                slot.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }
}
