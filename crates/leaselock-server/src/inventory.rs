use std::sync::Arc;
use std::time::Duration;

use leaselock_core::StoreClient;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, ServerError};

/// Result of one reduce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReduceOutcome {
    Reduced { remaining: i64 },
    SoldOut,
    /// Another holder had the lock and this request did not wait for it.
    Busy,
}

/// Stock counter kept in the shared store.
///
/// `reduce` is the critical section: it reads the counter and writes it back
/// decremented, which double-counts as soon as two callers interleave.
pub struct Inventory {
    store: Arc<dyn StoreClient>,
    stock_key: String,
    max_work: Duration,
}

impl Inventory {
    pub fn new(store: Arc<dyn StoreClient>, stock_key: impl Into<String>, max_work: Duration) -> Self {
        Self {
            store,
            stock_key: stock_key.into(),
            max_work,
        }
    }

    pub async fn seed(&self, stock: i64) -> Result<()> {
        self.store.set(&self.stock_key, &stock.to_string()).await?;
        info!("Seeded {} with {}", self.stock_key, stock);
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<i64>> {
        match self.store.get(&self.stock_key).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ServerError::CorruptStock(raw)),
            None => Ok(None),
        }
    }

    /// Decrement the stock by one after a random amount of simulated work.
    pub async fn reduce(&self) -> Result<ReduceOutcome> {
        self.simulate_work().await;

        let stock = self
            .current()
            .await?
            .ok_or_else(|| ServerError::StockNotSeeded(self.stock_key.clone()))?;

        if stock <= 0 {
            info!("Reduce failed, {} is sold out", self.stock_key);
            return Ok(ReduceOutcome::SoldOut);
        }

        let remaining = stock - 1;
        self.store
            .set(&self.stock_key, &remaining.to_string())
            .await?;
        info!("Reduced {}, {} remaining", self.stock_key, remaining);
        Ok(ReduceOutcome::Reduced { remaining })
    }

    async fn simulate_work(&self) {
        let max_ms = self.max_work.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let pause = Duration::from_millis(rand::rng().random_range(0..max_ms));
        debug!("Simulating {:?} of work", pause);
        tokio::time::sleep(pause).await;
    }
}
