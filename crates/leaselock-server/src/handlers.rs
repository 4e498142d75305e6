//! HTTP handlers for the inventory demo.
//!
//! Implements:
//! - GET /health - Health check
//! - GET /stock, PUT /stock - Read and seed the stock counter
//! - POST /reduce/{level} - Decrement the stock under one protection level

use std::fmt;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use leaselock_core::{
    DistributedLock, LeaseState, LockError, LockOptions, ReleaseMode, StoreClient, WaitTimeout,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::inventory::{Inventory, ReduceOutcome};

/// How a reduce request protects the critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionLevel {
    /// In-process mutex only; concurrent processes interleave freely.
    Local,
    /// Set-if-absent with a fixed lease, unconditional delete on release.
    FixedTtl,
    /// Fixed lease, release only if the record still carries our token.
    OwnerChecked,
    /// Owner-checked release plus watchdog renewal.
    Renewed,
}

impl ProtectionLevel {
    /// Lock options for store-backed levels; `None` for the local level.
    pub fn lock_options(self, base: &LockOptions) -> Option<LockOptions> {
        let options = base.clone();
        match self {
            ProtectionLevel::Local => None,
            ProtectionLevel::FixedTtl => Some(
                options
                    .with_renewal(false)
                    .with_release_mode(ReleaseMode::Unconditional),
            ),
            ProtectionLevel::OwnerChecked => Some(
                options
                    .with_renewal(false)
                    .with_release_mode(ReleaseMode::OwnerChecked),
            ),
            ProtectionLevel::Renewed => Some(
                options
                    .with_renewal(true)
                    .with_release_mode(ReleaseMode::OwnerChecked),
            ),
        }
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionLevel::Local => write!(f, "local"),
            ProtectionLevel::FixedTtl => write!(f, "fixed-ttl"),
            ProtectionLevel::OwnerChecked => write!(f, "owner-checked"),
            ProtectionLevel::Renewed => write!(f, "renewed"),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub inventory: Arc<Inventory>,
    pub local_guard: Arc<Mutex<()>>,
    pub lock_key: String,
    pub fixed_ttl: DistributedLock,
    pub owner_checked: DistributedLock,
    pub renewed: DistributedLock,
    pub store_backend: &'static str,
}

impl AppState {
    pub fn new(store: Arc<dyn StoreClient>, config: &Config) -> std::result::Result<Self, LockError> {
        let base = config.lock_options();
        let engine = |level: ProtectionLevel| -> std::result::Result<DistributedLock, LockError> {
            let options = level.lock_options(&base).ok_or_else(|| {
                LockError::InvalidArgument(format!("{} level has no store lock", level))
            })?;
            DistributedLock::new(store.clone(), options)
        };

        Ok(Self {
            inventory: Arc::new(Inventory::new(
                store.clone(),
                config.stock_key.clone(),
                config.max_work(),
            )),
            local_guard: Arc::new(Mutex::new(())),
            lock_key: config.lock_key.clone(),
            fixed_ttl: engine(ProtectionLevel::FixedTtl)?,
            owner_checked: engine(ProtectionLevel::OwnerChecked)?,
            renewed: engine(ProtectionLevel::Renewed)?,
            store_backend: store.backend_name(),
        })
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub store: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub stock: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SeedRequest {
    pub stock: i64,
}

#[derive(Debug, Serialize)]
pub struct ReduceResponse {
    pub level: ProtectionLevel,
    #[serde(flatten)]
    pub outcome: ReduceOutcome,
    /// Lease state observed when the critical section finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_ms: Option<i64>,
}

impl ReduceResponse {
    fn new(level: ProtectionLevel, outcome: ReduceOutcome) -> Self {
        Self {
            level,
            outcome,
            lease: None,
            held_ms: None,
        }
    }
}

/// GET /health - Health check endpoint.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        store: state.store_backend,
    })
}

/// GET /stock - Current stock counter.
pub async fn get_stock(State(state): State<AppState>) -> Result<Json<StockResponse>> {
    let stock = state.inventory.current().await?;
    Ok(Json(StockResponse { stock }))
}

/// PUT /stock - Seed the stock counter.
pub async fn put_stock(
    State(state): State<AppState>,
    Json(req): Json<SeedRequest>,
) -> Result<Json<StockResponse>> {
    if req.stock < 0 {
        return Err(ServerError::InvalidRequest(
            "stock must not be negative".to_string(),
        ));
    }
    state.inventory.seed(req.stock).await?;
    Ok(Json(StockResponse {
        stock: Some(req.stock),
    }))
}

/// POST /reduce/local - Process-local mutex only.
pub async fn reduce_local(State(state): State<AppState>) -> Result<Json<ReduceResponse>> {
    let _guard = state.local_guard.lock().await;
    let outcome = state.inventory.reduce().await?;
    Ok(Json(ReduceResponse::new(ProtectionLevel::Local, outcome)))
}

/// POST /reduce/fixed-ttl - Single attempt, fixed lease, unconditional release.
pub async fn reduce_fixed_ttl(State(state): State<AppState>) -> Result<Json<ReduceResponse>> {
    reduce_single_attempt(&state, ProtectionLevel::FixedTtl, &state.fixed_ttl).await
}

/// POST /reduce/owner-checked - Single attempt, fixed lease, owner-checked release.
pub async fn reduce_owner_checked(State(state): State<AppState>) -> Result<Json<ReduceResponse>> {
    reduce_single_attempt(&state, ProtectionLevel::OwnerChecked, &state.owner_checked).await
}

/// POST /reduce/renewed - Bounded wait, watchdog renewal, scoped release.
pub async fn reduce_renewed(State(state): State<AppState>) -> Result<Json<ReduceResponse>> {
    let lock = &state.renewed;
    let options = lock.options();
    let started = Utc::now();

    let result = lock
        .with_lock(&state.lock_key, options.lease_ttl, options.wait_timeout, || {
            state.inventory.reduce()
        })
        .await;

    match result {
        Ok(outcome) => {
            let mut response = ReduceResponse::new(ProtectionLevel::Renewed, outcome?);
            response.lease = Some(LeaseState::Released);
            response.held_ms = Some((Utc::now() - started).num_milliseconds());
            Ok(Json(response))
        }
        Err(LockError::AcquireTimeout { waited, .. }) => {
            info!(
                "No lock on {} within {:?}, giving up",
                state.lock_key, waited
            );
            Ok(Json(ReduceResponse::new(
                ProtectionLevel::Renewed,
                ReduceOutcome::Busy,
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// One non-blocking acquisition around the critical section, released on
/// every exit path like a `finally` block.
async fn reduce_single_attempt(
    state: &AppState,
    level: ProtectionLevel,
    lock: &DistributedLock,
) -> Result<Json<ReduceResponse>> {
    let lease_ttl = lock.options().lease_ttl;
    let mut handle = match lock
        .try_acquire(&state.lock_key, lease_ttl, WaitTimeout::NoWait)
        .await
    {
        Ok(handle) => handle,
        Err(LockError::AcquireTimeout { .. }) => {
            debug!("Did not win the {} lock on {}", level, state.lock_key);
            return Ok(Json(ReduceResponse::new(level, ReduceOutcome::Busy)));
        }
        Err(e) => return Err(e.into()),
    };
    info!("Won the {} lock on {}", level, state.lock_key);

    let outcome = state.inventory.reduce().await;
    let lease = handle.lease_state();
    let held_ms = (Utc::now() - handle.acquired_at()).num_milliseconds();
    let released = handle.release().await;

    let outcome = outcome?;
    if lease == LeaseState::Lost {
        warn!(
            "{} critical section on {} outlived its {:?} lease",
            level, state.lock_key, lease_ttl
        );
    }
    released?;

    Ok(Json(ReduceResponse {
        level,
        outcome,
        lease: Some(lease),
        held_ms: Some(held_ms),
    }))
}
