use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use leaselock_core::{
    DistributedLock, LeaseState, LockError, LockOptions, MemoryStore, ReleaseOutcome, StoreClient,
    WaitTimeout,
};
use tokio::time::{sleep, timeout, Instant};

const KEY: &str = "product_1001";
const STOCK: &str = "stock";
const TTL: Duration = Duration::from_secs(3);

fn setup(options: LockOptions) -> (Arc<MemoryStore>, DistributedLock) {
    let store = Arc::new(MemoryStore::new());
    let lock = DistributedLock::new(store.clone(), options).unwrap();
    (store, lock)
}

async fn read_stock(store: &MemoryStore) -> i64 {
    store.get(STOCK).await.unwrap().unwrap().parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_mutual_exclusion_under_contention() {
    let (store, lock) = setup(LockOptions::default());
    store.set(STOCK, "50").await.unwrap();

    const NUM_TASKS: i64 = 20;
    let inside = Arc::new(AtomicUsize::new(0));

    let tasks = (0..NUM_TASKS).map(|i| {
        let lock = lock.clone();
        let store = store.clone();
        let inside = inside.clone();
        tokio::spawn(async move {
            lock.with_lock(KEY, TTL, WaitTimeout::Unbounded, move || async move {
                assert_eq!(
                    inside.fetch_add(1, Ordering::SeqCst),
                    0,
                    "two holders inside the critical section"
                );
                let stock = read_stock(&store).await;
                sleep(Duration::from_millis(50 * (i % 4) as u64)).await;
                store.set(STOCK, &(stock - 1).to_string()).await.unwrap();
                inside.fetch_sub(1, Ordering::SeqCst);
                stock - 1
            })
            .await
            .expect("critical section should run under a held lock")
        })
    });

    let mut remaining: Vec<i64> = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.expect("task panicked"))
        .collect();
    remaining.sort_unstable();

    // Every decrement observed a distinct stock level: no double-decrement
    assert_eq!(remaining, (50 - NUM_TASKS..50).collect::<Vec<_>>());
    assert_eq!(read_stock(&store).await, 50 - NUM_TASKS);
    assert_eq!(store.get(KEY).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_outlives_critical_section() {
    let (store, lock) = setup(LockOptions::default().with_renewal_ratio(1.0 / 3.0));
    let mut holder = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await.unwrap();

    let contender = {
        let lock = lock.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut wins = 0;
            while started.elapsed() < Duration::from_secs(6) {
                if let Ok(mut handle) = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await {
                    wins += 1;
                    handle.release().await.unwrap();
                }
                sleep(Duration::from_millis(250)).await;
            }
            wins
        })
    };

    // Critical section twice as long as the lease
    sleep(Duration::from_secs(6)).await;

    assert_eq!(holder.lease_state(), LeaseState::Held);
    assert_eq!(contender.await.unwrap(), 0);
    assert_eq!(
        store.get(KEY).await.unwrap(),
        Some(holder.token().to_string())
    );
    assert_eq!(holder.release().await.unwrap(), ReleaseOutcome::Released);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout_is_bounded() {
    let (_store, lock) = setup(LockOptions::default());
    let _holder = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await.unwrap();

    let started = Instant::now();
    let err = lock
        .try_acquire(KEY, TTL, Duration::from_secs(2))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(2050), "{:?}", elapsed);
    match err {
        LockError::AcquireTimeout { key, waited } => {
            assert_eq!(key, KEY);
            assert!(waited >= Duration::from_secs(2));
        }
        other => panic!("expected AcquireTimeout, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_release_is_idempotent() {
    let (store, lock) = setup(LockOptions::default());
    let mut handle = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await.unwrap();

    assert_eq!(lock.release(&mut handle).await.unwrap(), ReleaseOutcome::Released);
    assert_eq!(
        lock.release(&mut handle).await.unwrap(),
        ReleaseOutcome::AlreadyReleased
    );
    assert_eq!(handle.release().await.unwrap(), ReleaseOutcome::AlreadyReleased);

    // A second release never touches a later owner's record
    let mut next = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await.unwrap();
    assert_eq!(handle.release().await.unwrap(), ReleaseOutcome::AlreadyReleased);
    assert_eq!(store.get(KEY).await.unwrap(), Some(next.token().to_string()));
    next.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_reports_out_of_band_expiry() {
    let (store, lock) = setup(LockOptions::default());
    let mut handle = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await.unwrap();
    let mut updates = handle.subscribe();

    // The store drops the record before the next renewal
    store.delete(KEY).await.unwrap();

    timeout(Duration::from_secs(2), handle.wait_lost())
        .await
        .expect("loss should be reported by the next renewal tick");
    assert_eq!(*updates.borrow_and_update(), LeaseState::Lost);
    assert!(matches!(handle.check(), Err(LockError::LockLost { .. })));

    // A new owner can take the key; the stale handle must leave it alone
    let mut next = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await.unwrap();
    assert_eq!(handle.release().await.unwrap(), ReleaseOutcome::NotHeld);
    assert_eq!(store.get(KEY).await.unwrap(), Some(next.token().to_string()));
    next.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_surfaces_lost_lease() {
    let (store, lock) = setup(LockOptions::default());

    let result = lock
        .with_lock(KEY, TTL, WaitTimeout::NoWait, || async {
            store.delete(KEY).await.unwrap();
            sleep(Duration::from_secs(2)).await;
        })
        .await;

    assert!(matches!(result, Err(LockError::LockLost { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_surfaces_unrenewed_expiry() {
    let (_store, lock) = setup(LockOptions::default().with_renewal(false));

    let result = lock
        .with_lock(KEY, TTL, WaitTimeout::NoWait, || sleep(Duration::from_secs(4)))
        .await;

    assert!(matches!(result, Err(LockError::LockLost { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_renewal_outage_past_ttl_reports_lost() {
    let options = LockOptions::default().with_max_renewal_failures(5);
    let (store, lock) = setup(options);
    let mut handle = lock.try_acquire(KEY, TTL, WaitTimeout::NoWait).await.unwrap();

    // Five failures at one per second would outlast the 3s record
    store.set_available(false);
    sleep(Duration::from_millis(3500)).await;
    store.set_available(true);

    assert!(store.set_if_absent(KEY, "second-owner", TTL).await.unwrap());
    assert_eq!(handle.lease_state(), LeaseState::Lost);
    assert!(matches!(handle.check(), Err(LockError::LockLost { .. })));

    assert_eq!(handle.release().await.unwrap(), ReleaseOutcome::NotHeld);
    assert_eq!(store.get(KEY).await.unwrap().as_deref(), Some("second-owner"));
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_surfaces_overlap_after_renewal_outage() {
    let options = LockOptions::default().with_max_renewal_failures(5);
    let (store, lock) = setup(options);

    let result = lock
        .with_lock(KEY, TTL, WaitTimeout::NoWait, || async {
            store.set_available(false);
            sleep(Duration::from_millis(3500)).await;
            store.set_available(true);
            assert!(store.set_if_absent(KEY, "second-owner", TTL).await.unwrap());
            sleep(Duration::from_millis(500)).await;
            "done"
        })
        .await;

    assert!(matches!(result, Err(LockError::LockLost { .. })));
    assert_eq!(store.get(KEY).await.unwrap().as_deref(), Some("second-owner"));
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_surfaces_record_gone_at_release() {
    let (store, lock) = setup(LockOptions::default());

    // The record changes hands between renewal ticks, so only the release
    // can tell
    let result = lock
        .with_lock(KEY, TTL, WaitTimeout::NoWait, || async {
            store.delete(KEY).await.unwrap();
            assert!(store.set_if_absent(KEY, "second-owner", TTL).await.unwrap());
            "done"
        })
        .await;

    assert!(matches!(result, Err(LockError::LockLost { .. })));
    assert_eq!(store.get(KEY).await.unwrap().as_deref(), Some("second-owner"));
}

async fn failing_critical_section() -> u32 {
    panic!("critical section failed");
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_releases_on_panic() {
    let (store, lock) = setup(LockOptions::default());

    let task = {
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.with_lock(KEY, TTL, WaitTimeout::NoWait, failing_critical_section)
                .await
        })
    };

    let err = task.await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(store.get(KEY).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_returns_value() {
    let (store, lock) = setup(LockOptions::default());

    let value = lock
        .with_lock(KEY, TTL, Duration::from_secs(1), || async { 42 })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert!(store.is_empty());
}
