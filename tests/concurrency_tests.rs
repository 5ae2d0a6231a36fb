//! Concurrency tests for identifier allocation and the registration pipeline.
//!
//! Run with: cargo test --test concurrency_tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;

use registrar::allocator::{AllocatorConfig, SequenceAllocator};
use registrar::breaker::{BreakerConfig, CircuitBreaker};
use registrar::contracts::{
    ArtifactRef, Clock, ConflictKind, Identifier, ManualClock, Outcome, PersistError,
    SequenceStore, SystemClock, UploadError,
};
use registrar::coordinator::{AttemptCoordinator, RetryConfig};
use registrar::idempotency::{Admission, Fingerprint, IdempotencyGuard, IdempotencyPolicy};
use registrar::storage::{MemoryStore, RocksDbStore};

type MemoryCoordinator = AttemptCoordinator<MemoryStore, MemoryStore, MemoryStore>;

fn coordinator(store: &Arc<MemoryStore>, policy: IdempotencyPolicy) -> MemoryCoordinator {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    AttemptCoordinator::with_store(
        Arc::clone(store),
        AllocatorConfig::default(),
        policy,
        RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        },
        Arc::new(CircuitBreaker::new(
            "object-storage",
            BreakerConfig::default(),
            Arc::clone(&clock),
        )),
        clock,
    )
}

/// Allocates `per_thread` identifiers on each of `threads` threads.
fn allocate_in_parallel<S: SequenceStore + 'static>(
    allocator: Arc<SequenceAllocator<S>>,
    threads: usize,
    per_thread: usize,
) -> Vec<u64> {
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| allocator.allocate().expect("allocate should succeed").number)
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect()
}

fn assert_unique_and_contiguous(mut numbers: Vec<u64>, expected: usize) {
    numbers.sort_unstable();
    let len_before = numbers.len();
    numbers.dedup();
    assert_eq!(numbers.len(), len_before, "Found duplicate identifiers");
    assert_eq!(numbers.len(), expected);
    let expected_range: Vec<u64> = (1..=expected as u64).collect();
    assert_eq!(numbers, expected_range, "Identifiers must have no gaps");
}

// =============================================================================
// Parallel Allocation
// =============================================================================

#[test]
fn parallel_allocation_memory_is_unique_and_contiguous() {
    let allocator = Arc::new(SequenceAllocator::new(
        Arc::new(MemoryStore::new()),
        AllocatorConfig::default(),
    ));
    let numbers = allocate_in_parallel(Arc::clone(&allocator), 16, 200);
    assert_unique_and_contiguous(numbers, 3_200);
    assert_eq!(allocator.current().unwrap(), 3_200);
}

#[test]
fn parallel_allocation_rocksdb_is_unique_and_contiguous() {
    let dir = TempDir::new().unwrap();
    let allocator = Arc::new(SequenceAllocator::new(
        Arc::new(RocksDbStore::open(dir.path()).unwrap()),
        AllocatorConfig::default(),
    ));
    let numbers = allocate_in_parallel(Arc::clone(&allocator), 8, 100);
    assert_unique_and_contiguous(numbers, 800);
}

// =============================================================================
// Concurrent Executions
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_with_distinct_keys_never_share_identifiers() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store, IdempotencyPolicy::default());

    let runs = (0..40).map(|i| {
        let store = Arc::clone(&store);
        let coordinator = &coordinator;
        async move {
            let fingerprint = Fingerprint::of_bytes(format!("team-{i}").as_bytes());
            coordinator
                .execute(
                    &format!("key-{i}"),
                    &fingerprint,
                    |id: Identifier| async move {
                        // Yield so uploads from different executions interleave.
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Ok::<_, UploadError>(vec![ArtifactRef::new(format!("mem://{id}"))])
                    },
                    |id: Identifier, _artifacts| {
                        let result = store.insert_record(&id, &i).map(|_| id.number);
                        async move { result }
                    },
                )
                .await
                .unwrap()
        }
    });
    let outcomes = join_all(runs).await;

    let numbers: Vec<u64> = outcomes
        .iter()
        .map(|o| *o.success().expect("every execution should succeed"))
        .collect();
    assert_unique_and_contiguous(numbers, 40);
    assert_eq!(store.record_count().unwrap(), 40);
}

#[tokio::test]
async fn counter_lock_is_not_held_during_upload() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store, IdempotencyPolicy::default());
    let other = SequenceAllocator::new(
        Arc::clone(&store),
        AllocatorConfig {
            lock_timeout: Duration::from_millis(10),
            ..AllocatorConfig::default()
        },
    );
    let (uploading_tx, uploading_rx) = tokio::sync::oneshot::channel::<()>();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let uploading_tx = std::sync::Mutex::new(Some(uploading_tx));
    let release_rx = std::sync::Mutex::new(Some(release_rx));

    let registration = coordinator.execute(
        "key-a",
        &Fingerprint::of_bytes(b"a"),
        |id: Identifier| {
            let started = uploading_tx.lock().unwrap().take();
            let release = release_rx.lock().unwrap().take();
            async move {
                if let Some(tx) = started {
                    let _ = tx.send(());
                }
                if let Some(rx) = release {
                    let _ = rx.await;
                }
                Ok::<_, UploadError>(vec![ArtifactRef::new(format!("mem://{id}"))])
            }
        },
        |id: Identifier, _| async move { Ok::<_, PersistError>(id.value) },
    );

    let concurrent_allocation = async {
        uploading_rx.await.unwrap();
        // Upload is in progress; the counter must be free.
        let id = other.allocate().expect("counter lock must be free during upload");
        release_tx.send(()).unwrap();
        id
    };

    let (outcome, allocated) = tokio::join!(registration, concurrent_allocation);
    assert_eq!(outcome.unwrap(), Outcome::Success("ICCT-001".to_string()));
    assert_eq!(allocated.value, "ICCT-002");
}

// =============================================================================
// Same-Key Concurrency
// =============================================================================

#[tokio::test]
async fn duplicate_in_flight_request_waits_and_replays() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store, IdempotencyPolicy::default());
    let uploads = AtomicU32::new(0);
    let fingerprint = Fingerprint::of_bytes(b"same payload");

    let run = || {
        coordinator.execute(
            "key-a",
            &fingerprint,
            |id: Identifier| {
                uploads.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, UploadError>(vec![ArtifactRef::new(format!("mem://{id}"))])
                }
            },
            |id: Identifier, _| async move { Ok::<_, PersistError>(id.value) },
        )
    };

    let (first, second) = tokio::join!(run(), run());
    let first = first.unwrap();
    assert_eq!(first, Outcome::Success("ICCT-001".to_string()));
    assert_eq!(second.unwrap(), first);
    assert_eq!(uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_gives_up_after_in_flight_wait_without_caching() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(
        &store,
        IdempotencyPolicy {
            in_flight_wait: Duration::from_millis(20),
            in_flight_poll: Duration::from_millis(5),
            ..IdempotencyPolicy::default()
        },
    );
    let fingerprint = Fingerprint::of_bytes(b"same payload");

    let run = |upload_delay: Duration| {
        coordinator.execute(
            "key-a",
            &fingerprint,
            move |id: Identifier| async move {
                tokio::time::sleep(upload_delay).await;
                Ok::<_, UploadError>(vec![ArtifactRef::new(format!("mem://{id}"))])
            },
            |id: Identifier, _| async move { Ok::<_, PersistError>(id.value) },
        )
    };

    let (slow, impatient) = tokio::join!(run(Duration::from_millis(200)), run(Duration::ZERO));
    assert_eq!(slow.unwrap(), Outcome::Success("ICCT-001".to_string()));
    assert_eq!(
        impatient.unwrap(),
        Outcome::<String>::Conflict(ConflictKind::InFlight)
    );

    // The in-flight conflict was not cached: a resubmission sees the success.
    let later = run(Duration::ZERO).await.unwrap();
    assert_eq!(later, Outcome::Success("ICCT-001".to_string()));
}

#[test]
fn parallel_begin_on_one_key_admits_exactly_one() {
    let store = Arc::new(MemoryStore::new());
    let guard = Arc::new(IdempotencyGuard::new(
        store,
        Arc::new(ManualClock::default()),
        IdempotencyPolicy::default(),
    ));
    let fingerprint = Fingerprint::of_bytes(b"payload");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let guard = Arc::clone(&guard);
            let fingerprint = fingerprint.clone();
            thread::spawn(move || guard.begin("key-a", &fingerprint).unwrap())
        })
        .collect();
    let admissions: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let fresh = admissions
        .iter()
        .filter(|a| matches!(a, Admission::Fresh(_)))
        .count();
    assert_eq!(fresh, 1);
    assert!(admissions
        .iter()
        .all(|a| matches!(a, Admission::Fresh(_) | Admission::InFlight { .. })));

    let claim_ids: HashSet<_> = admissions
        .iter()
        .filter_map(|a| match a {
            Admission::Fresh(claim) => Some(claim.claim_id),
            _ => None,
        })
        .collect();
    assert_eq!(claim_ids.len(), 1);
}
