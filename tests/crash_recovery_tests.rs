//! Crash recovery tests for the durable store.
//!
//! These tests verify that counters, idempotency records and orphan entries
//! survive restarts, and that state left behind by a crashed process is
//! recovered.
//! Run with: cargo test --test crash_recovery_tests

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use registrar::allocator::{AllocatorConfig, IdentifierFormat, SequenceAllocator};
use registrar::breaker::{BreakerConfig, CircuitBreaker};
use registrar::contracts::{
    ArtifactRef, Identifier, ManualClock, OrphanLedger, OrphanedAttempt, Outcome, PersistError,
    SequenceStore, UploadError,
};
use registrar::coordinator::{AttemptCoordinator, RetryConfig};
use registrar::idempotency::{
    Admission, Fingerprint, IdempotencyGuard, IdempotencyPolicy, DEFAULT_PENDING_GRACE,
};
use registrar::storage::RocksDbStore;

fn open(dir: &Path) -> Arc<RocksDbStore> {
    Arc::new(RocksDbStore::open(dir).expect("Failed to open store"))
}

fn guard(store: &Arc<RocksDbStore>, clock: &Arc<ManualClock>) -> IdempotencyGuard<RocksDbStore> {
    IdempotencyGuard::new(
        Arc::clone(store),
        clock.clone(),
        IdempotencyPolicy::default(),
    )
}

fn coordinator(
    store: &Arc<RocksDbStore>,
    clock: &Arc<ManualClock>,
) -> AttemptCoordinator<RocksDbStore, RocksDbStore, RocksDbStore> {
    AttemptCoordinator::with_store(
        Arc::clone(store),
        AllocatorConfig::default(),
        IdempotencyPolicy::default(),
        RetryConfig {
            base_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        },
        Arc::new(CircuitBreaker::new(
            "object-storage",
            BreakerConfig::default(),
            clock.clone(),
        )),
        clock.clone(),
    )
}

// =============================================================================
// Basic Recovery
// =============================================================================

#[test]
fn counter_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let allocator = SequenceAllocator::new(open(dir.path()), AllocatorConfig::default());
        for _ in 0..5 {
            allocator.allocate().unwrap();
        }
        // Store dropped here - clean shutdown
    }

    let allocator = SequenceAllocator::new(open(dir.path()), AllocatorConfig::default());
    assert_eq!(allocator.current().unwrap(), 5);
    assert_eq!(allocator.allocate().unwrap().value, "ICCT-006");
}

#[tokio::test]
async fn completed_outcome_replays_after_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let fingerprint = Fingerprint::of_bytes(b"team-lions");
    let uploads = AtomicU32::new(0);

    let upload = |id: Identifier| {
        uploads.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, UploadError>(vec![ArtifactRef::new(format!("mem://{id}"))]) }
    };

    let first = {
        let store = open(dir.path());
        let coordinator = coordinator(&store, &clock);
        coordinator
            .execute("key-a", &fingerprint, upload, |id: Identifier, _| {
                let result = store.insert_record(&id, &"Lions").map(|_| id.value);
                async move { result }
            })
            .await
            .unwrap()
    };
    assert_eq!(first, Outcome::Success("ICCT-001".to_string()));

    let store = open(dir.path());
    let coordinator = coordinator(&store, &clock);
    let replay = coordinator
        .execute("key-a", &fingerprint, upload, |_id: Identifier, _| async {
            Err::<String, _>(PersistError::Other("must not run".into()))
        })
        .await
        .unwrap();

    assert_eq!(replay, first);
    assert_eq!(uploads.load(Ordering::SeqCst), 1);
    assert_eq!(store.current().unwrap(), 1);
}

// =============================================================================
// Interrupted Work
// =============================================================================

/// A record committed by a process that died before its counter write
/// reached disk leaves the counter behind. Reconciliation fixes it.
#[test]
fn reconciliation_after_counter_fell_behind() {
    let dir = TempDir::new().unwrap();
    let format = IdentifierFormat::default();

    {
        let store = open(dir.path());
        let allocator = SequenceAllocator::new(Arc::clone(&store), AllocatorConfig::default());
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();
        // Records for 3 and 4 landed, the counter did not move.
        store.insert_record(&format.format(3), &"lost-counter").unwrap();
        store.insert_record(&format.format(4), &"lost-counter").unwrap();
    }

    let store = open(dir.path());
    let allocator = SequenceAllocator::new(Arc::clone(&store), AllocatorConfig::default());
    let result = allocator.sync_with_existing(store.as_ref()).unwrap();
    assert_eq!(result.previous, 2);
    assert_eq!(result.current, 4);
    assert_eq!(allocator.allocate().unwrap().value, "ICCT-005");

    // Running again is a no-op.
    assert!(!allocator.sync_with_existing(store.as_ref()).unwrap().advanced());
}

#[test]
fn pending_marker_from_crashed_process_is_taken_over_after_grace() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let fingerprint = Fingerprint::of_bytes(b"payload");

    let abandoned = {
        let store = open(dir.path());
        let admission = guard(&store, &clock).begin("key-a", &fingerprint).unwrap();
        // Process dies without calling complete.
        match admission {
            Admission::Fresh(claim) => claim,
            other => panic!("expected fresh admission, got {other:?}"),
        }
    };

    let store = open(dir.path());
    let guard = guard(&store, &clock);

    // Still within the grace period: treated as in flight.
    assert!(matches!(
        guard.begin("key-a", &fingerprint).unwrap(),
        Admission::InFlight { .. }
    ));

    clock.advance(DEFAULT_PENDING_GRACE);
    let claim = match guard.begin("key-a", &fingerprint).unwrap() {
        Admission::Fresh(claim) => claim,
        other => panic!("expected takeover, got {other:?}"),
    };
    assert!(claim.took_over);
    assert_ne!(claim.claim_id, abandoned.claim_id);

    // The abandoned execution cannot overwrite the new one.
    assert!(!guard.complete(&abandoned, &"stale").unwrap());
    assert!(guard.complete(&claim, &"fresh").unwrap());
    assert_eq!(
        guard.begin("key-a", &fingerprint).unwrap(),
        Admission::Replay(serde_json::json!("fresh"))
    );
}

#[test]
fn orphans_survive_restart_until_resolved() {
    let dir = TempDir::new().unwrap();
    let format = IdentifierFormat::default();
    let orphan = OrphanedAttempt {
        identifier: format.format(7),
        attempt: 1,
        artifacts: vec![ArtifactRef::new("mem://bucket/ICCT-007/logo.png")],
        reason: "Identifier ICCT-007 already exists".into(),
        discarded_at: Utc::now(),
    };

    {
        let store = open(dir.path());
        store.record_orphan(orphan.clone()).unwrap();
    }

    let store = open(dir.path());
    assert_eq!(store.pending_orphans().unwrap(), vec![orphan.clone()]);
    assert!(store.resolve_orphan(&orphan.identifier).unwrap());
    assert!(!store.resolve_orphan(&orphan.identifier).unwrap());

    drop(store);
    assert!(open(dir.path()).pending_orphans().unwrap().is_empty());
}

#[test]
fn expired_records_are_purged_after_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let fingerprint = Fingerprint::of_bytes(b"payload");

    {
        let store = open(dir.path());
        let guard = guard(&store, &clock);
        for key in ["a", "b", "c"] {
            if let Admission::Fresh(claim) = guard.begin(key, &fingerprint).unwrap() {
                guard.complete(&claim, &key).unwrap();
            }
        }
    }

    clock.advance(IdempotencyPolicy::default().ttl);
    let store = open(dir.path());
    let guard = guard(&store, &clock);
    assert!(guard.lookup("a").unwrap().is_none());
    assert_eq!(guard.purge_expired().unwrap(), 3);
    assert_eq!(guard.purge_expired().unwrap(), 0);
}
