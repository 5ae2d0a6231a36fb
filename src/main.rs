use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use registrar::allocator::SequenceAllocator;
use registrar::breaker::{CircuitBreakerRegistry, NOTIFICATIONS, OBJECT_STORAGE};
use registrar::config::Settings;
use registrar::contracts::{Clock, OrphanLedger, SystemClock};
use registrar::idempotency::IdempotencyGuard;
use registrar::storage::RocksDbStore;

const USAGE: &str = "usage: registrar [status | resolve-orphan <IDENTIFIER>]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("registrar=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let settings = Settings::from_env();
    settings.validate()?;

    let store = Arc::new(RocksDbStore::open(&settings.data_dir)?);
    tracing::info!(data_dir = %settings.data_dir.display(), "Opened RocksDB");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let allocator = SequenceAllocator::new(Arc::clone(&store), settings.allocator.clone());

    match args.first().map(String::as_str) {
        None | Some("status") => {}
        Some("resolve-orphan") => {
            let raw = args.get(1).ok_or(USAGE)?;
            let number = allocator
                .format()
                .parse(raw)
                .ok_or_else(|| format!("not an identifier: {raw}"))?;
            let identifier = allocator.format().format(number);
            if store.resolve_orphan(&identifier)? {
                tracing::info!(identifier = %identifier, "Orphan entry resolved");
            } else {
                tracing::warn!(identifier = %identifier, "No orphan entry for identifier");
            }
            return Ok(());
        }
        Some(_) => return Err(USAGE.into()),
    }

    // The counter may lag behind records written by a crashed or restored
    // instance.
    let reconciliation = allocator.sync_with_existing(store.as_ref())?;

    let guard = IdempotencyGuard::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        settings.idempotency.clone(),
    );
    let purged = guard.purge_expired()?;

    let orphans = store.pending_orphans()?;
    for orphan in &orphans {
        tracing::warn!(
            identifier = %orphan.identifier,
            attempt = orphan.attempt,
            artifacts = orphan.artifacts.len(),
            reason = %orphan.reason,
            discarded_at = %orphan.discarded_at,
            "Orphaned artifacts awaiting cleanup"
        );
    }

    let breakers = CircuitBreakerRegistry::new(settings.breaker.clone(), Arc::clone(&clock));
    breakers.get_or_create(OBJECT_STORAGE);
    breakers.get_or_create(NOTIFICATIONS);

    let report = json!({
        "data_dir": settings.data_dir.display().to_string(),
        "counter": {
            "previous": reconciliation.previous,
            "observed_max": reconciliation.observed_max,
            "current": reconciliation.current,
            "advanced": reconciliation.advanced(),
        },
        "records": store.record_count()?,
        "idempotency_purged": purged,
        "orphans": orphans,
        "breakers": breakers.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    print!("{}", breakers.format_prometheus());

    Ok(())
}
