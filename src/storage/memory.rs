use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::contracts::{
    IdempotencyRecord, IdempotencyStore, Identifier, LockResultExt, OrphanLedger,
    OrphanedAttempt, PersistError, RecordIndex, SequenceError, SequenceStore, StorageError,
};
use crate::storage::StoredRecord;

/// In-process implementation of every store contract.
///
/// Suitable for tests and single-process deployments that do not need
/// durability. The counter lock has the same timeout semantics as the
/// RocksDB row lock.
pub struct MemoryStore {
    counter: Mutex<u64>,
    idempotency: DashMap<String, IdempotencyRecord>,
    records: RwLock<BTreeMap<u64, StoredRecord>>,
    orphans: RwLock<BTreeMap<u64, OrphanedAttempt>>,
}

impl MemoryStore {
    /// Creates an empty store with the counter at 0.
    pub fn new() -> Self {
        Self::starting_from(0)
    }

    /// Creates a store whose counter starts at `last_issued`.
    pub fn starting_from(last_issued: u64) -> Self {
        Self {
            counter: Mutex::new(last_issued),
            idempotency: DashMap::new(),
            records: RwLock::new(BTreeMap::new()),
            orphans: RwLock::new(BTreeMap::new()),
        }
    }

    /// Holds the counter row lock until the guard is dropped.
    ///
    /// Allocation blocks (and eventually times out) while the guard lives.
    pub fn hold_counter_lock(&self) -> MutexGuard<'_, u64> {
        self.counter.lock()
    }

    /// Inserts a record under `identifier`, failing if the number is taken.
    pub fn insert_record<T: Serialize>(
        &self,
        identifier: &Identifier,
        body: &T,
    ) -> Result<StoredRecord, PersistError> {
        let body = serde_json::to_value(body).map_err(StorageError::from)?;
        let mut records = self.records.write().map_lock_err()?;
        if records.contains_key(&identifier.number) {
            return Err(PersistError::UniquenessConflict {
                identifier: identifier.value.clone(),
            });
        }
        let record = StoredRecord {
            identifier: identifier.clone(),
            body,
        };
        records.insert(identifier.number, record.clone());
        Ok(record)
    }

    pub fn get_record(&self, number: u64) -> Result<Option<StoredRecord>, StorageError> {
        let records = self.records.read().map_lock_err()?;
        Ok(records.get(&number).cloned())
    }

    pub fn record_count(&self) -> Result<usize, StorageError> {
        Ok(self.records.read().map_lock_err()?.len())
    }

    fn lock_counter(&self, lock_timeout: Duration) -> Result<MutexGuard<'_, u64>, SequenceError> {
        self.counter
            .try_lock_for(lock_timeout)
            .ok_or(SequenceError::LockTimeout {
                waited: lock_timeout,
            })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceStore for MemoryStore {
    fn next(&self, lock_timeout: Duration) -> Result<u64, SequenceError> {
        let mut counter = self.lock_counter(lock_timeout)?;
        let next = counter.checked_add(1).ok_or(SequenceError::Overflow)?;
        *counter = next;
        Ok(next)
    }

    fn current(&self) -> Result<u64, SequenceError> {
        Ok(*self.counter.lock())
    }

    fn advance_to(&self, floor: u64, lock_timeout: Duration) -> Result<u64, SequenceError> {
        let mut counter = self.lock_counter(lock_timeout)?;
        if *counter < floor {
            *counter = floor;
        }
        Ok(*counter)
    }
}

impl RecordIndex for MemoryStore {
    fn max_issued(&self) -> Result<Option<u64>, StorageError> {
        let records = self.records.read().map_lock_err()?;
        Ok(records.keys().next_back().copied())
    }
}

impl IdempotencyStore for MemoryStore {
    fn mutate<T, F>(&self, key: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(Option<&IdempotencyRecord>) -> (Option<IdempotencyRecord>, T),
    {
        // The entry guard holds the shard lock for the whole decision.
        let result = match self.idempotency.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let (write, result) = f(Some(entry.get()));
                if let Some(record) = write {
                    entry.insert(record);
                }
                result
            }
            Entry::Vacant(entry) => {
                let (write, result) = f(None);
                if let Some(record) = write {
                    entry.insert(record);
                }
                result
            }
        };
        Ok(result)
    }

    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StorageError> {
        Ok(self.idempotency.get(key).map(|r| r.value().clone()))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut removed = 0;
        self.idempotency.retain(|_, record| {
            let keep = !record.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

impl OrphanLedger for MemoryStore {
    fn record_orphan(&self, orphan: OrphanedAttempt) -> Result<(), StorageError> {
        let mut orphans = self.orphans.write().map_lock_err()?;
        orphans.insert(orphan.identifier.number, orphan);
        Ok(())
    }

    fn pending_orphans(&self) -> Result<Vec<OrphanedAttempt>, StorageError> {
        let orphans = self.orphans.read().map_lock_err()?;
        Ok(orphans.values().cloned().collect())
    }

    fn resolve_orphan(&self, identifier: &Identifier) -> Result<bool, StorageError> {
        let mut orphans = self.orphans.write().map_lock_err()?;
        Ok(orphans.remove(&identifier.number).is_some())
    }
}
