use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocksdb::{
    Direction, ErrorKind, IteratorMode, Options, Transaction, TransactionDB,
    TransactionDBOptions, TransactionOptions, WriteOptions,
};
use serde::Serialize;

use crate::contracts::{
    IdempotencyRecord, IdempotencyStore, Identifier, OrphanLedger, OrphanedAttempt,
    PersistError, RecordIndex, SequenceError, SequenceStore, StorageError,
};
use crate::storage::StoredRecord;

/// Key prefix for sequence counters
const SEQUENCE_PREFIX: &str = "seq";
/// Key prefix for idempotency records
const IDEM_PREFIX: &str = "idem";
/// Key prefix for registration records
const RECORD_PREFIX: &str = "rec";
/// Key prefix for orphaned attempts awaiting cleanup
const ORPHAN_PREFIX: &str = "orphan";

/// Counter used by `open`.
pub const DEFAULT_COUNTER: &str = "registration";

/// Lock wait for idempotency rows, record inserts and orphan updates.
const ROW_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// RocksDB-backed implementation of every store contract.
///
/// All read-modify-write paths run inside a pessimistic transaction that
/// locks the row with `get_for_update`, so concurrent writers in this
/// process are serialized per key. RocksDB permits one process per data
/// directory.
pub struct RocksDbStore {
    db: TransactionDB,
    counter_key: String,
}

impl RocksDbStore {
    /// Opens or creates a store at `path` using the default counter.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_counter(path, DEFAULT_COUNTER)
    }

    /// Opens or creates a store whose allocator uses the counter `counter`.
    ///
    /// The counter row is created with `last_issued = 0` the first time it
    /// is opened.
    pub fn open_with_counter(path: impl AsRef<Path>, counter: &str) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(duration_ms(ROW_LOCK_TIMEOUT));

        let db: TransactionDB = TransactionDB::open(&opts, &txn_db_opts, path).map_err(rocks_err)?;
        let store = Self {
            db,
            counter_key: format!("{}:{}", SEQUENCE_PREFIX, counter),
        };
        store.init_counter()?;

        tracing::info!(path = %path.display(), counter = counter, "Opened RocksDB store");
        Ok(store)
    }

    fn init_counter(&self) -> Result<(), StorageError> {
        let txn = self.transaction(ROW_LOCK_TIMEOUT);
        let existing = txn
            .get_for_update(&self.counter_key, true)
            .map_err(rocks_err)?;
        if existing.is_none() {
            txn.put(&self.counter_key, 0u64.to_be_bytes())
                .map_err(rocks_err)?;
        }
        txn.commit().map_err(rocks_err)
    }

    /// Starts a pessimistic transaction whose row locks wait at most `lock_timeout`.
    fn transaction(&self, lock_timeout: Duration) -> Transaction<'_, TransactionDB> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(duration_ms(lock_timeout));
        self.db.transaction_opt(&WriteOptions::default(), &txn_opts)
    }

    /// Creates a record key. Hex-encoded numbers keep keys in numeric order.
    fn record_key(number: u64) -> String {
        format!("{}:{:016x}", RECORD_PREFIX, number)
    }

    fn idempotency_key(key: &str) -> String {
        format!("{}:{}", IDEM_PREFIX, key)
    }

    fn orphan_key(number: u64) -> String {
        format!("{}:{:016x}", ORPHAN_PREFIX, number)
    }

    /// Parses the number from a record key. Key format: rec:{number_hex}
    fn parse_record_key(key: &[u8]) -> Option<u64> {
        let key = std::str::from_utf8(key).ok()?;
        let hex = key.strip_prefix(RECORD_PREFIX)?.strip_prefix(':')?;
        u64::from_str_radix(hex, 16).ok()
    }

    /// Parses a u64 from big-endian bytes.
    fn parse_u64_be(bytes: &[u8]) -> Result<u64, StorageError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| {
            StorageError::InvariantViolation(format!("counter has {} bytes, expected 8", bytes.len()))
        })?;
        Ok(u64::from_be_bytes(arr))
    }

    /// Collects every value stored under `prefix:`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StorageError> {
        let start = format!("{}:", prefix);
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(start.as_bytes(), Direction::Forward))
        {
            let (key, value) = item.map_err(rocks_err)?;
            if !key.starts_with(start.as_bytes()) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// Inserts a record under `identifier`, failing if the number is taken.
    pub fn insert_record<T: Serialize>(
        &self,
        identifier: &Identifier,
        body: &T,
    ) -> Result<StoredRecord, PersistError> {
        let record = StoredRecord {
            identifier: identifier.clone(),
            body: serde_json::to_value(body).map_err(StorageError::from)?,
        };
        let key = Self::record_key(identifier.number);
        let txn = self.transaction(ROW_LOCK_TIMEOUT);
        let existing = txn.get_for_update(&key, true).map_err(rocks_err)?;
        if existing.is_some() {
            return Err(PersistError::UniquenessConflict {
                identifier: identifier.value.clone(),
            });
        }
        let bytes = serde_json::to_vec(&record).map_err(StorageError::from)?;
        txn.put(&key, bytes).map_err(rocks_err)?;
        txn.commit().map_err(rocks_err)?;
        Ok(record)
    }

    pub fn get_record(&self, number: u64) -> Result<Option<StoredRecord>, StorageError> {
        match self.db.get(Self::record_key(number)).map_err(rocks_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn record_count(&self) -> Result<usize, StorageError> {
        Ok(self.scan_prefix(RECORD_PREFIX)?.len())
    }
}

impl SequenceStore for RocksDbStore {
    fn next(&self, lock_timeout: Duration) -> Result<u64, SequenceError> {
        // Dropping the transaction on any early return rolls it back.
        let txn = self.transaction(lock_timeout);
        let current = txn
            .get_for_update(&self.counter_key, true)
            .map_err(|e| lock_err(e, lock_timeout))?
            .map(|bytes| Self::parse_u64_be(&bytes))
            .transpose()?
            .unwrap_or(0);
        let next = current.checked_add(1).ok_or(SequenceError::Overflow)?;
        txn.put(&self.counter_key, next.to_be_bytes())
            .map_err(|e| lock_err(e, lock_timeout))?;
        txn.commit().map_err(|e| lock_err(e, lock_timeout))?;
        Ok(next)
    }

    fn current(&self) -> Result<u64, SequenceError> {
        let value = self.db.get(&self.counter_key).map_err(rocks_err)?;
        Ok(value
            .map(|bytes| Self::parse_u64_be(&bytes))
            .transpose()?
            .unwrap_or(0))
    }

    fn advance_to(&self, floor: u64, lock_timeout: Duration) -> Result<u64, SequenceError> {
        let txn = self.transaction(lock_timeout);
        let current = txn
            .get_for_update(&self.counter_key, true)
            .map_err(|e| lock_err(e, lock_timeout))?
            .map(|bytes| Self::parse_u64_be(&bytes))
            .transpose()?
            .unwrap_or(0);
        if current >= floor {
            return Ok(current);
        }
        txn.put(&self.counter_key, floor.to_be_bytes())
            .map_err(|e| lock_err(e, lock_timeout))?;
        txn.commit().map_err(|e| lock_err(e, lock_timeout))?;
        Ok(floor)
    }
}

impl RecordIndex for RocksDbStore {
    fn max_issued(&self) -> Result<Option<u64>, StorageError> {
        // ';' sorts right after ':', so this seeks to the last record key.
        let upper = format!("{};", RECORD_PREFIX);
        let mut iter = self
            .db
            .iterator(IteratorMode::From(upper.as_bytes(), Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item.map_err(rocks_err)?;
                Ok(Self::parse_record_key(&key))
            }
            None => Ok(None),
        }
    }
}

impl IdempotencyStore for RocksDbStore {
    fn mutate<T, F>(&self, key: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(Option<&IdempotencyRecord>) -> (Option<IdempotencyRecord>, T),
    {
        let db_key = Self::idempotency_key(key);
        let txn = self.transaction(ROW_LOCK_TIMEOUT);
        let existing: Option<IdempotencyRecord> = txn
            .get_for_update(&db_key, true)
            .map_err(rocks_err)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?;

        let (write, result) = f(existing.as_ref());
        if let Some(record) = write {
            let bytes = serde_json::to_vec(&record)?;
            txn.put(&db_key, bytes).map_err(rocks_err)?;
        }
        txn.commit().map_err(rocks_err)?;
        Ok(result)
    }

    fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StorageError> {
        match self.db.get(Self::idempotency_key(key)).map_err(rocks_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut candidates = Vec::new();
        for (key, value) in self.scan_prefix(IDEM_PREFIX)? {
            let record: IdempotencyRecord = serde_json::from_slice(&value)?;
            if record.is_expired(now) {
                candidates.push(key);
            }
        }

        let mut removed = 0;
        for key in candidates {
            // Re-check under the row lock; the key may have been reclaimed since the scan.
            let txn = self.transaction(ROW_LOCK_TIMEOUT);
            let current: Option<IdempotencyRecord> = txn
                .get_for_update(&key, true)
                .map_err(rocks_err)?
                .map(|bytes| serde_json::from_slice(&bytes))
                .transpose()?;
            if current.is_some_and(|r| r.is_expired(now)) {
                txn.delete(&key).map_err(rocks_err)?;
                removed += 1;
            }
            txn.commit().map_err(rocks_err)?;
        }
        Ok(removed)
    }
}

impl OrphanLedger for RocksDbStore {
    fn record_orphan(&self, orphan: OrphanedAttempt) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&orphan)?;
        self.db
            .put(Self::orphan_key(orphan.identifier.number), bytes)
            .map_err(rocks_err)
    }

    fn pending_orphans(&self) -> Result<Vec<OrphanedAttempt>, StorageError> {
        self.scan_prefix(ORPHAN_PREFIX)?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StorageError::from))
            .collect()
    }

    fn resolve_orphan(&self, identifier: &Identifier) -> Result<bool, StorageError> {
        let key = Self::orphan_key(identifier.number);
        let txn = self.transaction(ROW_LOCK_TIMEOUT);
        let existed = txn.get_for_update(&key, true).map_err(rocks_err)?.is_some();
        if existed {
            txn.delete(&key).map_err(rocks_err)?;
        }
        txn.commit().map_err(rocks_err)?;
        Ok(existed)
    }
}

fn rocks_err(e: rocksdb::Error) -> StorageError {
    StorageError::RocksDb(e.to_string())
}

/// Maps a RocksDB error from the counter path. Lock waits surface as
/// `TimedOut`, deadlocks as `Busy`; callers may retry both.
fn lock_err(e: rocksdb::Error, waited: Duration) -> SequenceError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::Busy => SequenceError::LockTimeout { waited },
        _ => SequenceError::Storage(rocks_err(e)),
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
