mod memory;
mod rocksdb;

use serde::{Deserialize, Serialize};

use crate::contracts::Identifier;

pub use memory::MemoryStore;
pub use self::rocksdb::{RocksDbStore, DEFAULT_COUNTER};

/// A committed registration record as kept by the bundled record tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub identifier: Identifier,
    pub body: serde_json::Value,
}
