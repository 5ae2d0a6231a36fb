//! Sequential identifier allocation on top of a `SequenceStore`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::env_or;
use crate::contracts::{Identifier, RecordIndex, SequenceError, SequenceStore};

/// How counter values are rendered as identifiers: prefix + zero-padded number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierFormat {
    prefix: String,
    width: usize,
}

impl IdentifierFormat {
    pub fn new(prefix: impl Into<String>, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            width,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Renders `number`. Numbers wider than `width` are not truncated.
    pub fn format(&self, number: u64) -> Identifier {
        Identifier {
            number,
            value: format!("{}{:0width$}", self.prefix, number, width = self.width),
        }
    }

    /// Extracts the number from an identifier in this format.
    pub fn parse(&self, value: &str) -> Option<u64> {
        let digits = value.strip_prefix(&self.prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

impl Default for IdentifierFormat {
    fn default() -> Self {
        Self::new("ICCT-", 3)
    }
}

/// Allocator tuning.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub format: IdentifierFormat,
    /// How long `allocate` waits for the counter row lock.
    pub lock_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            format: IdentifierFormat::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl AllocatorConfig {
    /// Creates an AllocatorConfig from environment variables.
    ///
    /// Environment variables:
    /// - `REGISTRAR_ID_PREFIX`: identifier prefix (default: ICCT-)
    /// - `REGISTRAR_ID_WIDTH`: zero-pad width (default: 3)
    /// - `REGISTRAR_SEQUENCE_LOCK_TIMEOUT_MS`: row lock wait (default: 5000)
    pub fn from_env() -> Self {
        let default = Self::default();
        let prefix = std::env::var("REGISTRAR_ID_PREFIX")
            .unwrap_or_else(|_| default.format.prefix().to_string());
        Self {
            format: IdentifierFormat::new(prefix, env_or("REGISTRAR_ID_WIDTH", default.format.width)),
            lock_timeout: Duration::from_millis(env_or(
                "REGISTRAR_SEQUENCE_LOCK_TIMEOUT_MS",
                default.lock_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Result of `sync_with_existing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Counter before reconciliation.
    pub previous: u64,
    /// Highest identifier number found among stored records.
    pub observed_max: Option<u64>,
    /// Counter after reconciliation.
    pub current: u64,
}

impl Reconciliation {
    pub fn advanced(&self) -> bool {
        self.current > self.previous
    }
}

/// Hands out identifiers from the shared counter.
///
/// The store's row lock is held only for the read-increment-write inside
/// `SequenceStore::next`; nothing else in the registration pipeline runs
/// under it.
pub struct SequenceAllocator<S: SequenceStore> {
    store: Arc<S>,
    config: AllocatorConfig,
}

impl<S: SequenceStore> SequenceAllocator<S> {
    pub fn new(store: Arc<S>, config: AllocatorConfig) -> Self {
        Self { store, config }
    }

    pub fn format(&self) -> &IdentifierFormat {
        &self.config.format
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Allocates the next identifier.
    ///
    /// Returns `SequenceError::LockTimeout` if the counter stays locked for
    /// longer than the configured timeout.
    pub fn allocate(&self) -> Result<Identifier, SequenceError> {
        match self.store.next(self.config.lock_timeout) {
            Ok(number) => {
                let identifier = self.config.format.format(number);
                tracing::debug!(identifier = %identifier, "Allocated identifier");
                Ok(identifier)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Identifier allocation failed");
                Err(e)
            }
        }
    }

    /// Last issued counter value.
    pub fn current(&self) -> Result<u64, SequenceError> {
        self.store.current()
    }

    /// Raises the counter to the highest identifier actually stored.
    ///
    /// Run at startup and whenever records may have been written behind the
    /// allocator's back (restores, manual inserts, crashes between record
    /// commit and counter update). Never lowers the counter.
    pub fn sync_with_existing<I: RecordIndex + ?Sized>(
        &self,
        index: &I,
    ) -> Result<Reconciliation, SequenceError> {
        let previous = self.store.current()?;
        let observed_max = index.max_issued()?;

        let current = match observed_max {
            Some(max) if max > previous => self.store.advance_to(max, self.config.lock_timeout)?,
            _ => previous,
        };

        let result = Reconciliation {
            previous,
            observed_max,
            current,
        };
        if result.advanced() {
            tracing::info!(
                previous = previous,
                current = current,
                "Sequence counter was behind stored records, advanced"
            );
        } else {
            tracing::debug!(
                current = current,
                observed_max = ?observed_max,
                "Sequence counter in sync with stored records"
            );
        }
        Ok(result)
    }
}
