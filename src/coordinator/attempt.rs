use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::contracts::{ArtifactRef, Identifier, OrphanedAttempt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Committed,
    RolledBack,
}

/// One allocate → upload → persist pass. Lives only for the duration of
/// a single `execute` call and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationAttempt {
    /// 1-based.
    pub attempt_number: u32,
    pub identifier: Option<Identifier>,
    pub uploaded_artifacts: Vec<ArtifactRef>,
    pub status: AttemptStatus,
}

impl RegistrationAttempt {
    pub fn new(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            identifier: None,
            uploaded_artifacts: Vec::new(),
            status: AttemptStatus::Pending,
        }
    }

    pub fn commit(&mut self) {
        self.status = AttemptStatus::Committed;
    }

    /// Marks the attempt rolled back and hands over its uploaded artifacts
    /// as an orphan entry. Returns `None` if nothing was uploaded.
    ///
    /// The identifier stays on the attempt: it is burned, not returned to
    /// the sequence.
    pub fn roll_back(&mut self, reason: &str, now: DateTime<Utc>) -> Option<OrphanedAttempt> {
        self.status = AttemptStatus::RolledBack;
        let identifier = self.identifier.clone()?;
        if self.uploaded_artifacts.is_empty() {
            return None;
        }
        Some(OrphanedAttempt {
            identifier,
            attempt: self.attempt_number,
            artifacts: std::mem::take(&mut self.uploaded_artifacts),
            reason: reason.to_string(),
            discarded_at: now,
        })
    }
}
