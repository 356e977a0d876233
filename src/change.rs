//! Two-stage change detection against the seen-file ledger.
//!
//! Stage one compares the listing timestamp with the stored one and skips
//! without touching the network when they are equal. Stage two runs only
//! for new or re-timestamped files: it takes the content hash from the
//! listing when available, otherwise downloads and hashes the content. A
//! matching hash means only metadata changed, so the stored timestamp is
//! refreshed and the file is skipped; anything else is processed.
//!
//! The ledger is written here only for confirmed-unchanged files.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::drive::DriveSource;
use crate::error::Result;
use crate::ledger::{Ledger, LedgerLocks};
use crate::models::{FileFormat, LedgerEntry, SourceFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Timestamp matches the ledger.
    Unchanged,
    /// Timestamp moved but the content hash did not.
    MetadataOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Modified,
}

/// A file that needs extraction, with whatever stage two already learned.
#[derive(Debug, Clone)]
pub struct ProcessPlan {
    pub kind: ChangeKind,
    pub content_hash: String,
    /// Bytes downloaded for hashing, reused to avoid a second fetch.
    pub prefetched: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Skip(SkipReason),
    Process(ProcessPlan),
}

/// Counts reported at the end of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DetectionStats {
    pub new: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub metadata_only: usize,
}

impl DetectionStats {
    pub fn record(&mut self, decision: &Decision) {
        match decision {
            Decision::Skip(reason) => self.record_skip(*reason),
            Decision::Process(plan) => self.record_change(plan.kind),
        }
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::Unchanged => self.unchanged += 1,
            SkipReason::MetadataOnly => self.metadata_only += 1,
        }
    }

    pub fn record_change(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::New => self.new += 1,
            ChangeKind::Modified => self.modified += 1,
        }
    }
}

/// Tagged SHA-256 of fetched bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub struct ChangeDetector {
    drive: Arc<dyn DriveSource>,
    ledger: Arc<dyn Ledger>,
    locks: Arc<LedgerLocks>,
}

impl ChangeDetector {
    pub fn new(
        drive: Arc<dyn DriveSource>,
        ledger: Arc<dyn Ledger>,
        locks: Arc<LedgerLocks>,
    ) -> Self {
        Self {
            drive,
            ledger,
            locks,
        }
    }

    pub async fn detect(&self, file: &SourceFile, format: FileFormat) -> Result<Decision> {
        let _guard = self.locks.lock(&file.id).await;
        let previous = self.ledger.get(&file.id).await?;

        if let Some(prev) = &previous {
            if prev.modified_time == file.modified_time {
                debug!(file_id = %file.id, "timestamp unchanged");
                return Ok(Decision::Skip(SkipReason::Unchanged));
            }
        }

        let (hash, prefetched) = match &file.content_hash {
            Some(hash) => (hash.clone(), None),
            None => {
                let bytes = self.drive.fetch_content(file, format).await?;
                (content_hash(&bytes), Some(bytes))
            }
        };

        match previous {
            Some(prev) if prev.content_hash == hash => {
                debug!(file_id = %file.id, "content unchanged, refreshing timestamp");
                self.ledger
                    .record(
                        &file.id,
                        &LedgerEntry {
                            modified_time: file.modified_time,
                            content_hash: hash,
                        },
                    )
                    .await?;
                Ok(Decision::Skip(SkipReason::MetadataOnly))
            }
            Some(_) => Ok(Decision::Process(ProcessPlan {
                kind: ChangeKind::Modified,
                content_hash: hash,
                prefetched,
            })),
            None => Ok(Decision::Process(ProcessPlan {
                kind: ChangeKind::New,
                content_hash: hash,
                prefetched,
            })),
        }
    }
}
