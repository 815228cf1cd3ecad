//! Hash-chained audit trail of commits and rollbacks

use crate::error::AuditError;
use chrono::{DateTime, Utc};
use im::Vector;
use isg_core::{CandidateId, CommitId, EntityId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Commit,
    Rollback,
}

impl AuditAction {
    fn as_u8(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Rollback => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub commit: CommitId,
    pub candidate: CandidateId,
    pub entities: Vec<EntityId>,
    pub detail: String,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl AuditRecord {
    /// Hex form of the record hash
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

pub(crate) struct AuditEntry {
    pub(crate) action: AuditAction,
    pub(crate) commit: CommitId,
    pub(crate) candidate: CandidateId,
    pub(crate) entities: Vec<EntityId>,
    pub(crate) detail: String,
}

pub(crate) fn append(log: &mut Vector<AuditRecord>, entry: AuditEntry) -> u64 {
    let prev_hash = log.last().map_or([0u8; 32], |r| r.hash);
    let seq = log.len() as u64;
    let mut record = AuditRecord {
        seq,
        at: Utc::now(),
        action: entry.action,
        commit: entry.commit,
        candidate: entry.candidate,
        entities: entry.entities,
        detail: entry.detail,
        prev_hash,
        hash: [0u8; 32],
    };
    record.hash = compute_hash(&record);
    log.push_back(record);
    seq
}

/// Check every link and every record hash
///
/// # Errors
/// Returns the first record whose hash or back-link does not verify
pub fn verify_chain<'a, I>(records: I) -> Result<(), AuditError>
where
    I: IntoIterator<Item = &'a AuditRecord>,
{
    let mut prev = [0u8; 32];
    for record in records {
        if record.prev_hash != prev || record.hash != compute_hash(record) {
            return Err(AuditError::IntegrityViolation { seq: record.seq });
        }
        prev = record.hash;
    }
    Ok(())
}

fn compute_hash(record: &AuditRecord) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(record.seq.to_le_bytes());
    hasher.update(record.at.timestamp_micros().to_le_bytes());
    hasher.update([record.action.as_u8()]);
    hasher.update(record.commit.0.to_bytes());
    hasher.update(record.candidate.hash().as_bytes());
    for entity in &record.entities {
        hasher.update(entity.to_string().as_bytes());
        hasher.update([0]);
    }
    hasher.update(record.detail.as_bytes());
    hasher.update([0]);
    hasher.update(record.prev_hash);
    hasher.finalize().into()
}
