//! Confidence reports and approvals
//!
//! Reports are derived data: recomputed from the latest validation record
//! and retrieval features, never stored as the source of truth.

use crate::candidate::{CandidateId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Decision band for a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    AutoApply,
    HumanReview,
    Reject,
}

impl Display for Gate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AutoApply => "auto-apply",
            Self::HumanReview => "human-review",
            Self::Reject => "reject",
        })
    }
}

/// Retrieval-quality signals, each normalized to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFeatures {
    /// Share of the required context that made it into the bundle
    pub coverage: f64,
    /// Agreement between graph and vector retrieval; `None` when vector
    /// search did not contribute
    pub agreement: Option<f64>,
    /// Share of touched entities that the proposer was shown
    pub consistency: f64,
}

impl Default for RetrievalFeatures {
    fn default() -> Self {
        Self {
            coverage: 1.0,
            agreement: None,
            consistency: 1.0,
        }
    }
}

/// Calibrated accept/reject assessment of one validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub candidate: CandidateId,
    /// Run the report was computed from
    pub run: RunId,
    pub probability: f64,
    pub gate: Gate,
    pub features: RetrievalFeatures,
    /// Normalized contribution of the validation outcome
    pub validation_signal: f64,
}

/// Explicit reviewer decision from the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub reviewer: String,
    pub approved: bool,
    #[serde(default)]
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl HumanDecision {
    #[must_use]
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            approved: true,
            note: None,
            decided_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn reject(reviewer: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            approved: false,
            note: Some(note.into()),
            decided_at: Utc::now(),
        }
    }
}

/// Authority under which a commit is requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by")]
pub enum Approval {
    /// The confidence gate
    Confidence(ConfidenceReport),
    /// A human reviewer
    Human(HumanDecision),
}

impl Approval {
    /// Short description for the audit trail
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Confidence(r) => format!("gate {} (p={:.3})", r.gate, r.probability),
            Self::Human(d) if d.approved => format!("approved by {}", d.reviewer),
            Self::Human(d) => format!("rejected by {}", d.reviewer),
        }
    }
}
