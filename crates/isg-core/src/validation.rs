//! Validation records
//!
//! A [`ValidationResult`] is written once per run and never mutated; a
//! re-run produces a new record with a new [`RunId`].

use crate::candidate::{CandidateId, RunId};
use crate::id::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Phase of the per-candidate validation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPhase {
    Queued,
    Overlaying,
    Building,
    Testing,
    Passed,
    Failed,
}

impl ValidationPhase {
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

impl Display for ValidationPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Overlaying => "overlaying",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Passed => "passed",
            Self::Failed => "failed",
        })
    }
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// A diagnostic mapped back to the entity it concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// `None` when the location could not be attributed to an entity
    pub entity: Option<EntityId>,
    pub phase: ValidationPhase,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

impl Diagnostic {
    #[must_use]
    pub fn error(phase: ValidationPhase, message: impl Into<String>) -> Self {
        Self {
            entity: None,
            phase,
            severity: Severity::Error,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    #[must_use]
    pub fn for_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    #[must_use]
    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.phase)?;
        if let Some(entity) = &self.entity {
            write!(f, " {entity}")?;
        }
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            write!(f, " ({file}:{line})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Outcome of the build phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    /// Phase never reached
    #[default]
    Skipped,
    Succeeded,
    Failed,
}

/// Status of one selected test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// Failed, but the test is quarantined and excluded from the verdict
    Flaky,
    /// Selected but never reported by the runner
    NotRun,
}

/// Result of one selected test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub status: TestStatus,
}

impl TestOutcome {
    #[must_use]
    pub fn new(name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }

    /// True if this outcome fails the candidate
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(self.status, TestStatus::Failed | TestStatus::NotRun)
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Overlay,
    Build,
    Test,
    Timeout,
    Infrastructure,
}

/// Terminal verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Passed,
    Failed(FailureReason),
}

impl Verdict {
    #[inline]
    #[must_use]
    pub fn is_passed(self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Immutable record of one validation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub run: RunId,
    pub candidate: CandidateId,
    pub verdict: Verdict,
    pub diagnostics: Vec<Diagnostic>,
    pub build: BuildOutcome,
    pub tests: Vec<TestOutcome>,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl ValidationResult {
    #[inline]
    #[must_use]
    pub fn is_passed(&self) -> bool {
        self.verdict.is_passed()
    }

    /// Error diagnostics only
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    /// Tests counted towards the verdict
    #[must_use]
    pub fn counted_tests(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| t.status != TestStatus::Flaky)
            .count()
    }

    /// Share of executed tests that were quarantined flakes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn flaky_ratio(&self) -> f64 {
        if self.tests.is_empty() {
            return 0.0;
        }
        let flaky = self
            .tests
            .iter()
            .filter(|t| t.status == TestStatus::Flaky)
            .count();
        flaky as f64 / self.tests.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;

    fn result(tests: Vec<TestOutcome>) -> ValidationResult {
        ValidationResult {
            run: RunId::new(),
            candidate: CandidateId::from_hash(ContentHash::compute(b"c")),
            verdict: Verdict::Passed,
            diagnostics: vec![],
            build: BuildOutcome::Succeeded,
            tests,
            elapsed_ms: 3,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn flaky_tests_are_not_counted() {
        let r = result(vec![
            TestOutcome::new("a", TestStatus::Passed),
            TestOutcome::new("b", TestStatus::Flaky),
        ]);
        assert_eq!(r.counted_tests(), 1);
        assert!((r.flaky_ratio() - 0.5).abs() < f64::EPSILON);
        assert!(!r.tests[1].is_blocking());
    }

    #[test]
    fn verdict_serializes_tagged() {
        let json = serde_json::to_string(&Verdict::Failed(FailureReason::Timeout)).unwrap();
        assert_eq!(json, r#"{"verdict":"failed","reason":"timeout"}"#);
    }

    #[test]
    fn diagnostic_display_includes_location() {
        let d = Diagnostic::error(ValidationPhase::Building, "mismatched types")
            .for_entity("rt::task::spawn".parse().unwrap())
            .at("src/task.rs", 4);
        assert_eq!(
            d.to_string(),
            "[building] rt::task::spawn (src/task.rs:4): mismatched types"
        );
    }
}
