//! Confidence scoring
//!
//! Blends retrieval quality and the validation outcome into a single
//! probability, then bands it into a [`Gate`]. The blend is a normalized
//! weighted sum passed through a monotonic calibration.

use isg_core::{ConfidenceReport, Gate, RetrievalFeatures, TestStatus, ValidationResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureWeights {
    pub coverage: f64,
    pub agreement: f64,
    pub consistency: f64,
    pub validation: f64,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        Self {
            coverage: 0.2,
            agreement: 0.1,
            consistency: 0.2,
            validation: 0.5,
        }
    }
}

impl FeatureWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.coverage + self.agreement + self.consistency + self.validation
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        let all = [self.coverage, self.agreement, self.consistency, self.validation];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && self.total() > 0.0
    }
}

/// Monotonic map from the blended score to a probability
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calibration {
    /// Identity, clamped to `[0, 1]`
    Linear,
    Logistic { slope: f64, midpoint: f64 },
}

impl Default for Calibration {
    fn default() -> Self {
        Self::Logistic {
            slope: 10.0,
            midpoint: 0.6,
        }
    }
}

impl Calibration {
    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Linear => x.clamp(0.0, 1.0),
            Self::Logistic { slope, midpoint } => 1.0 / (1.0 + (-slope * (x - midpoint)).exp()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub weights: FeatureWeights,
    pub calibration: Calibration,
    /// At or above: auto-apply
    pub upper: f64,
    /// Below: reject
    pub lower: f64,
    /// Agreement assumed when vector search contributed nothing
    pub neutral_agreement: f64,
    /// Validation signal of a pass that ran no tests
    pub untested_signal: f64,
    /// Signal lost per unit of flaky-test ratio
    pub flaky_penalty: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            weights: FeatureWeights::default(),
            calibration: Calibration::default(),
            upper: 0.9,
            lower: 0.5,
            neutral_agreement: 0.5,
            untested_signal: 0.5,
            flaky_penalty: 0.5,
        }
    }
}

impl ConfidenceConfig {
    #[must_use]
    pub fn with_thresholds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    #[must_use]
    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }
}

/// Pure scorer: the same inputs always give the same report
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
}

impl ConfidenceScorer {
    #[must_use]
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Normalized contribution of a validation run
    #[must_use]
    pub fn validation_signal(&self, validation: &ValidationResult) -> f64 {
        if !validation.is_passed() {
            return 0.0;
        }
        let ran = validation.tests.iter().any(|t| t.status == TestStatus::Passed);
        if !ran {
            return self.config.untested_signal.clamp(0.0, 1.0);
        }
        (1.0 - self.config.flaky_penalty * validation.flaky_ratio()).clamp(0.0, 1.0)
    }

    #[must_use]
    pub fn score(&self, validation: &ValidationResult, features: RetrievalFeatures) -> ConfidenceReport {
        let w = &self.config.weights;
        let signal = self.validation_signal(validation);
        let agreement = features.agreement.unwrap_or(self.config.neutral_agreement);
        let blended = (w.coverage * features.coverage.clamp(0.0, 1.0)
            + w.agreement * agreement.clamp(0.0, 1.0)
            + w.consistency * features.consistency.clamp(0.0, 1.0)
            + w.validation * signal)
            / w.total();
        let probability = self.config.calibration.apply(blended);

        // a failed run can never be applied, whatever retrieval looked like
        let gate = if !validation.is_passed() || probability < self.config.lower {
            Gate::Reject
        } else if probability >= self.config.upper {
            Gate::AutoApply
        } else {
            Gate::HumanReview
        };
        debug!(candidate = %validation.candidate.short(), blended, probability, gate = %gate, "candidate scored");

        ConfidenceReport {
            candidate: validation.candidate,
            run: validation.run,
            probability,
            gate,
            features,
            validation_signal: signal,
        }
    }
}
