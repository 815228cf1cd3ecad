//! The validation gate
//!
//! Drives one candidate through overlay, build and test against its
//! projected future. Every run ends in a terminal verdict appended to the
//! validation log. Infrastructure failures and timeouts fail the run; they
//! never pass it.

use crate::build::{BuildTool, CargoTool};
use crate::closure::{test_closure, DEPENDENT_EDGES};
use crate::error::{GateError, ValidationError};
use crate::phase::PhaseTracker;
use crate::session::{SessionFactory, SessionKey, SessionPool, SyntaxSessionFactory};
use crate::workspace::{LinkMode, Materializer, ShadowWorkspace};
use chrono::Utc;
use dashmap::DashMap;
use isg_core::{
    BuildOutcome, CandidateId, Diagnostic, Direction, EntityId, FailureReason, FutureAction, RunId,
    TestOutcome, TestStatus, ValidationPhase, ValidationResult, Verdict,
};
use isg_graph::{GraphError, GraphRead, GraphStore, GraphView, ValidationLog};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub repo_root: PathBuf,
    /// Wall-clock limit for one run, all phases included, counted from
    /// when the run gets a slot
    pub timeout_secs: u64,
    /// Concurrent runs; the rest queue without spending their timeout
    pub max_concurrent: usize,
    pub link_mode: LinkMode,
    /// Test ids whose failures are recorded as flaky
    pub quarantined: Vec<String>,
    pub closure_depth: u32,
    /// Active feature set, part of the session pool key
    pub features: Vec<String>,
    /// Extra arguments for every cargo invocation
    pub cargo_args: Vec<String>,
    pub session_capacity: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            timeout_secs: 600,
            max_concurrent: 2,
            link_mode: LinkMode::HardLink,
            quarantined: Vec::new(),
            closure_depth: 4,
            features: Vec::new(),
            cargo_args: Vec::new(),
            session_capacity: 16,
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    #[must_use]
    pub fn with_quarantined(mut self, tests: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.quarantined = tests.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    #[must_use]
    pub fn with_link_mode(mut self, mode: LinkMode) -> Self {
        self.link_mode = mode;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What the phases produced before the verdict
#[derive(Debug, Default)]
struct RunOutcome {
    verdict: Option<FailureReason>,
    diagnostics: Vec<Diagnostic>,
    build: BuildOutcome,
    tests: Vec<TestOutcome>,
}

impl RunOutcome {
    fn fail(mut self, reason: FailureReason) -> Self {
        self.verdict = Some(reason);
        self
    }
}

pub struct ValidationGate {
    config: GateConfig,
    store: Arc<GraphStore>,
    log: Arc<ValidationLog>,
    sessions: SessionPool,
    tool: Arc<dyn BuildTool>,
    permits: Arc<Semaphore>,
    phases: Arc<DashMap<CandidateId, ValidationPhase>>,
}

impl ValidationGate {
    /// Gate backed by the syntax session and `cargo`
    #[must_use]
    pub fn new(config: GateConfig, store: Arc<GraphStore>, log: Arc<ValidationLog>) -> Self {
        let tool = Arc::new(CargoTool::new(config.cargo_args.clone()));
        let sessions = SessionPool::new(Arc::new(SyntaxSessionFactory), config.session_capacity);
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            store,
            log,
            sessions,
            tool,
            permits,
            phases: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn BuildTool>) -> Self {
        self.tool = tool;
        self
    }

    #[must_use]
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.sessions = SessionPool::new(factory, self.config.session_capacity);
        self
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    #[must_use]
    pub fn log(&self) -> &Arc<ValidationLog> {
        &self.log
    }

    /// Phase of the latest run for `candidate`, if any ran in this process
    #[must_use]
    pub fn phase(&self, candidate: &CandidateId) -> Option<ValidationPhase> {
        self.phases.get(candidate).map(|p| *p)
    }

    /// Validate a pending candidate and record the result
    ///
    /// Repeated calls produce independent runs; each is appended to the log.
    ///
    /// # Errors
    ///
    /// - [`GateError::NotPending`] if the candidate is unknown or closed
    /// - [`GateError::Log`] if the result could not be recorded
    pub async fn validate(&self, candidate: &CandidateId) -> Result<Arc<ValidationResult>, GateError> {
        let view = self.store.project_future(candidate).map_err(|e| match e {
            GraphError::CandidateNotPending(id) => GateError::NotPending(id),
            other => GateError::Graph(other),
        })?;

        let run = RunId::new();
        let started = Instant::now();
        let mut tracker = PhaseTracker::new(*candidate);
        self.phases.insert(*candidate, tracker.phase());

        // The clock starts once a build slot is free
        if self.permits.available_permits() == 0 {
            debug!(candidate = %candidate.short(), "waiting for a build slot");
        }
        let timeout = self.config.timeout();
        let timed = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(_permit) => tokio::time::timeout(timeout, self.run_phases(&view, &mut tracker)).await,
            Err(closed) => Ok(Err(ValidationError::Join(closed.to_string()))),
        };
        let outcome = match timed {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(infra)) => {
                error!(candidate = %candidate.short(), phase = %tracker.phase(), error = %infra, "validation infrastructure failure");
                RunOutcome {
                    diagnostics: vec![Diagnostic::error(tracker.phase(), infra.to_string())],
                    ..RunOutcome::default()
                }
                .fail(FailureReason::Infrastructure)
            }
            Err(_) => {
                warn!(candidate = %candidate.short(), phase = %tracker.phase(), timeout_secs = timeout.as_secs(), "validation timed out");
                RunOutcome {
                    diagnostics: vec![Diagnostic::error(
                        tracker.phase(),
                        format!("validation exceeded {}s", timeout.as_secs()),
                    )],
                    ..RunOutcome::default()
                }
                .fail(FailureReason::Timeout)
            }
        };

        let verdict = match outcome.verdict {
            None => Verdict::Passed,
            Some(reason) => Verdict::Failed(reason),
        };
        let terminal = if verdict.is_passed() {
            ValidationPhase::Passed
        } else {
            ValidationPhase::Failed
        };
        let verdict = match tracker.advance(terminal) {
            Ok(()) => verdict,
            Err(e) => {
                error!(candidate = %candidate.short(), error = %e, "phase table rejected terminal transition");
                let _ = tracker.advance(ValidationPhase::Failed);
                Verdict::Failed(FailureReason::Infrastructure)
            }
        };
        self.phases.insert(*candidate, tracker.phase());

        let result = ValidationResult {
            run,
            candidate: *candidate,
            verdict,
            diagnostics: outcome.diagnostics,
            build: outcome.build,
            tests: outcome.tests,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            finished_at: Utc::now(),
        };
        info!(
            candidate = %candidate.short(),
            run = %run,
            verdict = ?result.verdict,
            diagnostics = result.diagnostics.len(),
            tests = result.tests.len(),
            elapsed_ms = result.elapsed_ms,
            "validation finished"
        );
        Ok(self.log.append(result)?)
    }

    async fn run_phases(&self, view: &GraphView, tracker: &mut PhaseTracker) -> Result<RunOutcome, ValidationError> {
        let candidate = view.candidate().id;
        let mut outcome = RunOutcome::default();

        self.enter(candidate, tracker, ValidationPhase::Overlaying)?;
        outcome.diagnostics = self.overlay(view).await?;
        if outcome.diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(outcome.fail(FailureReason::Overlay));
        }

        self.enter(candidate, tracker, ValidationPhase::Building)?;

        let materializer = Materializer::new(&self.config.repo_root, self.config.link_mode);
        let owned = view.candidate().clone();
        let base = view.base().clone();
        let workspace: ShadowWorkspace = tokio::task::spawn_blocking(move || materializer.materialize(&owned, &base))
            .await
            .map_err(|e| ValidationError::Join(e.to_string()))??;

        let report = self.tool.build(workspace.path()).await?;
        outcome.diagnostics.extend(report.diagnostics.into_iter().map(|d| {
            let mut diagnostic = Diagnostic {
                entity: None,
                phase: ValidationPhase::Building,
                severity: d.severity,
                message: d.message,
                file: None,
                line: None,
            };
            if let (Some(file), Some(line)) = (d.file, d.line) {
                diagnostic.entity = workspace.locate(&file, line).cloned();
                diagnostic = diagnostic.at(file, line);
            }
            diagnostic
        }));
        if !report.success {
            outcome.build = BuildOutcome::Failed;
            return Ok(outcome.fail(FailureReason::Build));
        }
        outcome.build = BuildOutcome::Succeeded;

        self.enter(candidate, tracker, ValidationPhase::Testing)?;
        let selected = test_closure(view, view.candidate().affected(), self.config.closure_depth);
        let reported = self.tool.run_tests(workspace.path(), &selected).await?;
        outcome.tests = self.reconcile(&selected, reported);

        let mut failed = false;
        for test in outcome.tests.iter().filter(|t| t.is_blocking()) {
            failed = true;
            let entity = test.name.parse::<EntityId>().ok();
            let mut diagnostic = Diagnostic::error(
                ValidationPhase::Testing,
                format!("test {} {}", test.name, if test.status == TestStatus::NotRun { "did not run" } else { "failed" }),
            );
            diagnostic.entity = entity;
            outcome.diagnostics.push(diagnostic);
        }
        for test in outcome.tests.iter().filter(|t| t.status == TestStatus::Flaky) {
            warn!(candidate = %candidate.short(), test = %test.name, "quarantined test failed, ignoring");
        }
        if failed {
            return Ok(outcome.fail(FailureReason::Test));
        }
        Ok(outcome)
    }

    fn enter(&self, candidate: CandidateId, tracker: &mut PhaseTracker, phase: ValidationPhase) -> Result<(), ValidationError> {
        tracker.advance(phase)?;
        self.phases.insert(candidate, phase);
        Ok(())
    }

    /// One outcome per selected test, quarantined failures downgraded to flaky
    fn reconcile(&self, selected: &[EntityId], reported: Vec<TestOutcome>) -> Vec<TestOutcome> {
        let mut outcomes: Vec<TestOutcome> = selected
            .iter()
            .map(|id| {
                let name = id.to_string();
                let status = reported
                    .iter()
                    .find(|t| t.name == name)
                    .map_or(TestStatus::NotRun, |t| t.status);
                let status = if status == TestStatus::Failed && self.config.quarantined.contains(&name) {
                    TestStatus::Flaky
                } else {
                    status
                };
                TestOutcome::new(name, status)
            })
            .collect();
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        outcomes
    }

    /// Present each new body to an analysis session, and flag deletes that
    /// leave references behind
    async fn overlay(&self, view: &GraphView) -> Result<Vec<Diagnostic>, ValidationError> {
        let candidate = view.candidate();
        let key = SessionKey::new(&self.config.repo_root, &self.config.features);
        let session = self.sessions.get(&key).await?;
        let mut diagnostics = Vec::new();

        for m in &candidate.mutations {
            let Some(code) = m.code.as_deref() else { continue };
            if m.action == FutureAction::Delete {
                continue;
            }
            let uri = format!("isg://{}/{}", candidate.id, m.entity);
            session.open(&uri, code).await?;
            let found = session.diagnostics(&uri).await;
            session.close(&uri).await?;

            let location = view.base().entity(&m.entity).and_then(|e| e.location.clone());
            for d in found? {
                let mut diagnostic = Diagnostic {
                    entity: Some(m.entity.clone()),
                    phase: ValidationPhase::Overlaying,
                    severity: d.severity,
                    message: d.message,
                    file: None,
                    line: None,
                };
                if let Some(span) = &location {
                    diagnostic = diagnostic.at(span.file.clone(), span.line_start + d.line - 1);
                }
                diagnostics.push(diagnostic);
            }
        }

        for m in candidate.mutations.iter().filter(|m| m.action == FutureAction::Delete) {
            for edge in view.base().edges(&m.entity, Direction::Incoming, &DEPENDENT_EDGES) {
                if view.contains(&edge.from) {
                    diagnostics.push(
                        Diagnostic::error(
                            ValidationPhase::Overlaying,
                            format!("{} still {} deleted {}", edge.from, edge.kind, m.entity),
                        )
                        .for_entity(m.entity.clone()),
                    );
                }
            }
        }
        Ok(diagnostics)
    }
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}
