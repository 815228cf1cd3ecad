//! Full request flow over the runtime fixture: a `spawn` missing its
//! `Send + 'static` bound, the callers that need it, and their tests

use async_trait::async_trait;
use isg_core::{CandidateDraft, ChangeRequestId, EntityMutation, FailureReason, Gate, HumanDecision, Verdict};
use isg_pipeline::{
    ChangeRequest, ConfidenceConfig, Disposition, ErrorKind, Pipeline, PipelineConfig, Proposer, ProposerError,
    StaticProposer,
};
use isg_retrieval::ContextBundle;
use isg_test_utils::{
    failed_run, id, spawn_signature, BrokenSessionFactory, RuntimeFixture, ScriptedBuildTool, SPAWN_FIXED, SPAWN_ORIGINAL,
};
use isg_graph::ValidationLog;
use isg_validation::{BuildTool, GateConfig};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const NOT_SEND: &str = "`F` cannot be sent between threads safely";

const SPAWN_BROKEN: &str = "pub fn spawn<F>(f: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static
{
    thread::spawn(f
}";

fn send_fix() -> CandidateDraft {
    CandidateDraft::new(
        ChangeRequestId::new(),
        vec![EntityMutation::modify(id("rt::task::spawn"), SPAWN_FIXED)
            .with_signature(spawn_signature(&["FnOnce()", "Send", "'static"]))],
    )
    .with_rationale("spawned closures run on another thread")
}

fn draft(code: &str) -> CandidateDraft {
    CandidateDraft::new(ChangeRequestId::new(), vec![EntityMutation::modify(id("rt::task::spawn"), code)])
}

fn request() -> ChangeRequest {
    ChangeRequest::new("require Send + 'static for closures passed to spawn", vec![id("rt::task::spawn")])
}

/// Records the bundle it was shown, then answers with fixed drafts
struct RecordingProposer {
    drafts: Vec<CandidateDraft>,
    shown: Mutex<Vec<ContextBundle>>,
}

#[async_trait]
impl Proposer for RecordingProposer {
    async fn propose(
        &self,
        _request: &ChangeRequest,
        context: &ContextBundle,
    ) -> Result<Vec<CandidateDraft>, ProposerError> {
        self.shown.lock().push(context.clone());
        Ok(self.drafts.clone())
    }
}

struct OfflineProposer;

#[async_trait]
impl Proposer for OfflineProposer {
    async fn propose(&self, _: &ChangeRequest, _: &ContextBundle) -> Result<Vec<CandidateDraft>, ProposerError> {
        Err(ProposerError::Unavailable("backend offline".into()))
    }
}

struct Harness {
    fixture: RuntimeFixture,
    tool: Arc<ScriptedBuildTool>,
    pipeline: Pipeline,
}

fn harness_with(
    proposer: Arc<dyn Proposer>,
    tool: ScriptedBuildTool,
    configure: impl FnOnce(PipelineConfig) -> PipelineConfig,
) -> Harness {
    let fixture = RuntimeFixture::new();
    let tool = Arc::new(tool.with_requirement("src/task.rs", "Send + 'static", 7, NOT_SEND));
    let config = configure(PipelineConfig::default().with_gate(GateConfig::new(fixture.repo.path())));
    let pipeline = Pipeline::with_store(
        config,
        Arc::clone(&fixture.store),
        Arc::new(ValidationLog::in_memory()),
        proposer,
    )
    .with_build_tool(Arc::clone(&tool) as Arc<dyn BuildTool>);
    Harness { fixture, tool, pipeline }
}

fn harness(drafts: Vec<CandidateDraft>) -> Harness {
    harness_with(Arc::new(StaticProposer::new(drafts)), ScriptedBuildTool::new(), |c| c)
}

fn review_everything(config: PipelineConfig) -> PipelineConfig {
    config.with_confidence(ConfidenceConfig::default().with_thresholds(0.5, 0.999))
}

fn spawn_code(h: &Harness) -> Option<String> {
    h.fixture.store.get_entity(&id("rt::task::spawn")).unwrap().current_code
}

#[tokio::test]
async fn send_fix_is_applied_and_can_be_rolled_back() {
    let proposer = Arc::new(RecordingProposer {
        drafts: vec![send_fix()],
        shown: Mutex::new(Vec::new()),
    });
    let h = harness_with(Arc::clone(&proposer) as Arc<dyn Proposer>, ScriptedBuildTool::new(), |c| c);
    let original = h.fixture.store.get_entity(&id("rt::task::spawn")).unwrap();

    let outcome = h.pipeline.handle(&request()).await.unwrap();

    // the proposer saw the seed and its direct caller
    let shown = proposer.shown.lock();
    assert!(shown[0].contains(&id("rt::task::spawn")));
    assert!(shown[0].contains(&id("rt::net::serve")));
    assert_eq!(outcome.ranked.entries[0].entity.id, id("rt::task::spawn"));

    assert_eq!(outcome.candidates.len(), 1);
    let c = &outcome.candidates[0];
    let report = c.report.as_ref().unwrap();
    assert_eq!(report.gate, Gate::AutoApply);
    assert!(report.probability >= 0.9, "probability {}", report.probability);
    assert_eq!(c.validation.as_ref().unwrap().verdict, Verdict::Passed);
    assert_eq!(c.error_kind(), None);

    let commit = outcome.committed().expect("committed").clone();
    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_FIXED));
    assert!(h.pipeline.list_pending().is_empty());

    let rolled = h.pipeline.rollback(&commit.commit).unwrap();
    assert_eq!(rolled.restored, vec![id("rt::task::spawn")]);
    let restored = h.fixture.store.get_entity(&id("rt::task::spawn")).unwrap();
    assert_eq!(restored.current_code.as_deref(), Some(SPAWN_ORIGINAL));
    assert_eq!(restored.signature, original.signature);

    assert_eq!(h.pipeline.history().len(), 2);
    h.pipeline.verify_audit().unwrap();
}

#[tokio::test]
async fn syntax_error_is_rejected_before_any_build() {
    let h = harness(vec![draft(SPAWN_BROKEN)]);
    let before = h.fixture.repo.contents();

    let outcome = h.pipeline.handle(&request()).await.unwrap();

    let c = &outcome.candidates[0];
    assert_eq!(c.report.as_ref().unwrap().gate, Gate::Reject);
    assert!(matches!(c.disposition, Disposition::Rejected(_)));
    assert_eq!(c.error_kind(), Some(ErrorKind::ValidationFailed));
    assert_eq!(h.tool.builds(), 0);

    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_ORIGINAL));
    assert_eq!(h.fixture.repo.contents(), before);
    assert!(h.pipeline.list_pending().is_empty(), "rejected candidate still locks spawn");
    assert!(h.pipeline.history().is_empty());
}

#[tokio::test]
async fn nothing_is_written_when_the_build_fails() {
    // compiles syntactically but still lacks the bound
    let h = harness(vec![draft(&SPAWN_ORIGINAL.replace("thread::spawn(f)", "thread::spawn(move || f())"))]);

    let outcome = h.pipeline.handle(&request()).await.unwrap();

    let c = &outcome.candidates[0];
    let validation = c.validation.as_ref().unwrap();
    assert!(!validation.is_passed());
    assert!(validation.errors().any(|d| d.message.contains(NOT_SEND)));
    assert!(outcome.committed().is_none());
    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_ORIGINAL));
    assert!(h.pipeline.history().is_empty());
}

#[tokio::test]
async fn review_band_waits_for_a_human() {
    let h = harness_with(
        Arc::new(StaticProposer::new(vec![send_fix()])),
        ScriptedBuildTool::new(),
        review_everything,
    );

    let outcome = h.pipeline.handle(&request()).await.unwrap();
    let c = &outcome.candidates[0];
    assert_eq!(c.disposition, Disposition::AwaitingReview);
    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_ORIGINAL));

    let reviews = h.pipeline.pending_reviews();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].candidate, c.candidate);

    let disposition = h.pipeline.approve(&c.candidate, HumanDecision::approve("maintainer")).unwrap();
    assert!(matches!(disposition, Disposition::Committed(_)));
    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_FIXED));
    assert!(h.pipeline.pending_reviews().is_empty());
    assert!(h.pipeline.history()[0].detail.contains("maintainer"));
}

#[tokio::test]
async fn refused_approval_keeps_the_candidate_under_review() {
    let h = harness_with(
        Arc::new(StaticProposer::new(vec![send_fix()])),
        ScriptedBuildTool::new(),
        review_everything,
    );
    let outcome = h.pipeline.handle(&request()).await.unwrap();
    let candidate = outcome.candidates[0].candidate;
    assert_eq!(outcome.candidates[0].disposition, Disposition::AwaitingReview);

    // A later run failed, so the approval can no longer commit
    h.pipeline
        .validation_log()
        .append(failed_run(candidate, FailureReason::Test))
        .unwrap();
    let err = h
        .pipeline
        .approve(&candidate, HumanDecision::approve("maintainer"))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CommitPrecondition);
    assert_eq!(h.pipeline.pending_reviews().len(), 1);
    assert_eq!(h.pipeline.list_pending().len(), 1);
    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_ORIGINAL));

    let disposition = h
        .pipeline
        .approve(&candidate, HumanDecision::reject("maintainer", "tests regressed"))
        .unwrap();
    assert!(matches!(disposition, Disposition::Rejected(_)));
    assert!(h.pipeline.pending_reviews().is_empty());
}

#[tokio::test]
async fn reviewer_rejection_releases_the_entity() {
    let h = harness_with(
        Arc::new(StaticProposer::new(vec![send_fix()])),
        ScriptedBuildTool::new(),
        review_everything,
    );
    let outcome = h.pipeline.handle(&request()).await.unwrap();
    let candidate = outcome.candidates[0].candidate;

    let disposition = h
        .pipeline
        .approve(&candidate, HumanDecision::reject("maintainer", "prefer a scoped API"))
        .unwrap();

    assert!(matches!(disposition, Disposition::Rejected(ref why) if why.contains("scoped API")));
    assert!(h.pipeline.list_pending().is_empty());
    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_ORIGINAL));
    assert!(h.pipeline.approve(&candidate, HumanDecision::approve("maintainer")).is_err());
}

#[tokio::test]
async fn second_draft_on_a_pending_target_conflicts() {
    let h = harness_with(
        Arc::new(StaticProposer::new(vec![send_fix(), draft(&SPAWN_FIXED.replace("f)", "f) "))])),
        ScriptedBuildTool::new(),
        review_everything,
    );

    let outcome = h.pipeline.handle(&request()).await.unwrap();

    assert_eq!(outcome.candidates.len(), 2);
    assert_eq!(outcome.candidates[0].disposition, Disposition::AwaitingReview);
    assert!(matches!(outcome.candidates[1].disposition, Disposition::Conflicted(_)));
    assert_eq!(outcome.candidates[1].error_kind(), Some(ErrorKind::CandidateConflict));
    assert!(outcome.candidates[1].validation.is_none());
}

#[tokio::test]
async fn drafts_after_a_commit_are_skipped() {
    let h = harness(vec![send_fix(), draft(SPAWN_BROKEN)]);

    let outcome = h.pipeline.handle(&request()).await.unwrap();

    assert_eq!(outcome.candidates.len(), 1);
    assert!(outcome.candidates[0].is_committed());
    assert_eq!(h.tool.builds(), 1);
}

#[tokio::test]
async fn slow_validation_times_out() {
    let h = harness_with(
        Arc::new(StaticProposer::new(vec![send_fix()])),
        ScriptedBuildTool::new().with_delay(Duration::from_secs(5)),
        |c| {
            let gate = c.gate.clone().with_timeout(Duration::from_secs(1));
            c.with_gate(gate)
        },
    );

    let outcome = h.pipeline.handle(&request()).await.unwrap();

    let c = &outcome.candidates[0];
    assert_eq!(c.error_kind(), Some(ErrorKind::ValidationTimeout));
    assert!(matches!(c.disposition, Disposition::Rejected(_)));
    assert_eq!(spawn_code(&h).as_deref(), Some(SPAWN_ORIGINAL));
}

#[tokio::test]
async fn infrastructure_failure_rejects_without_writing() {
    let h = harness(vec![send_fix()]);
    let pipeline = h.pipeline.with_session_factory(Arc::new(BrokenSessionFactory));

    let outcome = pipeline.handle(&request()).await.unwrap();

    let c = &outcome.candidates[0];
    assert_eq!(c.error_kind(), Some(ErrorKind::ValidationFailed));
    assert_eq!(c.report.as_ref().unwrap().gate, Gate::Reject);
    assert_eq!(
        h.fixture.store.get_entity(&id("rt::task::spawn")).unwrap().current_code.as_deref(),
        Some(SPAWN_ORIGINAL)
    );
}

#[tokio::test]
async fn unavailable_proposer_surfaces_a_retryable_error() {
    let h = harness_with(Arc::new(OfflineProposer), ScriptedBuildTool::new(), |c| c);

    let err = h.pipeline.handle(&request()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Proposer);
    assert!(err.is_retryable());
    assert!(h.pipeline.list_pending().is_empty());
}

#[tokio::test]
async fn unknown_seed_is_a_retrieval_error() {
    let h = harness(vec![send_fix()]);

    let err = h
        .pipeline
        .handle(&ChangeRequest::new("anything", vec![id("rt::nowhere")]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Retrieval);
}
