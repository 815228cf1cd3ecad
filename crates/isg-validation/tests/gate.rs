//! End-to-end gate runs against the on-disk runtime fixture

use isg_core::{
    BuildOutcome, Candidate, CandidateDraft, CandidateId, ChangeRequestId, EntityMutation, FailureReason,
    TestStatus, ValidationPhase, Verdict,
};
use isg_graph::{CandidatePolicy, CandidateStore, ValidationLog};
use isg_test_utils::{id, BrokenSessionFactory, RuntimeFixture, ScriptedBuildTool, SPAWN_FIXED, SPAWN_ORIGINAL};
use isg_validation::{GateConfig, GateError, LinkMode, ValidationGate};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const NOT_SEND: &str = "`F` cannot be sent between threads safely";

struct Harness {
    fixture: RuntimeFixture,
    candidates: CandidateStore,
    tool: Arc<ScriptedBuildTool>,
    gate: ValidationGate,
}

fn harness(tool: ScriptedBuildTool, configure: impl FnOnce(GateConfig) -> GateConfig) -> Harness {
    let fixture = RuntimeFixture::new();
    let tool = Arc::new(tool.with_requirement("src/task.rs", "Send + 'static", 7, NOT_SEND));
    let config = configure(GateConfig::new(fixture.repo.path()));
    let gate = ValidationGate::new(config, Arc::clone(&fixture.store), Arc::new(ValidationLog::in_memory()))
        .with_tool(Arc::clone(&tool) as Arc<dyn isg_validation::BuildTool>);
    let candidates = CandidateStore::new(Arc::clone(&fixture.store), CandidatePolicy::default());
    Harness {
        fixture,
        candidates,
        tool,
        gate,
    }
}

fn submit(h: &Harness, mutations: Vec<EntityMutation>) -> CandidateId {
    let c = Candidate::from_draft(CandidateDraft::new(ChangeRequestId::new(), mutations)).unwrap();
    h.candidates.submit(c).unwrap()
}

fn fix_spawn(h: &Harness) -> CandidateId {
    submit(h, vec![EntityMutation::modify(id("rt::task::spawn"), SPAWN_FIXED)])
}

#[tokio::test]
async fn send_fix_passes_without_touching_the_repo() {
    let h = harness(ScriptedBuildTool::new().with_probe("src/task.rs"), |c| c);
    let before = h.fixture.repo.contents();
    let cid = fix_spawn(&h);

    let result = h.gate.validate(&cid).await.unwrap();

    assert_eq!(result.verdict, Verdict::Passed);
    assert_eq!(result.build, BuildOutcome::Succeeded);
    assert_eq!(h.gate.phase(&cid), Some(ValidationPhase::Passed));
    assert_eq!(
        h.tool.selected(),
        vec![vec![id("rt::net::tests::accept_many"), id("rt::net::tests::serve_spawns")]]
    );
    let probed = h.tool.probed();
    assert!(probed[0].1.contains(SPAWN_FIXED));

    assert_eq!(h.fixture.repo.contents(), before);
    assert!(!h.tool.workspaces()[0].exists(), "shadow workspace left behind");
    assert_eq!(
        h.fixture.store.get_entity(&id("rt::task::spawn")).unwrap().current_code.as_deref(),
        Some(SPAWN_ORIGINAL)
    );
    assert_eq!(h.gate.log().latest(&cid).unwrap().run, result.run);
}

#[tokio::test]
async fn build_error_maps_back_to_entity() {
    let h = harness(ScriptedBuildTool::new(), |c| c.with_link_mode(LinkMode::Copy));
    let cid = submit(
        &h,
        vec![EntityMutation::modify(
            id("rt::task::spawn"),
            SPAWN_ORIGINAL.replace("thread::spawn(f)", "std::thread::spawn(f)"),
        )],
    );

    let result = h.gate.validate(&cid).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Build));
    assert_eq!(result.build, BuildOutcome::Failed);
    let error = result.errors().next().unwrap();
    assert_eq!(error.entity, Some(id("rt::task::spawn")));
    assert_eq!(error.phase, ValidationPhase::Building);
    assert_eq!(error.message, NOT_SEND);
    assert_eq!(h.tool.test_runs(), 0);
}

#[tokio::test]
async fn syntax_error_fails_fast_in_overlay() {
    let h = harness(ScriptedBuildTool::new(), |c| c);
    let cid = submit(
        &h,
        vec![EntityMutation::modify(id("rt::task::spawn"), "pub fn spawn<F>(f: F where F: {")],
    );

    let result = h.gate.validate(&cid).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Overlay));
    assert_eq!(result.build, BuildOutcome::Skipped);
    assert!(result.errors().all(|d| d.entity == Some(id("rt::task::spawn"))));
    assert!(result.errors().all(|d| d.file.as_deref() == Some("src/task.rs")));
    assert_eq!(h.tool.builds(), 0);
}

#[tokio::test]
async fn deleting_a_called_function_is_rejected() {
    let h = harness(ScriptedBuildTool::new(), |c| c);
    let cid = submit(&h, vec![EntityMutation::delete(id("rt::net::serve"))]);

    let result = h.gate.validate(&cid).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Overlay));
    let messages: Vec<String> = result.errors().map(|d| d.message.clone()).collect();
    assert!(messages.iter().any(|m| m.contains("rt::net::accept_loop")));
    assert!(messages.iter().any(|m| m.contains("rt::net::tests::serve_spawns")));
}

#[tokio::test]
async fn failing_test_fails_the_run() {
    let h = harness(ScriptedBuildTool::new().with_failing_test("rt::net::tests::accept_many"), |c| c);
    let cid = fix_spawn(&h);

    let result = h.gate.validate(&cid).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Test));
    let error = result.errors().next().unwrap();
    assert_eq!(error.entity, Some(id("rt::net::tests::accept_many")));
}

#[tokio::test]
async fn unreported_test_counts_as_not_run() {
    let h = harness(ScriptedBuildTool::new().with_silent_test("rt::net::tests::serve_spawns"), |c| c);
    let cid = fix_spawn(&h);

    let result = h.gate.validate(&cid).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Test));
    let silent = result.tests.iter().find(|t| t.name == "rt::net::tests::serve_spawns").unwrap();
    assert_eq!(silent.status, TestStatus::NotRun);
}

#[tokio::test]
async fn quarantined_flaky_test_does_not_change_the_verdict() {
    let flaky = "rt::net::tests::serve_spawns";
    let h = harness(ScriptedBuildTool::new().with_flaky_test(flaky), |c| c.with_quarantined([flaky]));
    let cid = fix_spawn(&h);

    let first = h.gate.validate(&cid).await.unwrap();
    let second = h.gate.validate(&cid).await.unwrap();

    assert_eq!(first.verdict, Verdict::Passed);
    assert_eq!(second.verdict, first.verdict);
    assert_ne!(first.run, second.run);
    let status = |r: &isg_core::ValidationResult| r.tests.iter().find(|t| t.name == flaky).unwrap().status;
    assert_eq!(status(&first), TestStatus::Flaky);
    assert_eq!(status(&second), TestStatus::Passed);
    assert_eq!(h.gate.log().history(&cid).len(), 2);
}

#[tokio::test]
async fn unquarantined_flaky_test_fails() {
    let h = harness(ScriptedBuildTool::new().with_flaky_test("rt::net::tests::serve_spawns"), |c| c);
    let cid = fix_spawn(&h);
    let result = h.gate.validate(&cid).await.unwrap();
    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Test));
}

#[tokio::test]
async fn timeout_fails_and_is_recorded() {
    let h = harness(ScriptedBuildTool::new().with_delay(Duration::from_secs(5)), |c| {
        c.with_timeout(Duration::from_secs(1))
    });
    let cid = fix_spawn(&h);

    let result = h.gate.validate(&cid).await.unwrap();

    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Timeout));
    assert_eq!(result.errors().next().unwrap().phase, ValidationPhase::Building);
    assert_eq!(h.gate.phase(&cid), Some(ValidationPhase::Failed));
    assert_eq!(h.gate.log().len(), 1);
}

#[tokio::test]
async fn queued_run_does_not_spend_its_timeout_waiting() {
    let h = harness(ScriptedBuildTool::new().with_delay(Duration::from_millis(700)), |c| {
        c.with_timeout(Duration::from_secs(1)).with_max_concurrent(1)
    });
    let cid = fix_spawn(&h);

    // The second run waits ~700ms for the slot, then needs ~700ms of its own
    let (first, second) = tokio::join!(h.gate.validate(&cid), h.gate.validate(&cid));

    assert_eq!(first.unwrap().verdict, Verdict::Passed);
    assert_eq!(second.unwrap().verdict, Verdict::Passed);
    assert_eq!(h.tool.builds(), 2);
    assert_eq!(h.gate.log().history(&cid).len(), 2);
}

#[tokio::test]
async fn crashed_analyzer_is_an_infrastructure_failure() {
    let fixture = RuntimeFixture::new();
    let gate = ValidationGate::new(
        GateConfig::new(fixture.repo.path()),
        Arc::clone(&fixture.store),
        Arc::new(ValidationLog::in_memory()),
    )
    .with_tool(Arc::new(ScriptedBuildTool::new()))
    .with_session_factory(Arc::new(BrokenSessionFactory));
    let candidates = CandidateStore::new(Arc::clone(&fixture.store), CandidatePolicy::default());
    let c = Candidate::from_draft(CandidateDraft::new(
        ChangeRequestId::new(),
        vec![EntityMutation::modify(id("rt::task::spawn"), SPAWN_FIXED)],
    ))
    .unwrap();
    let cid = candidates.submit(c).unwrap();

    let result = gate.validate(&cid).await.unwrap();
    assert_eq!(result.verdict, Verdict::Failed(FailureReason::Infrastructure));
}

#[tokio::test]
async fn closed_candidate_cannot_be_validated() {
    let h = harness(ScriptedBuildTool::new(), |c| c);
    let cid = fix_spawn(&h);
    h.candidates.discard(&cid).unwrap();
    assert!(matches!(h.gate.validate(&cid).await, Err(GateError::NotPending(id)) if id == cid));
}
