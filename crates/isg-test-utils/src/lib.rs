//! Testing utilities for the ISG workspace
//!
//! Shared fixtures, graph builders and scripted doubles for the build tool
//! and analysis sessions.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc, clippy::cast_possible_truncation)]

use async_trait::async_trait;
use chrono::Utc;
use isg_core::{
    BuildOutcome, CandidateId, EdgeKind, EntityId, EntityKind, ExtractedEntity, ExtractionBatch,
    FailureReason, RunId, Severity, Signature, SourceSpan, TestOutcome, TestStatus, ValidationResult,
    Verdict,
};
use isg_graph::GraphStore;
use isg_validation::{
    AnalysisSession, BuildReport, BuildTool, SessionFactory, SessionKey, ToolDiagnostic, ValidationError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

pub fn id(path: &str) -> EntityId {
    path.parse().unwrap()
}

pub fn function(path: &str, code: &str) -> ExtractedEntity {
    ExtractedEntity::new(id(path), EntityKind::Function, code)
}

pub fn test_fn(path: &str, code: &str) -> ExtractedEntity {
    ExtractedEntity::new(id(path), EntityKind::Test, code)
}

pub fn module(path: &str) -> ExtractedEntity {
    let mut e = ExtractedEntity::new(id(path), EntityKind::Module, "");
    e.code = None;
    e
}

fn run(candidate: CandidateId, verdict: Verdict, build: BuildOutcome) -> ValidationResult {
    ValidationResult {
        run: RunId::new(),
        candidate,
        verdict,
        diagnostics: Vec::new(),
        build,
        tests: vec![TestOutcome::new("fixture::tests::ok", TestStatus::Passed)],
        elapsed_ms: 1,
        finished_at: Utc::now(),
    }
}

/// A passing validation record for `candidate`
pub fn passed_run(candidate: CandidateId) -> ValidationResult {
    run(candidate, Verdict::Passed, BuildOutcome::Succeeded)
}

pub fn failed_run(candidate: CandidateId, reason: FailureReason) -> ValidationResult {
    let mut result = run(candidate, Verdict::Failed(reason), BuildOutcome::Failed);
    result.tests.clear();
    result
}

/// Deterministic graph of `nodes` functions with up to `out_degree` calls
/// each and `dims`-dimensional embeddings
pub fn synthetic_graph(nodes: usize, out_degree: usize, dims: usize) -> ExtractionBatch {
    let path = |i: usize| format!("syn::m{}::f{i}", i / 100);
    let mut batch = ExtractionBatch::new();
    for i in 0..nodes {
        let mut e = function(&path(i), &format!("fn f{i}() {{}}"));
        e.embedding = Some(
            (0..dims)
                .map(|d| ((i * 31 + d * 17) % 97) as f32 / 97.0 - 0.5)
                .collect(),
        );
        batch = batch.with_entity(e);
    }
    for i in 0..nodes {
        for j in 1..=out_degree {
            let target = (i * 7919 + j * 104_729) % nodes;
            if target != i {
                batch = batch.with_edge(id(&path(i)), id(&path(target)), EdgeKind::Calls);
            }
        }
    }
    batch
}

/// Location of `snippet` inside `text`
pub fn span_of(file: &str, text: &str, snippet: &str) -> SourceSpan {
    let start = text
        .find(snippet)
        .unwrap_or_else(|| panic!("{snippet:?} not found in {file}"));
    let line_start = text[..start].matches('\n').count() as u32 + 1;
    SourceSpan {
        file: file.to_string(),
        byte_start: start,
        byte_end: start + snippet.len(),
        line_start,
        line_end: line_start + snippet.matches('\n').count() as u32,
    }
}

/// Temporary on-disk repository
#[derive(Debug)]
pub struct FixtureRepo {
    dir: TempDir,
}

impl FixtureRepo {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        for (rel, text) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, text).unwrap();
        }
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(rel)).unwrap()
    }

    /// Every file's bytes, keyed by relative path
    pub fn contents(&self) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(self.dir.path())
            .into_iter()
            .map(Result::unwrap)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(self.dir.path()).unwrap();
                (rel.to_string_lossy().replace('\\', "/"), std::fs::read(e.path()).unwrap())
            })
            .collect()
    }
}

pub const CARGO_TOML: &str = "[package]\nname = \"rt\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[workspace]\n";

pub const LIB_RS: &str = "pub mod net;\npub mod task;\n";

pub const SPAWN_ORIGINAL: &str = "pub fn spawn<F>(f: F) -> thread::JoinHandle<()>
where
    F: FnOnce(),
{
    thread::spawn(f)
}";

pub const SPAWN_FIXED: &str = "pub fn spawn<F>(f: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::spawn(f)
}";

pub const SERVE: &str = "pub fn serve(port: u16) {
    spawn(move || {
        let _ = port;
    });
}";

pub const ACCEPT_LOOP: &str = "pub fn accept_loop(ports: &[u16]) {
    for port in ports {
        serve(*port);
    }
}";

pub const SERVE_SPAWNS: &str = "fn serve_spawns() {
        super::serve(8080);
    }";

pub const ACCEPT_MANY: &str = "fn accept_many() {
        super::accept_loop(&[1, 2]);
    }";

pub fn task_rs() -> String {
    format!("use std::thread;\n\n{SPAWN_ORIGINAL}\n")
}

pub fn net_rs() -> String {
    format!(
        "use crate::task::spawn;\n\n{SERVE}\n\n{ACCEPT_LOOP}\n\n#[cfg(test)]\nmod tests {{\n    #[test]\n    {SERVE_SPAWNS}\n\n    #[test]\n    {ACCEPT_MANY}\n}}\n"
    )
}

pub fn spawn_signature(bounds: &[&str]) -> Signature {
    Signature::default()
        .with_generic("F", bounds)
        .with_param("f", "F")
        .with_returns("thread::JoinHandle<()>")
}

/// A small task runtime with a `spawn` that is missing its `Send` bound,
/// on disk and extracted into a graph store
#[derive(Debug)]
pub struct RuntimeFixture {
    pub repo: FixtureRepo,
    pub store: Arc<GraphStore>,
}

impl RuntimeFixture {
    pub fn new() -> Self {
        let task = task_rs();
        let net = net_rs();
        let repo = FixtureRepo::new(&[
            ("Cargo.toml", CARGO_TOML),
            ("src/lib.rs", LIB_RS),
            ("src/task.rs", task.as_str()),
            ("src/net.rs", net.as_str()),
        ]);
        let store = Arc::new(GraphStore::new());
        store.upsert_entities(Self::batch()).unwrap();
        Self { repo, store }
    }

    /// The extractor output for the fixture sources
    pub fn batch() -> ExtractionBatch {
        let task = task_rs();
        let net = net_rs();
        let located = |mut e: ExtractedEntity, file: &str, text: &str, snippet: &str| {
            e.location = Some(span_of(file, text, snippet));
            e
        };
        let embedded = |mut e: ExtractedEntity, v: [f32; 3]| {
            e.embedding = Some(v.to_vec());
            e
        };
        let tests_mod = &net[net.find("mod tests").unwrap()..net.len() - 1];

        let mut spawn = located(function("rt::task::spawn", SPAWN_ORIGINAL), "src/task.rs", &task, SPAWN_ORIGINAL);
        spawn.signature = spawn_signature(&["FnOnce()"]);
        spawn.summary = Some("Run `f` on a new thread".into());

        ExtractionBatch::new()
            .with_entity(located(module("rt"), "src/lib.rs", LIB_RS, LIB_RS))
            .with_entity(located(module("rt::task"), "src/task.rs", &task, &task))
            .with_entity(located(module("rt::net"), "src/net.rs", &net, &net))
            .with_entity(located(module("rt::net::tests"), "src/net.rs", &net, tests_mod))
            .with_entity(embedded(spawn, [1.0, 0.0, 0.0]))
            .with_entity(embedded(
                located(function("rt::net::serve", SERVE), "src/net.rs", &net, SERVE),
                [0.9, 0.3, 0.0],
            ))
            .with_entity(embedded(
                located(function("rt::net::accept_loop", ACCEPT_LOOP), "src/net.rs", &net, ACCEPT_LOOP),
                [0.7, 0.6, 0.1],
            ))
            .with_entity(embedded(
                located(test_fn("rt::net::tests::serve_spawns", SERVE_SPAWNS), "src/net.rs", &net, SERVE_SPAWNS),
                [0.5, 0.5, 0.5],
            ))
            .with_entity(embedded(
                located(test_fn("rt::net::tests::accept_many", ACCEPT_MANY), "src/net.rs", &net, ACCEPT_MANY),
                [0.4, 0.5, 0.6],
            ))
            .with_edge(id("rt"), id("rt::task"), EdgeKind::Contains)
            .with_edge(id("rt"), id("rt::net"), EdgeKind::Contains)
            .with_edge(id("rt::task"), id("rt::task::spawn"), EdgeKind::Contains)
            .with_edge(id("rt::net"), id("rt::net::serve"), EdgeKind::Contains)
            .with_edge(id("rt::net"), id("rt::net::accept_loop"), EdgeKind::Contains)
            .with_edge(id("rt::net"), id("rt::net::tests"), EdgeKind::Contains)
            .with_edge(id("rt::net::tests"), id("rt::net::tests::serve_spawns"), EdgeKind::Contains)
            .with_edge(id("rt::net::tests"), id("rt::net::tests::accept_many"), EdgeKind::Contains)
            .with_edge(id("rt::net::serve"), id("rt::task::spawn"), EdgeKind::Calls)
            .with_edge(id("rt::net::accept_loop"), id("rt::net::serve"), EdgeKind::Calls)
            .with_edge(id("rt::net::tests::serve_spawns"), id("rt::net::serve"), EdgeKind::Calls)
            .with_edge(id("rt::net::tests::accept_many"), id("rt::net::accept_loop"), EdgeKind::Calls)
    }
}

impl Default for RuntimeFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Requirement {
    file: String,
    needle: String,
    line: u32,
    message: String,
}

/// Build tool double driven by a script instead of a compiler
///
/// Builds succeed unless a requirement is unmet in the shadow workspace.
/// Tests pass unless listed as failing or flaky; flaky tests fail on every
/// odd-numbered run.
#[derive(Debug, Default)]
pub struct ScriptedBuildTool {
    requirements: Vec<Requirement>,
    failing: Vec<String>,
    flaky: Vec<String>,
    silent: Vec<String>,
    delay: Option<Duration>,
    probes: Vec<String>,
    builds: AtomicUsize,
    test_runs: AtomicUsize,
    flaky_calls: Mutex<HashMap<String, usize>>,
    probed: Mutex<Vec<(String, String)>>,
    selected: Mutex<Vec<Vec<EntityId>>>,
    workspaces: Mutex<Vec<PathBuf>>,
}

impl ScriptedBuildTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the build with `message` at `file:line` unless `file` contains `needle`
    #[must_use]
    pub fn with_requirement(mut self, file: &str, needle: &str, line: u32, message: &str) -> Self {
        self.requirements.push(Requirement {
            file: file.into(),
            needle: needle.into(),
            line,
            message: message.into(),
        });
        self
    }

    #[must_use]
    pub fn with_failing_test(mut self, test: &str) -> Self {
        self.failing.push(test.into());
        self
    }

    #[must_use]
    pub fn with_flaky_test(mut self, test: &str) -> Self {
        self.flaky.push(test.into());
        self
    }

    /// Never report `test`, as if the runner skipped it
    #[must_use]
    pub fn with_silent_test(mut self, test: &str) -> Self {
        self.silent.push(test.into());
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Record the content of `file` as seen by each build
    #[must_use]
    pub fn with_probe(mut self, file: &str) -> Self {
        self.probes.push(file.into());
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn test_runs(&self) -> usize {
        self.test_runs.load(Ordering::SeqCst)
    }

    /// `(file, content)` pairs captured by probes
    pub fn probed(&self) -> Vec<(String, String)> {
        self.probed.lock().clone()
    }

    /// Test selections, one per run
    pub fn selected(&self) -> Vec<Vec<EntityId>> {
        self.selected.lock().clone()
    }

    /// Workspace roots the tool was pointed at
    pub fn workspaces(&self) -> Vec<PathBuf> {
        self.workspaces.lock().clone()
    }
}

#[async_trait]
impl BuildTool for ScriptedBuildTool {
    async fn build(&self, root: &Path) -> Result<BuildReport, ValidationError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.workspaces.lock().push(root.to_path_buf());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        for file in &self.probes {
            let text = std::fs::read_to_string(root.join(file)).unwrap_or_default();
            self.probed.lock().push((file.clone(), text));
        }
        let diagnostics: Vec<ToolDiagnostic> = self
            .requirements
            .iter()
            .filter(|r| {
                !std::fs::read_to_string(root.join(&r.file))
                    .unwrap_or_default()
                    .contains(&r.needle)
            })
            .map(|r| ToolDiagnostic {
                file: Some(r.file.clone()),
                line: Some(r.line),
                severity: Severity::Error,
                message: r.message.clone(),
            })
            .collect();
        Ok(BuildReport {
            success: diagnostics.is_empty(),
            diagnostics,
        })
    }

    async fn run_tests(&self, _root: &Path, tests: &[EntityId]) -> Result<Vec<TestOutcome>, ValidationError> {
        self.test_runs.fetch_add(1, Ordering::SeqCst);
        self.selected.lock().push(tests.to_vec());
        let mut calls = self.flaky_calls.lock();
        Ok(tests
            .iter()
            .map(ToString::to_string)
            .filter(|name| !self.silent.contains(name))
            .map(|name| {
                let status = if self.failing.contains(&name) {
                    TestStatus::Failed
                } else if self.flaky.contains(&name) {
                    let n = calls.entry(name.clone()).or_default();
                    *n += 1;
                    if *n % 2 == 1 {
                        TestStatus::Failed
                    } else {
                        TestStatus::Passed
                    }
                } else {
                    TestStatus::Passed
                };
                TestOutcome::new(name, status)
            })
            .collect())
    }
}

/// Session factory that always fails, as a crashed analyzer would
#[derive(Debug, Default, Clone, Copy)]
pub struct BrokenSessionFactory;

#[async_trait]
impl SessionFactory for BrokenSessionFactory {
    async fn create(&self, key: &SessionKey) -> Result<Arc<dyn AnalysisSession>, ValidationError> {
        Err(ValidationError::Session(format!(
            "analyzer for {} exited during startup",
            key.workspace.display()
        )))
    }
}
