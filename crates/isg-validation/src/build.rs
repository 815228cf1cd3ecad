//! Build and test tools
//!
//! [`BuildTool`] abstracts the real toolchain. [`CargoTool`] drives `cargo`
//! as a subprocess and parses its machine-readable output.

use crate::error::ValidationError;
use async_trait::async_trait;
use isg_core::{EntityId, Severity, TestOutcome, TestStatus};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// A diagnostic as reported by the tool, in workspace coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDiagnostic {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub success: bool,
    pub diagnostics: Vec<ToolDiagnostic>,
}

#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Build the workspace at `root`
    async fn build(&self, root: &Path) -> Result<BuildReport, ValidationError>;

    /// Run exactly `tests`, reporting one outcome per test named by entity id
    ///
    /// Tests the runner never reports come back as [`TestStatus::NotRun`].
    async fn run_tests(&self, root: &Path, tests: &[EntityId]) -> Result<Vec<TestOutcome>, ValidationError>;
}

/// `cargo check` / `cargo test` in the shadow workspace
#[derive(Debug, Clone)]
pub struct CargoTool {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl Default for CargoTool {
    fn default() -> Self {
        Self {
            program: PathBuf::from("cargo"),
            extra_args: Vec::new(),
        }
    }
}

impl CargoTool {
    #[must_use]
    pub fn new(extra_args: Vec<String>) -> Self {
        Self {
            extra_args,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, root: &Path, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(subcommand)
            .arg("--workspace")
            .arg("--target-dir")
            .arg(root.join("target"))
            .args(&self.extra_args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, mut cmd: Command) -> Result<std::process::Output, ValidationError> {
        cmd.output().await.map_err(|source| ValidationError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl BuildTool for CargoTool {
    async fn build(&self, root: &Path) -> Result<BuildReport, ValidationError> {
        let mut cmd = self.command(root, "check");
        cmd.arg("--all-targets").arg("--message-format=json");
        let output = self.output(cmd).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut diagnostics: Vec<ToolDiagnostic> = stdout.lines().filter_map(parse_compiler_message).collect();
        let success = output.status.success();
        if !success && !diagnostics.iter().any(|d| d.severity == Severity::Error) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            diagnostics.push(ToolDiagnostic {
                file: None,
                line: None,
                severity: Severity::Error,
                message: tail(&stderr, 20),
            });
        }
        debug!(success, diagnostics = diagnostics.len(), "cargo check finished");
        Ok(BuildReport { success, diagnostics })
    }

    async fn run_tests(&self, root: &Path, tests: &[EntityId]) -> Result<Vec<TestOutcome>, ValidationError> {
        if tests.is_empty() {
            return Ok(Vec::new());
        }
        let filters: HashMap<String, &EntityId> = tests.iter().map(|t| (libtest_name(t), t)).collect();

        let mut cmd = self.command(root, "test");
        cmd.arg("--no-fail-fast").arg("--").arg("--exact").args(filters.keys());
        let output = self.output(cmd).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut seen: HashMap<&str, TestStatus> = HashMap::new();
        for (name, status) in stdout.lines().filter_map(parse_test_line) {
            let Some(status) = status else { continue };
            let entry = seen.entry(name).or_insert(status);
            if status == TestStatus::Failed {
                *entry = TestStatus::Failed;
            }
        }
        if !output.status.success() && seen.is_empty() {
            warn!(stderr = %tail(&String::from_utf8_lossy(&output.stderr), 5), "cargo test reported no results");
        }

        let mut outcomes: Vec<TestOutcome> = filters
            .iter()
            .map(|(name, id)| {
                let status = seen.get(name.as_str()).copied().unwrap_or(TestStatus::NotRun);
                TestOutcome::new(id.to_string(), status)
            })
            .collect();
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(outcomes)
    }
}

/// libtest names tests by module path without the crate name
fn libtest_name(id: &EntityId) -> String {
    let segments = id.segments();
    if segments.len() > 1 {
        segments[1..].join("::")
    } else {
        id.to_string()
    }
}

/// `test a::b ... ok` -> `("a::b", Some(Passed))`; ignored tests carry no status
fn parse_test_line(line: &str) -> Option<(&str, Option<TestStatus>)> {
    let rest = line.strip_prefix("test ")?;
    let (name, result) = rest.rsplit_once(" ... ")?;
    let status = match result.trim() {
        "ok" => Some(TestStatus::Passed),
        "FAILED" => Some(TestStatus::Failed),
        r if r.starts_with("ignored") => None,
        _ => return None,
    };
    Some((name.trim(), status))
}

#[derive(Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    message: Option<CompilerMessage>,
}

#[derive(Deserialize)]
struct CompilerMessage {
    message: String,
    level: String,
    #[serde(default)]
    spans: Vec<CompilerSpan>,
}

#[derive(Deserialize)]
struct CompilerSpan {
    file_name: String,
    line_start: u32,
    is_primary: bool,
}

fn parse_compiler_message(line: &str) -> Option<ToolDiagnostic> {
    let msg: CargoMessage = serde_json::from_str(line).ok()?;
    if msg.reason != "compiler-message" {
        return None;
    }
    let inner = msg.message?;
    let severity = match inner.level.as_str() {
        "error" | "error: internal compiler error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => Severity::Note,
    };
    let primary = inner.spans.iter().find(|s| s.is_primary);
    Some(ToolDiagnostic {
        file: primary.map(|s| s.file_name.clone()),
        line: primary.map(|s| s.line_start),
        severity,
        message: inner.message,
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn compiler_messages_are_parsed() {
        let line = r#"{"reason":"compiler-message","package_id":"demo","message":{"message":"`F` cannot be sent between threads safely","level":"error","spans":[{"file_name":"src/task.rs","line_start":12,"is_primary":true},{"file_name":"src/net.rs","line_start":3,"is_primary":false}]}}"#;
        assert_eq!(
            parse_compiler_message(line),
            Some(ToolDiagnostic {
                file: Some("src/task.rs".into()),
                line: Some(12),
                severity: Severity::Error,
                message: "`F` cannot be sent between threads safely".into(),
            })
        );
        assert_eq!(parse_compiler_message(r#"{"reason":"build-finished","success":true}"#), None);
        assert_eq!(parse_compiler_message("Compiling demo v0.1.0"), None);
    }

    #[test]
    fn test_lines_are_parsed() {
        assert_eq!(
            parse_test_line("test net::tests::serve_spawns ... ok"),
            Some(("net::tests::serve_spawns", Some(TestStatus::Passed)))
        );
        assert_eq!(
            parse_test_line("test task::tests::spawn ... FAILED"),
            Some(("task::tests::spawn", Some(TestStatus::Failed)))
        );
        assert_eq!(parse_test_line("test slow ... ignored, takes minutes"), Some(("slow", None)));
        assert_eq!(parse_test_line("test result: ok. 3 passed"), None);
        assert_eq!(parse_test_line("running 3 tests"), None);
    }

    #[test]
    fn libtest_names_drop_the_crate() {
        let id: EntityId = "rt::net::tests::serve".parse().unwrap();
        assert_eq!(libtest_name(&id), "net::tests::serve");
        let root: EntityId = "solo".parse().unwrap();
        assert_eq!(libtest_name(&root), "solo");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = CargoTool::default().with_program("/nonexistent/isg-cargo");
        let err = tool.build(dir.path()).await.unwrap_err();
        assert!(matches!(err, ValidationError::Spawn { .. }));
    }
}
