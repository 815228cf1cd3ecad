//! Incremental analysis sessions
//!
//! An [`AnalysisSession`] follows the open/change/diagnostics/close document
//! protocol of language servers. The default [`SyntaxSession`] parses each
//! document in memory with tree-sitter and reports syntax errors; nothing
//! touches the filesystem.
//!
//! Sessions are expensive to start for real analyzers, so the gate keeps
//! them in a [`SessionPool`] keyed by workspace and active feature set.

use crate::error::ValidationError;
use async_trait::async_trait;
use dashmap::DashMap;
use isg_core::Severity;
use moka::future::Cache;
use std::path::PathBuf;
use std::sync::Arc;
use tree_sitter::{Node, Parser};

/// Diagnostic reported by a session, relative to the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDiagnostic {
    /// 1-based line within the document
    pub line: u32,
    pub severity: Severity,
    pub message: String,
}

#[async_trait]
pub trait AnalysisSession: Send + Sync {
    async fn open(&self, uri: &str, text: &str) -> Result<(), ValidationError>;

    async fn change(&self, uri: &str, text: &str) -> Result<(), ValidationError>;

    async fn diagnostics(&self, uri: &str) -> Result<Vec<SessionDiagnostic>, ValidationError>;

    async fn close(&self, uri: &str) -> Result<(), ValidationError>;
}

/// Pool key: sessions are shared per workspace and feature set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub workspace: PathBuf,
    /// Sorted, deduplicated
    pub features: Vec<String>,
}

impl SessionKey {
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>, features: &[String]) -> Self {
        let mut features = features.to_vec();
        features.sort();
        features.dedup();
        Self {
            workspace: workspace.into(),
            features,
        }
    }
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, key: &SessionKey) -> Result<Arc<dyn AnalysisSession>, ValidationError>;
}

/// Concurrent cache of live sessions
#[derive(Clone)]
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    sessions: Cache<SessionKey, Arc<dyn AnalysisSession>>,
}

impl SessionPool {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>, capacity: u64) -> Self {
        Self {
            factory,
            sessions: Cache::new(capacity),
        }
    }

    /// Session for `key`, created on first use
    ///
    /// Concurrent callers for the same key share a single creation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Session`] if the factory fails.
    pub async fn get(&self, key: &SessionKey) -> Result<Arc<dyn AnalysisSession>, ValidationError> {
        let factory = Arc::clone(&self.factory);
        self.sessions
            .try_get_with(key.clone(), async move { factory.create(key).await })
            .await
            .map_err(|e| ValidationError::Session(e.to_string()))
    }

    pub async fn evict(&self, key: &SessionKey) {
        self.sessions.invalidate(key).await;
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.sessions.entry_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.sessions.entry_count())
            .finish_non_exhaustive()
    }
}

/// In-memory Rust syntax checker
#[derive(Debug, Default)]
pub struct SyntaxSession {
    documents: DashMap<String, Vec<SessionDiagnostic>>,
}

impl SyntaxSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn analyze(text: &str) -> Result<Vec<SessionDiagnostic>, ValidationError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_rust::LANGUAGE.into())
            .map_err(|e| ValidationError::Session(e.to_string()))?;
        let tree = parser
            .parse(text, None)
            .ok_or_else(|| ValidationError::Session("parser produced no tree".into()))?;

        let mut diagnostics = Vec::new();
        let mut stack: Vec<Node<'_>> = vec![tree.root_node()];
        while let Some(node) = stack.pop() {
            if node.is_error() {
                diagnostics.push(syntax_error(node, text, "syntax error near"));
                continue;
            }
            if node.is_missing() {
                diagnostics.push(syntax_error(node, text, "missing"));
                continue;
            }
            if node.has_error() {
                let mut cursor = node.walk();
                stack.extend(node.children(&mut cursor));
            }
        }
        diagnostics.sort_by(|a, b| a.line.cmp(&b.line).then_with(|| a.message.cmp(&b.message)));
        Ok(diagnostics)
    }
}

fn syntax_error(node: Node<'_>, text: &str, what: &str) -> SessionDiagnostic {
    let shown = if node.is_missing() {
        node.kind().to_string()
    } else {
        let raw = text.get(node.byte_range()).unwrap_or_default();
        raw.chars().take(24).collect::<String>().replace('\n', " ")
    };
    #[allow(clippy::cast_possible_truncation)]
    let line = node.start_position().row as u32 + 1;
    SessionDiagnostic {
        line,
        severity: Severity::Error,
        message: format!("{what} `{}`", shown.trim()),
    }
}

#[async_trait]
impl AnalysisSession for SyntaxSession {
    async fn open(&self, uri: &str, text: &str) -> Result<(), ValidationError> {
        let diagnostics = Self::analyze(text)?;
        self.documents.insert(uri.to_string(), diagnostics);
        Ok(())
    }

    async fn change(&self, uri: &str, text: &str) -> Result<(), ValidationError> {
        if !self.documents.contains_key(uri) {
            return Err(ValidationError::Session(format!("{uri} is not open")));
        }
        self.open(uri, text).await
    }

    async fn diagnostics(&self, uri: &str) -> Result<Vec<SessionDiagnostic>, ValidationError> {
        self.documents
            .get(uri)
            .map(|d| d.clone())
            .ok_or_else(|| ValidationError::Session(format!("{uri} is not open")))
    }

    async fn close(&self, uri: &str) -> Result<(), ValidationError> {
        self.documents.remove(uri);
        Ok(())
    }
}

/// Creates a fresh [`SyntaxSession`] per key
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntaxSessionFactory;

#[async_trait]
impl SessionFactory for SyntaxSessionFactory {
    async fn create(&self, _key: &SessionKey) -> Result<Arc<dyn AnalysisSession>, ValidationError> {
        Ok(Arc::new(SyntaxSession::new()))
    }
}
