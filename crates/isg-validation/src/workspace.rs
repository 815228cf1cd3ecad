//! Shadow workspaces for the build and test phases
//!
//! A [`ShadowWorkspace`] is a temporary copy of the repository with the
//! candidate's changes spliced in. Only files the candidate touches are
//! written; every other file is hard-linked (or copied, see [`LinkMode`]).
//! Test sources and build scripts are always copied.

use crate::error::ValidationError;
use isg_core::{Candidate, EntityId, FutureAction, SourceSpan};
use isg_graph::{GraphRead, GraphSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

/// How unchanged files enter the shadow workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Falls back to copying when linking fails (e.g. across devices)
    ///
    /// A linked file shares its inode with the repository, so anything
    /// that rewrites it in place inside the workspace also rewrites the
    /// real file. Build scripts, `Cargo.lock` and files under a `tests`
    /// directory are copied regardless; use [`LinkMode::Copy`] when other
    /// build steps write to source files.
    #[default]
    HardLink,
    Copy,
}

/// Files the build may rewrite, always copied
const NEVER_LINKED: &[&str] = &["Cargo.lock", "build.rs"];

/// Directories whose files are always copied
const NEVER_LINKED_DIRS: &[&str] = &["tests"];

/// Directory names never mirrored
const DEFAULT_SKIP: &[&str] = &["target", ".git"];

/// Maps `(file, line)` in the shadow workspace back to entity ids
#[derive(Debug, Clone, Default)]
pub struct LineMap {
    files: HashMap<String, Vec<(u32, u32, EntityId)>>,
}

impl LineMap {
    fn insert(&mut self, file: &str, start: u32, end: u32, id: EntityId) {
        self.files.entry(file.to_string()).or_default().push((start, end, id));
    }

    /// Innermost entity whose span contains `line`
    #[must_use]
    pub fn locate(&self, file: &str, line: u32) -> Option<&EntityId> {
        self.files
            .get(normalize(file).as_str())?
            .iter()
            .filter(|(start, end, _)| (*start..=*end).contains(&line))
            .min_by_key(|(start, end, _)| end - start)
            .map(|(_, _, id)| id)
    }
}

fn normalize(file: &str) -> String {
    file.trim_start_matches("./").replace('\\', "/")
}

/// A materialized candidate, removed from disk on drop
#[derive(Debug)]
pub struct ShadowWorkspace {
    dir: TempDir,
    changed: Vec<String>,
    lines: LineMap,
}

impl ShadowWorkspace {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Build output directory inside the workspace
    #[must_use]
    pub fn target_dir(&self) -> PathBuf {
        self.dir.path().join("target")
    }

    /// Repository-relative paths written with candidate content
    #[must_use]
    pub fn changed_files(&self) -> &[String] {
        &self.changed
    }

    #[must_use]
    pub fn locate(&self, file: &str, line: u32) -> Option<&EntityId> {
        self.lines.locate(file, line)
    }
}

struct Splice<'a> {
    entity: &'a EntityId,
    start: usize,
    end: usize,
    expected: &'a str,
    replacement: &'a str,
}

#[derive(Debug, Clone)]
pub struct Materializer {
    repo_root: PathBuf,
    link_mode: LinkMode,
    skip: Vec<String>,
}

impl Materializer {
    #[must_use]
    pub fn new(repo_root: impl Into<PathBuf>, link_mode: LinkMode) -> Self {
        Self {
            repo_root: repo_root.into(),
            link_mode,
            skip: DEFAULT_SKIP.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Mirror the repository with `candidate` applied on top of `graph`
    ///
    /// Every replaced span must still hold the entity's current code,
    /// otherwise the graph is stale relative to the repository.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::MissingLocation`] if a touched entity cannot be placed
    /// - [`ValidationError::StaleSource`] if a span no longer matches
    /// - [`ValidationError::Io`] for filesystem failures
    pub fn materialize(&self, candidate: &Candidate, graph: &GraphSnapshot) -> Result<ShadowWorkspace, ValidationError> {
        let mut splices: BTreeMap<String, Vec<Splice<'_>>> = BTreeMap::new();
        let mut appends: BTreeMap<String, Vec<(&EntityId, &str)>> = BTreeMap::new();

        for m in &candidate.mutations {
            match m.action {
                FutureAction::Modify | FutureAction::Delete => {
                    let entity = graph
                        .entity(&m.entity)
                        .ok_or_else(|| ValidationError::MissingLocation(m.entity.clone()))?;
                    let span = entity
                        .location
                        .as_ref()
                        .ok_or_else(|| ValidationError::MissingLocation(m.entity.clone()))?;
                    let replacement = match m.action {
                        FutureAction::Modify => m.code.as_deref().unwrap_or_default(),
                        _ => "",
                    };
                    splices.entry(span.file.clone()).or_default().push(Splice {
                        entity: &m.entity,
                        start: span.byte_start,
                        end: span.byte_end,
                        expected: entity.current_code.as_deref().unwrap_or_default(),
                        replacement,
                    });
                }
                FutureAction::Create => {
                    let file = match &m.placement {
                        Some(file) => file.clone(),
                        None => enclosing_file(graph, &m.entity)
                            .ok_or_else(|| ValidationError::MissingLocation(m.entity.clone()))?,
                    };
                    appends
                        .entry(file)
                        .or_default()
                        .push((&m.entity, m.code.as_deref().unwrap_or_default()));
                }
            }
        }

        let mut lines = LineMap::default();
        for entity in graph.entities() {
            if let Some(span) = &entity.location {
                if !splices.contains_key(&span.file) && !appends.contains_key(&span.file) {
                    lines.insert(&span.file, span.line_start, span.line_end, entity.id.clone());
                }
            }
        }

        let mut rewritten: HashMap<String, String> = HashMap::new();
        let files: Vec<String> = splices.keys().chain(appends.keys()).cloned().collect();
        for file in files {
            if rewritten.contains_key(&file) {
                continue;
            }
            let path = self.repo_root.join(&file);
            let original = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && !splices.contains_key(&file) => String::new(),
                Err(e) => return Err(ValidationError::io(path, e)),
            };
            let mut edits = splices.remove(&file).unwrap_or_default();
            let unchanged: Vec<(&EntityId, &SourceSpan)> = graph
                .entities()
                .filter_map(|e| e.location.as_ref().map(|s| (&e.id, s)))
                .filter(|(id, s)| s.file == file && !edits.iter().any(|edit| edit.entity == *id))
                .collect();
            let text = splice_file(
                &file,
                &original,
                &mut edits,
                appends.remove(&file).unwrap_or_default(),
                &unchanged,
                &mut lines,
            )?;
            rewritten.insert(file, text);
        }

        let dir = tempfile::Builder::new()
            .prefix("isg-shadow-")
            .tempdir()
            .map_err(|e| ValidationError::io(std::env::temp_dir(), e))?;
        self.mirror(dir.path(), &rewritten)?;

        let mut changed: Vec<String> = rewritten.into_keys().collect();
        changed.sort();
        debug!(candidate = %candidate.id.short(), workspace = %dir.path().display(), changed = changed.len(), "materialized shadow workspace");
        Ok(ShadowWorkspace { dir, changed, lines })
    }

    fn mirror(&self, shadow: &Path, rewritten: &HashMap<String, String>) -> Result<(), ValidationError> {
        let walker = WalkDir::new(&self.repo_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.skip.iter().any(|s| e.file_name() == s.as_str()));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.repo_root.clone());
                ValidationError::io(path, e.into())
            })?;
            let Ok(rel) = entry.path().strip_prefix(&self.repo_root) else {
                continue;
            };
            let dest = shadow.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest).map_err(|e| ValidationError::io(&dest, e))?;
                continue;
            }
            let key = rel.to_string_lossy().replace('\\', "/");
            if rewritten.contains_key(&key) {
                continue;
            }
            let never_link = NEVER_LINKED.iter().any(|n| entry.file_name() == *n)
                || rel
                    .parent()
                    .is_some_and(|dir| dir.iter().any(|c| NEVER_LINKED_DIRS.iter().any(|d| c == *d)));
            if self.link_mode == LinkMode::HardLink && !never_link && fs::hard_link(entry.path(), &dest).is_ok() {
                continue;
            }
            fs::copy(entry.path(), &dest).map_err(|e| ValidationError::io(&dest, e))?;
        }

        for (file, text) in rewritten {
            let dest = shadow.join(file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| ValidationError::io(parent, e))?;
            }
            fs::write(&dest, text).map_err(|e| ValidationError::io(&dest, e))?;
        }
        Ok(())
    }
}

/// File of the innermost located ancestor
fn enclosing_file(graph: &GraphSnapshot, id: &EntityId) -> Option<String> {
    id.ancestors()
        .rev()
        .find_map(|a| graph.entity(&a).and_then(|e| e.location.as_ref()).map(|s| s.file.clone()))
}

#[allow(clippy::cast_possible_truncation)]
fn count_lines(text: &str) -> u32 {
    text.matches('\n').count() as u32
}

fn splice_file(
    file: &str,
    original: &str,
    edits: &mut [Splice<'_>],
    appends: Vec<(&EntityId, &str)>,
    unchanged: &[(&EntityId, &SourceSpan)],
    lines: &mut LineMap,
) -> Result<String, ValidationError> {
    edits.sort_by_key(|e| e.start);

    let mut out = String::with_capacity(original.len());
    let mut cursor = 0usize;
    // (original byte offset, line shift applying after it)
    let mut shifts: Vec<(usize, i64)> = Vec::with_capacity(edits.len());
    let mut shift = 0i64;

    for edit in edits.iter() {
        let stale = || ValidationError::StaleSource {
            entity: edit.entity.clone(),
            file: file.to_string(),
        };
        if edit.start < cursor {
            return Err(stale());
        }
        let before = original.get(cursor..edit.start).ok_or_else(stale)?;
        let replaced = original.get(edit.start..edit.end).ok_or_else(stale)?;
        if replaced != edit.expected {
            return Err(stale());
        }
        out.push_str(before);

        let line_start = count_lines(&out) + 1;
        out.push_str(edit.replacement);
        if !edit.replacement.is_empty() {
            lines.insert(file, line_start, line_start + count_lines(edit.replacement), edit.entity.clone());
        }
        shift += i64::from(count_lines(edit.replacement)) - i64::from(count_lines(replaced));
        shifts.push((edit.end, shift));
        cursor = edit.end;
    }
    out.push_str(original.get(cursor..).unwrap_or_default());

    let shift_at = |offset: usize| {
        shifts
            .iter()
            .take_while(|(end, _)| *end <= offset)
            .last()
            .map_or(0, |(_, s)| *s)
    };
    for (id, span) in unchanged {
        let start = i64::from(span.line_start) + shift_at(span.byte_start);
        let end = i64::from(span.line_end) + shift_at(span.byte_end);
        if let (Ok(start), Ok(end)) = (u32::try_from(start), u32::try_from(end)) {
            lines.insert(file, start, end, (*id).clone());
        }
    }

    for (id, code) in appends {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.is_empty() {
            out.push('\n');
        }
        let line_start = count_lines(&out) + 1;
        out.push_str(code);
        out.push('\n');
        lines.insert(file, line_start, line_start + count_lines(code), id.clone());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::{
        CandidateDraft, ChangeRequestId, EntityKind, EntityMutation, ExtractedEntity, ExtractionBatch,
    };
    use isg_graph::{CandidatePolicy, CandidateStore, GraphStore};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const LIB: &str = "pub fn a() -> u32 {\n    1\n}\n\npub fn b() -> u32 {\n    2\n}\n";

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    fn located(path: &str, code: &str, start: usize, line: u32) -> ExtractedEntity {
        let mut e = ExtractedEntity::new(id(path), EntityKind::Function, code);
        e.location = Some(SourceSpan {
            file: "src/lib.rs".into(),
            byte_start: start,
            byte_end: start + code.len(),
            line_start: line,
            line_end: line + count_lines(code),
        });
        e
    }

    fn repo() -> (TempDir, Arc<GraphStore>) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), LIB).unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
        fs::write(dir.path().join("Cargo.lock"), "# lock\n").unwrap();
        fs::write(dir.path().join("target/debug/junk"), "x").unwrap();

        let a = "pub fn a() -> u32 {\n    1\n}";
        let b = "pub fn b() -> u32 {\n    2\n}";
        let store = Arc::new(GraphStore::new());
        let mut module = ExtractedEntity::new(id("demo"), EntityKind::Module, "");
        module.code = None;
        module.location = Some(SourceSpan {
            file: "src/lib.rs".into(),
            byte_start: 0,
            byte_end: LIB.len(),
            line_start: 1,
            line_end: 7,
        });
        store
            .upsert_entities(
                ExtractionBatch::new()
                    .with_entity(module)
                    .with_entity(located("demo::a", a, 0, 1))
                    .with_entity(located("demo::b", b, LIB.find("pub fn b").unwrap(), 5)),
            )
            .unwrap();
        (dir, store)
    }

    fn stage(store: &Arc<GraphStore>, mutations: Vec<EntityMutation>) -> Candidate {
        let c = Candidate::from_draft(CandidateDraft::new(ChangeRequestId::new(), mutations)).unwrap();
        CandidateStore::new(Arc::clone(store), CandidatePolicy::default())
            .submit(c.clone())
            .unwrap();
        c
    }

    #[test]
    fn splices_only_changed_files_and_leaves_repo_alone() {
        let (dir, store) = repo();
        let c = stage(
            &store,
            vec![EntityMutation::modify(id("demo::a"), "pub fn a() -> u32 {\n    // one\n    1\n}")],
        );
        let ws = Materializer::new(dir.path(), LinkMode::HardLink)
            .materialize(&c, &store.snapshot())
            .unwrap();

        let shadow = fs::read_to_string(ws.path().join("src/lib.rs")).unwrap();
        assert_eq!(
            shadow,
            "pub fn a() -> u32 {\n    // one\n    1\n}\n\npub fn b() -> u32 {\n    2\n}\n"
        );
        assert_eq!(fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(), LIB);
        assert_eq!(ws.changed_files(), ["src/lib.rs".to_string()]);
        assert!(ws.path().join("Cargo.toml").exists());
        assert!(ws.path().join("Cargo.lock").exists());
        assert!(!ws.path().join("target/debug/junk").exists());

        // b moved down a line, a grew by one
        assert_eq!(ws.locate("src/lib.rs", 3), Some(&id("demo::a")));
        assert_eq!(ws.locate("src/lib.rs", 7), Some(&id("demo::b")));
        assert_eq!(ws.locate("./src/lib.rs", 6), Some(&id("demo::b")));
    }

    #[test]
    fn test_sources_are_copied_even_when_linking() {
        let (dir, store) = repo();
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("tests/it.rs"), "#[test]\nfn it() {}\n").unwrap();
        fs::write(dir.path().join("build.rs"), "fn main() {}\n").unwrap();
        let c = stage(&store, vec![EntityMutation::modify(id("demo::a"), "pub fn a() -> u32 { 3 }")]);
        let ws = Materializer::new(dir.path(), LinkMode::HardLink)
            .materialize(&c, &store.snapshot())
            .unwrap();

        // Rewriting the workspace copies in place must not reach the repo
        for file in ["tests/it.rs", "build.rs", "Cargo.lock"] {
            let original = fs::read_to_string(dir.path().join(file)).unwrap();
            let mut shadow = fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(ws.path().join(file))
                .unwrap();
            std::io::Write::write_all(&mut shadow, b"// rewritten\n").unwrap();
            drop(shadow);
            assert_eq!(fs::read_to_string(dir.path().join(file)).unwrap(), original, "{file}");
        }
    }

    #[test]
    fn delete_and_create_land_in_the_same_file() {
        let (dir, store) = repo();
        let c = stage(
            &store,
            vec![
                EntityMutation::delete(id("demo::b")),
                EntityMutation::create(id("demo::c"), EntityKind::Function, "pub fn c() {}"),
            ],
        );
        let ws = Materializer::new(dir.path(), LinkMode::Copy)
            .materialize(&c, &store.snapshot())
            .unwrap();
        let shadow = fs::read_to_string(ws.path().join("src/lib.rs")).unwrap();
        assert!(shadow.contains("pub fn a()"));
        assert!(!shadow.contains("pub fn b()"));
        assert!(shadow.ends_with("pub fn c() {}\n"));
        let last = count_lines(&shadow);
        assert_eq!(ws.locate("src/lib.rs", last), Some(&id("demo::c")));
    }

    #[test]
    fn stale_span_is_rejected() {
        let (dir, store) = repo();
        fs::write(dir.path().join("src/lib.rs"), "// edited by hand\n").unwrap();
        let c = stage(&store, vec![EntityMutation::modify(id("demo::a"), "pub fn a() -> u32 { 3 }")]);
        let err = Materializer::new(dir.path(), LinkMode::HardLink)
            .materialize(&c, &store.snapshot())
            .unwrap_err();
        assert!(matches!(err, ValidationError::StaleSource { .. }));
    }

    #[test]
    fn unlocated_entity_cannot_be_materialized() {
        let (dir, store) = repo();
        store
            .upsert_entities(ExtractionBatch::new().with_entity(ExtractedEntity::new(
                id("elsewhere::f"),
                EntityKind::Function,
                "fn f() {}",
            )))
            .unwrap();
        let c = stage(&store, vec![EntityMutation::modify(id("elsewhere::f"), "fn f() { 1 }")]);
        let err = Materializer::new(dir.path(), LinkMode::HardLink)
            .materialize(&c, &store.snapshot())
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingLocation(_)));
    }
}
