//! Interface-level entities
//!
//! An [`Entity`] carries two code bodies: the committed `current_code` and an
//! optional staged [`FutureState`]. The future half is a single tagged value,
//! so an entity can never hold future code without also naming the action
//! and the candidate that staged it.

use crate::candidate::CandidateId;
use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Entity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Free function or method
    Function,
    /// Struct, enum or type alias
    Type,
    /// Trait / interface
    Trait,
    /// Module or namespace
    Module,
    /// Test function
    Test,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Function => "function",
            Self::Type => "type",
            Self::Trait => "trait",
            Self::Module => "module",
            Self::Test => "test",
        })
    }
}

/// One generic parameter with its inline bounds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenericParam {
    pub name: String,
    #[serde(default)]
    pub bounds: Vec<String>,
}

/// One value parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: String,
}

/// Interface signature: parameters, return type and generic constraints
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub generics: Vec<GenericParam>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub returns: Option<String>,
    #[serde(default)]
    pub where_clauses: Vec<String>,
}

impl Signature {
    /// Add a generic parameter
    #[must_use]
    pub fn with_generic(mut self, name: impl Into<String>, bounds: &[&str]) -> Self {
        self.generics.push(GenericParam {
            name: name.into(),
            bounds: bounds.iter().map(|b| (*b).to_string()).collect(),
        });
        self
    }

    /// Add a value parameter
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            ty: ty.into(),
        });
        self
    }

    /// Set the return type
    #[must_use]
    pub fn with_returns(mut self, ty: impl Into<String>) -> Self {
        self.returns = Some(ty.into());
        self
    }

    /// Add a where-clause predicate
    #[must_use]
    pub fn with_where(mut self, predicate: impl Into<String>) -> Self {
        self.where_clauses.push(predicate.into());
        self
    }

    /// Render as a one-line declaration for `name`
    #[must_use]
    pub fn render(&self, name: &str) -> String {
        let mut out = String::from(name);
        if !self.generics.is_empty() {
            let generics: Vec<String> = self
                .generics
                .iter()
                .map(|g| {
                    if g.bounds.is_empty() {
                        g.name.clone()
                    } else {
                        format!("{}: {}", g.name, g.bounds.join(" + "))
                    }
                })
                .collect();
            out.push('<');
            out.push_str(&generics.join(", "));
            out.push('>');
        }
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, p.ty))
            .collect();
        out.push('(');
        out.push_str(&params.join(", "));
        out.push(')');
        if let Some(ret) = &self.returns {
            out.push_str(" -> ");
            out.push_str(ret);
        }
        if !self.where_clauses.is_empty() {
            out.push_str(" where ");
            out.push_str(&self.where_clauses.join(", "));
        }
        out
    }
}

/// Location of an entity in the source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    /// Path relative to the repository root, `/`-separated
    pub file: String,
    pub byte_start: usize,
    pub byte_end: usize,
    /// 1-based, inclusive
    pub line_start: u32,
    /// 1-based, inclusive
    pub line_end: u32,
}

impl SourceSpan {
    /// True if `line` falls inside this span
    #[inline]
    #[must_use]
    pub fn contains_line(&self, line: u32) -> bool {
        (self.line_start..=self.line_end).contains(&line)
    }
}

/// Proposed lifecycle action on an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureAction {
    Create,
    Modify,
    Delete,
}

/// Staged future half of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureState {
    pub action: FutureAction,
    /// `None` only for [`FutureAction::Delete`]
    pub code: Option<String>,
    /// Replacement signature, if the change alters the interface
    #[serde(default)]
    pub signature: Option<Signature>,
    pub candidate: CandidateId,
}

/// An interface-level unit of the codebase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default)]
    pub signature: Signature,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// `None` for declarations without a body (modules)
    #[serde(default)]
    pub current_code: Option<String>,
    #[serde(default)]
    pub location: Option<SourceSpan>,
    #[serde(default)]
    future: Option<FutureState>,
}

impl Entity {
    /// Committed entity with no staged future
    #[must_use]
    pub fn new(id: EntityId, kind: EntityKind) -> Self {
        Self {
            id,
            kind,
            signature: Signature::default(),
            summary: None,
            embedding: None,
            current_code: None,
            location: None,
            future: None,
        }
    }

    /// Set committed code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.current_code = Some(code.into());
        self
    }

    /// Set signature
    #[must_use]
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// Set embedding
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Set summary
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Set source location
    #[must_use]
    pub fn with_location(mut self, location: SourceSpan) -> Self {
        self.location = Some(location);
        self
    }

    /// Staged future state
    #[inline]
    #[must_use]
    pub fn future(&self) -> Option<&FutureState> {
        self.future.as_ref()
    }

    /// Staged future code
    #[inline]
    #[must_use]
    pub fn future_code(&self) -> Option<&str> {
        self.future.as_ref().and_then(|f| f.code.as_deref())
    }

    /// Staged future action
    #[inline]
    #[must_use]
    pub fn future_action(&self) -> Option<FutureAction> {
        self.future.as_ref().map(|f| f.action)
    }

    /// Candidate that staged the future state
    #[inline]
    #[must_use]
    pub fn candidate_id(&self) -> Option<&CandidateId> {
        self.future.as_ref().map(|f| &f.candidate)
    }

    /// Code as it would read after the staged change lands
    #[must_use]
    pub fn effective_code(&self) -> Option<&str> {
        match &self.future {
            Some(f) if f.action == FutureAction::Delete => None,
            Some(f) => f.code.as_deref(),
            None => self.current_code.as_deref(),
        }
    }

    /// One-line declaration
    #[must_use]
    pub fn declaration(&self) -> String {
        format!("{} {}", self.kind, self.signature.render(self.id.name()))
    }

    /// Apply an extractor refresh, keeping any staged future
    pub fn refresh_from(&mut self, extracted: ExtractedEntity) {
        self.kind = extracted.kind;
        self.signature = extracted.signature;
        self.summary = extracted.summary;
        self.embedding = extracted.embedding;
        self.current_code = extracted.code;
        self.location = extracted.location;
    }
}

impl From<ExtractedEntity> for Entity {
    fn from(extracted: ExtractedEntity) -> Self {
        Self {
            id: extracted.id,
            kind: extracted.kind,
            signature: extracted.signature,
            summary: extracted.summary,
            embedding: extracted.embedding,
            current_code: extracted.code,
            location: extracted.location,
            future: None,
        }
    }
}

/// Entity as produced by the extractor
///
/// Has no future fields, so extraction can never stage a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default)]
    pub signature: Signature,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub location: Option<SourceSpan>,
}

impl ExtractedEntity {
    /// Extracted entity with a body
    #[must_use]
    pub fn new(id: EntityId, kind: EntityKind, code: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            signature: Signature::default(),
            summary: None,
            embedding: None,
            code: Some(code.into()),
            location: None,
        }
    }

    /// True if applying this refresh leaves `entity`'s committed half unchanged
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        self.kind == entity.kind
            && self.signature == entity.signature
            && self.summary == entity.summary
            && self.embedding == entity.embedding
            && self.code == entity.current_code
            && self.location == entity.location
    }
}

/// Staging hooks for the graph store
///
/// **Note:** only the candidate and commit paths of the graph store call these.
#[doc(hidden)]
pub mod __private {
    use super::{Entity, FutureState};

    pub fn stage_future(entity: &mut Entity, future: FutureState) {
        entity.future = Some(future);
    }

    pub fn clear_future(entity: &mut Entity) -> Option<FutureState> {
        entity.future.take()
    }
}
