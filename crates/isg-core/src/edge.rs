//! Typed, directed relationships between entities

use crate::candidate::CandidateId;
use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Edge classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Calls,
    DependsOn,
    Implements,
    Contains,
}

impl EdgeKind {
    /// Every kind, in declaration order
    pub const ALL: [EdgeKind; 4] = [Self::Calls, Self::DependsOn, Self::Implements, Self::Contains];
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Calls => "calls",
            Self::DependsOn => "depends_on",
            Self::Implements => "implements",
            Self::Contains => "contains",
        })
    }
}

/// Traversal direction relative to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Edges leaving the entity
    Outgoing,
    /// Edges arriving at the entity
    Incoming,
    /// Both
    #[default]
    Both,
}

impl Direction {
    #[inline]
    #[must_use]
    pub fn includes_outgoing(self) -> bool {
        matches!(self, Self::Outgoing | Self::Both)
    }

    #[inline]
    #[must_use]
    pub fn includes_incoming(self) -> bool {
        matches!(self, Self::Incoming | Self::Both)
    }
}

/// A directed edge
///
/// `candidate` is `None` for edges of the current graph and names the
/// owning candidate for edges that exist only in a projected future.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: EntityId,
    pub to: EntityId,
    pub kind: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateId>,
}

impl Edge {
    /// Edge of the current graph
    #[inline]
    #[must_use]
    pub fn current(from: EntityId, to: EntityId, kind: EdgeKind) -> Self {
        Self {
            from,
            to,
            kind,
            candidate: None,
        }
    }

    /// Edge of a candidate's projected graph
    #[inline]
    #[must_use]
    pub fn projected(from: EntityId, to: EntityId, kind: EdgeKind, candidate: CandidateId) -> Self {
        Self {
            from,
            to,
            kind,
            candidate: Some(candidate),
        }
    }

    /// The same edge, re-tagged as current
    #[inline]
    #[must_use]
    pub fn promoted(&self) -> Self {
        Self::current(self.from.clone(), self.to.clone(), self.kind)
    }

    /// True if either endpoint is `id`
    #[inline]
    #[must_use]
    pub fn touches(&self, id: &EntityId) -> bool {
        &self.from == id || &self.to == id
    }

    /// The endpoint opposite `id`
    #[must_use]
    pub fn other(&self, id: &EntityId) -> &EntityId {
        if &self.from == id {
            &self.to
        } else {
            &self.from
        }
    }
}

impl Display for Edge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{}-> {}", self.from, self.kind, self.to)
    }
}
