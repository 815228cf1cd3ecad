//! Candidates: proposed entity mutations sharing one logical change

use crate::edge::EdgeKind;
use crate::entity::{EntityKind, FutureAction, Signature};
use crate::hash::{ContentHash, HashError};
use crate::id::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use ulid::Ulid;

/// Candidate identifier: content hash of the candidate's diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(ContentHash);

impl CandidateId {
    #[inline]
    #[must_use]
    pub const fn from_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    #[inline]
    #[must_use]
    pub fn hash(&self) -> &ContentHash {
        &self.0
    }

    /// Short form for logs
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl Display for CandidateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CandidateId {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Identifier of an incoming change request
    ChangeRequestId
);
ulid_id!(
    /// Identifier of a committed change
    CommitId
);
ulid_id!(
    /// Identifier of a single validation run
    RunId
);

/// One proposed change to one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMutation {
    pub entity: EntityId,
    pub action: FutureAction,
    /// New body; required for Create and Modify
    #[serde(default)]
    pub code: Option<String>,
    /// Kind of a created entity
    #[serde(default)]
    pub kind: Option<EntityKind>,
    /// Replacement signature
    #[serde(default)]
    pub signature: Option<Signature>,
    /// File a created entity is appended to, relative to the repo root
    #[serde(default)]
    pub placement: Option<String>,
}

impl EntityMutation {
    #[must_use]
    pub fn modify(entity: EntityId, code: impl Into<String>) -> Self {
        Self {
            entity,
            action: FutureAction::Modify,
            code: Some(code.into()),
            kind: None,
            signature: None,
            placement: None,
        }
    }

    #[must_use]
    pub fn create(entity: EntityId, kind: EntityKind, code: impl Into<String>) -> Self {
        Self {
            entity,
            action: FutureAction::Create,
            code: Some(code.into()),
            kind: Some(kind),
            signature: None,
            placement: None,
        }
    }

    #[must_use]
    pub fn delete(entity: EntityId) -> Self {
        Self {
            entity,
            action: FutureAction::Delete,
            code: None,
            kind: None,
            signature: None,
            placement: None,
        }
    }

    #[must_use]
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    #[must_use]
    pub fn with_placement(mut self, file: impl Into<String>) -> Self {
        self.placement = Some(file.into());
        self
    }

    /// Bytes this mutation contributes to the diff
    #[inline]
    #[must_use]
    pub fn diff_bytes(&self) -> usize {
        self.code.as_ref().map_or(0, String::len)
    }
}

/// An edge that exists only once the candidate lands
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposedEdge {
    pub from: EntityId,
    pub to: EntityId,
    pub kind: EdgeKind,
}

/// Proposer output before it is content-addressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDraft {
    pub change_request: ChangeRequestId,
    pub mutations: Vec<EntityMutation>,
    #[serde(default)]
    pub edges: Vec<ProposedEdge>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl CandidateDraft {
    #[must_use]
    pub fn new(change_request: ChangeRequestId, mutations: Vec<EntityMutation>) -> Self {
        Self {
            change_request,
            mutations,
            edges: Vec::new(),
            rationale: None,
        }
    }

    #[must_use]
    pub fn with_edge(mut self, from: EntityId, to: EntityId, kind: EdgeKind) -> Self {
        self.edges.push(ProposedEdge { from, to, kind });
        self
    }

    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// A content-addressed bundle of proposed mutations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub change_request: ChangeRequestId,
    pub mutations: Vec<EntityMutation>,
    pub edges: Vec<ProposedEdge>,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Address a draft by the hash of its diff
    ///
    /// Identical diffs hash identically regardless of which request
    /// produced them or when.
    ///
    /// # Errors
    /// Returns error if the diff cannot be serialized
    pub fn from_draft(draft: CandidateDraft) -> Result<Self, HashError> {
        let hash = ContentHash::compute_serializable(&(&draft.mutations, &draft.edges))?;
        Ok(Self {
            id: CandidateId::from_hash(hash),
            change_request: draft.change_request,
            mutations: draft.mutations,
            edges: draft.edges,
            rationale: draft.rationale,
            created_at: Utc::now(),
        })
    }

    /// Ids of every entity this candidate touches
    pub fn affected(&self) -> impl Iterator<Item = &EntityId> {
        self.mutations.iter().map(|m| &m.entity)
    }

    /// Mutation targeting `id`, if any
    #[must_use]
    pub fn mutation(&self, id: &EntityId) -> Option<&EntityMutation> {
        self.mutations.iter().find(|m| &m.entity == id)
    }

    /// Total diff size in bytes
    #[must_use]
    pub fn diff_bytes(&self) -> usize {
        self.mutations.iter().map(EntityMutation::diff_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[test]
    fn candidate_id_ignores_request_and_time() {
        let muts = vec![EntityMutation::modify(id("a::f"), "fn f() {}")];
        let a = Candidate::from_draft(CandidateDraft::new(ChangeRequestId::new(), muts.clone())).unwrap();
        let b = Candidate::from_draft(CandidateDraft::new(ChangeRequestId::new(), muts)).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn candidate_id_tracks_diff() {
        let req = ChangeRequestId::new();
        let a = Candidate::from_draft(CandidateDraft::new(
            req,
            vec![EntityMutation::modify(id("a::f"), "fn f() {}")],
        ))
        .unwrap();
        let b = Candidate::from_draft(CandidateDraft::new(
            req,
            vec![EntityMutation::modify(id("a::f"), "fn f() { }")],
        ))
        .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn candidate_diff_bytes_and_affected() {
        let c = Candidate::from_draft(CandidateDraft::new(
            ChangeRequestId::new(),
            vec![
                EntityMutation::modify(id("a::f"), "1234"),
                EntityMutation::delete(id("a::g")),
                EntityMutation::create(id("a::h"), EntityKind::Function, "12"),
            ],
        ))
        .unwrap();
        assert_eq!(c.diff_bytes(), 6);
        assert_eq!(c.affected().count(), 3);
        assert!(c.mutation(&id("a::g")).is_some());
    }

    #[test]
    fn ids_parse_their_display() {
        let commit = CommitId::new();
        assert_eq!(commit.to_string().parse::<CommitId>().unwrap(), commit);
        let c = CandidateId::from_hash(ContentHash::compute(b"x"));
        assert_eq!(c.to_string().parse::<CandidateId>().unwrap(), c);
    }
}
