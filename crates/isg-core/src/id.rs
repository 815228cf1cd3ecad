//! Structural entity identifiers
//!
//! An [`EntityId`] is the structural path of an entity (`rt::task::spawn`),
//! never a line number, so it survives re-indexing of unchanged source.
//!
//! Ordering is lexicographic over segments. Every descendant of a path
//! therefore sorts directly after it, which lets ordered maps answer
//! "everything under `rt::task`" with a single range scan.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Path separator used in the textual form
pub const SEPARATOR: &str = "::";

/// Stable identifier of an interface-level entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(Vec<String>);

impl EntityId {
    /// Build an id from path segments
    ///
    /// # Errors
    /// Returns error if there are no segments or a segment is malformed
    pub fn new<I, S>(segments: I) -> Result<Self, IdError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(IdError::Empty);
        }
        for seg in &segments {
            validate_segment(seg)?;
        }
        Ok(Self(segments))
    }

    /// Path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Final segment, the entity's own name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.last().map_or("", String::as_str)
    }

    /// Enclosing path, if any
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Append a segment
    ///
    /// # Errors
    /// Returns error if the segment is malformed
    pub fn child(&self, segment: impl Into<String>) -> Result<Self, IdError> {
        let segment = segment.into();
        validate_segment(&segment)?;
        let mut next = self.0.clone();
        next.push(segment);
        Ok(Self(next))
    }

    /// True if `self` equals `other` or encloses it
    #[inline]
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len() && self.0[..] == other.0[..self.0.len()]
    }

    /// True if one path encloses the other (or they are equal)
    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Every proper ancestor, outermost first
    pub fn ancestors(&self) -> impl DoubleEndedIterator<Item = Self> + '_ {
        (1..self.0.len()).map(move |n| Self(self.0[..n].to_vec()))
    }
}

fn validate_segment(seg: &str) -> Result<(), IdError> {
    if seg.is_empty() {
        return Err(IdError::EmptySegment);
    }
    if seg.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err(IdError::InvalidSegment(seg.to_string()));
    }
    Ok(())
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(SEPARATOR))
    }
}

impl FromStr for EntityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split(SEPARATOR))
    }
}

impl serde::Serialize for EntityId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors from building or parsing ids
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// No segments at all
    #[error("entity id has no segments")]
    Empty,

    /// An empty segment (`a::::b`)
    #[error("entity id contains an empty segment")]
    EmptySegment,

    /// Segment with whitespace or a stray colon
    #[error("invalid entity id segment: {0:?}")]
    InvalidSegment(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[test]
    fn id_parse_and_display() {
        let spawn = id("rt::task::spawn");
        assert_eq!(spawn.depth(), 3);
        assert_eq!(spawn.name(), "spawn");
        assert_eq!(spawn.to_string(), "rt::task::spawn");
        assert_eq!(spawn.parent(), Some(id("rt::task")));
    }

    #[test]
    fn id_rejects_malformed() {
        assert_eq!("".parse::<EntityId>(), Err(IdError::EmptySegment));
        assert_eq!("a::::b".parse::<EntityId>(), Err(IdError::EmptySegment));
        assert!(matches!(
            "a::b c".parse::<EntityId>(),
            Err(IdError::InvalidSegment(_))
        ));
    }

    #[test]
    fn id_prefix_is_segment_wise() {
        assert!(id("rt::task").is_prefix_of(&id("rt::task::spawn")));
        assert!(!id("rt::ta").is_prefix_of(&id("rt::task")));
        assert!(id("rt::task::spawn").overlaps(&id("rt::task")));
        assert!(!id("rt::net").overlaps(&id("rt::task")));
    }

    #[test]
    fn id_ancestors_outermost_first() {
        let got: Vec<String> = id("a::b::c").ancestors().map(|a| a.to_string()).collect();
        assert_eq!(got, vec!["a", "a::b"]);
    }

    #[test]
    fn id_ancestors_reverse_innermost_first() {
        let got: Vec<String> = id("a::b::c").ancestors().rev().map(|a| a.to_string()).collect();
        assert_eq!(got, vec!["a::b", "a"]);
    }

    #[test]
    fn id_serde_as_string() {
        let json = serde_json::to_string(&id("a::b")).unwrap();
        assert_eq!(json, "\"a::b\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id("a::b"));
    }

    proptest! {
        #[test]
        fn descendants_sort_contiguously(
            base in proptest::collection::vec("[a-c]{1,2}", 1..3),
            tails in proptest::collection::vec(proptest::collection::vec("[a-c]{1,2}", 0..3), 1..8),
            others in proptest::collection::vec(proptest::collection::vec("[a-c]{1,2}", 1..4), 0..8),
        ) {
            let prefix = EntityId::new(base.clone()).unwrap();
            let mut all: Vec<EntityId> = tails
                .iter()
                .map(|t| EntityId::new(base.iter().chain(t.iter()).cloned()).unwrap())
                .chain(others.into_iter().map(|o| EntityId::new(o).unwrap()))
                .collect();
            all.sort();
            let first = all.iter().position(|i| prefix.is_prefix_of(i)).unwrap();
            let run = all[first..].iter().take_while(|i| prefix.is_prefix_of(i)).count();
            let total = all.iter().filter(|i| prefix.is_prefix_of(i)).count();
            prop_assert_eq!(run, total);
        }
    }
}
