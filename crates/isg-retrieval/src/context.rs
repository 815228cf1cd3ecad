//! Context assembly under a size budget
//!
//! The assembler turns a [`RankedList`] into a bundle that fits a caller
//! budget. Seeds are mandatory. Remaining entries are packed greedily in
//! rank order, skipping any that do not fit and continuing with the rest.
//!
//! Items are laid out so the strongest entries sit at the edges of the
//! bundle (`s0, s2, s4, ..., s3, s1`), and the critical fact (the caller's
//! focus, or the top entry) is repeated at both ends.

use crate::engine::{Level, RankedEntry, RankedList};
use isg_core::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Size measure for budget accounting
#[derive(Clone, Default)]
pub enum SizeFn {
    #[default]
    Chars,
    /// Roughly four characters per token
    ApproxTokens,
    Custom(Arc<dyn Fn(&str) -> usize + Send + Sync>),
}

impl SizeFn {
    #[must_use]
    pub fn measure(&self, text: &str) -> usize {
        match self {
            Self::Chars => text.chars().count(),
            Self::ApproxTokens => text.chars().count().div_ceil(4),
            Self::Custom(f) => f(text),
        }
    }
}

impl Debug for SizeFn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chars => f.write_str("Chars"),
            Self::ApproxTokens => f.write_str("ApproxTokens"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Serializable choice of built-in size measure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMetric {
    #[default]
    Chars,
    ApproxTokens,
}

impl From<SizeMetric> for SizeFn {
    fn from(metric: SizeMetric) -> Self {
        match metric {
            SizeMetric::Chars => Self::Chars,
            SizeMetric::ApproxTokens => Self::ApproxTokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    pub budget: usize,
    /// Fact pinned to both ends of the bundle
    pub focus: Option<String>,
}

impl ContextRequest {
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self { budget, focus: None }
    }

    #[must_use]
    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus = Some(focus.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub id: EntityId,
    pub level: Level,
    pub score: f64,
    pub text: String,
    pub cost: usize,
}

/// Budgeted, ordered context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBundle {
    /// Items in layout order
    pub items: Vec<ContextItem>,
    /// Text repeated at the start and the end
    pub critical: Option<String>,
    pub budget: usize,
    pub used: usize,
    /// Ranked entries that did not fit, in rank order
    pub dropped: Vec<EntityId>,
    /// Mandatory seeds alone exceeded the budget
    pub over_budget: bool,
}

impl ContextBundle {
    /// Bundle text: critical fact, items, critical fact again
    #[must_use]
    pub fn render(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.items.len() + 2);
        if let Some(critical) = &self.critical {
            parts.push(critical);
        }
        parts.extend(self.items.iter().map(|i| i.text.as_str()));
        if let Some(critical) = &self.critical {
            parts.push(critical);
        }
        parts.join("\n\n")
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.items.iter().map(|i| &i.id)
    }

    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.ids().any(|i| i == id)
    }

    /// Fraction of `required` present in the bundle, 1.0 when nothing is required
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coverage(&self, required: &[EntityId]) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let present = required.iter().filter(|id| self.contains(id)).count();
        present as f64 / required.len() as f64
    }
}

/// Packs ranked entries into a [`ContextBundle`]
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    size: SizeFn,
}

impl ContextAssembler {
    #[must_use]
    pub fn new(size: SizeFn) -> Self {
        Self { size }
    }

    pub fn pack(&self, ranked: &RankedList, request: &ContextRequest) -> ContextBundle {
        let mut chosen: Vec<ContextItem> = Vec::new();
        let mut dropped = Vec::new();

        let critical = request
            .focus
            .clone()
            .or_else(|| ranked.entries.first().map(render_entry));
        // the critical text is charged once per end it appears on
        let mut used = match (&request.focus, &critical) {
            (Some(_), Some(text)) => 2 * self.size.measure(text),
            (None, Some(text)) => self.size.measure(text),
            _ => 0,
        };

        for (rank, entry) in ranked.entries.iter().enumerate() {
            let text = render_entry(entry);
            let cost = self.size.measure(&text);
            let mandatory = entry.level == Level::Seed || (rank == 0 && request.focus.is_none());
            if mandatory || used + cost <= request.budget {
                used += cost;
                chosen.push(ContextItem {
                    id: entry.entity.id.clone(),
                    level: entry.level,
                    score: entry.score,
                    text,
                    cost,
                });
            } else {
                dropped.push(entry.entity.id.clone());
            }
        }

        // without a focus, the top item itself is the critical fact at the
        // start, so only its trailing copy is rendered separately
        let items = edge_weighted(chosen);
        let (critical, items) = match request.focus {
            Some(_) => (critical, items),
            None => (None, with_trailing_copy(items)),
        };

        ContextBundle {
            items,
            critical,
            budget: request.budget,
            used,
            dropped,
            over_budget: used > request.budget,
        }
    }
}

/// `[s0, s1, s2, s3, s4]` -> `[s0, s2, s4, s3, s1]`
fn edge_weighted<T>(ranked: Vec<T>) -> Vec<T> {
    let mut front = Vec::with_capacity(ranked.len());
    let mut back = Vec::with_capacity(ranked.len() / 2);
    for (i, item) in ranked.into_iter().enumerate() {
        if i % 2 == 0 {
            front.push(item);
        } else {
            back.push(item);
        }
    }
    front.extend(back.into_iter().rev());
    front
}

fn with_trailing_copy(mut items: Vec<ContextItem>) -> Vec<ContextItem> {
    if items.len() > 1 {
        if let Some(first) = items.first().cloned() {
            items.push(first);
        }
    }
    items
}

fn render_entry(entry: &RankedEntry) -> String {
    let entity = &entry.entity;
    let mut text = format!("// {} [{}, {}]\n", entity.id, entity.kind, entry.level);
    if let Some(summary) = &entity.summary {
        for line in summary.lines() {
            text.push_str("/// ");
            text.push_str(line);
            text.push('\n');
        }
    }
    match entity.current_code.as_deref() {
        Some(code) => text.push_str(code),
        None => text.push_str(&entity.declaration()),
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use isg_core::{Entity, EntityKind};
    use pretty_assertions::assert_eq;

    fn entry(name: &str, level: Level, code: &str) -> RankedEntry {
        let id: EntityId = format!("m::{name}").parse().unwrap();
        RankedEntry {
            entity: Entity::new(id, EntityKind::Function).with_code(code),
            level,
            hop: None,
            graph_proximity: 0.0,
            vector_similarity: None,
            score: 0.0,
        }
    }

    fn list(entries: Vec<RankedEntry>) -> RankedList {
        RankedList {
            entries,
            ranked: true,
            ..RankedList::default()
        }
    }

    fn names(bundle: &ContextBundle) -> Vec<String> {
        bundle.ids().map(|id| id.name().to_string()).collect()
    }

    #[test]
    fn layout_puts_strongest_at_edges() {
        assert_eq!(edge_weighted(vec![0, 1, 2, 3, 4]), vec![0, 2, 4, 3, 1]);
        assert_eq!(edge_weighted(vec![0, 1, 2, 3]), vec![0, 2, 3, 1]);
        assert_eq!(edge_weighted(Vec::<u8>::new()), Vec::<u8>::new());
    }

    #[test]
    fn oversized_entry_is_skipped_not_fatal() {
        let ranked = list(vec![
            entry("seed", Level::Seed, "s"),
            entry("big", Level::Interface, &"x".repeat(500)),
            entry("small", Level::Interface, "y"),
        ]);
        let bundle = ContextAssembler::default().pack(&ranked, &ContextRequest::new(200).with_focus("F"));
        assert_eq!(names(&bundle), vec!["seed", "small"]);
        assert_eq!(bundle.dropped.len(), 1);
        assert!(bundle.used <= bundle.budget);
        assert!(!bundle.over_budget);
    }

    #[test]
    fn seeds_exceed_budget_flagged() {
        let ranked = list(vec![
            entry("seed", Level::Seed, &"s".repeat(100)),
            entry("next", Level::Interface, "n"),
        ]);
        let bundle = ContextAssembler::default().pack(&ranked, &ContextRequest::new(10).with_focus("F"));
        assert_eq!(names(&bundle), vec!["seed"]);
        assert!(bundle.over_budget);
    }

    #[test]
    fn focus_is_repeated_at_both_ends() {
        let ranked = list(vec![entry("a", Level::Seed, "a"), entry("b", Level::Interface, "b")]);
        let rendered = ContextAssembler::default()
            .pack(&ranked, &ContextRequest::new(1000).with_focus("spawn must be Send"))
            .render();
        assert!(rendered.starts_with("spawn must be Send"));
        assert!(rendered.ends_with("spawn must be Send"));
    }

    #[test]
    fn top_item_repeated_without_focus() {
        let ranked = list(vec![
            entry("a", Level::Seed, "a"),
            entry("b", Level::Interface, "b"),
            entry("c", Level::Interface, "c"),
        ]);
        let bundle = ContextAssembler::default().pack(&ranked, &ContextRequest::new(1000));
        assert_eq!(names(&bundle), vec!["a", "c", "b", "a"]);
        assert!(bundle.critical.is_none());
    }

    #[test]
    fn coverage_counts_required_present() {
        let ranked = list(vec![entry("a", Level::Seed, "a"), entry("b", Level::Interface, &"b".repeat(90))]);
        let bundle = ContextAssembler::default().pack(&ranked, &ContextRequest::new(60));
        let required = ranked.required();
        assert!((bundle.coverage(&required) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn approx_tokens_rounds_up() {
        assert_eq!(SizeFn::ApproxTokens.measure("abcde"), 2);
        assert_eq!(SizeFn::Custom(Arc::new(|s: &str| s.len() * 10)).measure("ab"), 20);
    }
}
