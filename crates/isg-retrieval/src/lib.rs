//! ISG Retrieval
//!
//! Hybrid retrieval and context assembly over the interface graph.
//!
//! - [`RetrievalEngine`]: bounded graph expansion from seed entities fused
//!   with vector similarity, deduplicated and hard-capped
//! - [`ContextAssembler`]: packs a [`RankedList`] into a [`ContextBundle`]
//!   under a caller-supplied size budget
//!
//! Both work against any [`GraphRead`](isg_graph::GraphRead), so the same
//! retrieval runs over the current graph or a candidate's projected future.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = RetrievalEngine::new(RetrievalConfig::default());
//! let ranked = engine.retrieve(&store.snapshot(), &RetrievalRequest::new(seeds, 2, 8))?;
//!
//! let bundle = ContextAssembler::new(SizeFn::ApproxTokens)
//!     .pack(&ranked, &ContextRequest::new(4_000).with_focus("spawn requires F: Send"));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod context;
mod engine;
mod error;
mod traversal;
mod vector;

pub use context::{ContextAssembler, ContextBundle, ContextItem, ContextRequest, SizeFn, SizeMetric};
pub use engine::{
    Degradation, Level, RankedEntry, RankedList, RetrievalConfig, RetrievalEngine, RetrievalFilters,
    RetrievalRequest,
};
pub use error::RetrievalError;
pub use vector::{ExactVectorIndex, Metric, VectorHit, VectorIndex};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        ContextAssembler, ContextBundle, ContextRequest, RankedList, RetrievalEngine, RetrievalRequest,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
