//! Retrieval errors
//!
//! Only requests that cannot produce any result fail; everything else
//! degrades and is reported on the [`RankedList`](crate::RankedList).

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrievalError {
    #[error("retrieval request has no seeds")]
    NoSeeds,

    #[error("none of the {0} seed(s) exist in the graph")]
    AllSeedsUnknown(usize),

    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),
}
