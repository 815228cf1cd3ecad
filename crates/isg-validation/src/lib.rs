//! ISG Validation
//!
//! The gate a candidate must pass before it can be committed:
//!
//! 1. **Overlaying**: each new body is checked in memory by a pooled
//!    [`AnalysisSession`]; deletes that leave live references are rejected
//! 2. **Building**: the candidate is materialized into a [`ShadowWorkspace`]
//!    and built with a [`BuildTool`]
//! 3. **Testing**: only the tests that reach the change are run
//!
//! Nothing here writes to the repository. Results are appended to the
//! [`ValidationLog`](isg_graph::ValidationLog) and never mutated.
//!
//! # Example
//!
//! ```rust,ignore
//! let gate = ValidationGate::new(GateConfig::new(repo), Arc::clone(&store), log);
//! let result = gate.validate(&candidate).await?;
//! if !result.is_passed() {
//!     for d in result.errors() {
//!         eprintln!("{d}");
//!     }
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod build;
mod closure;
mod error;
mod gate;
mod phase;
mod session;
mod workspace;

pub use build::{BuildReport, BuildTool, CargoTool, ToolDiagnostic};
pub use closure::test_closure;
pub use error::{GateError, ValidationError};
pub use gate::{GateConfig, ValidationGate};
pub use phase::{is_allowed, PhaseTracker};
pub use session::{
    AnalysisSession, SessionDiagnostic, SessionFactory, SessionKey, SessionPool, SyntaxSession,
    SyntaxSessionFactory,
};
pub use workspace::{LineMap, LinkMode, Materializer, ShadowWorkspace};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{BuildTool, GateConfig, ValidationGate};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
