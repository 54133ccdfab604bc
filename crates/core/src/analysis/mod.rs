//! Reachability analysis from candidate configuration keys to sink setters.
//!
//! Pipeline per key:
//! - locate NUL-terminated occurrences of the key in the binary's data
//! - resolve code references to each occurrence (directly or via a data pointer)
//! - expand the call graph from the referencing function
//! - depth-first search for a sink, noting unsafe digest calls along the way
//! - on success, mine the referencing function for sibling keys

pub mod callgraph;
pub mod engine;
pub mod heuristic;
pub mod results;
pub mod safety;
pub mod search;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

pub use callgraph::CallGraph;
pub use engine::{AnalyzerState, Engine};
pub use heuristic::ParameterDiscoverer;
pub use results::{render_path, KeywordMap, RunSummary, ShareResult, UNKNOWN_KEY};
pub use safety::{ArgumentReader, SafetyChecker};
pub use search::{SafeSet, SearchOrigin, SinkSearch};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("analysis cancelled")]
    Cancelled,
    #[error("program facts provide no register value propagation")]
    NoRegisterPropagation,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keyword map JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid identifier pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Cooperative cancellation flag, polled at loop boundaries.
///
/// Clones share the flag, so a host can keep one handle and hand another to the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
