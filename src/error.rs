//! Error taxonomy for disambiguation runs.
//!
//! Only `BackboneUnavailable` aborts a run; every other kind is absorbed
//! into the run statistics and the cascade continues with the next stage.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Fatal precondition: the reference backbone is empty or inaccessible
    /// at run start. No writes have happened when this is raised.
    #[error("backbone unavailable or empty: {0}")]
    BackboneUnavailable(String),

    /// A matcher's backing engine cannot be invoked (process missing,
    /// table absent, query feature unsupported).
    #[error("matcher unavailable: {0}")]
    MatcherUnavailable(String),

    /// A single batch call to the external matching engine exceeded its
    /// bound. The matcher is retried fresh on the next batch.
    #[error("engine invocation exceeded {timeout_secs}s")]
    EngineTimeout { timeout_secs: u64 },

    /// Report output path collides with a source database.
    #[error("unsafe output path {0}: collides with a source database")]
    UnsafeOutputPath(PathBuf),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ResolveError {
    /// Whether this error aborts the whole run. Everything except the
    /// backbone precondition degrades to statistics.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResolveError::BackboneUnavailable(_))
    }
}
