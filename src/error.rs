//! Typed failure kinds for the build pipeline.
//!
//! Most errors in this crate travel as `anyhow::Error` with call-site
//! context. The kinds below are the ones callers (and tests) need to
//! distinguish programmatically; they sit at the root of the chain so a
//! `downcast_ref::<BuildError>()` recovers them.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// The environment cannot run a build at all. No cleanup is owed
    /// because nothing was touched yet.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A mount or unmount operation failed outside of cleanup.
    #[error("mount operation failed for '{}': {detail}", .target.display())]
    Mount { target: PathBuf, detail: String },

    /// A named stage aborted the run.
    #[error("stage '{stage}' failed: {detail}")]
    Stage { stage: String, detail: String },

    /// The compressed root image came out below the configured floor,
    /// which almost always means the staging tree was empty or truncated.
    #[error("artifact too small: {actual} bytes (floor is {floor} bytes)")]
    ArtifactSize { actual: u64, floor: u64 },

    /// Mounts survived the forced unwind. Destructive filesystem steps
    /// must not run while these exist.
    #[error("{count} mount(s) still active under '{}' after unwind", .root.display())]
    ResidualMounts { root: PathBuf, count: usize },
}

impl BuildError {
    pub fn stage(stage: &str, detail: impl Into<String>) -> Self {
        BuildError::Stage {
            stage: stage.to_string(),
            detail: detail.into(),
        }
    }

    pub fn precondition(detail: impl Into<String>) -> Self {
        BuildError::Precondition(detail.into())
    }
}
