//! Pipeline errors.

use std::path::PathBuf;

use kiln_targets::CapabilityFlag;
use thiserror::Error;

use crate::resolve::RequestSource;
use crate::stage::PartialStagingFailure;

/// Errors raised while turning flag requests into a configuration.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("conflicting requests for '{flag}' from {source_kind}: both on and off")]
    ConfigurationConflict {
        flag: CapabilityFlag,
        source_kind: RequestSource,
    },

    #[error("invalid flag request '{request}': {reason}")]
    InvalidFlagRequest { request: String, reason: String },
}

/// Errors raised by a build backend.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("toolchain exited with {}", describe_status(.status))]
    BuildFailure {
        /// Exit code, `None` when the process was killed by a signal or never ran.
        status: Option<i32>,
        /// Captured stdout and stderr, verbatim.
        diagnostics: String,
    },

    #[error("build cancelled")]
    Cancelled,

    #[error("artifact manifest {}: {reason}", path.display())]
    ManifestInvalid { path: PathBuf, reason: String },
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {code}"),
        None => "no exit status".to_string(),
    }
}

/// Errors raised by the artifact stager.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("no artifact could be staged to any destination ({})", .0.summary())]
    NothingStaged(PartialStagingFailure),

    #[error("no install destinations configured")]
    NoDestinations,

    #[error("staging cancelled before any destination completed")]
    Cancelled,
}

/// An error from one pipeline stage, tagged with the stage that raised it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("resolving failed")]
    Resolving(#[source] ResolveError),

    #[error("building failed")]
    Building(#[source] BuildError),

    #[error("staging failed")]
    Staging(#[source] StageError),
}

impl PipelineError {
    /// Whether the failure stems from a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Building(BuildError::Cancelled)
                | PipelineError::Staging(StageError::Cancelled)
        )
    }
}
