//! Orchestration report aggregating all pipeline stages.

use std::fmt;

use kiln_targets::{ForcedOff, PlatformDescriptor};
use serde::Serialize;

use crate::artifact::ArtifactSet;
use crate::pipeline::{RunLog, RunState};
use crate::resolve::BuildConfiguration;
use crate::stage::{PartialStagingFailure, StagingReport};

/// Summary of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    /// Terminal state (`done` or `failed`).
    pub state: RunState,
    /// Target platform.
    pub platform: PlatformDescriptor,
    /// Name of the build target.
    pub target: String,
    /// Total run duration in milliseconds.
    pub duration_ms: u64,
    /// Every state the run passed through.
    pub log: RunLog,
    pub forced_off: ForcedOff,
    /// Resolved configuration (absent if resolution failed).
    pub configuration: Option<BuildConfiguration>,
    /// Built artifacts (absent if the build failed).
    pub artifacts: Option<ArtifactSet>,
    pub staging: Option<StagingReport>,
    /// What staging left undone: failed copies, stranded artifacts and
    /// skipped destinations. Set on a partial run and on a run where
    /// nothing could be staged.
    pub staging_failure: Option<PartialStagingFailure>,
    /// Rendered error chain of a failed run.
    pub error: Option<String>,
}

impl OrchestrationReport {
    pub(crate) fn new(platform: PlatformDescriptor, target: String) -> Self {
        Self {
            state: RunState::Idle,
            platform,
            target,
            duration_ms: 0,
            log: RunLog::default(),
            forced_off: ForcedOff::empty(),
            configuration: None,
            artifacts: None,
            staging: None,
            staging_failure: None,
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, log: RunLog) {
        self.state = log.current();
        self.duration_ms = log.elapsed_ms();
        self.log = log;
    }

    /// Whether the run ended in `Done` with every copy in place.
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Done && self.staging_failure.is_none()
    }
}

impl fmt::Display for OrchestrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Build Report ===")?;
        writeln!(f, "Platform: {}", self.platform)?;
        writeln!(f, "Target: {}", self.target)?;
        writeln!(f, "Result: {}", self.state)?;
        writeln!(f, "Duration: {} ms", self.duration_ms)?;

        writeln!(f)?;
        writeln!(f, "--- States ---")?;
        for entry in self.log.entries() {
            match &entry.note {
                Some(note) => {
                    writeln!(f, "  {:>6} ms  {:<10} {note}", entry.elapsed_ms, entry.state)?
                }
                None => writeln!(f, "  {:>6} ms  {}", entry.elapsed_ms, entry.state)?,
            }
        }

        if !self.forced_off.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Forced off ({}) ---", self.forced_off.len())?;
            for flag in self.forced_off.flags() {
                if let Some(reason) = self.forced_off.reason(flag) {
                    writeln!(f, "  {flag:<6} {reason}")?;
                }
            }
        }

        if let Some(ref config) = self.configuration {
            writeln!(f)?;
            writeln!(f, "--- Configuration ---")?;
            write!(f, "{config}")?;
        }

        if let Some(ref artifacts) = self.artifacts {
            writeln!(f)?;
            writeln!(f, "--- Artifacts ({}) ---", artifacts.len())?;
            for a in artifacts.iter() {
                writeln!(
                    f,
                    "  {} ({} bytes, sha256:{})",
                    a.path.display(),
                    a.size_bytes,
                    a.digest
                )?;
            }
        }

        if let Some(ref staging) = self.staging {
            writeln!(f)?;
            writeln!(
                f,
                "--- Staging: {} ---",
                if staging.is_complete() { "COMPLETE" } else { "PARTIAL" }
            )?;
            for d in &staging.destinations {
                let status = if d.skipped {
                    "skipped".to_string()
                } else {
                    format!("{} staged, {} failed", d.staged.len(), d.failures.len())
                };
                writeln!(f, "  {}: {status}", d.destination.display())?;
            }
        }

        if let Some(ref failure) = self.staging_failure {
            writeln!(f)?;
            write!(f, "{failure}")?;
        }

        if let Some(ref error) = self.error {
            writeln!(f)?;
            writeln!(f, "error: {error}")?;
        }

        Ok(())
    }
}
