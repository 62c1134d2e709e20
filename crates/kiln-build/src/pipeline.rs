//! Orchestration pipeline:
//! detect -> resolve -> build -> stage, with an ordered log of every state.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use kiln_targets::{forced_off_with_cpu, CpuFeatures, PlatformDescriptor};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{PipelineError, StageError};
use crate::invoke::{BuildBackend, CancelToken};
use crate::report::OrchestrationReport;
use crate::resolve::{resolve, FlagRequest, FlagRequests};
use crate::stage::{stage, StageOptions};

/// States of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    Detecting,
    Resolving,
    Building,
    Staging,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Detecting => "detecting",
            RunState::Resolving => "resolving",
            RunState::Building => "building",
            RunState::Staging => "staging",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.pad(name)
    }
}

/// One entry of the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub state: RunState,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    pub note: Option<String>,
}

/// Ordered record of the states a run passed through.
#[derive(Debug, Clone, Serialize)]
pub struct RunLog {
    entries: Vec<LogEntry>,
    #[serde(skip)]
    started: Instant,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLog {
    fn new() -> Self {
        Self {
            entries: vec![LogEntry {
                state: RunState::Idle,
                elapsed_ms: 0,
                note: None,
            }],
            started: Instant::now(),
        }
    }

    fn enter(&mut self, state: RunState, note: Option<String>) {
        info!(target: "kiln::pipeline", %state, note = note.as_deref().unwrap_or(""), "state");
        self.entries.push(LogEntry {
            state,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            note,
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// The sequence of states, in order.
    pub fn states(&self) -> Vec<RunState> {
        self.entries.iter().map(|e| e.state).collect()
    }

    /// The most recent state.
    pub fn current(&self) -> RunState {
        self.entries.last().map_or(RunState::Idle, |e| e.state)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Configuration for one orchestration run.
pub struct PipelineConfig {
    /// Target platform.
    pub platform: PlatformDescriptor,
    /// CPU snapshot narrowing the forced-off set, if probing was requested.
    pub cpu: Option<CpuFeatures>,
    /// Raw flag requests from every mechanism.
    pub requests: Vec<FlagRequest>,
    /// Name of the build target in the vendored library.
    pub target: String,
    /// Install destinations, in order.
    pub destinations: Vec<PathBuf>,
    pub stage: StageOptions,
}

/// Output of a run: the report, plus the error if the run failed.
pub struct PipelineOutput {
    pub report: OrchestrationReport,
    pub error: Option<PipelineError>,
}

/// Run the whole pipeline once.
///
/// The backend is invoked at most once; a build failure is never retried.
pub fn orchestrate(
    config: PipelineConfig,
    backend: &dyn BuildBackend,
    cancel: &CancelToken,
) -> PipelineOutput {
    let mut log = RunLog::new();
    let mut report = OrchestrationReport::new(config.platform.clone(), config.target.clone());

    // Detecting
    log.enter(RunState::Detecting, Some(config.platform.name()));
    let forced = forced_off_with_cpu(&config.platform, config.cpu.as_ref());
    report.forced_off = forced.clone();

    // Resolving
    log.enter(RunState::Resolving, None);
    let requests = match FlagRequests::collect(&config.requests) {
        Ok(r) => r,
        Err(e) => return fail(log, report, PipelineError::Resolving(e)),
    };
    let build_config = resolve(&requests, &forced);
    report.configuration = Some(build_config.clone());

    // Building
    log.enter(RunState::Building, Some(backend.name().to_string()));
    let artifacts = match backend.build(&build_config, &config.target, cancel) {
        Ok(set) => set,
        Err(e) => return fail(log, report, PipelineError::Building(e)),
    };
    report.artifacts = Some(artifacts.clone());

    // Staging
    log.enter(
        RunState::Staging,
        Some(format!("{} destination(s)", config.destinations.len())),
    );
    match stage(&artifacts, &config.destinations, &config.stage, cancel) {
        Ok(staging) => {
            report.staging_failure = staging.partial_failure();
            if let Some(ref failure) = report.staging_failure {
                warn!(target: "kiln::pipeline", "{}", failure.to_string().trim_end());
            }
            report.staging = Some(staging);
        }
        Err(e) => {
            if let StageError::NothingStaged(ref failure) = e {
                report.staging_failure = Some(failure.clone());
            }
            return fail(log, report, PipelineError::Staging(e));
        }
    }

    log.enter(RunState::Done, None);
    report.finish(log);
    PipelineOutput {
        report,
        error: None,
    }
}

fn fail(mut log: RunLog, mut report: OrchestrationReport, err: PipelineError) -> PipelineOutput {
    let root = error_chain(&err);
    error!(target: "kiln::pipeline", stage = %log.current(), error = %root, "run failed");
    log.enter(RunState::Failed, Some(root.clone()));
    report.error = Some(root);
    report.finish(log);
    PipelineOutput {
        report,
        error: Some(err),
    }
}

/// Render an error and its sources as `outer: inner: root`.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}
