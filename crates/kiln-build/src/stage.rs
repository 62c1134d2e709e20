//! Artifact staging: copy every artifact into every install destination.
//!
//! Destinations are independent. A failure at one never stops the others, and
//! copies overwrite unconditionally so a repeated run converges to the same
//! tree. At most `workers` destinations are processed at once.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactSet, ContentHash};
use crate::error::StageError;
use crate::invoke::CancelToken;

/// Default number of destinations staged concurrently.
pub const DEFAULT_WORKERS: usize = 4;

/// Options controlling a staging run.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Upper bound on concurrently staged destinations (at least 1).
    pub workers: usize,
    /// Re-hash each copied file and compare with the artifact digest.
    pub verify: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            verify: true,
        }
    }
}

/// One copy that did not make it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyFailure {
    /// File name of the artifact.
    pub artifact: PathBuf,
    pub destination: PathBuf,
    pub reason: String,
}

/// Result of staging into a single destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationReport {
    pub destination: PathBuf,
    /// Files written (or found already in place), in artifact order.
    pub staged: Vec<PathBuf>,
    pub failures: Vec<CopyFailure>,
    /// Not attempted because cancellation was requested first.
    pub skipped: bool,
}

impl DestinationReport {
    pub fn is_complete(&self) -> bool {
        !self.skipped && self.failures.is_empty()
    }

    fn skipped(destination: PathBuf) -> Self {
        Self {
            destination,
            staged: Vec::new(),
            failures: Vec::new(),
            skipped: true,
        }
    }
}

/// An artifact that reached no destination at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrandedArtifact {
    pub artifact: PathBuf,
    pub failed_destinations: Vec<PathBuf>,
}

/// Staging finished with failed copies; names what failed and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialStagingFailure {
    /// Every failed copy, in destination order.
    pub failures: Vec<CopyFailure>,
    /// Artifacts that did not land anywhere.
    pub stranded: Vec<StrandedArtifact>,
    /// Destinations skipped after a cancel request.
    pub skipped: Vec<PathBuf>,
}

impl PartialStagingFailure {
    /// Distinct destinations with at least one failed copy, in order.
    pub fn failed_destinations(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        for f in &self.failures {
            if !out.contains(&f.destination) {
                out.push(f.destination.clone());
            }
        }
        out
    }

    /// Whether the only shortfall is destinations skipped after a cancel.
    pub fn is_cancellation_only(&self) -> bool {
        self.failures.is_empty() && !self.skipped.is_empty()
    }

    /// One-line form: each failed destination and its first reason.
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .failed_destinations()
            .iter()
            .filter_map(|dest| {
                let first = self.failures.iter().find(|f| &f.destination == dest)?;
                Some(format!("{}: {}", dest.display(), first.reason))
            })
            .collect();
        if !self.skipped.is_empty() {
            parts.push(format!("{} destination(s) skipped", self.skipped.len()));
        }
        parts.join("; ")
    }
}

impl fmt::Display for PartialStagingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "staging incomplete:")?;
        for failure in &self.failures {
            writeln!(
                f,
                "  {} -> {}: {}",
                failure.artifact.display(),
                failure.destination.display(),
                failure.reason
            )?;
        }
        for s in &self.stranded {
            writeln!(f, "  {} was not staged anywhere", s.artifact.display())?;
        }
        for d in &self.skipped {
            writeln!(f, "  {} skipped (cancelled)", d.display())?;
        }
        Ok(())
    }
}

/// Outcome of a staging run, one entry per distinct destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagingReport {
    pub destinations: Vec<DestinationReport>,
    #[serde(skip)]
    artifacts: Vec<PathBuf>,
}

impl StagingReport {
    /// Whether every artifact reached every destination.
    pub fn is_complete(&self) -> bool {
        self.destinations.iter().all(DestinationReport::is_complete)
    }

    /// Whether any artifact reached any destination.
    pub fn any_staged(&self) -> bool {
        self.destinations.iter().any(|d| !d.staged.is_empty())
    }

    /// Summary of what failed, or `None` when staging was complete.
    pub fn partial_failure(&self) -> Option<PartialStagingFailure> {
        if self.is_complete() {
            return None;
        }
        let failures: Vec<CopyFailure> = self
            .destinations
            .iter()
            .flat_map(|d| d.failures.iter().cloned())
            .collect();
        let skipped: Vec<PathBuf> = self
            .destinations
            .iter()
            .filter(|d| d.skipped)
            .map(|d| d.destination.clone())
            .collect();

        let stranded = self
            .artifacts
            .iter()
            .filter(|name| {
                !self
                    .destinations
                    .iter()
                    .any(|d| d.staged.iter().any(|p| p.file_name() == Some(name.as_os_str())))
            })
            .map(|name| StrandedArtifact {
                artifact: name.clone(),
                failed_destinations: failures
                    .iter()
                    .filter(|f| &f.artifact == name)
                    .map(|f| f.destination.clone())
                    .collect(),
            })
            .collect();

        Some(PartialStagingFailure {
            failures,
            stranded,
            skipped,
        })
    }
}

/// Copy every artifact in `set` to every destination.
///
/// Returns `Err` only when nothing could be staged at all (or there was
/// nowhere to stage to). Partial failures are reported through
/// [`StagingReport::partial_failure`].
pub fn stage(
    set: &ArtifactSet,
    destinations: &[PathBuf],
    options: &StageOptions,
    cancel: &CancelToken,
) -> Result<StagingReport, StageError> {
    stage_observed(set, destinations, options, cancel, &|_| {})
}

/// [`stage`], calling `on_done` from the worker after each destination.
pub(crate) fn stage_observed(
    set: &ArtifactSet,
    destinations: &[PathBuf],
    options: &StageOptions,
    cancel: &CancelToken,
    on_done: &(dyn Fn(&DestinationReport) + Sync),
) -> Result<StagingReport, StageError> {
    let destinations = dedup_destinations(destinations);
    if destinations.is_empty() {
        return Err(StageError::NoDestinations);
    }

    let workers = options.workers.clamp(1, destinations.len());
    info!(
        target: "kiln::stage",
        artifacts = set.len(),
        destinations = destinations.len(),
        workers,
        "staging artifacts"
    );

    let next = AtomicUsize::new(0);
    let mut slots: Vec<Option<DestinationReport>> = vec![None; destinations.len()];

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let next = &next;
                let destinations = &destinations;
                s.spawn(move || {
                    let mut done = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(dest) = destinations.get(i) else {
                            break;
                        };
                        // In-flight copies finish; nothing new starts after cancel.
                        let report = if cancel.is_cancelled() {
                            DestinationReport::skipped(dest.clone())
                        } else {
                            stage_destination(set, dest, options.verify)
                        };
                        on_done(&report);
                        done.push((i, report));
                    }
                    done
                })
            })
            .collect();

        for handle in handles {
            if let Ok(done) = handle.join() {
                for (i, report) in done {
                    slots[i] = Some(report);
                }
            }
        }
    });

    let reports: Vec<DestinationReport> = slots
        .into_iter()
        .zip(destinations.iter())
        .map(|(slot, dest)| slot.unwrap_or_else(|| DestinationReport::skipped(dest.clone())))
        .collect();

    let report = StagingReport {
        destinations: reports,
        artifacts: set.iter().map(|a| PathBuf::from(a.file_name())).collect(),
    };

    if !report.any_staged() {
        if report.destinations.iter().all(|d| d.skipped) {
            return Err(StageError::Cancelled);
        }
        if let Some(failure) = report.partial_failure() {
            return Err(StageError::NothingStaged(failure));
        }
    }

    if let Some(failure) = report.partial_failure() {
        warn!(
            target: "kiln::stage",
            failed = ?failure.failed_destinations(),
            stranded = failure.stranded.len(),
            skipped = failure.skipped.len(),
            "staging incomplete"
        );
    }
    Ok(report)
}

fn dedup_destinations(destinations: &[PathBuf]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::with_capacity(destinations.len());
    for d in destinations {
        if out.contains(d) {
            debug!(
                target: "kiln::stage",
                destination = %d.display(),
                "duplicate destination ignored"
            );
        } else {
            out.push(d.clone());
        }
    }
    out
}

fn stage_destination(set: &ArtifactSet, dest: &Path, verify: bool) -> DestinationReport {
    let mut report = DestinationReport {
        destination: dest.to_path_buf(),
        staged: Vec::new(),
        failures: Vec::new(),
        skipped: false,
    };

    if let Err(e) = fs::create_dir_all(dest) {
        for artifact in set.iter() {
            report.failures.push(CopyFailure {
                artifact: PathBuf::from(artifact.file_name()),
                destination: dest.to_path_buf(),
                reason: format!("creating directory: {e}"),
            });
        }
        warn!(
            target: "kiln::stage",
            destination = %dest.display(),
            error = %e,
            "destination unusable"
        );
        return report;
    }

    for artifact in set.iter() {
        match copy_artifact(artifact, dest, verify) {
            Ok(path) => report.staged.push(path),
            Err(reason) => {
                warn!(
                    target: "kiln::stage",
                    artifact = %artifact.path.display(),
                    destination = %dest.display(),
                    %reason,
                    "copy failed"
                );
                report.failures.push(CopyFailure {
                    artifact: PathBuf::from(artifact.file_name()),
                    destination: dest.to_path_buf(),
                    reason,
                });
            }
        }
    }
    debug!(
        target: "kiln::stage",
        destination = %dest.display(),
        staged = report.staged.len(),
        failed = report.failures.len(),
        "destination done"
    );
    report
}

fn copy_artifact(artifact: &Artifact, dest: &Path, verify: bool) -> Result<PathBuf, String> {
    let target = dest.join(artifact.file_name());
    if is_same_file(&artifact.path, &target) {
        return Ok(target);
    }
    fs::copy(&artifact.path, &target).map_err(|e| e.to_string())?;
    if verify {
        let digest =
            ContentHash::of_file(&target).map_err(|e| format!("verifying copy: {e}"))?;
        if digest != artifact.digest {
            return Err(format!(
                "digest mismatch after copy (expected {}, found {digest})",
                artifact.digest
            ));
        }
    }
    Ok(target)
}

// Copying a file onto itself would truncate it.
fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
