//! `kiln stage`: copy an existing build's artifacts without rebuilding.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kiln_build::{stage, ArtifactSet, CancelToken, StagingReport};

use super::{destinations, Outcome, Project, ReportFormat};

/// Stage the artifacts listed in an artifact manifest.
pub fn run(
    project: &Project,
    cwd: &Path,
    manifest: Option<&Path>,
    dests: &[PathBuf],
    workers: Option<usize>,
    format: ReportFormat,
    cancel: &CancelToken,
) -> Result<Outcome> {
    let manifest_path = match manifest {
        Some(path) => kiln_build::rebase(cwd, path),
        None => project.manifest.toolchain(&project.dir).manifest_path(),
    };
    let artifacts = ArtifactSet::load_manifest(&manifest_path)
        .context("loading artifacts (run `kiln build` first?)")?;
    let options = project.manifest.stage_options(workers);
    let destinations = destinations(project, cwd, dests);

    let report = stage(&artifacts, &destinations, &options, cancel)
        .with_context(|| format!("staging {} artifact(s)", artifacts.len()))?;
    print_staging(&report, format)?;

    let failure = report.partial_failure();
    if let Some(ref failure) = failure {
        eprint!("warning: {failure}");
    }
    Ok(Outcome::of_staging(failure.as_ref()))
}

fn print_staging(report: &StagingReport, format: ReportFormat) -> Result<()> {
    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        ReportFormat::Text => {
            for d in &report.destinations {
                if d.skipped {
                    println!("{}: skipped", d.destination.display());
                    continue;
                }
                println!(
                    "{}: {} staged, {} failed",
                    d.destination.display(),
                    d.staged.len(),
                    d.failures.len()
                );
            }
        }
    }
    Ok(())
}
