//! CLI command implementations.

pub mod build;
pub mod clean;
pub mod doctor;
pub mod resolve;
pub mod stage;
pub mod target;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kiln_build::{env_flag_requests, FlagRequest, PartialStagingFailure, RequestSource};
use kiln_targets::{CpuFeatures, PlatformDescriptor};
use tracing::debug;

use crate::manifest::KilnManifest;

/// How a command that completed without error finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Finished, but at least one copy did not reach its destination.
    PartialStaging,
    /// Staging stopped on a cancel request after some destinations finished.
    Cancelled,
}

impl Outcome {
    /// Outcome of a staging run that completed with `failure` left undone.
    ///
    /// Any failed copy counts as partial staging, even when a cancel request
    /// also skipped destinations.
    pub fn of_staging(failure: Option<&PartialStagingFailure>) -> Self {
        match failure {
            None => Outcome::Success,
            Some(f) if f.is_cancellation_only() => Outcome::Cancelled,
            Some(_) => Outcome::PartialStaging,
        }
    }
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// The project a command runs in: its manifest and root directory.
pub struct Project {
    pub dir: PathBuf,
    pub manifest: KilnManifest,
    /// Whether a `kiln.toml` was actually found.
    pub found: bool,
}

impl Project {
    /// Load `kiln.toml` from `cwd` upward, or fall back to defaults rooted at `cwd`.
    pub fn discover(cwd: &Path) -> Result<Self> {
        match KilnManifest::find_and_load(cwd)? {
            Some((manifest, dir)) => {
                debug!(target: "kiln::cli", dir = %dir.display(), "loaded kiln.toml");
                Ok(Self {
                    dir,
                    manifest,
                    found: true,
                })
            }
            None => {
                debug!(target: "kiln::cli", "no kiln.toml found, using defaults");
                Ok(Self {
                    dir: cwd.to_path_buf(),
                    manifest: KilnManifest::default(),
                    found: false,
                })
            }
        }
    }

    /// Platform from the command line, else the manifest default, else the host.
    pub fn platform(&self, cli: Option<&str>) -> Result<PlatformDescriptor> {
        let name = cli.unwrap_or_else(|| self.manifest.default_platform());
        PlatformDescriptor::resolve(name).with_context(|| format!("selecting platform '{name}'"))
    }

    /// CPU snapshot when probing is requested on the command line or in the manifest.
    pub fn cpu_snapshot(&self, cli_probe: bool) -> Option<CpuFeatures> {
        (cli_probe || self.manifest.detect.probe_cpu).then(CpuFeatures::probe_host)
    }

    /// Every flag request, from the manifest, the environment and the command line.
    pub fn flag_requests<I, K, V>(&self, env: I, cli_flags: &[String]) -> Vec<FlagRequest>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let mut requests = self.manifest.flag_requests();
        requests.extend(env_flag_requests(env));
        requests.extend(
            cli_flags
                .iter()
                .map(|f| FlagRequest::new(RequestSource::CommandLine, f.clone())),
        );
        requests
    }
}

/// Resolve user-supplied destinations against `cwd`, or use the manifest's.
pub fn destinations(project: &Project, cwd: &Path, cli: &[PathBuf]) -> Vec<PathBuf> {
    if cli.is_empty() {
        project.manifest.destinations(&project.dir)
    } else {
        cli.iter().map(|d| kiln_build::rebase(cwd, d)).collect()
    }
}
