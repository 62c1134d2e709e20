//! kiln: build a vendored native inference runtime and stage its libraries.

mod commands;
mod manifest;

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_build::{BuildError, CancelToken, PipelineError, ResolveError, StageError};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use commands::build::BuildOptions;
use commands::{Outcome, Project, ReportFormat};

/// Process exit codes.
mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIGURATION: i32 = 2;
    pub const BUILD_FAILURE: i32 = 3;
    pub const PARTIAL_STAGING: i32 = 4;
    pub const CANCELLED: i32 = 5;
}

#[derive(Parser)]
#[command(
    name = "kiln",
    version,
    about = "Build a native inference runtime and stage its libraries"
)]
struct Cli {
    /// Log at debug level (overridden by KILN_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect, resolve, build and stage
    Build {
        /// Target platform (host, macos-x86_64, x86_64-apple-darwin, ...)
        #[arg(long)]
        platform: Option<String>,
        /// Flag request NAME=STATE (e.g. avx2=off); repeatable
        #[arg(long = "flag", value_name = "NAME=STATE")]
        flags: Vec<String>,
        /// Install destination; repeatable (default: [stage] destinations)
        #[arg(long = "dest", value_name = "DIR")]
        destinations: Vec<PathBuf>,
        /// Destinations staged concurrently
        #[arg(long)]
        workers: Option<usize>,
        /// Build target name (default: [build] target)
        #[arg(long)]
        target: Option<String>,
        /// Also force off extensions the host CPU lacks
        #[arg(long)]
        probe_cpu: bool,
        /// Report format
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        report: ReportFormat,
    },
    /// Print the forced-off set and resolved configuration without building
    Resolve {
        #[arg(long)]
        platform: Option<String>,
        #[arg(long = "flag", value_name = "NAME=STATE")]
        flags: Vec<String>,
        #[arg(long)]
        probe_cpu: bool,
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        report: ReportFormat,
    },
    /// Stage an existing build's artifacts
    Stage {
        /// Artifact manifest (default: <build_dir>/kiln-artifacts.json)
        #[arg(long)]
        manifest: Option<PathBuf>,
        #[arg(long = "dest", value_name = "DIR")]
        destinations: Vec<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        report: ReportFormat,
    },
    /// Inspect target platforms
    Target {
        #[command(subcommand)]
        action: TargetAction,
    },
    /// Check toolchain, host and project status
    Doctor,
    /// Remove the build directory
    Clean,
}

#[derive(Subcommand)]
enum TargetAction {
    /// List built-in platforms
    List,
    /// Show the forced-off set and default configuration of a platform
    Describe {
        /// Platform name or target triple
        name: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!(target: "kiln::cli", "interrupt received, cancelling");
        handler_token.cancel();
    }) {
        warn!(target: "kiln::cli", "could not install Ctrl+C handler: {e}");
    }

    let result = std::env::current_dir()
        .context("reading the working directory")
        .and_then(|cwd| run(cli, &cwd, &cancel));
    let code = match result {
        Ok(outcome) => outcome_code(outcome),
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    };
    process::exit(code);
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn run(cli: Cli, cwd: &Path, cancel: &CancelToken) -> anyhow::Result<Outcome> {
    let project = Project::discover(cwd)?;

    match cli.command {
        Commands::Build {
            platform,
            flags,
            destinations,
            workers,
            target,
            probe_cpu,
            report,
        } => {
            let opts = BuildOptions {
                platform,
                flags,
                destinations,
                workers,
                target,
                probe_cpu,
                report,
            };
            commands::build::run(&project, cwd, &opts, cancel)
        }

        Commands::Resolve {
            platform,
            flags,
            probe_cpu,
            report,
        } => {
            commands::resolve::run(&project, platform.as_deref(), &flags, probe_cpu, report)?;
            Ok(Outcome::Success)
        }

        Commands::Stage {
            manifest,
            destinations,
            workers,
            report,
        } => commands::stage::run(
            &project,
            cwd,
            manifest.as_deref(),
            &destinations,
            workers,
            report,
            cancel,
        ),

        Commands::Target { action } => {
            match action {
                TargetAction::List => commands::target::list()?,
                TargetAction::Describe { name } => commands::target::describe(&name)?,
            }
            Ok(Outcome::Success)
        }

        Commands::Doctor => {
            commands::doctor::run(&project)?;
            Ok(Outcome::Success)
        }

        Commands::Clean => {
            commands::clean::run(&project)?;
            Ok(Outcome::Success)
        }
    }
}
/// Exit code of a command that returned without error.
fn outcome_code(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Success => exit::SUCCESS,
        Outcome::PartialStaging => exit::PARTIAL_STAGING,
        Outcome::Cancelled => exit::CANCELLED,
    }
}

/// Map an error chain to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PipelineError>() {
            return match e {
                PipelineError::Resolving(_) => exit::CONFIGURATION,
                PipelineError::Building(BuildError::Cancelled) => exit::CANCELLED,
                PipelineError::Building(_) => exit::BUILD_FAILURE,
                PipelineError::Staging(StageError::Cancelled) => exit::CANCELLED,
                PipelineError::Staging(_) => exit::PARTIAL_STAGING,
            };
        }
        if cause.downcast_ref::<ResolveError>().is_some() {
            return exit::CONFIGURATION;
        }
        if let Some(e) = cause.downcast_ref::<StageError>() {
            return match e {
                StageError::Cancelled => exit::CANCELLED,
                _ => exit::PARTIAL_STAGING,
            };
        }
    }
    exit::FAILURE
}
