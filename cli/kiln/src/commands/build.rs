//! `kiln build`: detect, resolve, build and stage in one run.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use kiln_build::{
    orchestrate, BuildBackend, BuildError, CancelToken, OrchestrationReport, PipelineConfig,
    PipelineError,
};
use tracing::info;

use super::{destinations, Outcome, Project, ReportFormat};

/// Command-line options for `kiln build`.
#[derive(Debug, Default)]
pub struct BuildOptions {
    pub platform: Option<String>,
    pub flags: Vec<String>,
    pub destinations: Vec<PathBuf>,
    pub workers: Option<usize>,
    pub target: Option<String>,
    pub probe_cpu: bool,
    pub report: ReportFormat,
}

/// Run the full pipeline with the project's configured toolchain.
pub fn run(
    project: &Project,
    cwd: &Path,
    opts: &BuildOptions,
    cancel: &CancelToken,
) -> Result<Outcome> {
    let backend = project.manifest.toolchain(&project.dir);
    run_with_backend(project, cwd, opts, &backend, std::env::vars_os(), cancel)
}

pub(crate) fn run_with_backend<I, K, V>(
    project: &Project,
    cwd: &Path,
    opts: &BuildOptions,
    backend: &dyn BuildBackend,
    env: I,
    cancel: &CancelToken,
) -> Result<Outcome>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let platform = project.platform(opts.platform.as_deref())?;
    let target = opts
        .target
        .clone()
        .unwrap_or_else(|| project.manifest.build.target.clone());
    let config = PipelineConfig {
        platform: platform.clone(),
        cpu: project.cpu_snapshot(opts.probe_cpu),
        requests: project.flag_requests(env, &opts.flags),
        target: target.clone(),
        destinations: destinations(project, cwd, &opts.destinations),
        stage: project.manifest.stage_options(opts.workers),
    };
    info!(
        target: "kiln::cli",
        platform = %platform,
        build_target = %target,
        backend = backend.name(),
        "starting build"
    );

    let output = orchestrate(config, backend, cancel);
    print_report(&output.report, opts.report)?;

    match output.error {
        None => Ok(Outcome::of_staging(output.report.staging_failure.as_ref())),
        Some(err) => {
            if let PipelineError::Building(BuildError::BuildFailure { diagnostics, .. }) = &err {
                if !diagnostics.is_empty() {
                    eprintln!("--- toolchain output ---");
                    eprint!("{diagnostics}");
                    if !diagnostics.ends_with('\n') {
                        eprintln!();
                    }
                }
            }
            Err(anyhow::Error::new(err).context(format!("building '{target}' for {platform}")))
        }
    }
}

pub(crate) fn print_report(report: &OrchestrationReport, format: ReportFormat) -> Result<()> {
    match format {
        ReportFormat::Text => print!("{report}"),
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use kiln_build::{ArtifactSet, BuildConfiguration, ResolveError, StageError};
    use kiln_targets::CapabilityFlag;

    #[derive(Debug)]
    struct StubBackend {
        out: PathBuf,
        fail: bool,
        seen: std::sync::Mutex<Vec<CapabilityFlag>>,
    }

    impl StubBackend {
        fn new(out: &Path) -> Self {
            Self {
                out: out.to_path_buf(),
                fail: false,
                seen: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl BuildBackend for StubBackend {
        fn name(&self) -> &str {
            "stub"
        }

        fn build(
            &self,
            config: &BuildConfiguration,
            _target: &str,
            _cancel: &CancelToken,
        ) -> Result<ArtifactSet, BuildError> {
            *self.seen.lock().unwrap() = config.enabled_flags();
            if self.fail {
                return Err(BuildError::BuildFailure {
                    status: Some(2),
                    diagnostics: "error: unknown option\n".into(),
                });
            }
            fs::create_dir_all(&self.out).unwrap();
            fs::write(self.out.join("libllama.dylib"), b"llama").unwrap();
            Ok(ArtifactSet::from_paths(self.out.join("libllama.dylib"), vec![]).unwrap())
        }
    }

    fn project(dir: &Path, toml: &str) -> Project {
        fs::write(dir.join("kiln.toml"), toml).unwrap();
        Project::discover(dir).unwrap()
    }

    const MANIFEST: &str = r#"
[project]
name = "llama-cpp-python"

[platform]
default = "macos-x86_64"

[stage]
destinations = ["llama_cpp/lib", "dist/llama_cpp/lib"]
"#;

    #[test]
    fn build_stages_to_manifest_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), MANIFEST);
        let backend = StubBackend::new(&dir.path().join("build"));
        let opts = BuildOptions {
            flags: vec!["avx=on".into()],
            ..BuildOptions::default()
        };

        let outcome = run_with_backend(
            &project,
            dir.path(),
            &opts,
            &backend,
            Vec::<(String, String)>::new(),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert!(backend.seen.lock().unwrap().is_empty());
        assert!(dir.path().join("llama_cpp/lib/libllama.dylib").is_file());
        assert!(dir.path().join("dist/llama_cpp/lib/libllama.dylib").is_file());
    }

    #[test]
    fn arm64_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), MANIFEST);
        let backend = StubBackend::new(&dir.path().join("build"));
        let opts = BuildOptions {
            platform: Some("macos-aarch64".into()),
            report: ReportFormat::Json,
            ..BuildOptions::default()
        };
        run_with_backend(
            &project,
            dir.path(),
            &opts,
            &backend,
            vec![("KILN_FLAG_FMA", "off")],
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(
            *backend.seen.lock().unwrap(),
            vec![CapabilityFlag::Avx, CapabilityFlag::Avx2, CapabilityFlag::F16c]
        );
    }

    #[test]
    fn build_failure_surfaces_pipeline_error() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), MANIFEST);
        let mut backend = StubBackend::new(&dir.path().join("build"));
        backend.fail = true;

        let err = run_with_backend(
            &project,
            dir.path(),
            &BuildOptions::default(),
            &backend,
            Vec::<(String, String)>::new(),
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Building(BuildError::BuildFailure { .. }))
        ));
        assert!(format!("{err:#}").contains("status 2"));
        assert!(!dir.path().join("llama_cpp/lib").exists());
    }

    #[test]
    fn conflicting_cli_flags_fail_before_building() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), MANIFEST);
        let backend = StubBackend::new(&dir.path().join("build"));
        let opts = BuildOptions {
            flags: vec!["avx2=on".into(), "avx2=off".into()],
            ..BuildOptions::default()
        };
        let err = run_with_backend(
            &project,
            dir.path(),
            &opts,
            &backend,
            Vec::<(String, String)>::new(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Resolving(ResolveError::ConfigurationConflict { .. }))
        ));
    }

    #[test]
    fn partial_staging_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), MANIFEST);
        let backend = StubBackend::new(&dir.path().join("build"));
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"not a dir").unwrap();
        let opts = BuildOptions {
            destinations: vec![blocked, PathBuf::from("ok")],
            ..BuildOptions::default()
        };
        let outcome = run_with_backend(
            &project,
            dir.path(),
            &opts,
            &backend,
            Vec::<(String, String)>::new(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(outcome, Outcome::PartialStaging);
        assert!(dir.path().join("ok/libllama.dylib").is_file());

        let fs_blocked = opts.destinations[0].clone();
        let err = run_with_backend(
            &project,
            dir.path(),
            &BuildOptions {
                destinations: vec![fs_blocked],
                ..BuildOptions::default()
            },
            &backend,
            Vec::<(String, String)>::new(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Staging(StageError::NothingStaged(_)))
        ));
    }
}
