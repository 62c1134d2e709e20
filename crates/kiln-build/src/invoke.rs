//! Build invocation: runs the native toolchain once with the resolved flags.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactSet, DEFAULT_MANIFEST_NAME};
use crate::error::BuildError;
use crate::resolve::BuildConfiguration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared flag used to ask a running pipeline to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A backend able to build the vendored library.
///
/// Object-safe so backends can be stored in `Box<dyn BuildBackend>`.
pub trait BuildBackend: fmt::Debug + Send + Sync {
    /// Human-readable name of the backend.
    fn name(&self) -> &str;

    /// Build `target` with `config`, returning the produced artifacts.
    fn build(
        &self,
        config: &BuildConfiguration,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<ArtifactSet, BuildError>;
}

/// How resolved flags are passed to the toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefineStyle {
    /// `-D<PREFIX><NAME>=ON|OFF` appended to the arguments.
    #[default]
    Cmake,
    /// `<PREFIX><NAME>=1|0` appended to the arguments.
    Make,
    /// `<PREFIX><NAME>=ON|OFF` set in the child's environment.
    Env,
}

/// Translated form of a configuration for one toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defines {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Translate a configuration into the toolchain's option vocabulary.
pub fn translate(config: &BuildConfiguration, style: DefineStyle, prefix: &str) -> Defines {
    let mut defines = Defines {
        args: Vec::new(),
        env: Vec::new(),
    };
    for r in config.iter() {
        let name = format!("{prefix}{}", r.flag.toolchain_name());
        match style {
            DefineStyle::Cmake => {
                let value = if r.enabled { "ON" } else { "OFF" };
                defines.args.push(format!("-D{name}={value}"));
            }
            DefineStyle::Make => {
                let value = if r.enabled { "1" } else { "0" };
                defines.args.push(format!("{name}={value}"));
            }
            DefineStyle::Env => {
                let value = if r.enabled { "ON" } else { "OFF" };
                defines.env.push((name, value.to_string()));
            }
        }
    }
    defines
}

/// Build backend that spawns an external toolchain process.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    /// Program to run (`cmake`, `make`, a driver script).
    pub program: String,
    /// Arguments; `{target}`, `{source_dir}` and `{build_dir}` are substituted.
    pub args: Vec<String>,
    /// Directory holding the vendored sources.
    pub source_dir: PathBuf,
    /// Directory the build writes into.
    pub build_dir: PathBuf,
    pub define_style: DefineStyle,
    pub define_prefix: String,
    /// Artifact manifest path, relative to `build_dir` unless absolute.
    pub manifest: PathBuf,
}

impl CommandToolchain {
    pub fn new(
        program: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        build_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            source_dir: source_dir.into(),
            build_dir: build_dir.into(),
            define_style: DefineStyle::default(),
            define_prefix: "LLAMA_".to_string(),
            manifest: PathBuf::from(DEFAULT_MANIFEST_NAME),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn manifest_path(&self) -> PathBuf {
        if self.manifest.is_absolute() {
            self.manifest.clone()
        } else {
            self.build_dir.join(&self.manifest)
        }
    }

    fn substitute(&self, arg: &str, target: &str) -> String {
        arg.replace("{target}", target)
            .replace("{source_dir}", &self.source_dir.to_string_lossy())
            .replace("{build_dir}", &self.build_dir.to_string_lossy())
    }

    /// Whether any argument carries the `{target}` placeholder.
    pub fn references_target(&self) -> bool {
        self.args.iter().any(|a| a.contains("{target}"))
    }

    /// The full command line that would be run.
    pub fn command_line(
        &self,
        config: &BuildConfiguration,
        target: &str,
    ) -> (Vec<String>, Vec<(String, String)>) {
        let defines = translate(config, self.define_style, &self.define_prefix);
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| self.substitute(a, target))
            .collect();
        args.extend(defines.args);
        (args, defines.env)
    }
}

impl BuildBackend for CommandToolchain {
    fn name(&self) -> &str {
        &self.program
    }

    fn build(
        &self,
        config: &BuildConfiguration,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<ArtifactSet, BuildError> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let (args, env) = self.command_line(config, target);
        std::fs::create_dir_all(&self.build_dir).map_err(|e| BuildError::BuildFailure {
            status: None,
            diagnostics: format!("creating {}: {e}", self.build_dir.display()),
        })?;

        if !self.references_target() {
            warn!(
                target: "kiln::build",
                build_target = %target,
                "no toolchain argument uses {{target}}; the target name is not passed on"
            );
        }
        info!(
            target: "kiln::build",
            program = %self.program,
            args = ?args,
            build_target = %target,
            "invoking toolchain"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so cancel reaches everything the toolchain spawns.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command
            .spawn()
            .map_err(|e| BuildError::BuildFailure {
                status: None,
                diagnostics: format!("failed to start '{}': {e}", self.program),
            })?;

        let (status, diagnostics) = wait_with_cancel(child, cancel)?;
        if status != Some(0) {
            return Err(BuildError::BuildFailure {
                status,
                diagnostics,
            });
        }
        debug!(target: "kiln::build", bytes = diagnostics.len(), "toolchain finished");

        ArtifactSet::load_manifest(&self.manifest_path())
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut s) = stream {
            let _ = s.read_to_end(&mut buf);
        }
        buf
    })
}

// Returns (exit code, captured stdout + stderr). Kills the child on cancel.
fn wait_with_cancel(
    mut child: Child,
    cancel: &CancelToken,
) -> Result<(Option<i32>, String), BuildError> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        if cancel.is_cancelled() {
            warn!(
                target: "kiln::build",
                pid = child.id(),
                "cancel requested, terminating toolchain"
            );
            terminate(&mut child);
            let _ = child.wait();
            // Grandchildren may still hold the pipes; leave the readers detached.
            drop((stdout, stderr));
            return Err(BuildError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                terminate(&mut child);
                return Err(BuildError::BuildFailure {
                    status: None,
                    diagnostics: format!("waiting for toolchain: {e}"),
                });
            }
        }
    };

    let mut diagnostics =
        String::from_utf8_lossy(&stdout.join().unwrap_or_default()).into_owned();
    diagnostics.push_str(&String::from_utf8_lossy(&stderr.join().unwrap_or_default()));
    Ok((status.code(), diagnostics))
}

// Kill the toolchain's whole process group, then the child itself.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal; the group was created at spawn.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn rebase(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{resolve, FlagRequests, RequestSource};
    use kiln_targets::{forced_off, Architecture, OsFamily, PlatformDescriptor};

    fn config_for(os: OsFamily, arch: Architecture) -> BuildConfiguration {
        resolve(&FlagRequests::new(), &forced_off(&PlatformDescriptor::new(os, arch)))
    }

    #[test]
    fn translate_cmake_style() {
        let config = config_for(OsFamily::MacOs, Architecture::X86_64);
        let defines = translate(&config, DefineStyle::Cmake, "LLAMA_");
        assert_eq!(
            defines.args,
            vec![
                "-DLLAMA_AVX=OFF",
                "-DLLAMA_AVX2=OFF",
                "-DLLAMA_FMA=OFF",
                "-DLLAMA_F16C=OFF"
            ]
        );
        assert!(defines.env.is_empty());
    }

    #[test]
    fn translate_make_and_env_styles() {
        let mut requests = FlagRequests::new();
        requests
            .request_str(RequestSource::CommandLine, "fma=off")
            .unwrap();
        let config = resolve(
            &requests,
            &forced_off(&PlatformDescriptor::new(OsFamily::Linux, Architecture::X86_64)),
        );

        let make = translate(&config, DefineStyle::Make, "GGML_");
        assert_eq!(make.args[2], "GGML_FMA=0");
        assert_eq!(make.args[0], "GGML_AVX=1");

        let env = translate(&config, DefineStyle::Env, "");
        assert!(env.args.is_empty());
        assert_eq!(env.env[1], ("AVX2".to_string(), "ON".to_string()));
    }

    #[test]
    fn command_line_substitutes_placeholders() {
        let toolchain = CommandToolchain::new("cmake", "vendor/llama.cpp", "build").with_args([
            "-S",
            "{source_dir}",
            "-B",
            "{build_dir}",
            "--target",
            "{target}",
        ]);
        let config = config_for(OsFamily::MacOs, Architecture::Aarch64);
        let (args, env) = toolchain.command_line(&config, "llama");
        assert_eq!(
            &args[..6],
            &["-S", "vendor/llama.cpp", "-B", "build", "--target", "llama"]
        );
        assert_eq!(args[6], "-DLLAMA_AVX=ON");
        assert!(env.is_empty());
        assert!(toolchain.references_target());
        assert!(!CommandToolchain::new("make", "src", "out").references_target());
    }

    #[test]
    fn cancelled_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain =
            CommandToolchain::new("definitely-not-a-real-toolchain", dir.path(), dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = toolchain
            .build(&config_for(OsFamily::Linux, Architecture::X86_64), "llama", &cancel)
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
    }

    #[test]
    fn missing_program_is_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain =
            CommandToolchain::new("definitely-not-a-real-toolchain", dir.path(), dir.path());
        let err = toolchain
            .build(
                &config_for(OsFamily::Linux, Architecture::X86_64),
                "llama",
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, BuildError::BuildFailure { status: None, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_keeps_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CommandToolchain::new("sh", dir.path(), dir.path())
            .with_args(["-c", "echo 'error: unknown option' >&2; exit 1", "sh"]);
        let err = toolchain
            .build(
                &config_for(OsFamily::Linux, Architecture::X86_64),
                "llama",
                &CancelToken::new(),
            )
            .unwrap_err();
        match err {
            BuildError::BuildFailure {
                status,
                diagnostics,
            } => {
                assert_eq!(status, Some(1));
                assert!(diagnostics.contains("error: unknown option"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn successful_build_reads_manifest_and_sees_defines() {
        let dir = tempfile::tempdir().unwrap();
        // The script records its own argument list into the primary artifact.
        let script = r#"
out="$1"; shift
mkdir -p "$out/lib"
echo "$@" > "$out/lib/libllama.so"
printf 'dep' > "$out/lib/libggml.so"
printf '{"primary":"lib/libllama.so","runtime_dependencies":["lib/libggml.so"]}' \
    > "$out/kiln-artifacts.json"
"#;
        let build_dir = dir.path().join("build");
        let toolchain = CommandToolchain::new("sh", dir.path(), &build_dir)
            .with_args(["-c", script, "sh", "{build_dir}"]);

        let set = toolchain
            .build(
                &config_for(OsFamily::MacOs, Architecture::X86_64),
                "llama",
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(set.len(), 2);
        let recorded = std::fs::read_to_string(&set.primary().path).unwrap();
        assert!(recorded.contains("-DLLAMA_AVX2=OFF"), "{recorded}");
    }

    #[cfg(unix)]
    #[test]
    fn cancel_kills_running_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CommandToolchain::new("sh", dir.path(), dir.path())
            .with_args(["-c", "exec sleep 30"]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = toolchain
            .build(&config_for(OsFamily::Linux, Architecture::X86_64), "llama", &cancel)
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_reaches_toolchain_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        // The outer shell waits on a nested shell that writes a marker after a second.
        let toolchain = CommandToolchain::new("sh", dir.path(), dir.path()).with_args([
            "-c",
            r#"sh -c 'sleep 1; touch "$0/marker"' "$0"; exit 0"#,
            "{build_dir}",
        ]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let err = toolchain
            .build(&config_for(OsFamily::Linux, Architecture::X86_64), "llama", &cancel)
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, BuildError::Cancelled));

        thread::sleep(Duration::from_millis(1500));
        assert!(!dir.path().join("marker").exists());
    }

    #[test]
    fn rebase_keeps_absolute_paths() {
        let base = Path::new("/project");
        assert_eq!(rebase(base, Path::new("build")), PathBuf::from("/project/build"));
        assert_eq!(rebase(base, Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }
}
