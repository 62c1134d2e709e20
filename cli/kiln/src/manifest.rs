//! `kiln.toml` manifest parsing and project configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kiln_build::{
    rebase, CommandToolchain, DefineStyle, FlagRequest, RequestSource, StageOptions,
};
use serde::{Deserialize, Serialize};

pub const MANIFEST_NAME: &str = "kiln.toml";

/// Shell that runs [`DEFAULT_DRIVER`].
pub const DEFAULT_PROGRAM: &str = "sh";

/// Default build driver: configure with cmake, then build the target.
/// Positional arguments are the source dir, build dir and target name;
/// anything after them (the flag defines) goes to the configure step.
pub const DEFAULT_DRIVER: &str = r#"src="$1"; out="$2"; target="$3"; shift 3
cmake -S "$src" -B "$out" "$@" && cmake --build "$out" --config Release --target "$target""#;

/// The top-level manifest structure for a kiln project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilnManifest {
    /// Project metadata (required).
    pub project: ProjectConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Manifest-level flag requests (`avx2 = "off"`).
    #[serde(default)]
    pub features: BTreeMap<String, FeatureState>,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub stage: StageConfig,
}

/// Project metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Default target platform (`host`, `macos-x86_64`, a triple).
    #[serde(default)]
    pub default: Option<String>,
}

/// A flag state written either as a string (`"off"`) or a TOML bool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureState {
    Bool(bool),
    Text(String),
}

impl FeatureState {
    fn as_request_value(&self) -> &str {
        match self {
            FeatureState::Bool(true) => "on",
            FeatureState::Bool(false) => "off",
            FeatureState::Text(s) => s,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Narrow the forced-off set with the host CPU's extensions.
    #[serde(default)]
    pub probe_cpu: bool,
}

/// Build section: how the native toolchain is driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub target: String,
    pub program: String,
    pub args: Vec<String>,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub define_style: DefineStyle,
    pub define_prefix: String,
    /// Artifact manifest, relative to `build_dir` unless absolute.
    pub manifest: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            target: "llama".to_string(),
            program: DEFAULT_PROGRAM.to_string(),
            args: ["-c", DEFAULT_DRIVER, "kiln", "{source_dir}", "{build_dir}", "{target}"]
                .iter()
                .map(|a| a.to_string())
                .collect(),
            source_dir: PathBuf::from("vendor/llama.cpp"),
            build_dir: PathBuf::from("build"),
            define_style: DefineStyle::Cmake,
            define_prefix: "LLAMA_".to_string(),
            manifest: PathBuf::from(kiln_build::artifact::DEFAULT_MANIFEST_NAME),
        }
    }
}

/// Stage section: where artifacts are installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub destinations: Vec<PathBuf>,
    pub workers: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            destinations: vec![PathBuf::from("llama_cpp/lib")],
            workers: kiln_build::stage::DEFAULT_WORKERS,
        }
    }
}

impl Default for KilnManifest {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                name: "unnamed".to_string(),
            },
            platform: PlatformConfig::default(),
            features: BTreeMap::new(),
            detect: DetectConfig::default(),
            build: BuildConfig::default(),
            stage: StageConfig::default(),
        }
    }
}

impl KilnManifest {
    /// Search upward from `start_dir` for a `kiln.toml` file, parse and return it
    /// along with the directory it was found in.
    pub fn find_and_load(start_dir: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join(MANIFEST_NAME);
            if candidate.is_file() {
                let content = std::fs::read_to_string(&candidate)
                    .with_context(|| format!("reading {}", candidate.display()))?;
                let manifest: KilnManifest = toml::from_str(&content)
                    .with_context(|| format!("parsing {}", candidate.display()))?;
                return Ok(Some((manifest, dir)));
            }
            if !dir.pop() {
                break;
            }
        }
        Ok(None)
    }

    /// Parse a manifest from a TOML string.
    #[cfg(test)]
    pub fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("parsing kiln.toml")
    }

    /// Platform string to use when none is given on the command line.
    pub fn default_platform(&self) -> &str {
        self.platform.default.as_deref().unwrap_or("host")
    }

    /// The `[features]` table as manifest-level flag requests.
    pub fn flag_requests(&self) -> Vec<FlagRequest> {
        self.features
            .iter()
            .map(|(name, state)| {
                FlagRequest::new(
                    RequestSource::Manifest,
                    format!("{name}={}", state.as_request_value()),
                )
            })
            .collect()
    }

    /// Toolchain backend with paths resolved against `project_dir`.
    pub fn toolchain(&self, project_dir: &Path) -> CommandToolchain {
        let build = &self.build;
        let mut toolchain = CommandToolchain::new(
            build.program.clone(),
            rebase(project_dir, &build.source_dir),
            rebase(project_dir, &build.build_dir),
        )
        .with_args(build.args.iter().cloned());
        toolchain.define_style = build.define_style;
        toolchain.define_prefix = build.define_prefix.clone();
        toolchain.manifest = build.manifest.clone();
        toolchain
    }

    /// Install destinations resolved against `project_dir`.
    pub fn destinations(&self, project_dir: &Path) -> Vec<PathBuf> {
        self.stage
            .destinations
            .iter()
            .map(|d| rebase(project_dir, d))
            .collect()
    }

    /// Staging options; `workers` from the command line wins over `[stage]`.
    pub fn stage_options(&self, workers: Option<usize>) -> StageOptions {
        StageOptions {
            workers: workers.unwrap_or(self.stage.workers).max(1),
            ..StageOptions::default()
        }
    }

    pub fn build_dir(&self, project_dir: &Path) -> PathBuf {
        rebase(project_dir, &self.build.build_dir)
    }
}
