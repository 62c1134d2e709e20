//! Artifact manifests and the immutable artifact set a build produces.
//!
//! The native build writes a small JSON manifest next to its outputs:
//!
//! ```json
//! { "primary": "lib/libllama.so", "runtime_dependencies": ["lib/libggml.so"] }
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BuildError;

/// Default file name of the artifact manifest inside the build directory.
pub const DEFAULT_MANIFEST_NAME: &str = "kiln-artifacts.json";

/// A SHA-256 hex digest of an artifact's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Hash a file's contents.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(ContentHash(hex_encode(&hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// On-disk shape of the manifest written by the native build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub primary: PathBuf,
    #[serde(default)]
    pub runtime_dependencies: Vec<PathBuf>,
}

/// Role of an artifact within the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactRole {
    Primary,
    RuntimeDependency,
}

/// A single produced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub role: ArtifactRole,
    pub digest: ContentHash,
    pub size_bytes: u64,
}

impl Artifact {
    fn from_path(path: PathBuf, role: ArtifactRole) -> io::Result<Self> {
        let size_bytes = std::fs::metadata(&path)?.len();
        let digest = ContentHash::of_file(&path)?;
        Ok(Self {
            path,
            role,
            digest,
            size_bytes,
        })
    }

    /// File name used at every install destination.
    pub fn file_name(&self) -> &std::ffi::OsStr {
        self.path.file_name().unwrap_or(self.path.as_os_str())
    }
}

/// The ordered files produced by one successful build: primary library first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    /// Build a set from concrete paths, hashing every file.
    pub fn from_paths(primary: PathBuf, runtime_dependencies: Vec<PathBuf>) -> io::Result<Self> {
        let mut artifacts = Vec::with_capacity(1 + runtime_dependencies.len());
        artifacts.push(Artifact::from_path(primary, ArtifactRole::Primary)?);
        for dep in runtime_dependencies {
            artifacts.push(Artifact::from_path(dep, ArtifactRole::RuntimeDependency)?);
        }
        Ok(Self { artifacts })
    }

    /// Load and validate a manifest file.
    pub fn load_manifest(path: &Path) -> Result<Self, BuildError> {
        let invalid = |reason: String| BuildError::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let manifest: ArtifactManifest =
            serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

        let base = path.parent().unwrap_or(Path::new("."));
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };

        let primary = resolve(&manifest.primary);
        let deps: Vec<PathBuf> = manifest
            .runtime_dependencies
            .iter()
            .map(|p| resolve(p))
            .collect();

        for file in std::iter::once(&primary).chain(deps.iter()) {
            if !file.is_file() {
                return Err(invalid(format!("listed artifact {} does not exist", file.display())));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for file in std::iter::once(&primary).chain(deps.iter()) {
            if let Some(name) = file.file_name() {
                if !seen.insert(name.to_os_string()) {
                    return Err(invalid(format!(
                        "two artifacts share the file name {}",
                        name.to_string_lossy()
                    )));
                }
            }
        }

        Self::from_paths(primary, deps).map_err(|e| invalid(e.to_string()))
    }

    pub fn primary(&self) -> &Artifact {
        &self.artifacts[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_build_dir(dir: &Path) {
        fs::create_dir_all(dir.join("lib")).unwrap();
        fs::write(dir.join("lib/libllama.so"), b"primary").unwrap();
        fs::write(dir.join("lib/libggml.so"), b"dependency").unwrap();
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_build_dir(dir.path());
        let manifest = dir.path().join(DEFAULT_MANIFEST_NAME);
        fs::write(
            &manifest,
            r#"{"primary": "lib/libllama.so", "runtime_dependencies": ["lib/libggml.so"]}"#,
        )
        .unwrap();

        let set = ArtifactSet::load_manifest(&manifest).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.primary().role, ArtifactRole::Primary);
        assert_eq!(set.primary().path, dir.path().join("lib/libllama.so"));
        assert_eq!(set.primary().size_bytes, 7);
        let roles: Vec<_> = set.iter().map(|a| a.role).collect();
        assert_eq!(roles, vec![ArtifactRole::Primary, ArtifactRole::RuntimeDependency]);
    }

    #[test]
    fn dependencies_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        write_build_dir(dir.path());
        let manifest = dir.path().join(DEFAULT_MANIFEST_NAME);
        fs::write(&manifest, r#"{"primary": "lib/libllama.so"}"#).unwrap();
        assert_eq!(ArtifactSet::load_manifest(&manifest).unwrap().len(), 1);
    }

    #[test]
    fn missing_artifact_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join(DEFAULT_MANIFEST_NAME);
        fs::write(&manifest, r#"{"primary": "lib/libllama.so"}"#).unwrap();
        let err = ArtifactSet::load_manifest(&manifest).unwrap_err();
        assert!(matches!(err, BuildError::ManifestInvalid { .. }));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn missing_or_malformed_manifest_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join(DEFAULT_MANIFEST_NAME);
        assert!(ArtifactSet::load_manifest(&manifest).is_err());
        fs::write(&manifest, "not json").unwrap();
        assert!(ArtifactSet::load_manifest(&manifest).is_err());
    }

    #[test]
    fn duplicate_file_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_build_dir(dir.path());
        fs::create_dir_all(dir.path().join("other")).unwrap();
        fs::write(dir.path().join("other/libggml.so"), b"x").unwrap();
        let manifest = dir.path().join(DEFAULT_MANIFEST_NAME);
        fs::write(
            &manifest,
            r#"{
                "primary": "lib/libllama.so",
                "runtime_dependencies": ["lib/libggml.so", "other/libggml.so"]
            }"#,
        )
        .unwrap();
        assert!(ArtifactSet::load_manifest(&manifest).is_err());
    }

    #[test]
    fn digest_is_sha256_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            ContentHash::of_file(&path).unwrap().as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
