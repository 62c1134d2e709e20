//! Platform descriptors.
//!
//! A [`PlatformDescriptor`] is the pair of operating system and CPU
//! architecture a native build is configured for. It is built once at the
//! start of a run and never mutated.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TargetError};

/// Operating system family of the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    FreeBsd,
    /// Anything else, kept verbatim (lowercased).
    Other(String),
}

impl OsFamily {
    /// Parse an OS name or one of its common aliases.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "linux" => OsFamily::Linux,
            "macos" | "darwin" | "apple" | "osx" => OsFamily::MacOs,
            "windows" | "win32" | "win" => OsFamily::Windows,
            "freebsd" => OsFamily::FreeBsd,
            other => OsFamily::Other(other.to_string()),
        }
    }

    /// Canonical short name, as used in `os-arch` platform strings.
    pub fn as_str(&self) -> &str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::MacOs => "macos",
            OsFamily::Windows => "windows",
            OsFamily::FreeBsd => "freebsd",
            OsFamily::Other(name) => name,
        }
    }

    /// Whether the OS runs on a Unix-like kernel.
    pub fn is_unix_like(&self) -> bool {
        matches!(self, OsFamily::Linux | OsFamily::MacOs | OsFamily::FreeBsd)
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// CPU architecture of the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    X86_64,
    X86,
    /// 64-bit ARM (ARMv8-A and later).
    Aarch64,
    /// 32-bit ARM.
    Arm,
    Other(String),
}

impl Architecture {
    /// Parse an architecture name or one of its common aliases.
    pub fn parse(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "x86_64" | "amd64" | "x64" => Architecture::X86_64,
            "x86" | "i386" | "i586" | "i686" => Architecture::X86,
            "aarch64" | "arm64" => Architecture::Aarch64,
            "arm" => Architecture::Arm,
            s if s.starts_with("armv7") || s.starts_with("armv6") => Architecture::Arm,
            _ => Architecture::Other(lower),
        }
    }

    /// Canonical short name.
    pub fn as_str(&self) -> &str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::X86 => "x86",
            Architecture::Aarch64 => "aarch64",
            Architecture::Arm => "arm",
            Architecture::Other(name) => name,
        }
    }

    /// Whether this is the 64-bit ARM family.
    pub fn is_arm64(&self) -> bool {
        matches!(self, Architecture::Aarch64)
    }

    /// Whether this is an x86-family architecture (32 or 64 bit).
    pub fn is_x86_family(&self) -> bool {
        matches!(self, Architecture::X86_64 | Architecture::X86)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// The operating system and architecture a build targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformDescriptor {
    pub os: OsFamily,
    pub architecture: Architecture,
}

impl PlatformDescriptor {
    pub fn new(os: OsFamily, architecture: Architecture) -> Self {
        Self { os, architecture }
    }

    /// Describe the machine kiln itself is running on.
    pub fn host() -> Self {
        Self {
            os: OsFamily::parse(std::env::consts::OS),
            architecture: Architecture::parse(std::env::consts::ARCH),
        }
    }

    /// Canonical `os-arch` name (e.g. `macos-x86_64`).
    pub fn name(&self) -> String {
        format!("{}-{}", self.os, self.architecture)
    }

    /// Resolve a user-supplied platform string.
    ///
    /// Accepts `host`, `<os>-<arch>` pairs, and target triples
    /// (`x86_64-apple-darwin`, `aarch64-unknown-linux-gnu`).
    pub fn resolve(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("host") {
            return Ok(Self::host());
        }
        crate::parse::parse_platform(trimmed)
    }
}

impl fmt::Display for PlatformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.architecture)
    }
}

impl FromStr for PlatformDescriptor {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::resolve(s)
    }
}
