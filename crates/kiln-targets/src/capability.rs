//! Optional CPU instruction-set extensions a native build may use.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TargetError;
use crate::platform::Architecture;

/// An optional instruction-set extension the vendored library can be
/// compiled to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityFlag {
    /// Advanced Vector Extensions.
    Avx,
    /// Advanced Vector Extensions 2.
    Avx2,
    /// Fused multiply-add.
    Fma,
    /// Half-precision float conversion.
    F16c,
}

impl CapabilityFlag {
    /// Every flag, in resolution and reporting order.
    pub const ALL: [CapabilityFlag; 4] = [
        CapabilityFlag::Avx,
        CapabilityFlag::Avx2,
        CapabilityFlag::Fma,
        CapabilityFlag::F16c,
    ];

    /// Lowercase name used on the command line and in `kiln.toml`.
    pub fn name(self) -> &'static str {
        match self {
            CapabilityFlag::Avx => "avx",
            CapabilityFlag::Avx2 => "avx2",
            CapabilityFlag::Fma => "fma",
            CapabilityFlag::F16c => "f16c",
        }
    }

    /// Name in the native toolchain's option vocabulary (before any prefix).
    pub fn toolchain_name(self) -> &'static str {
        match self {
            CapabilityFlag::Avx => "AVX",
            CapabilityFlag::Avx2 => "AVX2",
            CapabilityFlag::Fma => "FMA",
            CapabilityFlag::F16c => "F16C",
        }
    }

    /// State used when neither policy nor the user says otherwise.
    pub fn default_enabled(self) -> bool {
        true
    }
}

impl fmt::Display for CapabilityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for CapabilityFlag {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        CapabilityFlag::ALL
            .into_iter()
            .find(|flag| flag.name() == lower)
            .ok_or(TargetError::UnknownFlag {
                name: s.to_string(),
            })
    }
}

/// A snapshot of which capability flags a concrete CPU supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuFeatures {
    /// Architecture of the CPU the snapshot was taken on.
    pub architecture: Architecture,
    /// Flags the CPU supports.
    pub supported: Vec<CapabilityFlag>,
}

impl CpuFeatures {
    pub fn new(architecture: Architecture, supported: Vec<CapabilityFlag>) -> Self {
        Self {
            architecture,
            supported,
        }
    }

    /// Probe the CPU kiln is running on.
    ///
    /// On non-x86 hosts none of the flags exist, so the snapshot is empty.
    pub fn probe_host() -> Self {
        let architecture = Architecture::parse(std::env::consts::ARCH);
        let supported = probe_supported();
        tracing::debug!(
            target: "kiln::detect",
            arch = %architecture,
            supported = ?supported,
            "probed host CPU features"
        );
        Self {
            architecture,
            supported,
        }
    }

    pub fn supports(&self, flag: CapabilityFlag) -> bool {
        self.supported.contains(&flag)
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn probe_supported() -> Vec<CapabilityFlag> {
    let mut supported = Vec::new();
    if is_x86_feature_detected!("avx") {
        supported.push(CapabilityFlag::Avx);
    }
    if is_x86_feature_detected!("avx2") {
        supported.push(CapabilityFlag::Avx2);
    }
    if is_x86_feature_detected!("fma") {
        supported.push(CapabilityFlag::Fma);
    }
    if is_x86_feature_detected!("f16c") {
        supported.push(CapabilityFlag::F16c);
    }
    supported
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn probe_supported() -> Vec<CapabilityFlag> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag_names() {
        assert_eq!("avx".parse::<CapabilityFlag>().unwrap(), CapabilityFlag::Avx);
        assert_eq!("AVX2".parse::<CapabilityFlag>().unwrap(), CapabilityFlag::Avx2);
        assert_eq!(" fma ".parse::<CapabilityFlag>().unwrap(), CapabilityFlag::Fma);
        assert_eq!("f16c".parse::<CapabilityFlag>().unwrap(), CapabilityFlag::F16c);
        assert!("avx512".parse::<CapabilityFlag>().is_err());
    }

    #[test]
    fn all_flags_default_on() {
        for flag in CapabilityFlag::ALL {
            assert!(flag.default_enabled());
            assert_eq!(flag.toolchain_name(), flag.name().to_ascii_uppercase());
        }
    }

    #[test]
    fn probe_host_matches_architecture() {
        let cpu = CpuFeatures::probe_host();
        assert_eq!(cpu.architecture, Architecture::parse(std::env::consts::ARCH));
        if !cpu.architecture.is_x86_family() {
            assert!(cpu.supported.is_empty());
        }
    }

    #[test]
    fn explicit_snapshot() {
        let cpu = CpuFeatures::new(Architecture::X86_64, vec![CapabilityFlag::Avx]);
        assert!(cpu.supports(CapabilityFlag::Avx));
        assert!(!cpu.supports(CapabilityFlag::Avx2));
    }
}
