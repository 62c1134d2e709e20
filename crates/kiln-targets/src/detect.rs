//! Capability detection: which flags must be forced off for a platform.
//!
//! The platform rule disables every extended SIMD flag on Intel macOS, where
//! older machines in the fleet lack them and the built library would die with
//! an illegal instruction. A CPU snapshot, when supplied, narrows the set
//! further to what the actual processor supports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityFlag, CpuFeatures};
use crate::platform::{OsFamily, PlatformDescriptor};

/// Why a flag was forced off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForceReason {
    /// The platform policy disables this flag.
    PlatformPolicy,
    /// The probed CPU does not implement this extension.
    CpuFeatureMissing,
}

impl fmt::Display for ForceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForceReason::PlatformPolicy => f.write_str("platform policy"),
            ForceReason::CpuFeatureMissing => f.write_str("CPU lacks extension"),
        }
    }
}

/// The set of flags disabled regardless of any user request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedOff {
    entries: Vec<(CapabilityFlag, ForceReason)>,
}

impl ForcedOff {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, flag: CapabilityFlag) -> bool {
        self.entries.iter().any(|(f, _)| *f == flag)
    }

    /// Reason the flag is forced off, if it is.
    pub fn reason(&self, flag: CapabilityFlag) -> Option<ForceReason> {
        self.entries
            .iter()
            .find(|(f, _)| *f == flag)
            .map(|(_, r)| *r)
    }

    /// Forced-off flags in [`CapabilityFlag::ALL`] order.
    pub fn flags(&self) -> Vec<CapabilityFlag> {
        self.entries.iter().map(|(f, _)| *f).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // First reason wins; platform policy is always inserted before CPU probing.
    fn insert(&mut self, flag: CapabilityFlag, reason: ForceReason) {
        if !self.contains(flag) {
            self.entries.push((flag, reason));
            self.entries.sort_by_key(|(f, _)| *f);
        }
    }
}

/// Whether the platform policy restricts extended SIMD flags.
pub fn policy_restricts(platform: &PlatformDescriptor) -> bool {
    platform.os == OsFamily::MacOs && !platform.architecture.is_arm64()
}

/// Forced-off set from the platform policy alone. Pure and total.
pub fn forced_off(platform: &PlatformDescriptor) -> ForcedOff {
    let mut set = ForcedOff::empty();
    if policy_restricts(platform) {
        for flag in CapabilityFlag::ALL {
            set.insert(flag, ForceReason::PlatformPolicy);
        }
    }
    set
}

/// Forced-off set from the platform policy, narrowed by a CPU snapshot.
///
/// The snapshot only applies when its architecture matches the platform's;
/// a snapshot of the build host says nothing about a cross target.
pub fn forced_off_with_cpu(platform: &PlatformDescriptor, cpu: Option<&CpuFeatures>) -> ForcedOff {
    let mut set = forced_off(platform);
    let Some(cpu) = cpu else {
        return set;
    };
    if cpu.architecture != platform.architecture {
        tracing::debug!(
            target: "kiln::detect",
            platform = %platform,
            cpu_arch = %cpu.architecture,
            "CPU snapshot does not match target architecture, ignoring"
        );
        return set;
    }
    for flag in CapabilityFlag::ALL {
        if !cpu.supports(flag) {
            set.insert(flag, ForceReason::CpuFeatureMissing);
        }
    }
    set
}
