//! Target platform descriptors and capability detection for kiln.
//!
//! A build is configured from two inputs:
//! - **Platform:** the operating system and architecture being targeted
//! - **Capabilities:** the optional instruction-set extensions the build may use
//!
//! [`forced_off`] combines them into the set of flags that platform policy
//! disables no matter what the user asks for.

pub mod capability;
pub mod detect;
pub mod error;
pub mod parse;
pub mod platform;

pub use capability::{CapabilityFlag, CpuFeatures};
pub use detect::{forced_off, forced_off_with_cpu, policy_restricts, ForceReason, ForcedOff};
pub use error::{Result, TargetError};
pub use parse::{builtin_platforms, parse_platform};
pub use platform::{Architecture, OsFamily, PlatformDescriptor};
