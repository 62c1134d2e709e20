//! Parsing of platform strings and the table of built-in platforms.
//!
//! Two spellings are accepted: the short `<os>-<arch>` form used in
//! `kiln.toml` (`macos-x86_64`, `linux-aarch64`) and compiler target
//! triples (`x86_64-apple-darwin`, `aarch64-unknown-linux-gnu`).

use crate::error::{Result, TargetError};
use crate::platform::{Architecture, OsFamily, PlatformDescriptor};

/// Parse a platform string in either short or triple form.
pub fn parse_platform(input: &str) -> Result<PlatformDescriptor> {
    let unrecognized = || TargetError::UnrecognizedPlatform {
        input: input.to_string(),
    };

    let parts: Vec<&str> = input.split('-').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] | [_] => Err(unrecognized()),
        [first, second] => {
            let os = OsFamily::parse(first);
            let arch = Architecture::parse(second);
            if is_known_os(&os) && is_known_arch(&arch) {
                return Ok(PlatformDescriptor::new(os, arch));
            }
            // `<arch>-<os>`, e.g. `aarch64-linux`
            let os = OsFamily::parse(second);
            let arch = Architecture::parse(first);
            if is_known_os(&os) && is_known_arch(&arch) {
                return Ok(PlatformDescriptor::new(os, arch));
            }
            Err(unrecognized())
        }
        [arch, rest @ ..] => {
            let arch = Architecture::parse(arch);
            if !is_known_arch(&arch) {
                return Err(unrecognized());
            }
            // The vendor field may itself name the OS (`apple`).
            let os = rest
                .iter()
                .map(|p| OsFamily::parse(p))
                .find(is_known_os)
                .ok_or_else(unrecognized)?;
            Ok(PlatformDescriptor::new(os, arch))
        }
    }
}

fn is_known_os(os: &OsFamily) -> bool {
    !matches!(os, OsFamily::Other(_))
}

fn is_known_arch(arch: &Architecture) -> bool {
    !matches!(arch, Architecture::Other(_))
}

/// Built-in platforms with a one-line description each.
pub fn builtin_platforms() -> Vec<(PlatformDescriptor, &'static str)> {
    vec![
        (
            PlatformDescriptor::new(OsFamily::MacOs, Architecture::X86_64),
            "Intel macOS (extended SIMD disabled by policy)",
        ),
        (
            PlatformDescriptor::new(OsFamily::MacOs, Architecture::Aarch64),
            "Apple Silicon macOS",
        ),
        (
            PlatformDescriptor::new(OsFamily::Linux, Architecture::X86_64),
            "Generic Linux x86-64",
        ),
        (
            PlatformDescriptor::new(OsFamily::Linux, Architecture::Aarch64),
            "Generic Linux AArch64",
        ),
        (
            PlatformDescriptor::new(OsFamily::Windows, Architecture::X86_64),
            "Windows x86-64",
        ),
    ]
}
