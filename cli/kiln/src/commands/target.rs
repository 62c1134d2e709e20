//! `kiln target`: platform listing and description.

use anyhow::{Context, Result};
use kiln_build::{resolve, FlagRequests};
use kiln_targets::{builtin_platforms, forced_off, policy_restricts, PlatformDescriptor};

/// List the built-in platforms.
pub fn list() -> Result<()> {
    println!("Built-in platforms:");
    println!();
    for (platform, description) in builtin_platforms() {
        let marker = if policy_restricts(&platform) { " *" } else { "" };
        println!("  {:<16} {description}{marker}", platform.name());
    }
    println!();
    println!("  * extended SIMD flags are forced off on this platform");
    println!();
    println!("Any <os>-<arch> pair or target triple is accepted; 'host' means this machine.");
    println!("Use 'kiln target describe <platform>' for details.");
    Ok(())
}

/// Describe a platform: its descriptor, forced-off set and default configuration.
pub fn describe(name: &str) -> Result<()> {
    let platform = PlatformDescriptor::resolve(name)
        .context("use 'kiln target list' to see built-in platforms")?;
    print!("{}", render(&platform));
    Ok(())
}

fn render(platform: &PlatformDescriptor) -> String {
    let forced = forced_off(platform);
    let config = resolve(&FlagRequests::new(), &forced);

    let mut out = format!("=== Platform: {platform} ===\n");
    out.push_str(&format!("  OS:           {}\n", platform.os));
    out.push_str(&format!("  Architecture: {}\n", platform.architecture));
    out.push('\n');
    if forced.is_empty() {
        out.push_str("--- Forced off: none ---\n");
    } else {
        out.push_str(&format!("--- Forced off ({}) ---\n", forced.len()));
        for flag in forced.flags() {
            if let Some(reason) = forced.reason(flag) {
                out.push_str(&format!("  {flag:<6} {reason}\n"));
            }
        }
    }
    out.push('\n');
    out.push_str("--- Default configuration ---\n");
    out.push_str(&config.to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_runs() {
        list().unwrap();
    }

    #[test]
    fn describe_known_platform() {
        assert!(describe("linux-x86_64").is_ok());
        assert!(describe("x86_64-apple-darwin").is_ok());
    }

    #[test]
    fn describe_unknown_platform() {
        let err = describe("nonexistent").unwrap_err();
        assert!(format!("{err:#}").contains("nonexistent"));
    }

    #[test]
    fn render_intel_mac() {
        let text = render(&PlatformDescriptor::resolve("macos-x86_64").unwrap());
        assert!(text.contains("Forced off (4)"));
        assert!(text.contains("platform policy"));
        assert!(!text.contains(" on "));
    }

    #[test]
    fn render_apple_silicon() {
        let text = render(&PlatformDescriptor::resolve("macos-aarch64").unwrap());
        assert!(text.contains("Forced off: none"));
        assert!(text.contains("avx2   on   default"));
    }
}
