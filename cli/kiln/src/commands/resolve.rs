//! `kiln resolve`: show the forced-off set and resolved configuration without building.

use std::ffi::OsStr;

use anyhow::{Context, Result};
use kiln_build::{resolve, BuildConfiguration, FlagRequests};
use kiln_targets::{forced_off_with_cpu, ForcedOff, PlatformDescriptor};
use serde::Serialize;

use super::{Project, ReportFormat};

#[derive(Debug, Serialize)]
struct Resolution {
    platform: PlatformDescriptor,
    forced_off: ForcedOff,
    configuration: BuildConfiguration,
}

/// Resolve the build configuration for a platform and print it.
pub fn run(
    project: &Project,
    platform: Option<&str>,
    flags: &[String],
    probe_cpu: bool,
    format: ReportFormat,
) -> Result<()> {
    let resolution = compute(project, platform, flags, probe_cpu, std::env::vars_os())?;
    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&resolution)?),
        ReportFormat::Text => {
            println!("Platform: {}", resolution.platform);
            if resolution.forced_off.is_empty() {
                println!("Forced off: none");
            } else {
                println!("Forced off:");
                for flag in resolution.forced_off.flags() {
                    if let Some(reason) = resolution.forced_off.reason(flag) {
                        println!("  {flag:<6} {reason}");
                    }
                }
            }
            println!();
            println!("Configuration:");
            print!("{}", resolution.configuration);
        }
    }
    Ok(())
}

fn compute<I, K, V>(
    project: &Project,
    platform: Option<&str>,
    flags: &[String],
    probe_cpu: bool,
    env: I,
) -> Result<Resolution>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let platform = project.platform(platform)?;
    let cpu = project.cpu_snapshot(probe_cpu);
    let forced_off = forced_off_with_cpu(&platform, cpu.as_ref());
    let requests = FlagRequests::collect(&project.flag_requests(env, flags))
        .context("collecting flag requests")?;
    let configuration = resolve(&requests, &forced_off);
    Ok(Resolution {
        platform,
        forced_off,
        configuration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_build::{Provenance, RequestSource, ResolveError};
    use kiln_targets::{CapabilityFlag, ForceReason};

    fn project() -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kiln.toml"),
            "[project]\nname = \"p\"\n[features]\nf16c = \"off\"\n",
        )
        .unwrap();
        let project = Project::discover(dir.path()).unwrap();
        (dir, project)
    }

    #[test]
    fn intel_mac_forces_everything_off() {
        let (_dir, project) = project();
        let r = compute(
            &project,
            Some("x86_64-apple-darwin"),
            &["avx=on".to_string()],
            false,
            Vec::<(String, String)>::new(),
        )
        .unwrap();
        assert_eq!(r.forced_off.len(), 4);
        assert!(r.configuration.enabled_flags().is_empty());
        let avx = r.configuration.get(CapabilityFlag::Avx).unwrap();
        assert_eq!(
            avx.provenance,
            Provenance::Forced {
                reason: ForceReason::PlatformPolicy
            }
        );
        assert_eq!(avx.overridden_request, Some(true));
    }

    #[test]
    fn command_line_beats_environment_beats_manifest() {
        let (_dir, project) = project();
        let r = compute(
            &project,
            Some("linux-x86_64"),
            &["avx2=off".to_string()],
            false,
            vec![("KILN_FLAG_F16C", "on"), ("KILN_FLAG_AVX2", "on")],
        )
        .unwrap();
        let f16c = r.configuration.get(CapabilityFlag::F16c).unwrap();
        assert!(f16c.enabled);
        assert_eq!(
            f16c.provenance,
            Provenance::Requested {
                source: RequestSource::Environment
            }
        );
        assert!(!r.configuration.is_enabled(CapabilityFlag::Avx2));
        assert!(r.configuration.is_enabled(CapabilityFlag::Avx));
    }

    #[test]
    fn invalid_request_is_rejected() {
        let (_dir, project) = project();
        let err = compute(
            &project,
            Some("linux-x86_64"),
            &["avx=maybe".to_string()],
            false,
            Vec::<(String, String)>::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ResolveError>(),
            Some(ResolveError::InvalidFlagRequest { .. })
        ));
    }
}
