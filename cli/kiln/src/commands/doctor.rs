//! `kiln doctor`: toolchain and host diagnostics.

use std::process::Command;

use anyhow::Result;
use kiln_targets::{forced_off, CapabilityFlag, CpuFeatures, PlatformDescriptor};

use super::Project;
use crate::manifest::DEFAULT_PROGRAM;

/// Print toolchain diagnostic information.
pub fn run(project: &Project) -> Result<()> {
    println!("=== kiln doctor ===");
    println!();
    println!("kiln version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("--- Host ---");
    let host = PlatformDescriptor::host();
    println!("  Platform: {host}");
    let cpu = CpuFeatures::probe_host();
    for flag in CapabilityFlag::ALL {
        println!(
            "  {flag:<6} {}",
            if cpu.supports(flag) { "supported" } else { "not supported" }
        );
    }
    let forced = forced_off(&host);
    if !forced.is_empty() {
        println!("  Forced off by platform policy: {}", join_flags(&forced.flags()));
    }
    println!();

    println!("--- Toolchain ---");
    let program = &project.manifest.build.program;
    if program != DEFAULT_PROGRAM {
        print_tool_status(program, &["--version"]);
    }
    if program != "cmake" {
        print_tool_status("cmake", &["--version"]);
    }
    print_tool_status("cc", &["--version"]);
    println!();

    println!("--- Project Status ---");
    if project.found {
        let build = &project.manifest.build;
        println!("  kiln.toml: found at {}", project.dir.display());
        println!("  Project:   {}", project.manifest.project.name);
        println!("  Platform:  {}", project.manifest.default_platform());
        let source = kiln_build::rebase(&project.dir, &build.source_dir);
        println!(
            "  Sources:   {} ({})",
            source.display(),
            if source.is_dir() { "present" } else { "missing" }
        );
        let build_dir = project.manifest.build_dir(&project.dir);
        println!(
            "  Build dir: {} ({})",
            build_dir.display(),
            if build_dir.is_dir() { "present" } else { "absent" }
        );
        for dest in project.manifest.destinations(&project.dir) {
            println!("  Stage to:  {}", dest.display());
        }
    } else {
        println!("  kiln.toml: not found (using defaults)");
    }

    Ok(())
}

fn join_flags(flags: &[CapabilityFlag]) -> String {
    flags
        .iter()
        .map(|f| f.name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_tool_status(name: &str, args: &[&str]) {
    match Command::new(name).args(args).output() {
        Ok(output) => {
            let version = String::from_utf8_lossy(&output.stdout);
            let first_line = version.lines().next().unwrap_or("(unknown version)");
            println!("  {name}: {first_line}");
        }
        Err(_) => {
            println!("  {name}: not found");
        }
    }
}
