//! `kiln clean`: remove the build directory.

use std::fs;

use anyhow::{Context, Result};

use super::Project;

/// Remove the project's build directory. Staged copies are left alone.
pub fn run(project: &Project) -> Result<()> {
    let build_dir = project.manifest.build_dir(&project.dir);
    if build_dir.exists() {
        fs::remove_dir_all(&build_dir)
            .with_context(|| format!("removing {}", build_dir.display()))?;
        println!("Removed {}", build_dir.display());
    } else {
        println!("Already clean: {} does not exist", build_dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(dir: &std::path::Path) -> Project {
        fs::write(
            dir.join("kiln.toml"),
            "[project]\nname = \"p\"\n[build]\nbuild_dir = \"out\"\n",
        )
        .unwrap();
        Project::discover(dir).unwrap()
    }

    #[test]
    fn clean_removes_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("libllama.so"), b"data").unwrap();
        let staged = dir.path().join("llama_cpp/lib");
        fs::create_dir_all(&staged).unwrap();

        run(&project(dir.path())).unwrap();
        assert!(!out.exists());
        assert!(staged.exists());
    }

    #[test]
    fn clean_handles_already_clean() {
        let dir = tempfile::tempdir().unwrap();
        run(&project(dir.path())).unwrap();
    }
}
