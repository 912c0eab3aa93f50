//! Data and cache directory resolution.
//!
//! Runs write logs and artifacts under
//! `<data-root>/<project-slug>/<build-number>/` and caches under
//! `<cache-root>/<project-slug>/`. Both roots can be overridden through the
//! environment.

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};

pub const DATA_DIR_ENV: &str = "PIPELINE_RUNNER_DATA_DIR";
pub const CACHE_DIR_ENV: &str = "PIPELINE_RUNNER_CACHE_DIR";

const APP_DIR: &str = "pipeline-runner";

/// Root of all run output trees.
pub fn data_root() -> ConfigResult<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or_else(|| ConfigError::MissingField("user data directory".to_string()))
}

/// Root of all cache directories.
pub fn cache_root() -> ConfigResult<PathBuf> {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::cache_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or_else(|| ConfigError::MissingField("user cache directory".to_string()))
}

/// Output tree for one run.
pub fn run_dir(data_root: &Path, project_slug: &str, build_number: u64) -> PathBuf {
    data_root.join(project_slug).join(build_number.to_string())
}

/// Allocate the next build number for a project: read the counter file,
/// increment, persist. Build numbers are monotonic per project.
pub fn next_build_number(data_root: &Path, project_slug: &str) -> ConfigResult<u64> {
    let project_dir = data_root.join(project_slug);
    std::fs::create_dir_all(&project_dir)?;
    let counter = project_dir.join("build-number");

    let current = match std::fs::read_to_string(&counter) {
        Ok(content) => content.trim().parse::<u64>().unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    let next = current + 1;
    std::fs::write(&counter, format!("{next}\n"))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_numbers_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_build_number(dir.path(), "proj").unwrap(), 1);
        assert_eq!(next_build_number(dir.path(), "proj").unwrap(), 2);
        assert_eq!(next_build_number(dir.path(), "proj").unwrap(), 3);
        // Independent per project.
        assert_eq!(next_build_number(dir.path(), "other").unwrap(), 1);
    }

    #[test]
    fn corrupt_counter_restarts_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("build-number"), "not a number").unwrap();
        assert_eq!(next_build_number(dir.path(), "proj").unwrap(), 1);
    }

    #[test]
    fn run_dir_layout() {
        let root = PathBuf::from("/data");
        assert_eq!(
            run_dir(&root, "proj", 7),
            PathBuf::from("/data/proj/7")
        );
    }
}
