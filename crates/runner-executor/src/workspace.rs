//! Build directory population and artifact movement.
//!
//! The project source is copied into each step's build directory honouring
//! `.gitignore` (tracked plus untracked-but-not-ignored files). Artifacts
//! are matched by glob patterns evaluated against the build directory only:
//! patterns rooted outside it (`~/...`, absolute, or containing `..`) are
//! silently dropped, and patterns that match nothing produce a warning, not
//! an error.

use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use walkdir::WalkDir;

use runner_core::Result;
use runner_core::result::ArtifactEntry;

/// Copy the project source into a build directory, honouring `.gitignore`.
/// Returns the number of files copied.
pub fn copy_source(project_root: &Path, build_dir: &Path) -> Result<usize> {
    let mut copied = 0;
    let walk = WalkBuilder::new(project_root)
        .hidden(false)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    for entry in walk {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry during source copy");
                continue;
            }
        };
        let Ok(rel) = entry.path().strip_prefix(project_root) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = build_dir.join(rel);
        copied += copy_entry(entry.path(), &dest)?;
    }
    Ok(copied)
}

fn copy_entry(src: &Path, dest: &Path) -> Result<usize> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir_all(dest)?;
        Ok(0)
    } else if meta.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(dest);
        std::os::unix::fs::symlink(target, dest)?;
        Ok(1)
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)?;
        Ok(1)
    }
}

/// Whether an artifact pattern stays inside the build directory.
fn pattern_is_safe(pattern: &str) -> bool {
    if pattern.starts_with('/') || pattern.starts_with('~') {
        return false;
    }
    !Path::new(pattern)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Evaluate artifact patterns inside `build_dir` and copy matches into
/// `staging`, preserving relative paths and file modes. Per-file I/O
/// failures are logged and skipped.
pub fn collect_artifacts(
    build_dir: &Path,
    patterns: &[String],
    staging: &Path,
) -> Result<Vec<ArtifactEntry>> {
    let mut matchers: Vec<(String, GlobMatcher, bool)> = Vec::new();
    for pattern in patterns {
        if !pattern_is_safe(pattern) {
            continue;
        }
        match Glob::new(pattern) {
            Ok(glob) => matchers.push((pattern.clone(), glob.compile_matcher(), false)),
            Err(e) => warn!(pattern = %pattern, error = %e, "ignoring invalid artifact pattern"),
        }
    }
    if matchers.is_empty() {
        return Ok(Vec::new());
    }

    std::fs::create_dir_all(staging)?;
    let mut entries = Vec::new();

    for entry in WalkDir::new(build_dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry during artifact collection");
                continue;
            }
        };
        // Files and symlinks-to-files; directories themselves are never
        // collected.
        let is_file = entry.file_type().is_file()
            || (entry.file_type().is_symlink() && entry.path().is_file());
        if !is_file {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(build_dir) else {
            continue;
        };

        let mut wanted = false;
        for (_, matcher, matched) in matchers.iter_mut() {
            if matcher.is_match(rel) {
                *matched = true;
                wanted = true;
            }
        }
        if !wanted {
            continue;
        }

        let dest = staging.join(rel);
        if let Some(parent) = dest.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %rel.display(), error = %e, "failed to stage artifact");
                continue;
            }
        }
        match std::fs::copy(entry.path(), &dest) {
            Ok(size) => entries.push(ArtifactEntry {
                path: rel.to_string_lossy().to_string(),
                size,
            }),
            Err(e) => warn!(path = %rel.display(), error = %e, "failed to stage artifact"),
        }
    }

    for (pattern, _, matched) in &matchers {
        if !matched {
            warn!(pattern = %pattern, "artifact pattern matched no files");
        }
    }

    Ok(entries)
}

/// Copy a staged tree into a build directory, preserving relative paths.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry =
            entry.map_err(|e| runner_core::Error::ArtifactCollection(e.to_string()))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        copied += copy_entry(entry.path(), &dest.join(rel))?;
    }
    Ok(copied)
}

/// Per-run artifact store: the ordered list of step staging directories.
///
/// Artifacts from any completed step are visible to all subsequent steps;
/// rehydration replays each staging tree in collection order.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    staged: Mutex<Vec<PathBuf>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's staging directory after collection.
    pub fn record(&self, staging: PathBuf) {
        if let Ok(mut staged) = self.staged.lock() {
            staged.push(staging);
        }
    }

    /// Copy every recorded staging tree into a build directory.
    pub fn rehydrate_into(&self, build_dir: &Path) -> Result<usize> {
        let roots = match self.staged.lock() {
            Ok(staged) => staged.clone(),
            Err(_) => Vec::new(),
        };
        let mut copied = 0;
        for root in roots {
            copied += copy_tree(&root, build_dir)?;
        }
        Ok(copied)
    }
}
