//! Project context discovery.
//!
//! Repository identity comes from the working copy: the slug from the
//! directory name, branch and commit from `git`, owner/slug from the
//! `origin` remote when one exists.

use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use runner_core::context::ProjectInfo;
use runner_core::id::slugify;

use crate::error::{ConfigError, ConfigResult};

// Matches both `git@host:owner/repo.git` and `https://host/owner/repo.git`.
static REMOTE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[:/]([^/:]+)/([^/:]+?)(?:\.git)?/?$").unwrap());

/// Build a [`ProjectInfo`] for the project rooted at `root`.
pub fn discover(root: &Path) -> ConfigResult<ProjectInfo> {
    let root = root.canonicalize()?;
    let dir_name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "project root".to_string(),
            message: "has no directory name".to_string(),
        })?;
    let slug = slugify(&dir_name);

    let branch = run_git(&root, &["rev-parse", "--abbrev-ref", "HEAD"])
        .filter(|b| b != "HEAD")
        .unwrap_or_else(|| "master".to_string());
    let commit = run_git(&root, &["rev-parse", "HEAD"]).unwrap_or_default();
    let remote = run_git(&root, &["config", "--get", "remote.origin.url"]);

    let (repo_owner, repo_slug) = remote
        .as_deref()
        .and_then(parse_remote)
        .unwrap_or_else(|| ("local".to_string(), slug.clone()));

    Ok(ProjectInfo {
        root,
        slug,
        repo_owner,
        repo_slug,
        branch,
        commit,
    })
}

fn run_git(root: &Path, args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_remote(url: &str) -> Option<(String, String)> {
    REMOTE_REGEX
        .captures(url)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}
