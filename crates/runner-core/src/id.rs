//! Deterministic identifier derivation.
//!
//! Step ids are stable across runs of the same build:
//! `<project-slug>-<build-number>-<group-index>-<step-index>-<step-slug>`.
//! Container names embed the step id plus a short random suffix so that a
//! crashed run never collides with its successor.

use uuid::Uuid;

/// Lowercase a name into a slug safe for paths and container names.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("unnamed");
    }
    slug
}

/// Stable identifier for a step within a run.
pub fn step_id(
    project_slug: &str,
    build_number: u64,
    group_index: usize,
    step_index: usize,
    step_name: &str,
) -> String {
    format!(
        "{project_slug}-{build_number}-{group_index}-{step_index}-{}",
        slugify(step_name)
    )
}

/// Short random suffix for container and volume names.
pub fn short_suffix() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Name for a step container.
pub fn container_name(step_id: &str, suffix: &str) -> String {
    format!("pipeline-runner-{step_id}-{suffix}")
}

/// Name for a service container belonging to a step.
pub fn service_container_name(step_id: &str, service: &str, suffix: &str) -> String {
    format!("pipeline-runner-{step_id}-svc-{}-{suffix}", slugify(service))
}

/// Name for the per-step bridge network.
pub fn network_name(step_id: &str, suffix: &str) -> String {
    format!("pipeline-runner-{step_id}-{suffix}")
}

/// Name of the project-scoped Docker-in-Docker cache volume.
pub fn docker_cache_volume(project_slug: &str) -> String {
    format!("pipeline-runner-{project_slug}-docker")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_lowercases() {
        assert_eq!(slugify("Build & Test!"), "build-test");
        assert_eq!(slugify("  deploy to prod  "), "deploy-to-prod");
        assert_eq!(slugify("___"), "unnamed");
    }

    #[test]
    fn step_id_is_deterministic() {
        let a = step_id("my-proj", 7, 1, 0, "Run tests");
        let b = step_id("my-proj", 7, 1, 0, "Run tests");
        assert_eq!(a, b);
        assert_eq!(a, "my-proj-7-1-0-run-tests");
    }

    #[test]
    fn container_names_differ_per_suffix() {
        let id = step_id("p", 1, 0, 0, "build");
        let a = container_name(&id, &short_suffix());
        let b = container_name(&id, &short_suffix());
        assert_ne!(a, b);
        assert!(a.starts_with("pipeline-runner-p-1-0-0-build-"));
    }

    #[test]
    fn short_suffix_is_eight_hex_chars() {
        let s = short_suffix();
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn docker_cache_volume_embeds_slug() {
        assert_eq!(docker_cache_volume("my-proj"), "pipeline-runner-my-proj-docker");
    }
}
