//! Per-invocation run context.
//!
//! All identity, paths, variables, and cancellation state for one run are
//! carried in a single explicit value threaded through the coordinator and
//! executor. There is no ambient global state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::pipeline::Step;
use crate::variable::{VarOrigin, Variable, VariableSet};

/// Project source and working directory inside the step container.
pub const CLONE_DIR: &str = "/opt/atlassian/pipelines/agent/build";
/// SSH material mount point inside the step container.
pub const SSH_DIR: &str = "/opt/atlassian/pipelines/agent/ssh";
/// Agent scratch mount carrying the generated shell program.
pub const AGENT_TMP_DIR: &str = "/opt/atlassian/pipelines/agent/tmp";
/// Forwarded SSH agent socket path inside the step container.
pub const SSH_AGENT_SOCK: &str = "/ssh-agent";
/// Docker daemon socket path shared by the `docker` service.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Where the run is executing from: repository identity and git state.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    /// Project root on the host.
    pub root: PathBuf,
    /// Slug derived from the project directory name.
    pub slug: String,
    pub repo_owner: String,
    pub repo_slug: String,
    pub branch: String,
    pub commit: String,
}

impl ProjectInfo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_slug)
    }
}

/// SSH forwarding configuration for the run.
#[derive(Debug, Clone)]
pub struct SshForwarding {
    /// Private key copied into the step container.
    pub key_path: PathBuf,
    /// Host-side agent socket to bind-mount, when present.
    pub agent_sock: Option<PathBuf>,
}

/// A user-defined host → container bind mount.
#[derive(Debug, Clone)]
pub struct UserVolume {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Per-invocation identity, directories, variables, and cancellation.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Stable identifier for this invocation.
    pub run_id: String,
    pub pipeline_uuid: Uuid,
    pub project: ProjectInfo,
    /// Monotonic per project.
    pub build_number: u64,
    /// `<data-root>/<project-slug>/<build-number>`.
    pub run_dir: PathBuf,
    /// `<cache-root>/<project-slug>`.
    pub cache_dir: PathBuf,
    /// Pipeline-declared (resolved) and user-supplied variables.
    pub variables: VariableSet,
    /// Whether a controlling terminal is attached.
    pub interactive: bool,
    /// Apply CPU/memory limits derived from the step size.
    pub cpu_limits: bool,
    /// Remove build directories at run end instead of keeping them.
    pub cleanup_build: bool,
    pub ssh: Option<SshForwarding>,
    pub extra_volumes: Vec<UserVolume>,
    pub started_at: DateTime<Utc>,
    pub cancel: CancelToken,
}

impl RunContext {
    /// Log directory for one step.
    pub fn step_dir(&self, step_id: &str) -> PathBuf {
        self.run_dir.join("steps").join(step_id)
    }

    pub fn pipeline_log_path(&self) -> PathBuf {
        self.run_dir.join("pipeline.log")
    }

    /// Assemble the full environment for one step, per the precedence
    /// rules: step-local > user-supplied > deployment > pipeline-declared >
    /// system.
    pub fn step_variables(
        &self,
        step: &Step,
        step_uuid: Uuid,
        parallel: Option<(usize, usize)>,
        deployment_vars: &[(String, String)],
        oidc_token: Option<String>,
    ) -> VariableSet {
        let mut set = self.variables.clone();

        for (name, value) in self.system_variables(step, step_uuid, parallel) {
            set.push(Variable::new(name, value, VarOrigin::System));
        }
        for (name, value) in deployment_vars {
            set.push(Variable::secret(name.clone(), value.clone(), VarOrigin::Deployment));
        }
        for (name, value) in &step.variables {
            set.push(Variable::new(name.clone(), value.clone(), VarOrigin::StepLocal));
        }
        if let Some(token) = oidc_token {
            set.push(Variable::secret("BITBUCKET_STEP_OIDC_TOKEN", token, VarOrigin::Oidc));
        }
        set
    }

    fn system_variables(
        &self,
        step: &Step,
        step_uuid: Uuid,
        parallel: Option<(usize, usize)>,
    ) -> Vec<(String, String)> {
        let mut vars = vec![
            ("CI".to_string(), "true".to_string()),
            ("BITBUCKET_BUILD_NUMBER".to_string(), self.build_number.to_string()),
            (
                "BITBUCKET_PIPELINE_UUID".to_string(),
                format!("{{{}}}", self.pipeline_uuid),
            ),
            ("BITBUCKET_STEP_UUID".to_string(), format!("{{{step_uuid}}}")),
            ("BITBUCKET_REPO_SLUG".to_string(), self.project.repo_slug.clone()),
            ("BITBUCKET_REPO_OWNER".to_string(), self.project.repo_owner.clone()),
            ("BITBUCKET_REPO_FULL_NAME".to_string(), self.project.full_name()),
            ("BITBUCKET_CLONE_DIR".to_string(), CLONE_DIR.to_string()),
            ("BITBUCKET_BRANCH".to_string(), self.project.branch.clone()),
            ("BITBUCKET_COMMIT".to_string(), self.project.commit.clone()),
        ];
        if let Some((index, count)) = parallel {
            vars.push(("BITBUCKET_PARALLEL_STEP".to_string(), index.to_string()));
            vars.push(("BITBUCKET_PARALLEL_STEP_COUNT".to_string(), count.to_string()));
        }
        if let Some(deployment) = &step.deployment {
            vars.push((
                "BITBUCKET_DEPLOYMENT_ENVIRONMENT".to_string(),
                deployment.clone(),
            ));
        }
        vars
    }

    /// Resolved name → value environment for credential expansion.
    pub fn env_map(&self) -> HashMap<String, String> {
        self.variables.merged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> RunContext {
        RunContext {
            run_id: "run-1".into(),
            pipeline_uuid: Uuid::nil(),
            project: ProjectInfo {
                root: PathBuf::from("/tmp/proj"),
                slug: "proj".into(),
                repo_owner: "acme".into(),
                repo_slug: "proj".into(),
                branch: "main".into(),
                commit: "abc123".into(),
            },
            build_number: 42,
            run_dir: PathBuf::from("/tmp/data/proj/42"),
            cache_dir: PathBuf::from("/tmp/cache/proj"),
            variables: VariableSet::new(),
            interactive: false,
            cpu_limits: false,
            cleanup_build: false,
            ssh: None,
            extra_volumes: Vec::new(),
            started_at: Utc::now(),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn system_variables_cover_the_bitbucket_set() {
        let ctx = test_context();
        let step = Step {
            name: "build".into(),
            ..Step::default()
        };
        let set = ctx.step_variables(&step, Uuid::nil(), None, &[], None);
        let env = set.merged();
        assert_eq!(env.get("CI").map(String::as_str), Some("true"));
        assert_eq!(env.get("BITBUCKET_BUILD_NUMBER").map(String::as_str), Some("42"));
        assert_eq!(env.get("BITBUCKET_REPO_FULL_NAME").map(String::as_str), Some("acme/proj"));
        assert_eq!(env.get("BITBUCKET_CLONE_DIR").map(String::as_str), Some(CLONE_DIR));
        assert_eq!(env.get("BITBUCKET_BRANCH").map(String::as_str), Some("main"));
        assert!(!env.contains_key("BITBUCKET_PARALLEL_STEP"));
        assert!(!env.contains_key("BITBUCKET_DEPLOYMENT_ENVIRONMENT"));
    }

    #[test]
    fn parallel_and_deployment_variables_appear_when_set() {
        let ctx = test_context();
        let step = Step {
            name: "deploy".into(),
            deployment: Some("production".into()),
            ..Step::default()
        };
        let set = ctx.step_variables(&step, Uuid::nil(), Some((1, 3)), &[], None);
        let env = set.merged();
        assert_eq!(env.get("BITBUCKET_PARALLEL_STEP").map(String::as_str), Some("1"));
        assert_eq!(env.get("BITBUCKET_PARALLEL_STEP_COUNT").map(String::as_str), Some("3"));
        assert_eq!(
            env.get("BITBUCKET_DEPLOYMENT_ENVIRONMENT").map(String::as_str),
            Some("production")
        );
    }

    #[test]
    fn step_local_overrides_user_supplied() {
        let mut ctx = test_context();
        ctx.variables
            .push(Variable::new("LEVEL", "user", VarOrigin::UserSupplied));
        let mut step = Step {
            name: "s".into(),
            ..Step::default()
        };
        step.variables.insert("LEVEL".into(), "step".into());
        let set = ctx.step_variables(&step, Uuid::nil(), None, &[], None);
        assert_eq!(set.get("LEVEL"), Some("step"));
    }

    #[test]
    fn oidc_token_is_secret() {
        let ctx = test_context();
        let step = Step {
            name: "s".into(),
            oidc: true,
            ..Step::default()
        };
        let set = ctx.step_variables(&step, Uuid::nil(), None, &[], Some("jwt-token".into()));
        assert_eq!(set.get("BITBUCKET_STEP_OIDC_TOKEN"), Some("jwt-token"));
        assert!(set.secret_values().contains(&"jwt-token".to_string()));
    }
}
