//! Pipeline, step group, and step definitions.
//!
//! These types are the validated in-memory model produced by the
//! configuration parser and consumed by the coordinator and executor. They
//! are immutable after construction.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The fully parsed pipeline document: default image, shared definitions,
/// and every addressable pipeline keyed by its selector (`default`,
/// `custom.<name>`, `branches.<pattern>`, ...).
#[derive(Debug, Clone, Default)]
pub struct PipelineSet {
    /// Default image for steps that do not declare their own.
    pub image: Option<ImageSpec>,
    /// Shared cache and service definitions.
    pub definitions: Definitions,
    /// All pipelines, in document order.
    pub pipelines: IndexMap<String, Pipeline>,
}

impl PipelineSet {
    /// Look up a pipeline by its selector.
    pub fn get(&self, selector: &str) -> Option<&Pipeline> {
        self.pipelines.get(selector)
    }
}

/// Shared `definitions` block: named caches and services.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    pub caches: IndexMap<String, CacheSpec>,
    pub services: IndexMap<String, ServiceSpec>,
}

/// An ordered list of step groups addressable by a named key.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Selector this pipeline is addressed by (e.g. `custom.deploy`).
    pub selector: String,
    /// Variables declared by the pipeline (custom pipelines only).
    pub variables: Vec<DeclaredVariable>,
    /// Step groups, in declared order.
    pub groups: Vec<StepGroup>,
}

/// A variable declared by a custom pipeline, optionally constrained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredVariable {
    pub name: String,
    /// Default value. A declared variable with no default is required.
    pub default: Option<String>,
    /// Allowed values; empty means unconstrained.
    pub allowed_values: Vec<String>,
}

/// Execution mode of a step group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMode {
    Sequential,
    Parallel,
}

/// One entry of a pipeline: a single sequential step, or a parallel block
/// of two or more steps. The parser enforces both shapes.
#[derive(Debug, Clone)]
pub struct StepGroup {
    pub index: usize,
    pub mode: GroupMode,
    pub steps: Vec<Step>,
}

/// Whether a step starts on its own or waits for confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Trigger {
    #[default]
    Automatic,
    Manual,
}

/// A single scripted unit of work running in one container.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    /// Step image; falls back to the document default, then the built-in.
    pub image: Option<ImageSpec>,
    /// Script lines, run in order.
    pub script: Vec<String>,
    /// After-script lines; run regardless of the script's exit code.
    pub after_script: Vec<String>,
    /// Names of services to start for this step.
    pub services: Vec<String>,
    /// Names of caches to mount into this step.
    pub caches: Vec<String>,
    /// Artifact configuration.
    pub artifacts: ArtifactSpec,
    /// Step-local variables (highest precedence).
    pub variables: HashMap<String, String>,
    pub trigger: Trigger,
    /// Deployment environment name, surfaced as
    /// `BITBUCKET_DEPLOYMENT_ENVIRONMENT`.
    pub deployment: Option<String>,
    /// Whether the step requested an OIDC token.
    pub oidc: bool,
    /// Size multiplier (1x, 2x, ...).
    pub size: u32,
    /// Maximum run time in minutes.
    pub max_time: Option<u64>,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: None,
            script: Vec::new(),
            after_script: Vec::new(),
            services: Vec::new(),
            caches: Vec::new(),
            artifacts: ArtifactSpec::default(),
            variables: HashMap::new(),
            trigger: Trigger::Automatic,
            deployment: None,
            oidc: false,
            size: 1,
            max_time: None,
        }
    }
}

/// Artifact patterns and whether the step rehydrates upstream artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Rehydrate artifacts from previous steps into the build directory.
    pub download: bool,
    /// Glob patterns evaluated against the build directory.
    pub paths: Vec<String>,
}

impl Default for ArtifactSpec {
    fn default() -> Self {
        Self {
            download: true,
            paths: Vec::new(),
        }
    }
}

/// A container image reference with optional credentials, run-as-user, and
/// platform override.
///
/// Two specs are equal when their reference and platform match; credentials
/// do not participate in equality and are redacted from debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub run_as_user: Option<i64>,
    pub auth: Option<RegistryAuth>,
    pub platform: Option<String>,
}

impl ImageSpec {
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_as_user: None,
            auth: None,
            platform: None,
        }
    }
}

impl PartialEq for ImageSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.platform == other.platform
    }
}

impl Eq for ImageSpec {}

impl std::fmt::Debug for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSpec")
            .field("name", &self.name)
            .field("run_as_user", &self.run_as_user)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("platform", &self.platform)
            .finish()
    }
}

/// Registry credentials attached to an image. Sensitive; never logged.
#[derive(Clone, Serialize, Deserialize)]
pub enum RegistryAuth {
    Basic { username: String, password: String },
    AwsEcr { access_key: String, secret_key: String },
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryAuth::Basic { .. } => f.write_str("Basic(<redacted>)"),
            RegistryAuth::AwsEcr { .. } => f.write_str("AwsEcr(<redacted>)"),
        }
    }
}

/// Name of the special Docker-in-Docker service.
pub const DOCKER_SERVICE: &str = "docker";

/// Image used when neither the step nor the document declares one.
pub const DEFAULT_IMAGE: &str = "alpine:latest";

/// Image backing an undeclared `docker` service.
pub const DEFAULT_DOCKER_SERVICE_IMAGE: &str = "docker:dind";

/// A sidecar container started for the duration of a step.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub image: ImageSpec,
    pub variables: HashMap<String, String>,
    /// Memory reservation in megabytes.
    pub memory: Option<i64>,
    /// Command override.
    pub command: Option<Vec<String>>,
}

impl ServiceSpec {
    /// Whether this service provides the Docker-in-Docker daemon.
    pub fn is_docker(&self) -> bool {
        self.name == DOCKER_SERVICE
    }
}

/// A named, persistently stored directory shared across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSpec {
    pub name: String,
    /// Path inside the step container, absolute or `$HOME`/`~` rooted.
    pub path: String,
    /// Files whose combined hash forms the cache key; empty means the
    /// constant `default` key.
    pub key_files: Vec<String>,
}
