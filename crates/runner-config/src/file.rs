//! `bitbucket-pipelines.yml` parsing.
//!
//! The document is deserialized into raw serde types first, then converted
//! into the validated core model. Fields that accept either a scalar or a
//! mapping (`image`, caches, `artifacts`, service `command`) use untagged
//! enums.

use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use runner_core::pipeline::{
    ArtifactSpec, CacheSpec, DEFAULT_DOCKER_SERVICE_IMAGE, DOCKER_SERVICE, DeclaredVariable,
    Definitions, GroupMode, ImageSpec, Pipeline, PipelineSet, RegistryAuth, ServiceSpec, Step,
    StepGroup, Trigger,
};

use crate::error::{ConfigError, ConfigResult};

/// File name looked up in the project root.
pub const PIPELINE_FILE: &str = "bitbucket-pipelines.yml";

/// Parse the pipeline file at `path`.
pub fn parse_file(path: &Path) -> ConfigResult<PipelineSet> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse pipeline document text.
pub fn parse_str(content: &str) -> ConfigResult<PipelineSet> {
    let raw: RawDocument = serde_yaml::from_str(content)?;
    convert(raw)
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    image: Option<RawImage>,
    definitions: Option<RawDefinitions>,
    pipelines: RawPipelines,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawImage {
    Name(String),
    Spec(RawImageSpec),
}

#[derive(Debug, Deserialize)]
struct RawImageSpec {
    name: String,
    #[serde(rename = "run-as-user")]
    run_as_user: Option<i64>,
    username: Option<String>,
    password: Option<String>,
    aws: Option<RawAws>,
    platform: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAws {
    #[serde(rename = "access-key")]
    access_key: String,
    #[serde(rename = "secret-key")]
    secret_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefinitions {
    caches: Option<IndexMap<String, RawCache>>,
    services: Option<IndexMap<String, RawService>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCache {
    Path(String),
    Keyed {
        path: String,
        key: RawCacheKey,
    },
}

#[derive(Debug, Deserialize)]
struct RawCacheKey {
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    image: Option<RawImage>,
    variables: Option<HashMap<String, String>>,
    /// Memory reservation in megabytes.
    memory: Option<i64>,
    command: Option<RawCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawPipelines {
    default: Option<Vec<RawItem>>,
    custom: Option<IndexMap<String, Vec<RawItem>>>,
    branches: Option<IndexMap<String, Vec<RawItem>>>,
    tags: Option<IndexMap<String, Vec<RawItem>>>,
    #[serde(rename = "pull-requests")]
    pull_requests: Option<IndexMap<String, Vec<RawItem>>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawItem {
    Step { step: RawStep },
    Parallel { parallel: Vec<RawParallelItem> },
    Variables { variables: Vec<RawVariable> },
}

#[derive(Debug, Deserialize)]
struct RawParallelItem {
    step: RawStep,
}

#[derive(Debug, Deserialize)]
struct RawVariable {
    name: String,
    default: Option<String>,
    #[serde(rename = "allowed-values")]
    allowed_values: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: Option<String>,
    image: Option<RawImage>,
    script: Vec<String>,
    #[serde(rename = "after-script")]
    after_script: Option<Vec<String>>,
    services: Option<Vec<String>>,
    caches: Option<Vec<String>>,
    artifacts: Option<RawArtifacts>,
    variables: Option<HashMap<String, String>>,
    trigger: Option<String>,
    deployment: Option<String>,
    oidc: Option<bool>,
    size: Option<String>,
    #[serde(rename = "max-time")]
    max_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArtifacts {
    Paths(Vec<String>),
    Full {
        download: Option<bool>,
        paths: Option<Vec<String>>,
    },
}

fn convert(raw: RawDocument) -> ConfigResult<PipelineSet> {
    let definitions = convert_definitions(raw.definitions.unwrap_or_default())?;

    let mut pipelines = IndexMap::new();
    if let Some(items) = raw.pipelines.default {
        let pipeline = convert_pipeline("default", items, &definitions)?;
        pipelines.insert(pipeline.selector.clone(), pipeline);
    }
    for (section, map) in [
        ("branches", raw.pipelines.branches),
        ("tags", raw.pipelines.tags),
        ("pull-requests", raw.pipelines.pull_requests),
        ("custom", raw.pipelines.custom),
    ] {
        let Some(map) = map else { continue };
        for (name, items) in map {
            let selector = format!("{section}.{name}");
            let pipeline = convert_pipeline(&selector, items, &definitions)?;
            pipelines.insert(selector, pipeline);
        }
    }

    if pipelines.is_empty() {
        return Err(ConfigError::MissingField("pipelines".to_string()));
    }

    Ok(PipelineSet {
        image: raw.image.map(convert_image),
        definitions,
        pipelines,
    })
}

fn convert_image(raw: RawImage) -> ImageSpec {
    match raw {
        RawImage::Name(name) => ImageSpec::from_name(name),
        RawImage::Spec(spec) => {
            let auth = if let Some(aws) = spec.aws {
                Some(RegistryAuth::AwsEcr {
                    access_key: aws.access_key,
                    secret_key: aws.secret_key,
                })
            } else if let (Some(username), Some(password)) = (spec.username, spec.password) {
                Some(RegistryAuth::Basic { username, password })
            } else {
                None
            };
            ImageSpec {
                name: spec.name,
                run_as_user: spec.run_as_user,
                auth,
                platform: spec.platform,
            }
        }
    }
}

fn convert_definitions(raw: RawDefinitions) -> ConfigResult<Definitions> {
    let mut definitions = Definitions::default();

    for (name, cache) in raw.caches.unwrap_or_default() {
        let (path, key_files) = match cache {
            RawCache::Path(path) => (path, Vec::new()),
            RawCache::Keyed { path, key } => {
                if key.files.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("definitions.caches.{name}.key.files"),
                        message: "must list at least one file".to_string(),
                    });
                }
                (path, key.files)
            }
        };
        definitions.caches.insert(
            name.clone(),
            CacheSpec {
                name,
                path,
                key_files,
            },
        );
    }

    for (name, service) in raw.services.unwrap_or_default() {
        let image = match service.image {
            Some(image) => convert_image(image),
            None if name == DOCKER_SERVICE => ImageSpec::from_name(DEFAULT_DOCKER_SERVICE_IMAGE),
            None => {
                return Err(ConfigError::MissingField(format!(
                    "definitions.services.{name}.image"
                )));
            }
        };
        let command = service.command.map(|cmd| match cmd {
            RawCommand::Line(line) => vec!["/bin/sh".to_string(), "-c".to_string(), line],
            RawCommand::Argv(argv) => argv,
        });
        definitions.services.insert(
            name.clone(),
            ServiceSpec {
                name,
                image,
                variables: service.variables.unwrap_or_default(),
                memory: service.memory,
                command,
            },
        );
    }

    // The `docker` service is available even when not declared.
    if !definitions.services.contains_key(DOCKER_SERVICE) {
        definitions.services.insert(
            DOCKER_SERVICE.to_string(),
            ServiceSpec {
                name: DOCKER_SERVICE.to_string(),
                image: ImageSpec::from_name(DEFAULT_DOCKER_SERVICE_IMAGE),
                variables: HashMap::new(),
                memory: None,
                command: None,
            },
        );
    }

    Ok(definitions)
}

fn convert_pipeline(
    selector: &str,
    items: Vec<RawItem>,
    definitions: &Definitions,
) -> ConfigResult<Pipeline> {
    let mut variables = Vec::new();
    let mut groups = Vec::new();

    for (position, item) in items.into_iter().enumerate() {
        match item {
            RawItem::Variables { variables: declared } => {
                if position != 0 {
                    return Err(ConfigError::InvalidValue {
                        field: format!("pipelines.{selector}"),
                        message: "variables must be the first entry".to_string(),
                    });
                }
                if !selector.starts_with("custom.") {
                    return Err(ConfigError::InvalidValue {
                        field: format!("pipelines.{selector}"),
                        message: "only custom pipelines may declare variables".to_string(),
                    });
                }
                variables = declared
                    .into_iter()
                    .map(|v| DeclaredVariable {
                        name: v.name,
                        default: v.default,
                        allowed_values: v.allowed_values.unwrap_or_default(),
                    })
                    .collect();
            }
            RawItem::Step { step } => {
                let index = groups.len();
                let step = convert_step(selector, step, index, 0, definitions)?;
                groups.push(StepGroup {
                    index,
                    mode: GroupMode::Sequential,
                    steps: vec![step],
                });
            }
            RawItem::Parallel { parallel } => {
                if parallel.len() < 2 {
                    return Err(ConfigError::InvalidValue {
                        field: format!("pipelines.{selector}"),
                        message: "a parallel group needs at least two steps".to_string(),
                    });
                }
                let index = groups.len();
                let steps = parallel
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| convert_step(selector, item.step, index, i, definitions))
                    .collect::<ConfigResult<Vec<_>>>()?;
                groups.push(StepGroup {
                    index,
                    mode: GroupMode::Parallel,
                    steps,
                });
            }
        }
    }

    if groups.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: format!("pipelines.{selector}"),
            message: "pipeline has no steps".to_string(),
        });
    }

    Ok(Pipeline {
        selector: selector.to_string(),
        variables,
        groups,
    })
}

fn convert_step(
    selector: &str,
    raw: RawStep,
    group_index: usize,
    step_index: usize,
    definitions: &Definitions,
) -> ConfigResult<Step> {
    if raw.script.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "pipelines.{selector}: step script"
        )));
    }

    let services = raw.services.unwrap_or_default();
    for service in &services {
        if !definitions.services.contains_key(service) {
            return Err(ConfigError::InvalidReference(format!(
                "step in pipelines.{selector} references undefined service '{service}'"
            )));
        }
    }

    let trigger = match raw.trigger.as_deref() {
        None | Some("automatic") => Trigger::Automatic,
        Some("manual") => Trigger::Manual,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: "trigger".to_string(),
                message: format!("expected 'automatic' or 'manual', got '{other}'"),
            });
        }
    };

    let size = match raw.size.as_deref() {
        None => 1,
        Some(size) => parse_size(size)?,
    };

    let artifacts = match raw.artifacts {
        None => ArtifactSpec::default(),
        Some(RawArtifacts::Paths(paths)) => ArtifactSpec {
            download: true,
            paths,
        },
        Some(RawArtifacts::Full { download, paths }) => ArtifactSpec {
            download: download.unwrap_or(true),
            paths: paths.unwrap_or_default(),
        },
    };

    Ok(Step {
        name: raw
            .name
            .unwrap_or_else(|| format!("step {}.{}", group_index + 1, step_index + 1)),
        image: raw.image.map(convert_image),
        script: raw.script,
        after_script: raw.after_script.unwrap_or_default(),
        services,
        // Undefined cache names are kept and skipped with a warning at
        // mount time, matching the hosted behaviour.
        caches: raw.caches.unwrap_or_default(),
        artifacts,
        variables: raw.variables.unwrap_or_default(),
        trigger,
        deployment: raw.deployment,
        oidc: raw.oidc.unwrap_or(false),
        size,
        max_time: raw.max_time,
    })
}

fn parse_size(size: &str) -> ConfigResult<u32> {
    let multiplier = size
        .strip_suffix('x')
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n >= 1);
    multiplier.ok_or_else(|| ConfigError::InvalidValue {
        field: "size".to_string(),
        message: format!("expected '1x', '2x', ..., got '{size}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_DOC: &str = r#"
image: atlassian/default-image:3

definitions:
  caches:
    maven: ~/.m2/repository
    node-keyed:
      path: node_modules
      key:
        files:
          - package-lock.json
  services:
    postgres:
      image: postgres:15
      variables:
        POSTGRES_PASSWORD: example
      memory: 512

pipelines:
  default:
    - step:
        name: Build
        script:
          - cat /etc/os-release
        caches:
          - maven
        artifacts:
          - target/**
  custom:
    deploy:
      - variables:
          - name: FILENAME
          - name: VAR_WITH_DEFAULT_1
            default: Default 1
          - name: VAR_WITH_CHOICE
            default: dev
            allowed-values:
              - dev
              - staging
              - production
      - step:
          name: Deploy
          deployment: production
          trigger: manual
          script:
            - ./deploy.sh
      - parallel:
          - step:
              name: Lint
              script:
                - lint
          - step:
              name: Test
              size: 2x
              services:
                - postgres
              script:
                - test
              after-script:
                - echo done
"#;

    #[test]
    fn parses_full_document() {
        let set = parse_str(FULL_DOC).unwrap();
        assert_eq!(set.image.as_ref().unwrap().name, "atlassian/default-image:3");
        assert_eq!(set.definitions.caches.len(), 2);
        assert!(set.pipelines.contains_key("default"));
        assert!(set.pipelines.contains_key("custom.deploy"));
    }

    #[test]
    fn keyed_cache_carries_files() {
        let set = parse_str(FULL_DOC).unwrap();
        let cache = &set.definitions.caches["node-keyed"];
        assert_eq!(cache.path, "node_modules");
        assert_eq!(cache.key_files, vec!["package-lock.json".to_string()]);
        assert!(set.definitions.caches["maven"].key_files.is_empty());
    }

    #[test]
    fn custom_pipeline_variables_are_collected() {
        let set = parse_str(FULL_DOC).unwrap();
        let pipeline = &set.pipelines["custom.deploy"];
        assert_eq!(pipeline.variables.len(), 3);
        assert_eq!(pipeline.variables[1].default.as_deref(), Some("Default 1"));
        assert_eq!(pipeline.variables[2].allowed_values.len(), 3);
    }

    #[test]
    fn parallel_groups_and_step_fields() {
        let set = parse_str(FULL_DOC).unwrap();
        let pipeline = &set.pipelines["custom.deploy"];
        assert_eq!(pipeline.groups.len(), 2);
        assert_eq!(pipeline.groups[0].mode, GroupMode::Sequential);
        assert_eq!(pipeline.groups[0].steps[0].trigger, Trigger::Manual);
        assert_eq!(
            pipeline.groups[0].steps[0].deployment.as_deref(),
            Some("production")
        );
        let parallel = &pipeline.groups[1];
        assert_eq!(parallel.mode, GroupMode::Parallel);
        assert_eq!(parallel.steps.len(), 2);
        assert_eq!(parallel.steps[1].size, 2);
        assert_eq!(parallel.steps[1].services, vec!["postgres".to_string()]);
        assert_eq!(parallel.steps[1].after_script, vec!["echo done".to_string()]);
    }

    #[test]
    fn artifact_download_flag_form() {
        let doc = r#"
pipelines:
  default:
    - step:
        script: [build]
        artifacts:
          download: false
          paths:
            - dist/**
"#;
        let set = parse_str(doc).unwrap();
        let step = &set.pipelines["default"].groups[0].steps[0];
        assert!(!step.artifacts.download);
        assert_eq!(step.artifacts.paths, vec!["dist/**".to_string()]);
    }

    #[test]
    fn undefined_service_is_rejected() {
        let doc = r#"
pipelines:
  default:
    - step:
        script: [run]
        services: [redis]
"#;
        let err = parse_str(doc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(_)));
    }

    #[test]
    fn docker_service_is_implicitly_defined() {
        let doc = r#"
pipelines:
  default:
    - step:
        script: [docker build .]
        services: [docker]
"#;
        let set = parse_str(doc).unwrap();
        let docker = &set.definitions.services[DOCKER_SERVICE];
        assert_eq!(docker.image.name, DEFAULT_DOCKER_SERVICE_IMAGE);
    }

    #[test]
    fn single_step_parallel_is_rejected() {
        let doc = r#"
pipelines:
  default:
    - parallel:
        - step:
            script: [only one]
"#;
        assert!(parse_str(doc).is_err());
    }

    #[test]
    fn variables_on_non_custom_pipeline_are_rejected() {
        let doc = r#"
pipelines:
  default:
    - variables:
        - name: X
    - step:
        script: [run]
"#;
        assert!(parse_str(doc).is_err());
    }

    #[test]
    fn image_map_with_credentials() {
        let doc = r#"
image:
  name: registry.example.com/app:1
  run-as-user: 1000
  username: ci
  password: $DOCKER_PASSWORD
pipelines:
  default:
    - step:
        script: [run]
"#;
        let set = parse_str(doc).unwrap();
        let image = set.image.unwrap();
        assert_eq!(image.run_as_user, Some(1000));
        assert!(matches!(image.auth, Some(RegistryAuth::Basic { .. })));
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("1x").unwrap(), 1);
        assert_eq!(parse_size("8x").unwrap(), 8);
        assert!(parse_size("big").is_err());
        assert!(parse_size("0x").is_err());
    }
}
