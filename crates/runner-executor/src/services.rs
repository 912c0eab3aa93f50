//! Sidecar service containers.
//!
//! All services of a step share one network namespace: the first service
//! joins the step's bridge network and every other service (and the step
//! container itself) is started with `network_mode=container:<first>`.
//! Services are therefore reachable from the step on `localhost` only;
//! service-name DNS does not resolve. Readiness is a settle window, not a
//! health probe: a service that exits within the window fails the step.
//!
//! The service named `docker` is the Docker-in-Docker daemon: privileged,
//! with its socket shared through a per-step named volume mounted at
//! `/var/run` on both the service and the step container.

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::network::CreateNetworkOptions;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use runner_core::context::DOCKER_SOCKET;
use runner_core::id::{network_name, service_container_name};
use runner_core::pipeline::ServiceSpec;
use runner_core::variable::{expand, mask};
use runner_core::{Error, Result};

use crate::image::ImageProvider;
use crate::logs::LineBuffer;

/// How long a service must stay up before it counts as ready.
pub const SETTLE_WINDOW: std::time::Duration = std::time::Duration::from_secs(1);

/// Grace period for service shutdown before force-kill.
const STOP_GRACE_SECONDS: i64 = 10;

/// A running service container and its log-capture task.
pub struct ServiceContainer {
    pub name: String,
    pub id: String,
    log_task: Option<JoinHandle<()>>,
}

/// Everything a started service set exposes to the step container.
pub struct ServiceHandles {
    /// Per-step bridge network, removed on stop.
    pub network: Option<String>,
    pub containers: Vec<ServiceContainer>,
    /// Container whose network namespace the step joins.
    pub namespace_container: Option<String>,
    /// Extra environment for the step container (`DOCKER_HOST`).
    pub step_env: Vec<String>,
    /// Extra mounts for the step container (the DinD socket volume).
    pub step_mounts: Vec<Mount>,
    pub socket_volume: Option<String>,
}

impl ServiceHandles {
    fn empty() -> Self {
        Self {
            network: None,
            containers: Vec::new(),
            namespace_container: None,
            step_env: Vec::new(),
            step_mounts: Vec::new(),
            socket_volume: None,
        }
    }
}

/// Parameters for starting a step's services.
pub struct ServiceStartParams<'a> {
    pub step_id: &'a str,
    pub suffix: &'a str,
    pub services: Vec<ServiceSpec>,
    /// Run variables used to expand `$VAR` references in service variables.
    pub env: &'a HashMap<String, String>,
    pub secrets: &'a [String],
    pub labels: HashMap<String, String>,
    pub step_dir: &'a Path,
    /// Graph-root volume for the DinD daemon, when the step declared the
    /// `docker` cache.
    pub docker_graph_volume: Option<String>,
    /// Socket volume shared between the DinD daemon and the step.
    pub docker_socket_volume: Option<String>,
}

/// Starts, readiness-gates, log-captures, and tears down services.
pub struct ServiceRuntime {
    docker: Docker,
}

impl ServiceRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Launch every requested service and return once each is ready.
    pub async fn start(
        &self,
        images: &ImageProvider,
        params: ServiceStartParams<'_>,
    ) -> Result<ServiceHandles> {
        if params.services.is_empty() {
            return Ok(ServiceHandles::empty());
        }

        let network = network_name(params.step_id, params.suffix);
        self.docker
            .create_network(CreateNetworkOptions::<String> {
                name: network.clone(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Internal(format!("failed to create network {network}: {e}")))?;

        let mut handles = ServiceHandles {
            network: Some(network.clone()),
            socket_volume: params.docker_socket_volume.clone(),
            ..ServiceHandles::empty()
        };

        for spec in &params.services {
            // Service images never receive the step platform override.
            if let Err(e) = images.ensure(&spec.image, params.env, false).await {
                self.stop(&mut handles, false).await;
                return Err(e);
            }

            let network_mode = match &handles.namespace_container {
                None => network.clone(),
                Some(first) => format!("container:{first}"),
            };

            match self
                .start_one(spec, &params, network_mode)
                .await
            {
                Ok(container) => {
                    if handles.namespace_container.is_none() {
                        handles.namespace_container = Some(container.id.clone());
                    }
                    handles.containers.push(container);
                }
                Err(e) => {
                    self.stop(&mut handles, false).await;
                    return Err(e);
                }
            }
        }

        if let Some(volume) = &params.docker_socket_volume {
            handles.step_mounts.push(socket_mount(volume));
            handles
                .step_env
                .push(format!("DOCKER_HOST=unix://{DOCKER_SOCKET}"));
        }

        Ok(handles)
    }

    async fn start_one(
        &self,
        spec: &ServiceSpec,
        params: &ServiceStartParams<'_>,
        network_mode: String,
    ) -> Result<ServiceContainer> {
        let name = service_container_name(params.step_id, &spec.name, params.suffix);

        let mut env: Vec<String> = spec
            .variables
            .iter()
            .map(|(k, v)| format!("{k}={}", expand(v, params.env)))
            .collect();

        let mut mounts = Vec::new();
        let mut privileged = None;
        if spec.is_docker() {
            privileged = Some(true);
            if !spec.variables.contains_key("DOCKER_TLS_CERTDIR") {
                env.push("DOCKER_TLS_CERTDIR=".to_string());
            }
            if let Some(volume) = &params.docker_socket_volume {
                mounts.push(Mount {
                    target: Some("/var/run".to_string()),
                    source: Some(volume.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    ..Default::default()
                });
            }
            if let Some(volume) = &params.docker_graph_volume {
                mounts.push(Mount {
                    target: Some(crate::volumes::DOCKER_GRAPH_ROOT.to_string()),
                    source: Some(volume.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    ..Default::default()
                });
            }
        }

        let host_config = HostConfig {
            network_mode: Some(network_mode),
            privileged,
            memory_reservation: spec.memory.map(|mb| mb * 1024 * 1024),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.name.clone()),
            cmd: spec.command.clone(),
            env: Some(env),
            labels: Some(params.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        info!(service = %spec.name, image = %spec.image.name, "starting service");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::ServiceNotReady(format!("{}: create failed: {e}", spec.name)))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ServiceNotReady(format!("{}: start failed: {e}", spec.name)))?;

        // Settle window instead of a health probe; scripts are expected to
        // retry their connections.
        tokio::time::sleep(SETTLE_WINDOW).await;
        let inspect = self
            .docker
            .inspect_container(&created.id, None)
            .await
            .map_err(|e| Error::ServiceNotReady(format!("{}: {e}", spec.name)))?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            let exit_code = inspect.state.and_then(|s| s.exit_code).unwrap_or(-1);
            return Err(Error::ServiceNotReady(format!(
                "{} exited during startup with code {exit_code}",
                spec.name
            )));
        }

        let log_task = self.spawn_log_capture(
            &created.id,
            &spec.name,
            params.step_dir,
            params.secrets.to_vec(),
        );

        Ok(ServiceContainer {
            name: spec.name.clone(),
            id: created.id,
            log_task: Some(log_task),
        })
    }

    fn spawn_log_capture(
        &self,
        container_id: &str,
        service: &str,
        step_dir: &Path,
        secrets: Vec<String>,
    ) -> JoinHandle<()> {
        let docker = self.docker.clone();
        let container_id = container_id.to_string();
        let service = service.to_string();
        let log_path = step_dir.join("services").join(format!("{service}.log"));

        tokio::spawn(async move {
            if let Some(parent) = log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let mut file = match std::fs::File::create(&log_path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(service = %service, error = %e, "failed to open service log");
                    return;
                }
            };

            let mut stream = docker.logs(
                &container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            let mut buffer = LineBuffer::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(output) => {
                        for line in buffer.push(&output.into_bytes()) {
                            let _ = writeln!(file, "{}", mask(&line, &secrets));
                        }
                    }
                    Err(e) => {
                        debug!(service = %service, error = %e, "service log stream ended");
                        break;
                    }
                }
            }
            if let Some(line) = buffer.flush() {
                let _ = writeln!(file, "{}", mask(&line, &secrets));
            }
        })
    }

    /// Capture remaining logs, then remove containers and the network.
    /// With `graceful` unset, containers are killed without the grace
    /// period.
    pub async fn stop(&self, handles: &mut ServiceHandles, graceful: bool) {
        for container in handles.containers.iter_mut().rev() {
            let timeout = if graceful { STOP_GRACE_SECONDS } else { 0 };
            if let Err(e) = self
                .docker
                .stop_container(&container.id, Some(StopContainerOptions { t: timeout }))
                .await
            {
                if !crate::docker::is_not_found(&e) {
                    warn!(service = %container.name, error = %e, "failed to stop service");
                }
            }

            if let Some(task) = container.log_task.take() {
                // The follow stream closes once the container stops.
                if tokio::time::timeout(std::time::Duration::from_secs(5), task)
                    .await
                    .is_err()
                {
                    debug!(service = %container.name, "service log capture timed out");
                }
            }

            if let Err(e) = self
                .docker
                .remove_container(
                    &container.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                if !crate::docker::is_not_found(&e) {
                    warn!(service = %container.name, error = %e, "failed to remove service");
                }
            }
        }
        handles.containers.clear();
        handles.namespace_container = None;

        if let Some(network) = handles.network.take() {
            if let Err(e) = self.docker.remove_network(&network).await {
                if !crate::docker::is_not_found(&e) {
                    warn!(network = %network, error = %e, "failed to remove network");
                }
            }
        }
    }
}

/// Mount carrying the DinD socket volume at `/var/run`.
pub fn socket_mount(volume: &str) -> Mount {
    Mount {
        target: Some("/var/run".to_string()),
        source: Some(volume.to_string()),
        typ: Some(MountTypeEnum::VOLUME),
        ..Default::default()
    }
}
