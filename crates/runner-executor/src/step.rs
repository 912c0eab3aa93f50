//! The step executor.
//!
//! `execute` runs one fully resolved step to completion and always returns
//! a [`StepResult`]; internal failures are captured in the result's
//! `failure` field, never propagated. The lifecycle is: resolve, prepare
//! the build directory, start services, launch the step container with the
//! generated shell program, stream output, wait (with timeout and
//! cancellation), collect artifacts, record caches, tear down.

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use runner_core::context::{AGENT_TMP_DIR, CLONE_DIR, RunContext, SSH_AGENT_SOCK, SSH_DIR};
use runner_core::creds::{DeploymentVarsProvider, OidcTokenProvider};
use runner_core::id::{container_name, short_suffix, step_id};
use runner_core::pipeline::{DEFAULT_IMAGE, DOCKER_SERVICE, Definitions, ImageSpec, Step};
use runner_core::result::{FailureReason, StepResult};
use runner_core::ui::Interactor;
use runner_core::variable::VariableSet;
use runner_core::{Error, Result};
use uuid::Uuid;

use crate::docker::{RUN_LABEL, STEP_LABEL};
use crate::image::ImageProvider;
use crate::logs::{LineBuffer, LogRouter};
use crate::script;
use crate::services::{ServiceHandles, ServiceRuntime, ServiceStartParams};
use crate::volumes::{CacheBacking, VolumeManager};
use crate::workspace::{ArtifactStore, collect_artifacts, copy_source};

/// Default `max-time` in minutes.
pub const DEFAULT_MAX_TIME_MINUTES: u64 = 120;

/// Memory granted per size unit when CPU limits are enabled.
const MEMORY_PER_SIZE: i64 = 4 * 1024 * 1024 * 1024;
/// CPU cores granted per size unit, in nanocpus.
const NANO_CPUS_PER_SIZE: i64 = 4_000_000_000;

/// Home directory of the default in-container user; `~`-rooted cache paths
/// resolve against it.
const CONTAINER_HOME: &str = "/root";

/// One masked line of step output, ready for the terminal.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub step_id: String,
    pub step_name: String,
    pub line: String,
}

/// Parameters for one step execution.
pub struct StepRun<'a> {
    pub step: &'a Step,
    pub ctx: &'a RunContext,
    pub group_index: usize,
    pub step_index: usize,
    /// (index, count) when the step belongs to a parallel group.
    pub parallel: Option<(usize, usize)>,
    pub store: &'a ArtifactStore,
    pub output: mpsc::Sender<OutputLine>,
}

/// Outcome of the container phase of a step.
struct ContainerOutcome {
    exit_code: i64,
    failure: Option<FailureReason>,
    after_exit: Option<i64>,
}

/// Executes single steps against the local Docker daemon.
pub struct StepExecutor {
    docker: Docker,
    images: Arc<ImageProvider>,
    services: ServiceRuntime,
    volumes: Arc<VolumeManager>,
    definitions: Definitions,
    default_image: Option<ImageSpec>,
    oidc: Arc<dyn OidcTokenProvider>,
    deployments: Arc<dyn DeploymentVarsProvider>,
    interactor: Arc<dyn Interactor>,
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docker: Docker,
        images: Arc<ImageProvider>,
        volumes: Arc<VolumeManager>,
        definitions: Definitions,
        default_image: Option<ImageSpec>,
        oidc: Arc<dyn OidcTokenProvider>,
        deployments: Arc<dyn DeploymentVarsProvider>,
        interactor: Arc<dyn Interactor>,
    ) -> Self {
        Self {
            services: ServiceRuntime::new(docker.clone()),
            docker,
            images,
            volumes,
            definitions,
            default_image,
            oidc,
            deployments,
            interactor,
        }
    }

    /// Run a step to completion. Never fails across this boundary.
    pub async fn execute(&self, run: StepRun<'_>) -> StepResult {
        let started_at = Utc::now();
        let id = step_id(
            &run.ctx.project.slug,
            run.ctx.build_number,
            run.group_index,
            run.step_index,
            &run.step.name,
        );
        let step_dir = run.ctx.step_dir(&id);

        info!(step = %run.step.name, step_id = %id, "executing step");
        let result = match self.run_step(&run, &id, &step_dir, started_at).await {
            Ok(result) => result,
            Err(err) => StepResult::aborted(&id, &run.step.name, started_at, failure_reason(err)),
        };

        if !result.succeeded() {
            let reason = match &result.failure {
                Some(FailureReason::Script) | None => format!("exit code {}", result.exit_code),
                Some(other) => other.to_string(),
            };
            let _ = run
                .output
                .send(OutputLine {
                    step_id: id.clone(),
                    step_name: run.step.name.clone(),
                    line: format!("Step '{}' failed: {reason}", run.step.name),
                })
                .await;
        }

        persist_result(&step_dir, &result);
        result
    }

    async fn run_step(
        &self,
        run: &StepRun<'_>,
        id: &str,
        step_dir: &Path,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<StepResult> {
        let ctx = run.ctx;
        let step = run.step;
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        std::fs::create_dir_all(step_dir)?;
        let suffix = short_suffix();

        // 1. Resolve: image, variables, services, caches.
        let image = step
            .image
            .clone()
            .or_else(|| self.default_image.clone())
            .unwrap_or_else(|| ImageSpec::from_name(DEFAULT_IMAGE));

        let deployment_vars = match &step.deployment {
            Some(environment) => self.deployments.vars_for(environment)?,
            None => Vec::new(),
        };
        let oidc_token = if step.oidc {
            self.oidc.token(id).await?
        } else {
            None
        };

        let step_uuid = Uuid::new_v4();
        let variables = ctx.step_variables(step, step_uuid, run.parallel, &deployment_vars, oidc_token);
        let env_map = variables.merged();
        let secrets = variables.secret_values();

        self.images.ensure(&image, &env_map, true).await?;

        // 2. Prepare the filesystem.
        let build_dir = self.volumes.build_dir(step_dir)?;
        let staging_dir = self.volumes.artifact_dir(step_dir)?;
        let agent_dir = self.volumes.agent_dir(step_dir)?;

        copy_source(&ctx.project.root, &build_dir)?;
        if step.artifacts.download {
            run.store.rehydrate_into(&build_dir)?;
        }

        let mut setup = Vec::new();
        let mut binds = vec![
            format!("{}:{CLONE_DIR}:rw", build_dir.display()),
            format!("{}:{AGENT_TMP_DIR}:ro", agent_dir.display()),
        ];

        if let Some(ssh) = &ctx.ssh {
            let ssh_dir = self.volumes.ssh_material(step_dir, &ssh.key_path)?;
            binds.push(format!("{}:{SSH_DIR}:ro", ssh_dir.display()));
            setup.push("mkdir -p \"$HOME/.ssh\"".to_string());
            setup.push(format!("cp {SSH_DIR}/config \"$HOME/.ssh/config\""));
            if let Some(sock) = &ssh.agent_sock {
                binds.push(format!("{}:{SSH_AGENT_SOCK}", sock.display()));
            }
        }
        for volume in &ctx.extra_volumes {
            let mode = if volume.read_only { "ro" } else { "rw" };
            binds.push(format!(
                "{}:{}:{mode}",
                volume.host.display(),
                volume.container
            ));
        }

        let program = script::generate(
            &step.script,
            &step.after_script,
            &setup,
            ctx.interactive,
        );
        std::fs::write(agent_dir.join(script::BUILD_SCRIPT_FILE), program)?;

        let cache_mounts = self
            .volumes
            .cache_mounts(
                &step.caches,
                &self.definitions.caches,
                &ctx.project.root,
                CONTAINER_HOME,
            )
            .await?;
        let mut docker_graph_volume = None;
        for mount in &cache_mounts {
            match &mount.backing {
                CacheBacking::Host(host) => {
                    binds.push(format!("{}:{}:rw", host.display(), mount.container_path));
                }
                CacheBacking::Volume(volume) if step.services.iter().any(|s| s == DOCKER_SERVICE) => {
                    docker_graph_volume = Some(volume.clone());
                }
                CacheBacking::Volume(_) => {
                    warn!(cache = %mount.name, "docker cache requested without the docker service");
                }
            }
        }

        // 3. Services.
        let labels = HashMap::from([
            (RUN_LABEL.to_string(), ctx.run_id.clone()),
            (STEP_LABEL.to_string(), id.to_string()),
        ]);
        let service_specs: Vec<_> = step
            .services
            .iter()
            .filter_map(|name| self.definitions.services.get(name).cloned())
            .collect();
        let docker_socket_volume = if step.services.iter().any(|s| s == DOCKER_SERVICE) {
            Some(self.volumes.docker_socket_volume(id, &suffix).await?)
        } else {
            None
        };
        let mut handles = self
            .services
            .start(
                &self.images,
                ServiceStartParams {
                    step_id: id,
                    suffix: &suffix,
                    services: service_specs,
                    env: &env_map,
                    secrets: &secrets,
                    labels: labels.clone(),
                    step_dir,
                    docker_graph_volume,
                    docker_socket_volume,
                },
            )
            .await?;

        // 4-7. Launch the container, stream output, wait, after-script.
        let outcome = self
            .run_container(
                run,
                id,
                &suffix,
                &image,
                &variables,
                &mut handles,
                binds,
                labels,
                &agent_dir,
                step_dir,
            )
            .await;

        // 10. Teardown services and the per-step socket volume; the step
        // container itself is removed inside `run_container`.
        let graceful = !ctx.cancel.is_forced();
        self.services.stop(&mut handles, graceful).await;
        if let Some(volume) = handles.socket_volume.take() {
            if let Err(e) = self.docker.remove_volume(&volume, None).await {
                if !crate::docker::is_not_found(&e) {
                    warn!(volume = %volume, error = %e, "failed to remove socket volume");
                }
            }
        }
        let outcome = outcome?;

        // 8. Artifacts (best-effort, also after cancellation).
        let mut artifacts = Vec::new();
        if !step.artifacts.paths.is_empty() {
            match collect_artifacts(&build_dir, &step.artifacts.paths, &staging_dir) {
                Ok(entries) => {
                    artifacts = entries;
                    run.store.record(staging_dir.clone());
                }
                Err(e) => warn!(step = %step.name, error = %e, "artifact collection failed"),
            }
        }

        // 9. Cache bookkeeping; bind-mounted caches are already persisted.
        let caches = self.volumes.cache_entries(&cache_mounts);

        if let Some(after_exit) = outcome.after_exit {
            if after_exit != 0 {
                warn!(step = %step.name, code = after_exit, "after-script failed");
                let _ = run
                    .output
                    .send(OutputLine {
                        step_id: id.to_string(),
                        step_name: step.name.clone(),
                        line: format!("after-script exited with code {after_exit}"),
                    })
                    .await;
            }
        }

        let failure = outcome.failure.or(if outcome.exit_code != 0 {
            Some(FailureReason::Script)
        } else {
            None
        });

        Ok(StepResult {
            step_id: id.to_string(),
            name: step.name.clone(),
            exit_code: outcome.exit_code,
            started_at,
            ended_at: Utc::now(),
            artifacts,
            caches,
            failure,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_container(
        &self,
        run: &StepRun<'_>,
        id: &str,
        suffix: &str,
        image: &ImageSpec,
        variables: &VariableSet,
        handles: &mut ServiceHandles,
        binds: Vec<String>,
        labels: HashMap<String, String>,
        agent_dir: &Path,
        step_dir: &Path,
    ) -> Result<ContainerOutcome> {
        let ctx = run.ctx;
        let step = run.step;

        let mut env = variables.to_env();
        env.extend(handles.step_env.iter().cloned());
        if let Some(ssh) = &ctx.ssh {
            if ssh.agent_sock.is_some() {
                env.push(format!("SSH_AUTH_SOCK={SSH_AGENT_SOCK}"));
            }
        }

        let network_mode = handles
            .namespace_container
            .as_ref()
            .map(|first| format!("container:{first}"));

        let (memory, nano_cpus) = if ctx.cpu_limits {
            let size = i64::from(step.size);
            (Some(size * MEMORY_PER_SIZE), Some(size * NANO_CPUS_PER_SIZE))
        } else {
            (None, None)
        };

        let host_config = HostConfig {
            binds: Some(binds),
            mounts: if handles.step_mounts.is_empty() {
                None
            } else {
                Some(handles.step_mounts.clone())
            },
            network_mode,
            memory,
            nano_cpus,
            ..Default::default()
        };

        let config = Config {
            image: Some(image.name.clone()),
            cmd: Some(script::container_command()),
            env: Some(env),
            working_dir: Some(CLONE_DIR.to_string()),
            user: Some(image.run_as_user.unwrap_or(0).to_string()),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = container_name(id, suffix);
        debug!(container = %name, image = %image.name, "creating step container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: image.platform.clone(),
                }),
                config,
            )
            .await
            .map_err(|e| Error::ContainerStart(format!("create failed: {e}")))?;
        let container_id = created.id;

        let outcome = self
            .stream_and_wait(run, id, &container_id, variables, agent_dir, step_dir)
            .await;

        if let Err(e) = self
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            if !crate::docker::is_not_found(&e) {
                warn!(container = %name, error = %e, "failed to remove step container");
            }
        }

        outcome
    }

    async fn stream_and_wait(
        &self,
        run: &StepRun<'_>,
        id: &str,
        container_id: &str,
        variables: &VariableSet,
        agent_dir: &Path,
        step_dir: &Path,
    ) -> Result<ContainerOutcome> {
        let ctx = run.ctx;
        let step = run.step;

        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ContainerStart(format!("start failed: {e}")))?;

        // One reader task for the multiplexed output stream.
        let mut router = LogRouter::new(step_dir, variables.secret_values())?;
        let (breakpoint_tx, mut breakpoint_rx) = mpsc::unbounded_channel::<u32>();
        let output = run.output.clone();
        let step_name = step.name.clone();
        let step_id_owned = id.to_string();
        let mut log_stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let reader = tokio::spawn(async move {
            let mut buffer = LineBuffer::new();
            loop {
                let lines = match log_stream.next().await {
                    Some(Ok(chunk)) => buffer.push(&chunk.into_bytes()),
                    Some(Err(e)) => {
                        debug!(error = %e, "log stream ended");
                        break;
                    }
                    None => break,
                };
                for line in lines {
                    route_line(
                        &mut router,
                        &line,
                        &output,
                        &breakpoint_tx,
                        &step_id_owned,
                        &step_name,
                    )
                    .await;
                }
            }
            if let Some(line) = buffer.flush() {
                route_line(
                    &mut router,
                    &line,
                    &output,
                    &breakpoint_tx,
                    &step_id_owned,
                    &step_name,
                )
                .await;
            }
            router.finish();
            router
        });

        // Breakpoint pauses: prompt the terminal, then create the resume
        // marker the in-container program polls for.
        let interactor = Arc::clone(&self.interactor);
        let agent_dir_owned = agent_dir.to_path_buf();
        let bp_step_name = step.name.clone();
        let breakpoint_task = tokio::spawn(async move {
            while let Some(index) = breakpoint_rx.recv().await {
                interactor.resume_breakpoint(&bp_step_name, index).await;
                let marker = agent_dir_owned.join(script::resume_file_name(index));
                if let Err(e) = std::fs::write(&marker, b"") {
                    warn!(error = %e, "failed to write breakpoint resume marker");
                }
            }
        });

        let max_time =
            std::time::Duration::from_secs(step.max_time.unwrap_or(DEFAULT_MAX_TIME_MINUTES) * 60);
        let mut wait_stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let outcome = tokio::select! {
            waited = wait_stream.next() => {
                let exit_code = match waited {
                    Some(Ok(response)) => response.status_code,
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                    Some(Err(e)) => {
                        return Err(Error::Internal(format!("container wait failed: {e}")));
                    }
                    None => {
                        return Err(Error::Internal("container wait stream ended".to_string()));
                    }
                };
                ContainerOutcome { exit_code, failure: None, after_exit: None }
            }
            _ = tokio::time::sleep(max_time) => {
                warn!(step = %step.name, "step exceeded its maximum run time");
                self.halt_container(container_id, true).await;
                ContainerOutcome { exit_code: 1, failure: Some(FailureReason::Timeout), after_exit: None }
            }
            _ = ctx.cancel.cancelled() => {
                self.halt_container(container_id, !ctx.cancel.is_forced()).await;
                ContainerOutcome { exit_code: 1, failure: Some(FailureReason::Cancelled), after_exit: None }
            }
        };

        breakpoint_task.abort();
        let after_exit =
            match tokio::time::timeout(std::time::Duration::from_secs(10), reader).await {
                Ok(Ok(router)) => router.after_exit(),
                Ok(Err(e)) => {
                    warn!(error = %e, "log reader task failed");
                    None
                }
                Err(_) => {
                    warn!("log reader did not drain in time");
                    None
                }
            };

        Ok(ContainerOutcome {
            after_exit,
            ..outcome
        })
    }

    /// Stop a container: SIGTERM with the grace period, or an immediate
    /// kill when the run was force-cancelled.
    async fn halt_container(&self, container_id: &str, graceful: bool) {
        if graceful {
            if let Err(e) = self
                .docker
                .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
                .await
            {
                if !crate::docker::is_not_found(&e) {
                    warn!(error = %e, "failed to stop step container");
                }
            }
        } else if let Err(e) = self
            .docker
            .kill_container(
                container_id,
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await
        {
            if !crate::docker::is_not_found(&e) {
                warn!(error = %e, "failed to kill step container");
            }
        }
    }
}

/// Route one output line: log files, terminal channel, breakpoint signals.
async fn route_line(
    router: &mut LogRouter,
    line: &str,
    output: &mpsc::Sender<OutputLine>,
    breakpoint_tx: &mpsc::UnboundedSender<u32>,
    step_id: &str,
    step_name: &str,
) {
    let disposition = router.handle_line(line);
    if let Some(display) = disposition.display {
        let _ = output
            .send(OutputLine {
                step_id: step_id.to_string(),
                step_name: step_name.to_string(),
                line: display,
            })
            .await;
    }
    if let Some(index) = disposition.breakpoint {
        let _ = breakpoint_tx.send(index);
    }
}

fn persist_result(step_dir: &Path, result: &StepResult) {
    let write = || -> Result<()> {
        std::fs::create_dir_all(step_dir)?;
        let json = serde_json::to_string_pretty(result)
            .map_err(|e| Error::Internal(e.to_string()))?;
        std::fs::write(step_dir.join("meta.json"), json)?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!(step_id = %result.step_id, error = %e, "failed to persist step result");
    }
}

fn failure_reason(err: Error) -> FailureReason {
    match err {
        Error::ImagePull(msg) => FailureReason::ImagePull(msg),
        Error::ImageNotFound(msg) => FailureReason::ImageNotFound(msg),
        Error::ContainerStart(msg) => FailureReason::ContainerStart(msg),
        Error::ServiceNotReady(msg) => FailureReason::ServiceNotReady(msg),
        Error::Timeout(_) => FailureReason::Timeout,
        Error::Cancelled => FailureReason::Cancelled,
        other => FailureReason::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_map_from_errors() {
        assert!(matches!(
            failure_reason(Error::ImagePull("x".into())),
            FailureReason::ImagePull(_)
        ));
        assert!(matches!(
            failure_reason(Error::Cancelled),
            FailureReason::Cancelled
        ));
        assert!(matches!(
            failure_reason(Error::CacheKeyMissingFile("f".into())),
            FailureReason::Internal(_)
        ));
    }

    #[test]
    fn persist_result_writes_meta_json() {
        let dir = tempfile::tempdir().unwrap();
        let result = StepResult::aborted(
            "proj-1-0-0-build",
            "build",
            Utc::now(),
            FailureReason::Timeout,
        );
        persist_result(dir.path(), &result);
        let meta = std::fs::read_to_string(dir.path().join("meta.json")).unwrap();
        assert!(meta.contains("proj-1-0-0-build"));
        assert!(meta.contains("Timeout"));
    }
}
