//! Docker client setup and shared helpers.

use bollard::Docker;
use bollard::container::{ListContainersOptions, RemoveContainerOptions};
use std::collections::HashMap;
use tracing::{debug, warn};

use runner_core::{Error, Result};

/// Label carrying the run id on every container this tool creates.
pub const RUN_LABEL: &str = "io.pipeline-runner.run";
/// Label carrying the step id.
pub const STEP_LABEL: &str = "io.pipeline-runner.step";

/// Connect to the local Docker daemon and verify it responds.
pub async fn connect() -> Result<Docker> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| Error::Internal(format!("failed to connect to Docker: {e}")))?;
    docker
        .ping()
        .await
        .map_err(|e| Error::Internal(format!("Docker daemon is not responding: {e}")))?;
    Ok(docker)
}

/// Whether a bollard error is a 404 from the daemon.
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Remove exited containers left behind by earlier runs, identified by the
/// run label. Failures are logged and ignored.
pub async fn sweep_stale_containers(docker: &Docker) {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![RUN_LABEL.to_string()]);
    filters.insert(
        "status".to_string(),
        vec!["exited".to_string(), "dead".to_string()],
    );

    let containers = match docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
    {
        Ok(containers) => containers,
        Err(e) => {
            warn!(error = %e, "failed to list stale containers");
            return;
        }
    };

    for container in containers {
        let Some(id) = container.id else { continue };
        debug!(container = %id, "removing stale container");
        if let Err(e) = docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %id, error = %e, "failed to remove stale container");
        }
    }
}
