//! Image resolution and pulls.
//!
//! `ensure` acquires a runnable local reference for an image, pulling it
//! when absent. Concurrent calls for the same (reference, platform) pair
//! coalesce onto one underlying pull through a per-run once-cell map.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use runner_core::creds::{RegistryAuthProvider, RegistryCredentials};
use runner_core::pipeline::{ImageSpec, RegistryAuth};
use runner_core::variable::expand;
use runner_core::{Error, Result};

use crate::docker::is_not_found;

static ECR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.dkr\.ecr\.([a-z0-9-]+)\.amazonaws\.com/").unwrap());

/// Resolves and ensures local availability of container images.
pub struct ImageProvider {
    docker: Docker,
    auth: Arc<dyn RegistryAuthProvider>,
    pulled: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl ImageProvider {
    pub fn new(docker: Docker, auth: Arc<dyn RegistryAuthProvider>) -> Self {
        Self {
            docker,
            auth,
            pulled: Mutex::new(HashMap::new()),
        }
    }

    /// Make `image` runnable locally and return its reference.
    ///
    /// The platform override is honoured only when `use_platform` is set;
    /// service images are always pulled for the daemon's native platform.
    pub async fn ensure(
        &self,
        image: &ImageSpec,
        env: &HashMap<String, String>,
        use_platform: bool,
    ) -> Result<String> {
        let platform = image.platform.as_deref().filter(|_| use_platform);
        let key = format!("{}|{}", image.name, platform.unwrap_or(""));

        let cell = {
            let mut pulled = self.pulled.lock().await;
            pulled.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        cell.get_or_try_init(|| self.pull_if_missing(image, env, platform))
            .await?;
        Ok(image.name.clone())
    }

    async fn pull_if_missing(
        &self,
        image: &ImageSpec,
        env: &HashMap<String, String>,
        platform: Option<&str>,
    ) -> Result<()> {
        match self.docker.inspect_image(&image.name).await {
            Ok(_) => {
                debug!(image = %image.name, "image present locally");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(Error::ImagePull(format!("{}: {e}", image.name))),
        }

        let credentials = self
            .auth
            .auth_for(image, env)
            .await?
            .map(|c| DockerCredentials {
                username: Some(c.username),
                password: Some(c.password),
                ..Default::default()
            });

        info!(image = %image.name, "pulling image");
        let options = CreateImageOptions::<String> {
            from_image: image.name.clone(),
            platform: platform.unwrap_or("").to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(classify_pull_error(&image.name, &error));
                    }
                    if let Some(status) = progress.status {
                        debug!(image = %image.name, status = %status, "pull progress");
                    }
                }
                Err(e) if is_not_found(&e) => {
                    return Err(Error::ImageNotFound(image.name.clone()));
                }
                Err(e) => return Err(Error::ImagePull(format!("{}: {e}", image.name))),
            }
        }

        // The pull stream can end cleanly while the image is still absent
        // (e.g. an invalid reference the registry answered politely).
        match self.docker.inspect_image(&image.name).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(Error::ImageNotFound(image.name.clone())),
            Err(e) => Err(Error::ImagePull(format!("{}: {e}", image.name))),
        }
    }
}

fn classify_pull_error(image: &str, message: &str) -> Error {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("not found") || lowered.contains("manifest unknown") {
        Error::ImageNotFound(image.to_string())
    } else {
        Error::ImagePull(format!("{image}: {message}"))
    }
}

/// Default credentials provider: declared username/password (with `$VAR`
/// expansion against the run variables), or a transient ECR login via the
/// `aws` CLI for ECR-hosted references.
#[derive(Debug, Default)]
pub struct DefaultRegistryAuth;

#[async_trait]
impl RegistryAuthProvider for DefaultRegistryAuth {
    async fn auth_for(
        &self,
        image: &ImageSpec,
        env: &HashMap<String, String>,
    ) -> Result<Option<RegistryCredentials>> {
        match &image.auth {
            None => Ok(None),
            Some(RegistryAuth::Basic { username, password }) => Ok(Some(RegistryCredentials {
                username: expand(username, env),
                password: expand(password, env),
            })),
            Some(RegistryAuth::AwsEcr {
                access_key,
                secret_key,
            }) => {
                let region = ecr_region(&image.name).ok_or_else(|| {
                    Error::ImagePull(format!(
                        "{}: aws credentials supplied but the reference is not an ECR host",
                        image.name
                    ))
                })?;
                let password = ecr_login_password(
                    &region,
                    &expand(access_key, env),
                    &expand(secret_key, env),
                )
                .await?;
                Ok(Some(RegistryCredentials {
                    username: "AWS".to_string(),
                    password,
                }))
            }
        }
    }
}

/// Extract the region from an ECR image reference, when it is one.
pub fn ecr_region(reference: &str) -> Option<String> {
    ECR_REGEX
        .captures(reference)
        .map(|caps| caps[1].to_string())
}

async fn ecr_login_password(region: &str, access_key: &str, secret_key: &str) -> Result<String> {
    let output = tokio::process::Command::new("aws")
        .args(["ecr", "get-login-password", "--region", region])
        .env("AWS_ACCESS_KEY_ID", access_key)
        .env("AWS_SECRET_ACCESS_KEY", secret_key)
        .output()
        .await
        .map_err(|e| Error::ImagePull(format!("failed to invoke aws cli: {e}")))?;

    if !output.status.success() {
        return Err(Error::ImagePull(format!(
            "aws ecr get-login-password failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecr_hosts_are_detected() {
        assert_eq!(
            ecr_region("123456789012.dkr.ecr.eu-west-1.amazonaws.com/app:1").as_deref(),
            Some("eu-west-1")
        );
        assert!(ecr_region("docker.io/library/alpine").is_none());
        assert!(ecr_region("registry.example.com/app").is_none());
    }

    #[test]
    fn pull_errors_are_classified() {
        assert!(matches!(
            classify_pull_error("img", "manifest unknown: tag 1.2.3"),
            Error::ImageNotFound(_)
        ));
        assert!(matches!(
            classify_pull_error("img", "unauthorized: authentication required"),
            Error::ImagePull(_)
        ));
    }

    #[tokio::test]
    async fn basic_auth_expands_variables() {
        let provider = DefaultRegistryAuth;
        let image = ImageSpec {
            name: "registry.example.com/app".into(),
            run_as_user: None,
            auth: Some(RegistryAuth::Basic {
                username: "ci".into(),
                password: "$REGISTRY_PASSWORD".into(),
            }),
            platform: None,
        };
        let env = HashMap::from([(
            "REGISTRY_PASSWORD".to_string(),
            "hunter2".to_string(),
        )]);
        let creds = provider.auth_for(&image, &env).await.unwrap().unwrap();
        assert_eq!(creds.username, "ci");
        assert_eq!(creds.password, "hunter2");
    }

    #[tokio::test]
    async fn images_without_auth_need_no_credentials() {
        let provider = DefaultRegistryAuth;
        let image = ImageSpec::from_name("alpine:3");
        let creds = provider.auth_for(&image, &HashMap::new()).await.unwrap();
        assert!(creds.is_none());
    }
}
