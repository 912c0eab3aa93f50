//! Collaborator traits for credential acquisition.
//!
//! The executor consumes these; concrete providers live with the code that
//! owns the corresponding mechanism (registry auth in the executor,
//! deployment variables in the configuration layer).

use async_trait::async_trait;
use std::collections::HashMap;

use crate::Result;
use crate::pipeline::ImageSpec;

/// Username and password for a transient registry login. Never logged.
#[derive(Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegistryCredentials(<redacted>)")
    }
}

/// Resolves registry credentials for an image, if any are needed.
#[async_trait]
pub trait RegistryAuthProvider: Send + Sync {
    /// `env` is the run's resolved variable map, used to expand `$VAR`
    /// references inside declared credentials.
    async fn auth_for(
        &self,
        image: &ImageSpec,
        env: &HashMap<String, String>,
    ) -> Result<Option<RegistryCredentials>>;
}

/// Produces the short-lived signed JWT injected as
/// `BITBUCKET_STEP_OIDC_TOKEN`. The executor never signs tokens itself.
#[async_trait]
pub trait OidcTokenProvider: Send + Sync {
    async fn token(&self, step_id: &str) -> Result<Option<String>>;
}

/// Default OIDC provider: forwards a token supplied by the invoking
/// environment, when one is present.
#[derive(Debug, Default)]
pub struct EnvOidcProvider;

/// Environment variable consulted by [`EnvOidcProvider`].
pub const OIDC_TOKEN_ENV: &str = "PIPELINE_RUNNER_OIDC_TOKEN";

#[async_trait]
impl OidcTokenProvider for EnvOidcProvider {
    async fn token(&self, _step_id: &str) -> Result<Option<String>> {
        Ok(std::env::var(OIDC_TOKEN_ENV).ok().filter(|t| !t.is_empty()))
    }
}

/// Looks up deployment variables by deployment environment name.
pub trait DeploymentVarsProvider: Send + Sync {
    fn vars_for(&self, environment: &str) -> Result<Vec<(String, String)>>;
}

/// Provider with no deployment environments configured.
#[derive(Debug, Default)]
pub struct NoDeployments;

impl DeploymentVarsProvider for NoDeployments {
    fn vars_for(&self, _environment: &str) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}
