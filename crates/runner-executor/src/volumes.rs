//! Host directories and named volumes for a run.
//!
//! Every allocation is recorded in a per-run ledger and released in LIFO
//! order at run termination, on every exit path. Releasing an allocation
//! does not always mean deleting it: cache directories persist across runs,
//! and build/artifact directories are kept under the run's output tree for
//! inspection unless the run asked for cleanup.

use bollard::Docker;
use bollard::volume::CreateVolumeOptions;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use runner_core::context::{RunContext, SSH_DIR};
use runner_core::id::docker_cache_volume;
use runner_core::pipeline::{CacheSpec, DOCKER_SERVICE};
use runner_core::result::CacheEntry;
use runner_core::{Error, Result};

/// Key used when a cache declares no `key.files`.
pub const DEFAULT_CACHE_KEY: &str = "default";

/// Graph root of the Docker-in-Docker daemon, backed by the `docker` cache.
pub const DOCKER_GRAPH_ROOT: &str = "/var/lib/docker";

#[derive(Debug)]
enum Allocation {
    /// A host directory. Removed on release only when `remove` is set.
    HostDir { path: PathBuf, remove: bool },
    /// A named container volume. Cache volumes survive the run.
    Volume { name: String, remove: bool },
}

/// What backs a cache mount.
#[derive(Debug, Clone)]
pub enum CacheBacking {
    Host(PathBuf),
    Volume(String),
}

/// One resolved cache for a step.
#[derive(Debug, Clone)]
pub struct CacheMount {
    pub name: String,
    pub key: String,
    pub backing: CacheBacking,
    /// Mount path inside the container using it.
    pub container_path: String,
}

/// Allocates and reclaims host directories and named volumes.
pub struct VolumeManager {
    docker: Docker,
    project_slug: String,
    cache_dir: PathBuf,
    cleanup_build: bool,
    ledger: Mutex<Vec<Allocation>>,
}

impl VolumeManager {
    pub fn new(docker: Docker, ctx: &RunContext) -> Self {
        Self {
            docker,
            project_slug: ctx.project.slug.clone(),
            cache_dir: ctx.cache_dir.clone(),
            cleanup_build: ctx.cleanup_build,
            ledger: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, allocation: Allocation) {
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.push(allocation);
        }
    }

    /// Create the empty build directory for a step.
    pub fn build_dir(&self, step_dir: &Path) -> Result<PathBuf> {
        let path = step_dir.join("build");
        std::fs::create_dir_all(&path)?;
        self.record(Allocation::HostDir {
            path: path.clone(),
            remove: self.cleanup_build,
        });
        Ok(path)
    }

    /// Create the artifact staging directory for a step. Kept under the
    /// run's output tree.
    pub fn artifact_dir(&self, step_dir: &Path) -> Result<PathBuf> {
        let path = step_dir.join("artifacts");
        std::fs::create_dir_all(&path)?;
        self.record(Allocation::HostDir {
            path: path.clone(),
            remove: false,
        });
        Ok(path)
    }

    /// Directory holding the generated shell program and breakpoint resume
    /// markers, bind-mounted read-only into the step container.
    pub fn agent_dir(&self, step_dir: &Path) -> Result<PathBuf> {
        let path = step_dir.join("agent");
        std::fs::create_dir_all(&path)?;
        self.record(Allocation::HostDir {
            path: path.clone(),
            remove: false,
        });
        Ok(path)
    }

    /// Resolve the caches a step declared. Unknown names are skipped with a
    /// warning; the `docker` cache resolves to the project-scoped named
    /// volume mounted at the DinD graph root.
    pub async fn cache_mounts(
        &self,
        declared: &[String],
        definitions: &indexmap::IndexMap<String, CacheSpec>,
        project_root: &Path,
        home: &str,
    ) -> Result<Vec<CacheMount>> {
        let mut mounts = Vec::new();
        for name in declared {
            if name == DOCKER_SERVICE {
                let volume = docker_cache_volume(&self.project_slug);
                self.create_volume(&volume, false).await?;
                mounts.push(CacheMount {
                    name: name.clone(),
                    key: DEFAULT_CACHE_KEY.to_string(),
                    backing: CacheBacking::Volume(volume),
                    container_path: DOCKER_GRAPH_ROOT.to_string(),
                });
                continue;
            }

            let Some(spec) = definitions.get(name) else {
                warn!(cache = %name, "skipping undefined cache");
                continue;
            };

            let key = derive_cache_key(project_root, &spec.key_files)?;
            let host = self.cache_dir.join(format!("{name}-{key}"));
            std::fs::create_dir_all(&host)?;
            self.record(Allocation::HostDir {
                path: host.clone(),
                remove: false,
            });
            mounts.push(CacheMount {
                name: name.clone(),
                key,
                backing: CacheBacking::Host(host),
                container_path: resolve_cache_path(&spec.path, home),
            });
        }
        Ok(mounts)
    }

    /// Create the per-step volume carrying the DinD daemon socket.
    pub async fn docker_socket_volume(&self, step_id: &str, suffix: &str) -> Result<String> {
        let name = format!("pipeline-runner-{step_id}-{suffix}-docker-socket");
        self.create_volume(&name, true).await?;
        Ok(name)
    }

    async fn create_volume(&self, name: &str, remove: bool) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions::<String> {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Internal(format!("failed to create volume {name}: {e}")))?;
        self.record(Allocation::Volume {
            name: name.to_string(),
            remove,
        });
        Ok(())
    }

    /// Materialise SSH key material and client configuration for a step.
    ///
    /// `id_rsa` is written mode 0600, `id_rsa_tmp` 0644; the config file
    /// content is [`ssh_config_content`], which the in-container setup also
    /// installs verbatim as the user's `~/.ssh/config`.
    pub fn ssh_material(&self, step_dir: &Path, key_path: &Path) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let dir = step_dir.join("ssh");
        std::fs::create_dir_all(&dir)?;
        self.record(Allocation::HostDir {
            path: dir.clone(),
            remove: false,
        });

        let key = std::fs::read(key_path).map_err(|e| {
            Error::Internal(format!(
                "failed to read ssh key {}: {e}",
                key_path.display()
            ))
        })?;

        let id_rsa = dir.join("id_rsa");
        std::fs::write(&id_rsa, &key)?;
        std::fs::set_permissions(&id_rsa, std::fs::Permissions::from_mode(0o600))?;

        let id_rsa_tmp = dir.join("id_rsa_tmp");
        std::fs::write(&id_rsa_tmp, &key)?;
        std::fs::set_permissions(&id_rsa_tmp, std::fs::Permissions::from_mode(0o644))?;

        std::fs::write(dir.join("config"), ssh_config_content())?;
        Ok(dir)
    }

    /// Release all recorded allocations, newest first. Failures are logged
    /// and do not stop the remaining releases.
    pub async fn release_all(&self) {
        let allocations = match self.ledger.lock() {
            Ok(mut ledger) => std::mem::take(&mut *ledger),
            Err(_) => return,
        };

        for allocation in allocations.into_iter().rev() {
            match allocation {
                Allocation::HostDir { path, remove } => {
                    if remove {
                        debug!(path = %path.display(), "removing directory");
                        if let Err(e) = std::fs::remove_dir_all(&path) {
                            warn!(path = %path.display(), error = %e, "failed to remove directory");
                        }
                    }
                }
                Allocation::Volume { name, remove } => {
                    if remove {
                        debug!(volume = %name, "removing volume");
                        if let Err(e) = self.docker.remove_volume(&name, None).await {
                            if !crate::docker::is_not_found(&e) {
                                warn!(volume = %name, error = %e, "failed to remove volume");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Post-step cache bookkeeping: record what was persisted and warn for
    /// caches whose directory ended up empty. Bind-mounted caches are
    /// already on the host, so there is nothing to copy.
    pub fn cache_entries(&self, mounts: &[CacheMount]) -> Vec<CacheEntry> {
        mounts
            .iter()
            .map(|mount| {
                let persisted = match &mount.backing {
                    CacheBacking::Volume(_) => true,
                    CacheBacking::Host(path) => {
                        let non_empty = std::fs::read_dir(path)
                            .map(|mut entries| entries.next().is_some())
                            .unwrap_or(false);
                        if !non_empty {
                            warn!(cache = %mount.name, "nothing to cache");
                        }
                        non_empty
                    }
                };
                CacheEntry {
                    name: mount.name.clone(),
                    key: mount.key.clone(),
                    persisted,
                }
            })
            .collect()
    }
}

/// The canonical ssh client configuration installed into step containers.
pub fn ssh_config_content() -> String {
    format!("IdentityFile {SSH_DIR}/id_rsa\nServerAliveInterval 180\n")
}

/// Resolve a declared cache path against the container home directory.
/// Relative paths are rooted at the clone directory.
fn resolve_cache_path(declared: &str, home: &str) -> String {
    if let Some(rest) = declared.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else if declared == "~" {
        home.to_string()
    } else if let Some(rest) = declared.strip_prefix("$HOME/") {
        format!("{home}/{rest}")
    } else if declared == "$HOME" {
        home.to_string()
    } else if declared.starts_with('/') {
        declared.to_string()
    } else {
        format!("{}/{declared}", runner_core::context::CLONE_DIR)
    }
}

/// Derive a cache key from its declared key files.
///
/// With no key files the key is the constant `default`. Otherwise it is the
/// lowercase hex SHA-256 of the concatenated SHA-256 digests of each file,
/// in declared order. A missing file is a hard error.
pub fn derive_cache_key(project_root: &Path, key_files: &[String]) -> Result<String> {
    if key_files.is_empty() {
        return Ok(DEFAULT_CACHE_KEY.to_string());
    }

    let mut combined = Sha256::new();
    for file in key_files {
        let path = project_root.join(file);
        let content = std::fs::read(&path)
            .map_err(|_| Error::CacheKeyMissingFile(path.display().to_string()))?;
        let digest = Sha256::digest(&content);
        combined.update(digest);
    }
    Ok(hex::encode(combined.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_files_use_default_key() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(derive_cache_key(dir.path(), &[]).unwrap(), DEFAULT_CACHE_KEY);
    }

    #[test]
    fn cache_key_is_deterministic_and_order_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.lock"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.lock"), "beta").unwrap();

        let files_ab = vec!["a.lock".to_string(), "b.lock".to_string()];
        let files_ba = vec!["b.lock".to_string(), "a.lock".to_string()];

        let key1 = derive_cache_key(dir.path(), &files_ab).unwrap();
        let key2 = derive_cache_key(dir.path(), &files_ab).unwrap();
        let key3 = derive_cache_key(dir.path(), &files_ba).unwrap();

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.len(), 64);
        assert!(key1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn cache_key_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("deps.lock");
        let files = vec!["deps.lock".to_string()];

        std::fs::write(&lock, "v1").unwrap();
        let key1 = derive_cache_key(dir.path(), &files).unwrap();
        std::fs::write(&lock, "v2").unwrap();
        let key2 = derive_cache_key(dir.path(), &files).unwrap();
        assert_ne!(key1, key2);
    }

    #[test]
    fn missing_key_file_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = derive_cache_key(dir.path(), &["gone.lock".to_string()]).unwrap_err();
        assert!(matches!(err, Error::CacheKeyMissingFile(_)));
    }

    #[test]
    fn cache_paths_resolve_home() {
        assert_eq!(resolve_cache_path("~/.m2", "/root"), "/root/.m2");
        assert_eq!(resolve_cache_path("$HOME/.npm", "/root"), "/root/.npm");
        assert_eq!(resolve_cache_path("/opt/cache", "/root"), "/opt/cache");
        assert_eq!(
            resolve_cache_path("node_modules", "/root"),
            "/opt/atlassian/pipelines/agent/build/node_modules"
        );
    }

    #[test]
    fn ssh_config_pins_identity_and_keepalive() {
        let config = ssh_config_content();
        assert!(config.contains("IdentityFile /opt/atlassian/pipelines/agent/ssh/id_rsa"));
        assert!(config.contains("ServerAliveInterval 180"));
    }
}
