//! `pipeline-runner run`: execute one pipeline locally.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use runner_config::{PIPELINE_FILE, paths, project, variables};
use runner_core::context::{RunContext, SshForwarding, UserVolume};
use runner_core::creds::EnvOidcProvider;
use runner_core::pipeline::Pipeline;
use runner_core::ui::{Interactor, NonInteractive};
use runner_core::variable::{VarOrigin, Variable, VariableSet};
use runner_core::{CancelToken, Error};
use runner_executor::image::{DefaultRegistryAuth, ImageProvider};
use runner_executor::step::StepExecutor;
use runner_executor::volumes::VolumeManager;
use runner_scheduler::{PipelineCoordinator, PipelineEvent};

use crate::terminal;

pub struct RunArgs {
    pub project_dir: PathBuf,
    pub pipeline: Option<String>,
    pub env: Vec<String>,
    pub secret: Vec<String>,
    pub env_file: Vec<PathBuf>,
    pub ssh: bool,
    pub cpu_limits: bool,
    pub volume: Vec<String>,
    pub cleanup_build: bool,
    pub non_interactive: bool,
}

pub async fn run(args: RunArgs) -> i32 {
    match run_inner(args).await {
        Ok(code) => code,
        Err(RunError::Usage(message)) => {
            eprintln!("error: {message}");
            2
        }
        Err(RunError::Fatal(message)) => {
            eprintln!("error: {message}");
            1
        }
    }
}

enum RunError {
    /// Invalid invocation or configuration: exit 2.
    Usage(String),
    /// Everything else: exit 1.
    Fatal(String),
}

impl From<runner_config::ConfigError> for RunError {
    fn from(err: runner_config::ConfigError) -> Self {
        RunError::Usage(err.to_string())
    }
}

impl From<Error> for RunError {
    fn from(err: Error) -> Self {
        match err {
            Error::VariableValidation(_) | Error::InvalidStep(_) => {
                RunError::Usage(err.to_string())
            }
            other => RunError::Fatal(other.to_string()),
        }
    }
}

async fn run_inner(args: RunArgs) -> Result<i32, RunError> {
    let project_root = args
        .project_dir
        .canonicalize()
        .map_err(|e| RunError::Usage(format!("{}: {e}", args.project_dir.display())))?;
    let pipeline_path = project_root.join(PIPELINE_FILE);
    if !pipeline_path.is_file() {
        return Err(RunError::Usage(format!(
            "no {PIPELINE_FILE} in {}",
            project_root.display()
        )));
    }

    let set = runner_config::parse_file(&pipeline_path)?;
    let pipeline = select_pipeline(&set, args.pipeline.as_deref())?;

    let interactive = !args.non_interactive && terminal::is_interactive();

    // User-supplied variables: project `.env`, then --env-file, then --env
    // and --secret flags; later sources win.
    let mut user_vars: Vec<(String, String, bool)> = Vec::new();
    let project_env = project_root.join(".env");
    if project_env.is_file() {
        for (k, v) in variables::load_env_file(&project_env)? {
            user_vars.push((k, v, false));
        }
    }
    for file in &args.env_file {
        for (k, v) in variables::load_env_file(file)? {
            user_vars.push((k, v, false));
        }
    }
    for (k, v) in variables::parse_assignments(&args.env)? {
        user_vars.push((k, v, false));
    }
    for (k, v) in variables::parse_assignments(&args.secret)? {
        user_vars.push((k, v, true));
    }

    let mut supplied: HashMap<String, String> = user_vars
        .iter()
        .map(|(k, v, _)| (k.clone(), v.clone()))
        .collect();

    // Prompt for declared variables the user did not supply.
    if interactive && !pipeline.variables.is_empty() {
        for (k, v) in terminal::prompt_variables(&pipeline.variables, &supplied) {
            supplied.insert(k.clone(), v.clone());
            user_vars.push((k, v, false));
        }
    }

    // Declared-variable validation happens before any container starts.
    let declared = variables::resolve_declared(&pipeline.variables, &supplied)?;

    let mut var_set = VariableSet::new();
    for var in declared {
        var_set.push(var);
    }
    for (name, value, secret) in user_vars {
        var_set.push(if secret {
            Variable::secret(name, value, VarOrigin::UserSupplied)
        } else {
            Variable::new(name, value, VarOrigin::UserSupplied)
        });
    }

    let info = project::discover(&project_root)?;
    let data_root = paths::data_root()?;
    let cache_root = paths::cache_root()?;
    let build_number = paths::next_build_number(&data_root, &info.slug)?;
    let run_dir = paths::run_dir(&data_root, &info.slug, build_number);
    let cache_dir = cache_root.join(&info.slug);
    std::fs::create_dir_all(&run_dir).map_err(|e| RunError::Fatal(e.to_string()))?;

    let ssh = if args.ssh {
        Some(resolve_ssh()?)
    } else {
        None
    };
    let extra_volumes = parse_volumes(&args.volume)?;

    let cancel = CancelToken::new();
    let ctx = RunContext {
        run_id: Uuid::new_v4().to_string(),
        pipeline_uuid: Uuid::new_v4(),
        project: info,
        build_number,
        run_dir: run_dir.clone(),
        cache_dir,
        variables: var_set,
        interactive,
        cpu_limits: args.cpu_limits,
        cleanup_build: args.cleanup_build,
        ssh,
        extra_volumes,
        started_at: Utc::now(),
        cancel: cancel.clone(),
    };

    println!(
        "Running pipeline '{}' (build #{build_number})",
        pipeline.selector
    );
    println!("Logs: {}", run_dir.display());

    let docker = runner_executor::docker::connect().await.map_err(RunError::from)?;
    runner_executor::docker::sweep_stale_containers(&docker).await;

    let images = Arc::new(ImageProvider::new(
        docker.clone(),
        Arc::new(DefaultRegistryAuth),
    ));
    let volumes = Arc::new(VolumeManager::new(docker.clone(), &ctx));
    let interactor: Arc<dyn Interactor> = if interactive {
        Arc::new(terminal::TerminalInteractor)
    } else {
        Arc::new(NonInteractive)
    };
    let deployments = Arc::new(variables::DotenvDeployments::new(&ctx.project.root));

    let executor = Arc::new(StepExecutor::new(
        docker,
        images,
        Arc::clone(&volumes),
        set.definitions.clone(),
        set.image.clone(),
        Arc::new(EnvOidcProvider),
        deployments,
        Arc::clone(&interactor),
    ));

    // Ctrl-C cancels with a grace period; a second Ctrl-C force-kills.
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if signal_token.is_cancelled() {
                eprintln!("\nForce-killing containers");
            } else {
                eprintln!("\nCancelling run (Ctrl-C again to force-kill)");
            }
            signal_token.cancel();
        }
    });

    let coordinator = PipelineCoordinator::new(executor, interactor);
    let (mut events, handle) = coordinator.execute(pipeline.clone(), ctx);

    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::StepStarted { name } => {
                println!("▶ Step '{name}' started");
            }
            PipelineEvent::StepLog { name, line } => {
                println!("[{name}] {line}");
            }
            PipelineEvent::StepSkipped { name } => {
                println!("⊘ Step '{name}' skipped (manual trigger)");
            }
            PipelineEvent::StepCompleted { name, success, exit_code } => {
                if success {
                    println!("✓ Step '{name}' succeeded");
                } else {
                    println!("✗ Step '{name}' failed (exit code {exit_code})");
                }
            }
            PipelineEvent::Cancelled => {
                println!("Run cancelled");
            }
            PipelineEvent::PipelineCompleted { success } => {
                if success {
                    println!("Pipeline completed successfully");
                } else {
                    println!("Pipeline failed");
                }
            }
        }
    }

    let result = handle.await;

    // Release every recorded allocation, LIFO, on all exit paths.
    volumes.release_all().await;

    let result =
        result.map_err(|e| RunError::Fatal(format!("pipeline task failed: {e}")))?;
    Ok(result.exit_code())
}

fn select_pipeline<'a>(
    set: &'a runner_core::pipeline::PipelineSet,
    requested: Option<&str>,
) -> Result<&'a Pipeline, RunError> {
    let selector = requested.unwrap_or("default");
    if let Some(pipeline) = set.get(selector) {
        return Ok(pipeline);
    }
    if let Some(pipeline) = set.get(&format!("custom.{selector}")) {
        return Ok(pipeline);
    }
    let available: Vec<&str> = set.pipelines.keys().map(String::as_str).collect();
    Err(RunError::Usage(format!(
        "no such pipeline '{selector}'; available: {}",
        available.join(", ")
    )))
}

fn resolve_ssh() -> Result<SshForwarding, RunError> {
    let home = dirs::home_dir()
        .ok_or_else(|| RunError::Usage("cannot locate home directory for --ssh".to_string()))?;
    let key_path = home.join(".ssh").join("id_rsa");
    if !key_path.is_file() {
        return Err(RunError::Usage(format!(
            "--ssh requested but {} does not exist",
            key_path.display()
        )));
    }
    let agent_sock = std::env::var("SSH_AUTH_SOCK")
        .ok()
        .map(PathBuf::from)
        .filter(|p| p.exists());
    Ok(SshForwarding {
        key_path,
        agent_sock,
    })
}

fn parse_volumes(specs: &[String]) -> Result<Vec<UserVolume>, RunError> {
    specs
        .iter()
        .map(|spec| {
            let parts: Vec<&str> = spec.split(':').collect();
            match parts.as_slice() {
                [host, container] => Ok(UserVolume {
                    host: PathBuf::from(host),
                    container: container.to_string(),
                    read_only: false,
                }),
                [host, container, "ro"] => Ok(UserVolume {
                    host: PathBuf::from(host),
                    container: container.to_string(),
                    read_only: true,
                }),
                [host, container, "rw"] => Ok(UserVolume {
                    host: PathBuf::from(host),
                    container: container.to_string(),
                    read_only: false,
                }),
                _ => Err(RunError::Usage(format!(
                    "invalid --volume '{spec}', expected HOST:CONTAINER[:ro]"
                ))),
            }
        })
        .collect()
}
