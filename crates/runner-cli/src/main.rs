//! pipeline-runner CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod terminal;

#[derive(Parser)]
#[command(name = "pipeline-runner")]
#[command(about = "Run Bitbucket Pipelines locally", long_about = None)]
#[command(version)]
struct Cli {
    /// Project directory containing bitbucket-pipelines.yml
    #[arg(long, short = 'p', global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline to run (e.g. `default`, `custom.deploy`, or just `deploy`)
        pipeline: Option<String>,

        /// Set a variable (repeatable)
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Set a secret variable, masked in all logs (repeatable)
        #[arg(long = "secret", value_name = "KEY=VALUE")]
        secret: Vec<String>,

        /// Load variables from a dotenv file (repeatable)
        #[arg(long = "env-file", value_name = "FILE")]
        env_file: Vec<PathBuf>,

        /// Forward the user's ssh key and agent into step containers
        #[arg(long)]
        ssh: bool,

        /// Apply CPU/memory limits derived from each step's size
        #[arg(long)]
        cpu_limits: bool,

        /// Extra bind mount, HOST:CONTAINER[:ro] (repeatable)
        #[arg(long = "volume", value_name = "HOST:CONTAINER[:ro]")]
        volume: Vec<String>,

        /// Remove build directories at run end instead of keeping them
        #[arg(long)]
        cleanup_build: bool,

        /// Never prompt; manual steps are skipped
        #[arg(long)]
        non_interactive: bool,
    },
    /// List the pipelines defined in the pipeline file
    List,
}

/// Process exit code for invalid invocations and configuration errors.
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run {
            pipeline,
            env,
            secret,
            env_file,
            ssh,
            cpu_limits,
            volume,
            cleanup_build,
            non_interactive,
        } => {
            commands::run::run(commands::run::RunArgs {
                project_dir: cli.project_dir,
                pipeline,
                env,
                secret,
                env_file,
                ssh,
                cpu_limits,
                volume,
                cleanup_build,
                non_interactive,
            })
            .await
        }
        Commands::List => commands::list::list(&cli.project_dir),
    };

    std::process::exit(code);
}
