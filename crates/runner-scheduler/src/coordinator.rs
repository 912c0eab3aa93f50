//! The pipeline coordinator.
//!
//! Walks the ordered step groups of one pipeline. Sequential steps stop the
//! pipeline on failure; steps of a parallel group are serialised in
//! declared order but a failure does not prevent its siblings from running.
//! Artifacts from any completed step are visible to all subsequent steps
//! through the shared [`ArtifactStore`].

use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use runner_core::RunContext;
use runner_core::pipeline::{GroupMode, Pipeline, Step, Trigger};
use runner_core::result::{RunResult, StepResult};
use runner_core::ui::Interactor;

use runner_executor::{ArtifactStore, OutputLine, StepExecutor, StepRun};

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StepStarted { name: String },
    StepLog { name: String, line: String },
    StepSkipped { name: String },
    StepCompleted { name: String, success: bool, exit_code: i64 },
    Cancelled,
    PipelineCompleted { success: bool },
}

/// Seam between the coordinator and the Docker-backed executor.
#[async_trait]
pub trait StepRunner: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step: &Step,
        ctx: &RunContext,
        group_index: usize,
        step_index: usize,
        parallel: Option<(usize, usize)>,
        store: &ArtifactStore,
        output: mpsc::Sender<OutputLine>,
    ) -> StepResult;
}

#[async_trait]
impl StepRunner for StepExecutor {
    async fn run_step(
        &self,
        step: &Step,
        ctx: &RunContext,
        group_index: usize,
        step_index: usize,
        parallel: Option<(usize, usize)>,
        store: &ArtifactStore,
        output: mpsc::Sender<OutputLine>,
    ) -> StepResult {
        self.execute(StepRun {
            step,
            ctx,
            group_index,
            step_index,
            parallel,
            store,
            output,
        })
        .await
    }
}

/// Orchestrates the execution of one pipeline.
pub struct PipelineCoordinator {
    runner: Arc<dyn StepRunner>,
    interactor: Arc<dyn Interactor>,
}

impl PipelineCoordinator {
    pub fn new(runner: Arc<dyn StepRunner>, interactor: Arc<dyn Interactor>) -> Self {
        Self { runner, interactor }
    }

    /// Execute a pipeline, returning a channel of events and a handle to
    /// the final result.
    pub fn execute(
        &self,
        pipeline: Pipeline,
        ctx: RunContext,
    ) -> (mpsc::Receiver<PipelineEvent>, JoinHandle<RunResult>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let runner = Arc::clone(&self.runner);
        let interactor = Arc::clone(&self.interactor);

        let handle = tokio::spawn(async move {
            Self::execute_inner(runner, interactor, pipeline, ctx, events_tx).await
        });

        (events_rx, handle)
    }

    async fn execute_inner(
        runner: Arc<dyn StepRunner>,
        interactor: Arc<dyn Interactor>,
        pipeline: Pipeline,
        ctx: RunContext,
        events: mpsc::Sender<PipelineEvent>,
    ) -> RunResult {
        let store = ArtifactStore::new();
        let mut steps: Vec<StepResult> = Vec::new();
        let mut success = true;

        // One writer task serialises all step output into pipeline.log and
        // forwards it to the terminal, in arrival order.
        let (output_tx, mut output_rx) = mpsc::channel::<OutputLine>(256);
        let log_events = events.clone();
        let pipeline_log = open_pipeline_log(&ctx);
        let log_task = tokio::spawn(async move {
            let mut log = pipeline_log;
            while let Some(line) = output_rx.recv().await {
                if let Some(log) = log.as_mut() {
                    let _ = writeln!(log, "[{}] {}", line.step_name, line.line);
                }
                let _ = log_events
                    .send(PipelineEvent::StepLog {
                        name: line.step_name,
                        line: line.line,
                    })
                    .await;
            }
            if let Some(log) = log.as_mut() {
                let _ = log.flush();
            }
        });

        'groups: for group in &pipeline.groups {
            if ctx.cancel.is_cancelled() {
                let _ = events.send(PipelineEvent::Cancelled).await;
                success = false;
                break;
            }

            let parallel_count = match group.mode {
                GroupMode::Parallel => Some(group.steps.len()),
                GroupMode::Sequential => None,
            };
            let mut group_failed = false;

            for (step_index, step) in group.steps.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    let _ = events.send(PipelineEvent::Cancelled).await;
                    success = false;
                    break 'groups;
                }

                if step.trigger == Trigger::Manual {
                    let proceed = if ctx.interactive {
                        interactor.confirm_manual(&step.name).await
                    } else {
                        false
                    };
                    if !proceed {
                        // The pipeline stops, successfully, before the
                        // manual step.
                        info!(step = %step.name, "manual step not confirmed, stopping");
                        let _ = events
                            .send(PipelineEvent::StepSkipped {
                                name: step.name.clone(),
                            })
                            .await;
                        break 'groups;
                    }
                }

                let _ = events
                    .send(PipelineEvent::StepStarted {
                        name: step.name.clone(),
                    })
                    .await;

                let parallel = parallel_count.map(|count| (step_index, count));
                let result = runner
                    .run_step(
                        step,
                        &ctx,
                        group.index,
                        step_index,
                        parallel,
                        &store,
                        output_tx.clone(),
                    )
                    .await;

                let step_success = result.succeeded();
                if step_success {
                    info!(step = %step.name, "step completed");
                } else {
                    error!(step = %step.name, exit_code = result.exit_code, "step failed");
                    group_failed = true;
                }
                let _ = events
                    .send(PipelineEvent::StepCompleted {
                        name: step.name.clone(),
                        success: step_success,
                        exit_code: result.exit_code,
                    })
                    .await;
                steps.push(result);

                // A sequential failure stops the pipeline immediately;
                // parallel siblings still get their turn.
                if group_failed && group.mode == GroupMode::Sequential {
                    success = false;
                    break 'groups;
                }
            }

            if group_failed {
                success = false;
                break;
            }
        }

        drop(output_tx);
        let _ = log_task.await;

        let _ = events.send(PipelineEvent::PipelineCompleted { success }).await;
        RunResult {
            run_id: ctx.run_id.clone(),
            success,
            steps,
        }
    }
}

fn open_pipeline_log(ctx: &RunContext) -> Option<BufWriter<File>> {
    if let Err(e) = std::fs::create_dir_all(&ctx.run_dir) {
        error!(error = %e, "failed to create run directory");
        return None;
    }
    match File::create(ctx.pipeline_log_path()) {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(error = %e, "failed to create pipeline.log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runner_core::CancelToken;
    use runner_core::context::ProjectInfo;
    use runner_core::pipeline::StepGroup;
    use runner_core::ui::NonInteractive;
    use runner_core::variable::VariableSet;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct MockRunner {
        /// Exit code per step name.
        exit_codes: HashMap<String, i64>,
        calls: Mutex<Vec<(String, Option<(usize, usize)>)>>,
    }

    impl MockRunner {
        fn new(exit_codes: &[(&str, i64)]) -> Self {
            Self {
                exit_codes: exit_codes
                    .iter()
                    .map(|(name, code)| (name.to_string(), *code))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Option<(usize, usize)>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepRunner for MockRunner {
        async fn run_step(
            &self,
            step: &Step,
            _ctx: &RunContext,
            _group_index: usize,
            _step_index: usize,
            parallel: Option<(usize, usize)>,
            _store: &ArtifactStore,
            _output: mpsc::Sender<OutputLine>,
        ) -> StepResult {
            self.calls
                .lock()
                .unwrap()
                .push((step.name.clone(), parallel));
            let exit_code = *self.exit_codes.get(&step.name).unwrap_or(&0);
            StepResult {
                step_id: step.name.clone(),
                name: step.name.clone(),
                exit_code,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                artifacts: vec![],
                caches: vec![],
                failure: if exit_code == 0 {
                    None
                } else {
                    Some(runner_core::result::FailureReason::Script)
                },
            }
        }
    }

    fn make_step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            script: vec!["true".to_string()],
            ..Step::default()
        }
    }

    fn make_ctx(run_dir: &std::path::Path) -> RunContext {
        RunContext {
            run_id: "test-run".into(),
            pipeline_uuid: Uuid::nil(),
            project: ProjectInfo {
                root: run_dir.to_path_buf(),
                slug: "proj".into(),
                repo_owner: "acme".into(),
                repo_slug: "proj".into(),
                branch: "main".into(),
                commit: "abc".into(),
            },
            build_number: 1,
            run_dir: run_dir.to_path_buf(),
            cache_dir: run_dir.join("cache"),
            variables: VariableSet::new(),
            interactive: false,
            cpu_limits: false,
            cleanup_build: false,
            ssh: None,
            extra_volumes: vec![],
            started_at: Utc::now(),
            cancel: CancelToken::new(),
        }
    }

    fn sequential(steps: &[&str]) -> Pipeline {
        Pipeline {
            selector: "default".into(),
            variables: vec![],
            groups: steps
                .iter()
                .enumerate()
                .map(|(index, name)| StepGroup {
                    index,
                    mode: GroupMode::Sequential,
                    steps: vec![make_step(name)],
                })
                .collect(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn sequential_failure_stops_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(&[("build", 69)]));
        let coordinator =
            PipelineCoordinator::new(runner.clone(), Arc::new(NonInteractive));

        let (rx, handle) =
            coordinator.execute(sequential(&["build", "deploy"]), make_ctx(dir.path()));
        let events = drain(rx).await;
        let result = handle.await.unwrap();

        assert!(!result.success);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].exit_code, 69);
        let names: Vec<String> = runner.calls().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["build"]);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { success: false })
        ));
    }

    #[tokio::test]
    async fn successful_pipeline_runs_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(&[]));
        let coordinator =
            PipelineCoordinator::new(runner.clone(), Arc::new(NonInteractive));

        let (rx, handle) =
            coordinator.execute(sequential(&["build", "test", "deploy"]), make_ctx(dir.path()));
        drain(rx).await;
        let result = handle.await.unwrap();

        assert!(result.success);
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn parallel_siblings_run_despite_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(&[("lint", 1)]));
        let coordinator =
            PipelineCoordinator::new(runner.clone(), Arc::new(NonInteractive));

        let pipeline = Pipeline {
            selector: "default".into(),
            variables: vec![],
            groups: vec![
                StepGroup {
                    index: 0,
                    mode: GroupMode::Parallel,
                    steps: vec![make_step("lint"), make_step("test")],
                },
                StepGroup {
                    index: 1,
                    mode: GroupMode::Sequential,
                    steps: vec![make_step("deploy")],
                },
            ],
        };

        let (rx, handle) = coordinator.execute(pipeline, make_ctx(dir.path()));
        drain(rx).await;
        let result = handle.await.unwrap();

        assert!(!result.success);
        let calls = runner.calls();
        let names: Vec<&str> = calls.iter().map(|(n, _)| n.as_str()).collect();
        // Both parallel steps ran, serialised in declared order; the
        // following group did not.
        assert_eq!(names, vec!["lint", "test"]);
        assert_eq!(calls[0].1, Some((0, 2)));
        assert_eq!(calls[1].1, Some((1, 2)));
    }

    #[tokio::test]
    async fn sequential_steps_carry_no_parallel_env() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(&[]));
        let coordinator =
            PipelineCoordinator::new(runner.clone(), Arc::new(NonInteractive));

        let (rx, handle) = coordinator.execute(sequential(&["build"]), make_ctx(dir.path()));
        drain(rx).await;
        handle.await.unwrap();

        assert_eq!(runner.calls()[0].1, None);
    }

    #[tokio::test]
    async fn manual_step_skips_and_stops_successfully_when_non_interactive() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(&[]));
        let coordinator =
            PipelineCoordinator::new(runner.clone(), Arc::new(NonInteractive));

        let mut pipeline = sequential(&["build", "release", "announce"]);
        pipeline.groups[1].steps[0].trigger = Trigger::Manual;

        let (rx, handle) = coordinator.execute(pipeline, make_ctx(dir.path()));
        let events = drain(rx).await;
        let result = handle.await.unwrap();

        assert!(result.success);
        assert_eq!(result.steps.len(), 1);
        let names: Vec<String> = runner.calls().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["build"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::StepSkipped { name } if name == "release")));
    }

    #[tokio::test]
    async fn cancelled_run_executes_nothing_further() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(&[]));
        let coordinator =
            PipelineCoordinator::new(runner.clone(), Arc::new(NonInteractive));

        let ctx = make_ctx(dir.path());
        ctx.cancel.cancel();
        let (rx, handle) = coordinator.execute(sequential(&["build"]), ctx);
        drain(rx).await;
        let result = handle.await.unwrap();

        assert!(!result.success);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn pipeline_log_captures_output() {
        let dir = tempfile::tempdir().unwrap();

        struct ChattyRunner;
        #[async_trait]
        impl StepRunner for ChattyRunner {
            async fn run_step(
                &self,
                step: &Step,
                _ctx: &RunContext,
                _group_index: usize,
                _step_index: usize,
                _parallel: Option<(usize, usize)>,
                _store: &ArtifactStore,
                output: mpsc::Sender<OutputLine>,
            ) -> StepResult {
                let _ = output
                    .send(OutputLine {
                        step_id: "id".into(),
                        step_name: step.name.clone(),
                        line: "hello from the container".into(),
                    })
                    .await;
                StepResult {
                    step_id: "id".into(),
                    name: step.name.clone(),
                    exit_code: 0,
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    artifacts: vec![],
                    caches: vec![],
                    failure: None,
                }
            }
        }

        let coordinator =
            PipelineCoordinator::new(Arc::new(ChattyRunner), Arc::new(NonInteractive));
        let (rx, handle) = coordinator.execute(sequential(&["build"]), make_ctx(dir.path()));
        drain(rx).await;
        handle.await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("pipeline.log")).unwrap();
        assert_eq!(log, "[build] hello from the container\n");
    }
}
