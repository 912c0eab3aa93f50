//! Pipeline coordination for pipeline-runner.

pub mod coordinator;

pub use coordinator::{PipelineCoordinator, PipelineEvent, StepRunner};
