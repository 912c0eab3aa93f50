//! Docker-backed step execution for pipeline-runner.
//!
//! This crate owns every interaction with the container runtime:
//! - Image resolution and pulls ([`image`])
//! - Host directories, cache keys, and named volumes ([`volumes`])
//! - Sidecar service containers and per-step networking ([`services`])
//! - The generated in-container shell program ([`script`])
//! - Output demultiplexing and log files ([`logs`])
//! - The step lifecycle itself ([`step`])

pub mod docker;
pub mod image;
pub mod logs;
pub mod script;
pub mod services;
pub mod step;
pub mod volumes;
pub mod workspace;

pub use step::{OutputLine, StepExecutor, StepRun};
pub use workspace::ArtifactStore;
