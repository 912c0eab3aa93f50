//! User-interaction collaborator.
//!
//! Manual triggers, breakpoints, and variable prompts need a controlling
//! terminal; non-interactive runs substitute fixed answers.

use async_trait::async_trait;

#[async_trait]
pub trait Interactor: Send + Sync {
    /// Ask whether a manual step should run. `false` stops the pipeline
    /// (successfully).
    async fn confirm_manual(&self, step_name: &str) -> bool;

    /// Block until the user resumes a paused breakpoint.
    async fn resume_breakpoint(&self, step_name: &str, index: u32);
}

/// Interactor for runs without a controlling terminal: manual steps are
/// skipped and breakpoints resume immediately.
#[derive(Debug, Default)]
pub struct NonInteractive;

#[async_trait]
impl Interactor for NonInteractive {
    async fn confirm_manual(&self, _step_name: &str) -> bool {
        false
    }

    async fn resume_breakpoint(&self, _step_name: &str, _index: u32) {}
}
