//! Core domain types and traits for pipeline-runner.
//!
//! This crate contains:
//! - The parsed pipeline model (pipelines, step groups, steps, services, caches)
//! - The error taxonomy shared by all crates
//! - Run context: per-invocation identity, directories, and variable assembly
//! - Step and run results
//! - Identifier derivation (slugs, step ids, container names)
//! - Collaborator traits (registry auth, OIDC tokens, deployment variables)

pub mod cancel;
pub mod context;
pub mod creds;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod result;
pub mod ui;
pub mod variable;

pub use cancel::CancelToken;
pub use context::RunContext;
pub use error::{Error, Result};
