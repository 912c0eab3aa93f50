//! Pipeline file parsing and configuration discovery for pipeline-runner.
//!
//! This crate handles:
//! - Parsing `bitbucket-pipelines.yml` into the core model
//! - Project context discovery (git branch, commit, remote)
//! - User variables from flags and `.env` files, and validation of
//!   pipeline-declared variables
//! - Data and cache directory resolution, and the build-number counter

pub mod error;
pub mod file;
pub mod paths;
pub mod project;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use file::{PIPELINE_FILE, parse_file, parse_str};
