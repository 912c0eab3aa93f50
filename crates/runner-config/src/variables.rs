//! User-supplied variables and declared-variable validation.
//!
//! Validation of `allowed-values` and required variables happens here, in
//! one place, before any container starts.

use std::collections::HashMap;
use std::path::Path;

use runner_core::creds::DeploymentVarsProvider;
use runner_core::pipeline::DeclaredVariable;
use runner_core::variable::{VarOrigin, Variable};

use crate::error::{ConfigError, ConfigResult};

/// Parse `KEY=VALUE` command-line assignments.
pub fn parse_assignments(assignments: &[String]) -> ConfigResult<Vec<(String, String)>> {
    assignments
        .iter()
        .map(|raw| {
            raw.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "--env".to_string(),
                    message: format!("expected KEY=VALUE, got '{raw}'"),
                })
        })
        .collect()
}

/// Load variables from a dotenv-style file. A missing file is an error;
/// callers probe for the conventional `.env` themselves.
pub fn load_env_file(path: &Path) -> ConfigResult<Vec<(String, String)>> {
    let mut vars = Vec::new();
    for item in dotenvy::from_path_iter(path).map_err(|e| ConfigError::InvalidValue {
        field: path.display().to_string(),
        message: e.to_string(),
    })? {
        let (key, value) = item.map_err(|e| ConfigError::InvalidValue {
            field: path.display().to_string(),
            message: e.to_string(),
        })?;
        vars.push((key, value));
    }
    Ok(vars)
}

/// Validate supplied values against the pipeline's declared variables and
/// resolve defaults for the rest.
///
/// Returns pipeline-declared variables for every name the user did not
/// supply: the default when one exists, the empty string otherwise. A
/// declared variable with `allowed-values` must either be supplied with one
/// of those values or carry a default.
pub fn resolve_declared(
    declared: &[DeclaredVariable],
    supplied: &HashMap<String, String>,
) -> ConfigResult<Vec<Variable>> {
    let mut resolved = Vec::new();

    for var in declared {
        match supplied.get(&var.name) {
            Some(value) => {
                if !var.allowed_values.is_empty() && !var.allowed_values.contains(value) {
                    return Err(ConfigError::Validation(format!(
                        "variable '{}' must be one of [{}], got '{value}'",
                        var.name,
                        var.allowed_values.join(", ")
                    )));
                }
            }
            None => match &var.default {
                Some(default) => {
                    resolved.push(Variable::new(
                        var.name.clone(),
                        default.clone(),
                        VarOrigin::PipelineDeclared,
                    ));
                }
                None if !var.allowed_values.is_empty() => {
                    return Err(ConfigError::Validation(format!(
                        "variable '{}' is required and must be one of [{}]",
                        var.name,
                        var.allowed_values.join(", ")
                    )));
                }
                None => {
                    resolved.push(Variable::new(
                        var.name.clone(),
                        String::new(),
                        VarOrigin::PipelineDeclared,
                    ));
                }
            },
        }
    }

    Ok(resolved)
}

/// Deployment variables read from `.env.<environment>` in the project root.
#[derive(Debug)]
pub struct DotenvDeployments {
    root: std::path::PathBuf,
}

impl DotenvDeployments {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DeploymentVarsProvider for DotenvDeployments {
    fn vars_for(&self, environment: &str) -> runner_core::Result<Vec<(String, String)>> {
        let path = self.root.join(format!(".env.{environment}"));
        if !path.is_file() {
            return Ok(Vec::new());
        }
        load_env_file(&path).map_err(runner_core::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn declared(name: &str, default: Option<&str>, allowed: &[&str]) -> DeclaredVariable {
        DeclaredVariable {
            name: name.to_string(),
            default: default.map(String::from),
            allowed_values: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn defaults_fill_unsupplied_variables() {
        let vars = [
            declared("FILENAME", None, &[]),
            declared("VAR_WITH_DEFAULT_1", Some("Default 1"), &[]),
            declared("VAR_WITH_CHOICE", Some("dev"), &["dev", "staging", "production"]),
        ];
        let supplied = HashMap::from([("FILENAME".to_string(), "out.txt".to_string())]);
        let resolved = resolve_declared(&vars, &supplied).unwrap();
        let names: Vec<&str> = resolved.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["VAR_WITH_DEFAULT_1", "VAR_WITH_CHOICE"]);
        assert_eq!(resolved[0].value, "Default 1");
        assert_eq!(resolved[1].value, "dev");
    }

    #[test]
    fn unsupplied_without_default_resolves_empty() {
        let vars = [declared("EMPTY", None, &[])];
        let resolved = resolve_declared(&vars, &HashMap::new()).unwrap();
        assert_eq!(resolved[0].value, "");
    }

    #[test]
    fn value_outside_allowed_values_fails() {
        let vars = [declared("VAR_WITH_CHOICE", Some("dev"), &["dev", "staging", "production"])];
        let supplied = HashMap::from([("VAR_WITH_CHOICE".to_string(), "nope".to_string())]);
        let err = resolve_declared(&vars, &supplied).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn constrained_variable_without_default_is_required() {
        let vars = [declared("TARGET", None, &["dev", "prod"])];
        let err = resolve_declared(&vars, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn parse_assignments_accepts_equals_in_value() {
        let parsed =
            parse_assignments(&["KEY=a=b".to_string(), "OTHER=x".to_string()]).unwrap();
        assert_eq!(parsed[0], ("KEY".to_string(), "a=b".to_string()));
        assert_eq!(parsed[1], ("OTHER".to_string(), "x".to_string()));
    }

    #[test]
    fn parse_assignments_rejects_bare_names() {
        assert!(parse_assignments(&["NOVALUE".to_string()]).is_err());
    }

    #[test]
    fn env_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "MESSAGE=hello world").unwrap();
        writeln!(file, "EMPTY=").unwrap();
        drop(file);

        let vars = load_env_file(&path).unwrap();
        assert!(vars.contains(&("MESSAGE".to_string(), "hello world".to_string())));
        assert!(vars.contains(&("EMPTY".to_string(), String::new())));
    }

    #[test]
    fn deployment_vars_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DotenvDeployments::new(dir.path());
        assert!(provider.vars_for("production").unwrap().is_empty());
    }
}
