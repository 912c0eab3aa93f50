//! Variables, precedence, and secret masking.
//!
//! The environment presented to a step is the union of several origins;
//! earlier origins win:
//!
//! 1. step-local variables
//! 2. user-supplied variables (flags, prompt, `.env`)
//! 3. deployment variables
//! 4. pipeline-declared variables
//! 5. system (`BITBUCKET_*`) variables

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Placeholder substituted for secret values in terminal and file logs.
pub const SECRET_PLACEHOLDER: &str = "****";

/// Where a variable came from. Ordering is precedence: greater wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VarOrigin {
    System,
    PipelineDeclared,
    Deployment,
    UserSupplied,
    StepLocal,
    Oidc,
}

/// A single named value with its origin and sensitivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub origin: VarOrigin,
    pub secret: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: impl Into<String>, origin: VarOrigin) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            origin,
            secret: false,
        }
    }

    pub fn secret(name: impl Into<String>, value: impl Into<String>, origin: VarOrigin) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            origin,
            secret: true,
        }
    }
}

/// An ordered collection of variables with precedence-aware resolution.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    vars: Vec<Variable>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, var: Variable) {
        self.vars.push(var);
    }

    pub fn extend(&mut self, vars: impl IntoIterator<Item = Variable>) {
        self.vars.extend(vars);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    /// Resolve a name to its highest-precedence value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .filter(|v| v.name == name)
            .max_by_key(|v| v.origin)
            .map(|v| v.value.as_str())
    }

    /// Collapse into a name → value map, honouring precedence.
    pub fn merged(&self) -> HashMap<String, String> {
        let mut sorted: Vec<&Variable> = self.vars.iter().collect();
        // Stable sort: later declarations of equal precedence win.
        sorted.sort_by_key(|v| v.origin);
        sorted
            .into_iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    /// Environment in `KEY=value` form for container injection.
    pub fn to_env(&self) -> Vec<String> {
        let mut entries: Vec<(String, String)> = self.merged().into_iter().collect();
        entries.sort();
        entries.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Values that must be masked in any log output.
    pub fn secret_values(&self) -> Vec<String> {
        self.vars
            .iter()
            .filter(|v| v.secret && !v.value.is_empty())
            .map(|v| v.value.clone())
            .collect()
    }
}

impl FromIterator<Variable> for VariableSet {
    fn from_iter<T: IntoIterator<Item = Variable>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap());

/// Expand `$NAME` / `${NAME}` references against an environment map.
/// Unknown names expand to the empty string, as a shell would.
pub fn expand(input: &str, env: &HashMap<String, String>) -> String {
    VAR_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            env.get(&caps[1]).cloned().unwrap_or_default()
        })
        .to_string()
}

/// Replace every secret value in `line` with the fixed placeholder.
pub fn mask(line: &str, secrets: &[String]) -> String {
    let mut out = line.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret.as_str(), SECRET_PLACEHOLDER);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_step_local_beats_everything() {
        let mut set = VariableSet::new();
        set.push(Variable::new("NAME", "system", VarOrigin::System));
        set.push(Variable::new("NAME", "declared", VarOrigin::PipelineDeclared));
        set.push(Variable::new("NAME", "deploy", VarOrigin::Deployment));
        set.push(Variable::new("NAME", "user", VarOrigin::UserSupplied));
        set.push(Variable::new("NAME", "step", VarOrigin::StepLocal));
        assert_eq!(set.get("NAME"), Some("step"));
        assert_eq!(set.merged().get("NAME").map(String::as_str), Some("step"));
    }

    #[test]
    fn precedence_user_beats_deployment_and_declared() {
        let mut set = VariableSet::new();
        set.push(Variable::new("NAME", "declared", VarOrigin::PipelineDeclared));
        set.push(Variable::new("NAME", "user", VarOrigin::UserSupplied));
        set.push(Variable::new("NAME", "deploy", VarOrigin::Deployment));
        assert_eq!(set.get("NAME"), Some("user"));
    }

    #[test]
    fn declared_default_survives_when_unset_elsewhere() {
        let mut set = VariableSet::new();
        set.push(Variable::new("VAR_WITH_DEFAULT_1", "Default 1", VarOrigin::PipelineDeclared));
        assert_eq!(set.get("VAR_WITH_DEFAULT_1"), Some("Default 1"));
    }

    #[test]
    fn to_env_is_sorted_and_formatted() {
        let mut set = VariableSet::new();
        set.push(Variable::new("B", "2", VarOrigin::System));
        set.push(Variable::new("A", "1", VarOrigin::System));
        assert_eq!(set.to_env(), vec!["A=1".to_string(), "B=2".to_string()]);
    }

    #[test]
    fn expand_both_forms() {
        let mut env = HashMap::new();
        env.insert("USER".to_string(), "svc".to_string());
        assert_eq!(expand("$USER and ${USER}", &env), "svc and svc");
        assert_eq!(expand("$MISSING!", &env), "!");
    }

    #[test]
    fn mask_replaces_all_occurrences() {
        let secrets = vec!["hunter2".to_string()];
        assert_eq!(
            mask("pass hunter2 again hunter2", &secrets),
            "pass **** again ****"
        );
    }

    #[test]
    fn empty_secret_values_are_not_masked() {
        let mut set = VariableSet::new();
        set.push(Variable::secret("EMPTY", "", VarOrigin::UserSupplied));
        assert!(set.secret_values().is_empty());
    }
}
