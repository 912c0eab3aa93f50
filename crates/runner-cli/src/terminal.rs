//! Terminal interaction: prompts for manual triggers, breakpoints, and
//! pipeline variables.

use async_trait::async_trait;
use std::io::{IsTerminal, Write};

use runner_core::pipeline::DeclaredVariable;
use runner_core::ui::Interactor;

/// Whether a controlling terminal is attached to both ends.
pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn read_line_blocking() -> Option<String> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .ok()
        .map(|_| line.trim_end_matches(['\n', '\r']).to_string())
}

async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(read_line_blocking)
        .await
        .ok()
        .flatten()
}

/// Interactor backed by the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalInteractor;

#[async_trait]
impl Interactor for TerminalInteractor {
    async fn confirm_manual(&self, step_name: &str) -> bool {
        print!("Step '{step_name}' has a manual trigger. Run it? [y/N] ");
        let _ = std::io::stdout().flush();
        matches!(
            read_line().await.as_deref().map(str::trim),
            Some("y") | Some("Y") | Some("yes")
        )
    }

    async fn resume_breakpoint(&self, step_name: &str, index: u32) {
        print!("Breakpoint {index} in step '{step_name}' - press Enter to resume ");
        let _ = std::io::stdout().flush();
        let _ = read_line().await;
    }
}

/// Prompt for declared pipeline variables that were not supplied. Returns
/// the entered (name, value) pairs; empty input keeps the default (or the
/// empty string when there is none).
pub fn prompt_variables(
    declared: &[DeclaredVariable],
    supplied: &std::collections::HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut entered = Vec::new();
    for var in declared {
        if supplied.contains_key(&var.name) {
            continue;
        }
        let hint = match (&var.default, var.allowed_values.is_empty()) {
            (Some(default), true) => format!(" [{default}]"),
            (Some(default), false) => {
                format!(" ({}) [{default}]", var.allowed_values.join("/"))
            }
            (None, false) => format!(" ({})", var.allowed_values.join("/")),
            (None, true) => String::new(),
        };
        print!("{}{hint}: ", var.name);
        let _ = std::io::stdout().flush();
        match read_line_blocking() {
            Some(value) if !value.is_empty() => entered.push((var.name.clone(), value)),
            _ => {}
        }
    }
    entered
}
