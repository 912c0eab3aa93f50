//! Generation of the in-container shell program.
//!
//! The program is written into the agent directory on the host, which is
//! bind-mounted read-only into the container, and executed as the
//! container's command. It echoes each command with a `+ ` prefix, checks
//! each line's exit code and propagates the first failing one, and runs the
//! after-script with `BITBUCKET_EXIT_CODE` set regardless of the script's
//! outcome.
//!
//! Control lines for the host-side log router are prefixed with an ASCII
//! group separator so user output cannot collide with them accidentally.

use runner_core::context::AGENT_TMP_DIR;

/// File name of the generated program inside the agent directory.
pub const BUILD_SCRIPT_FILE: &str = "build_script.sh";

/// A script line whose trimmed form equals this marker suspends execution
/// when a terminal is attached.
pub const BREAKPOINT_MARKER: &str = "# pipeline-runner[breakpoint]";

/// Prefix of control lines emitted by the generated program.
pub const CONTROL_PREFIX: &str = "\u{1d}pipeline-runner:";

/// Control line opening the after-script phase.
pub const AFTER_SCRIPT_MARKER: &str = "after-script";
/// Control line reporting the after-script's exit code.
pub const AFTER_SCRIPT_EXIT_MARKER: &str = "after-script-exit";
/// Control line announcing a breakpoint pause.
pub const BREAKPOINT_HIT_MARKER: &str = "breakpoint";

// Octal escape for the control prefix, understood by POSIX printf.
const CONTROL_PRINTF: &str = r"\035pipeline-runner:";

/// Command the step container is started with.
pub fn container_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        format!("{AGENT_TMP_DIR}/{BUILD_SCRIPT_FILE}"),
    ]
}

/// Host-side file whose creation resumes a paused breakpoint.
pub fn resume_file_name(index: u32) -> String {
    format!("resume-{index}")
}

/// Generate the shell program for a step.
///
/// `setup` lines run before the user script without being echoed (ssh
/// configuration installation and the like). Breakpoint markers become pause
/// loops only when `interactive` is set; otherwise they stay comments.
pub fn generate(
    script: &[String],
    after_script: &[String],
    setup: &[String],
    interactive: bool,
) -> String {
    let mut program = String::from("#!/bin/sh\n");

    for line in setup {
        program.push_str(line);
        program.push('\n');
    }

    program.push_str("main() {\n");
    push_phase_lines(&mut program, script, interactive);
    program.push_str("return 0\n");
    program.push_str("}\n");

    if !after_script.is_empty() {
        program.push_str("after_main() {\n");
        push_phase_lines(&mut program, after_script, false);
        program.push_str("return 0\n");
        program.push_str("}\n");
    }

    // The user script runs in a subshell so an `exit` inside it cannot skip
    // the after-script phase.
    program.push_str("( main )\n");
    program.push_str("__build_exit=$?\n");

    if !after_script.is_empty() {
        program.push_str(&format!(
            "printf '{CONTROL_PRINTF}{AFTER_SCRIPT_MARKER}\\n'\n"
        ));
        program.push_str("BITBUCKET_EXIT_CODE=$__build_exit\n");
        program.push_str("export BITBUCKET_EXIT_CODE\n");
        program.push_str("( after_main )\n");
        program.push_str(&format!(
            "printf '{CONTROL_PRINTF}{AFTER_SCRIPT_EXIT_MARKER} %d\\n' $?\n"
        ));
    }

    program.push_str("exit $__build_exit\n");
    program
}

fn push_phase_lines(program: &mut String, lines: &[String], interactive: bool) {
    let mut breakpoint = 0u32;
    for line in lines {
        if line.trim() == BREAKPOINT_MARKER {
            if interactive {
                program.push_str(&format!(
                    "printf '{CONTROL_PRINTF}{BREAKPOINT_HIT_MARKER} %d\\n' {breakpoint}\n"
                ));
                program.push_str(&format!(
                    "while [ ! -e '{AGENT_TMP_DIR}/{}' ]; do sleep 1; done\n",
                    resume_file_name(breakpoint)
                ));
                breakpoint += 1;
            }
            continue;
        }
        program.push_str(&format!("printf '+ %s\\n' {}\n", single_quote(line)));
        program.push_str(line);
        program.push('\n');
        program.push_str("__rc=$?; if [ $__rc -ne 0 ]; then return $__rc; fi\n");
    }
}

/// Quote a string for safe inclusion in a shell word.
fn single_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Parse a control line emitted by the generated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    AfterScriptStart,
    AfterScriptExit(i64),
    Breakpoint(u32),
}

impl ControlLine {
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(CONTROL_PREFIX)?;
        if rest == AFTER_SCRIPT_MARKER {
            return Some(ControlLine::AfterScriptStart);
        }
        if let Some(code) = rest.strip_prefix(AFTER_SCRIPT_EXIT_MARKER) {
            return code.trim().parse().ok().map(ControlLine::AfterScriptExit);
        }
        if let Some(index) = rest.strip_prefix(BREAKPOINT_HIT_MARKER) {
            return index.trim().parse().ok().map(ControlLine::Breakpoint);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn echoes_each_command_with_prefix() {
        let program = generate(&lines(&["cat /etc/os-release", "id"]), &[], &[], false);
        assert!(program.contains("printf '+ %s\\n' 'cat /etc/os-release'"));
        assert!(program.contains("printf '+ %s\\n' 'id'"));
        assert!(program.contains("\ncat /etc/os-release\n"));
        assert!(program.contains("\nid\n"));
    }

    #[test]
    fn propagates_first_failing_exit_code() {
        let program = generate(&lines(&["false", "echo unreachable"]), &[], &[], false);
        assert!(program.contains("__rc=$?; if [ $__rc -ne 0 ]; then return $__rc; fi"));
        assert!(program.contains("( main )\n__build_exit=$?"));
        assert!(program.trim_end().ends_with("exit $__build_exit"));
    }

    #[test]
    fn after_script_gets_exit_code_env() {
        let program = generate(
            &lines(&["exit 2"]),
            &lines(&["echo \"Exit Code was ${BITBUCKET_EXIT_CODE}\""]),
            &[],
            false,
        );
        assert!(program.contains("BITBUCKET_EXIT_CODE=$__build_exit"));
        assert!(program.contains("export BITBUCKET_EXIT_CODE"));
        assert!(program.contains("after_main() {"));
        // The step's exit code is the script's, not the after-script's.
        assert!(program.trim_end().ends_with("exit $__build_exit"));
    }

    #[test]
    fn no_after_script_means_no_after_phase() {
        let program = generate(&lines(&["true"]), &[], &[], false);
        assert!(!program.contains("after_main"));
        assert!(!program.contains(AFTER_SCRIPT_MARKER));
    }

    #[test]
    fn breakpoints_are_noops_without_terminal() {
        let program = generate(
            &lines(&["echo a", "  # pipeline-runner[breakpoint]  ", "echo b"]),
            &[],
            &[],
            false,
        );
        assert!(!program.contains("resume-0"));
        assert!(!program.contains("breakpoint"));
        assert!(program.contains("echo a"));
        assert!(program.contains("echo b"));
    }

    #[test]
    fn breakpoints_pause_with_terminal() {
        let program = generate(
            &lines(&["echo a", "# pipeline-runner[breakpoint]", "echo b"]),
            &[],
            &[],
            true,
        );
        assert!(program.contains("resume-0"));
        assert!(program.contains("while [ ! -e"));
    }

    #[test]
    fn single_quotes_are_escaped() {
        let program = generate(&lines(&["echo 'it''s'"]), &[], &[], false);
        assert!(program.contains(r"'echo '\''it'\'''\''s'\'''"));
    }

    #[test]
    fn setup_lines_are_not_echoed() {
        let program = generate(
            &lines(&["true"]),
            &[],
            &lines(&["mkdir -p \"$HOME/.ssh\""]),
            false,
        );
        assert!(program.contains("mkdir -p \"$HOME/.ssh\"\n"));
        assert!(!program.contains("printf '+ %s\\n' 'mkdir"));
    }

    #[test]
    fn control_lines_round_trip() {
        assert_eq!(
            ControlLine::parse("\u{1d}pipeline-runner:after-script"),
            Some(ControlLine::AfterScriptStart)
        );
        assert_eq!(
            ControlLine::parse("\u{1d}pipeline-runner:after-script-exit 3"),
            Some(ControlLine::AfterScriptExit(3))
        );
        assert_eq!(
            ControlLine::parse("\u{1d}pipeline-runner:breakpoint 1"),
            Some(ControlLine::Breakpoint(1))
        );
        assert_eq!(ControlLine::parse("plain output"), None);
    }
}
