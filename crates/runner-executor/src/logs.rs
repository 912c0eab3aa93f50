//! Output demultiplexing and per-step log files.
//!
//! One reader task per step consumes the container's multiplexed
//! stdout/stderr stream, splits it into lines, and feeds each line through
//! the [`LogRouter`]: every line lands in `container.log`, non-control
//! lines land in `script.log` or `after-script.log` depending on the
//! current phase, and secrets are masked before anything reaches a file or
//! the terminal.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use runner_core::Result;
use runner_core::variable::mask;

use crate::script::ControlLine;

/// Which log file a non-control line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Script,
    AfterScript,
}

/// What the step executor should do with a handled line.
#[derive(Debug, Default)]
pub struct Disposition {
    /// Masked line to surface to the terminal, when any.
    pub display: Option<String>,
    /// A breakpoint pause was announced.
    pub breakpoint: Option<u32>,
}

/// Accumulates raw stream chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the complete lines it closed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).to_string());
        }
        lines
    }

    /// Drain any trailing unterminated line.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).to_string();
        self.buf.clear();
        Some(line)
    }
}

/// Routes container output into the step's log files.
pub struct LogRouter {
    container: BufWriter<File>,
    script: BufWriter<File>,
    after: BufWriter<File>,
    phase: Phase,
    secrets: Vec<String>,
    after_exit: Option<i64>,
}

impl LogRouter {
    /// Open `container.log`, `script.log`, and `after-script.log` under the
    /// step directory.
    pub fn new(step_dir: &Path, secrets: Vec<String>) -> Result<Self> {
        std::fs::create_dir_all(step_dir)?;
        let open = |name: &str| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(step_dir.join(name))?))
        };
        Ok(Self {
            container: open("container.log")?,
            script: open("script.log")?,
            after: open("after-script.log")?,
            phase: Phase::Script,
            secrets,
            after_exit: None,
        })
    }

    /// Handle one line of container output.
    pub fn handle_line(&mut self, line: &str) -> Disposition {
        let masked = mask(line, &self.secrets);
        let _ = writeln!(self.container, "{masked}");

        if let Some(control) = ControlLine::parse(line) {
            match control {
                ControlLine::AfterScriptStart => {
                    self.phase = Phase::AfterScript;
                    Disposition::default()
                }
                ControlLine::AfterScriptExit(code) => {
                    self.after_exit = Some(code);
                    Disposition::default()
                }
                ControlLine::Breakpoint(index) => Disposition {
                    display: None,
                    breakpoint: Some(index),
                },
            }
        } else {
            let target = match self.phase {
                Phase::Script => &mut self.script,
                Phase::AfterScript => &mut self.after,
            };
            let _ = writeln!(target, "{masked}");
            Disposition {
                display: Some(masked),
                breakpoint: None,
            }
        }
    }

    /// Exit code the after-script phase reported, when it ran.
    pub fn after_exit(&self) -> Option<i64> {
        self.after_exit
    }

    /// Flush all sinks.
    pub fn finish(&mut self) {
        let _ = self.container.flush();
        let _ = self.script.flush();
        let _ = self.after.flush();
    }
}
