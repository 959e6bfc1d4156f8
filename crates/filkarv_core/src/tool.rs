//! External tool adapter
//!
//! Some formats are extracted by shelling out (7z). Presence of a tool
//! is probed once per process; a missing tool or a nonzero exit is
//! surfaced as a parse rejection, never as a fatal error.

use crate::parser::ParseError;
use crate::parser::ParseResult;
use filkarv_types::ParseRejection;
use std::ffi::OsString;
use std::path::Path;
use std::process::Output;
use std::sync::OnceLock;

pub(crate) struct ExternalTool {
    program: &'static str,
    present: OnceLock<bool>,
}

impl ExternalTool {
    pub(crate) const fn new(program: &'static str) -> Self {
        Self {
            program,
            present: OnceLock::new(),
        }
    }

    /// Probe (once) whether the tool can be spawned at all.
    pub(crate) fn available(&self) -> bool {
        *self.present.get_or_init(|| {
            duct::cmd(self.program, ["--help"])
                .stdout_null()
                .stderr_null()
                .stdin_null()
                .unchecked()
                .run()
                .is_ok()
        })
    }

    /// Reject the parse if the tool is not installed.
    pub(crate) fn require(&self) -> ParseResult<()> {
        if self.available() {
            Ok(())
        } else {
            tracing::info!("External tool {} not found, skipping", self.program);
            Err(ParseRejection::tool_missing(self.program).into())
        }
    }

    /// Run the tool with `args` in `dir`, capturing output. A nonzero
    /// exit becomes a ToolFailure rejection carrying the first stderr
    /// line.
    pub(crate) fn run(
        &self,
        args: impl IntoIterator<Item = OsString>,
        dir: &Path,
    ) -> ParseResult<Output> {
        let output = duct::cmd(self.program, args)
            .dir(dir)
            .stdout_capture()
            .stderr_capture()
            .stdin_null()
            .unchecked()
            .run()
            .map_err(ParseError::Io)?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first_line = stderr.lines().next().unwrap_or("no output");
            Err(ParseRejection::tool_failure(compact_str::format_compact!(
                "{} exited with {}: {first_line}",
                self.program,
                output.status
            ))
            .into())
        }
    }
}
