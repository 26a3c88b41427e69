//! Structured failures shared across the pipeline.

use std::fmt;

/// Non-zero exit from a collaborator subprocess, with both captured streams.
///
/// Components that treat a failing process as a classification signal (the
/// regression runner) match on this; everything else propagates it up to the
/// pipeline boundary where [`ProcessError::exit`] turns it into a clean
/// report and a process exit with the child's code.
#[derive(Debug, Clone, thiserror::Error)]
pub struct ProcessError {
    pub cmd: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` failed with {}", self.cmd.join(" "), self.code)
    }
}

impl ProcessError {
    pub fn new(cmd: Vec<String>, stdout: Vec<u8>, stderr: Vec<u8>, code: i32) -> Self {
        Self {
            cmd,
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            code,
        }
    }

    /// Report the failing command and its captured output, then exit with the
    /// child's exit code.
    pub fn exit(&self) -> ! {
        tracing::error!("{}", self.cmd.join(" "));
        for line in self.stdout.lines() {
            tracing::info!("{line}");
        }
        for line in self.stderr.lines() {
            tracing::error!("{line}");
        }
        std::process::exit(self.code)
    }
}

/// Failures local to the corpus store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Two distinct contents truncated to the same bucket path. Recoverable:
    /// the trim loop bumps the name length and restarts the whole pass.
    #[error("truncation collision at name length {name_length}")]
    TruncationCollision { name_length: usize },

    /// The name length passed its hard ceiling. With a 256-bit digest this
    /// means corrupt data or misconfiguration, never bad luck; fatal.
    #[error("name length ceiling {ceiling} exceeded; corpus state is inconsistent")]
    NameLengthExceeded { ceiling: usize },
}
