use std::path::PathBuf;
use std::time::Duration;

/// Why a run entered the Fail terminal condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// A required pattern matched no captured line.
    NoMatch { patterns: Vec<String> },
    /// The monitor deadline passed before any success pattern matched.
    Timeout {
        patterns: Vec<String>,
        timeout: Duration,
    },
    /// The launcher had no child process to crash.
    NoChild { pid: u32 },
    /// Every recovery attempt of a retried scenario came back without the marker.
    RetriesExhausted { scenario: String, attempts: u32 },
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::NoMatch { patterns } => write!(f, "match failed {patterns:?}"),
            FailReason::Timeout { patterns, timeout } => write!(
                f,
                "match failed {patterns:?} (no match within {}s)",
                timeout.as_secs()
            ),
            FailReason::NoChild { pid } => {
                write!(f, "launcher pid {pid} has no child process to crash")
            }
            FailReason::RetriesExhausted { scenario, attempts } => {
                write!(f, "{scenario} did not recover in {attempts} attempts")
            }
        }
    }
}

/// Errors that abort a harness run.
#[derive(Debug)]
pub enum HarnessError {
    /// Failed to spawn the launcher (or one of its pipes).
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// I/O on the control or output channel failed.
    Io {
        context: &'static str,
        source: std::io::Error,
    },
    /// HardFail: diagnostics have already been written and the session stopped.
    Fail { reason: FailReason },
    /// Delivering a signal to a process failed.
    Signal { pid: i32, source: nix::Error },
    /// Listing the children of a process failed.
    ProcessTable { source: std::io::Error },
    /// The configuration file could not be read or validated.
    Config { path: PathBuf, message: String },
    /// A line pattern did not compile.
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Spawn { command, source } => {
                write!(f, "failed to spawn launcher `{command}`: {source}")
            }
            HarnessError::Io { context, source } => write!(f, "I/O error {context}: {source}"),
            HarnessError::Fail { reason } => write!(f, "FAIL: {reason}"),
            HarnessError::Signal { pid, source } => {
                write!(f, "failed to signal pid {pid}: {source}")
            }
            HarnessError::ProcessTable { source } => {
                write!(f, "failed to query process table: {source}")
            }
            HarnessError::Config { path, message } => {
                write!(f, "invalid config {}: {message}", path.display())
            }
            HarnessError::Pattern { pattern, source } => {
                write!(f, "invalid pattern {pattern:?}: {source}")
            }
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Spawn { source, .. } => Some(source),
            HarnessError::Io { source, .. } => Some(source),
            HarnessError::Signal { source, .. } => Some(source),
            HarnessError::ProcessTable { source } => Some(source),
            HarnessError::Pattern { source, .. } => Some(source),
            HarnessError::Fail { .. } | HarnessError::Config { .. } => None,
        }
    }
}

impl HarnessError {
    /// True for the HardFail terminal condition (as opposed to a harness malfunction).
    pub fn is_fail(&self) -> bool {
        matches!(self, HarnessError::Fail { .. })
    }
}
