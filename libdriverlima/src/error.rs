//! Errors surfaced by the driver. Nothing in this crate retries; every
//! failure comes back to the immediate caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::classify::ClassifiedOutput;

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

/// A line of `limactl` output that could not be turned into a record.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("line {line}: does not strictly match either expected JSON shape. Content: {content}")]
    UnknownShape { line: usize, content: String },
    #[error("line {line}: failed to decode {kind}: {source}")]
    Decode {
        line: usize,
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl FormatError {
    /// The 1-based line number the error refers to.
    pub fn line(&self) -> usize {
        match self {
            FormatError::UnknownShape { line, .. } => *line,
            FormatError::Decode { line, .. } => *line,
        }
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("limactl not found: {0}")]
    ToolNotFound(String),
    #[error("could not run limactl: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(
        "limactl {command} failed ({status}){}",
        .output.last_error_message().map(|r| format!(": {r}")).unwrap_or_default()
    )]
    Invocation {
        command: String,
        status: String,
        /// Everything `limactl` printed before failing. Raw when the output
        /// could not be classified.
        output: Box<ClassifiedOutput>,
    },
    #[error("{invocation}; output was also unreadable: {format}")]
    InvocationAndFormat {
        invocation: Box<DriverError>,
        format: FormatError,
    },
    #[error("unreadable limactl output: {0}")]
    Format(#[from] FormatError),
    /// Output of the wrong kind: structured where raw text was expected, or
    /// the reverse. Belongs with [`DriverError::Format`]; see
    /// [`DriverError::is_format_error`].
    #[error("limactl {command} printed unexpected output: {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error("{0}")]
    State(String),
    #[error("{step} failed after {completed}: {source}")]
    PartialFailure {
        step: &'static str,
        completed: &'static str,
        #[source]
        source: Box<DriverError>,
    },
    #[error("machine {0} not found")]
    MachineNotFound(String),
    #[error("invalid {kind} name `{name}`: {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },
    #[error("no image for Kubernetes version {0}")]
    ImageNotFound(String),
    #[error("command '{0}' not implemented")]
    UnsupportedCommand(String),
    #[error("command '{command}' needs parameter `{parameter}`")]
    MissingParameter {
        command: &'static str,
        parameter: &'static str,
    },
    #[error("remote command on {address} failed: {reason}")]
    Remote { address: String, reason: String },
    #[error("{context} ({}): {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DriverError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DriverError::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Wraps `self` as the failing step of a composite operation whose
    /// earlier step already took effect.
    pub(crate) fn after(self, completed: &'static str, step: &'static str) -> Self {
        DriverError::PartialFailure {
            step,
            completed,
            source: Box::new(self),
        }
    }

    /// What `limactl` printed before it failed, classified.
    pub fn tool_output(&self) -> Option<&ClassifiedOutput> {
        match self {
            DriverError::Invocation { output, .. } => Some(output),
            DriverError::InvocationAndFormat { invocation, .. } => invocation.tool_output(),
            DriverError::PartialFailure { source, .. } => source.tool_output(),
            _ => None,
        }
    }

    /// Whether `limactl` ran but printed something the driver could not use.
    pub fn is_format_error(&self) -> bool {
        match self {
            DriverError::Format(_)
            | DriverError::UnexpectedOutput { .. }
            | DriverError::InvocationAndFormat { .. } => true,
            DriverError::PartialFailure { source, .. } => source.is_format_error(),
            _ => false,
        }
    }

    /// The reason `limactl` gave for failing, when it gave one.
    pub fn tool_reason(&self) -> Option<&str> {
        match self {
            DriverError::Invocation { output, .. } => output.last_error_message(),
            DriverError::InvocationAndFormat { invocation, .. } => invocation.tool_reason(),
            DriverError::PartialFailure { source, .. } => source.tool_reason(),
            _ => None,
        }
    }
}
