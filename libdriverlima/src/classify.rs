//! Classification of `limactl` output.
//!
//! With `--log-format=json`, `limactl` prints one of three things:
//!
//! - a stream of JSON log lines while an operation is in flight,
//! - JSON instance listings (one object per line) for `list --format json`,
//! - free-form text, e.g. the output of a script run through `limactl shell`.
//!
//! [`classify`] tells these apart by the shape of each line alone, without
//! knowing which command produced the output.

use std::fmt;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FormatError;

/// Severity of a [`LogEvent`], as printed by `limactl`'s logger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Panic,
    Other(String),
}

impl LogLevel {
    /// True for the levels whose message explains why an invocation failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Fatal)
    }

    pub fn as_str(&self) -> &str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Panic => "panic",
            LogLevel::Other(level) => level,
        }
    }
}

impl From<String> for LogLevel {
    fn from(level: String) -> Self {
        match level.as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "fatal" => LogLevel::Fatal,
            "panic" => LogLevel::Panic,
            _ => LogLevel::Other(level),
        }
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One JSON log line.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    level: LogLevel,
    #[serde(rename = "msg")]
    message: String,
    #[serde(rename = "time")]
    timestamp: String,
}

impl LogEvent {
    pub fn new<S: Into<String>>(level: LogLevel, message: S, timestamp: S) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: timestamp.into(),
        }
    }
}

/// Instance state as reported by `limactl list`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    Running,
    Stopped,
    Broken,
    Other(String),
}

impl From<String> for InstanceState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "Running" => InstanceState::Running,
            "Stopped" => InstanceState::Stopped,
            "Broken" => InstanceState::Broken,
            _ => InstanceState::Other(state),
        }
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        match state {
            InstanceState::Running => "Running".into(),
            InstanceState::Stopped => "Stopped".into(),
            InstanceState::Broken => "Broken".into(),
            InstanceState::Other(state) => state,
        }
    }
}

/// One instance listing from `limactl list --format json`.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    name: String,
    hostname: String,
    status: InstanceState,
    #[serde(rename = "dir")]
    directory: String,
    #[serde(rename = "sshLocalPort", default)]
    ssh_local_port: u16,
    #[serde(rename = "sshConfigFile")]
    ssh_config_file: String,
}

/// Records collected from output that contained structured lines.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Default)]
pub struct Structured {
    log_events: Vec<LogEvent>,
    status_records: Vec<StatusRecord>,
    /// Unparseable lines seen after the first structured line, each
    /// terminated by a newline.
    remainder: String,
}

/// Everything one `limactl` invocation printed, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedOutput {
    /// The output was not structured; this is the whole of it, verbatim.
    Raw(String),
    Structured(Structured),
}

impl ClassifiedOutput {
    pub fn is_raw(&self) -> bool {
        matches!(self, ClassifiedOutput::Raw(_))
    }

    pub fn raw_text(&self) -> Option<&str> {
        match self {
            ClassifiedOutput::Raw(text) => Some(text),
            ClassifiedOutput::Structured(_) => None,
        }
    }

    pub fn log_events(&self) -> &[LogEvent] {
        match self {
            ClassifiedOutput::Raw(_) => &[],
            ClassifiedOutput::Structured(structured) => &structured.log_events,
        }
    }

    pub fn status_records(&self) -> &[StatusRecord] {
        match self {
            ClassifiedOutput::Raw(_) => &[],
            ClassifiedOutput::Structured(structured) => &structured.status_records,
        }
    }

    pub fn remainder(&self) -> &str {
        match self {
            ClassifiedOutput::Raw(_) => "",
            ClassifiedOutput::Structured(structured) => &structured.remainder,
        }
    }

    /// The message of the final log event, if that event is an error or
    /// fatal one. This is how `limactl` says why it failed.
    pub fn last_error_message(&self) -> Option<&str> {
        self.log_events()
            .last()
            .filter(|event| event.level.is_failure())
            .map(|event| event.message.as_str())
    }
}

/// The structured line shapes, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    LogEvent,
    StatusRecord,
}

impl Shape {
    const ALL: [Shape; 2] = [Shape::LogEvent, Shape::StatusRecord];

    fn required_keys(self) -> &'static [&'static str] {
        match self {
            Shape::LogEvent => &["level", "msg", "time"],
            Shape::StatusRecord => &["name", "hostname", "status", "dir", "sshConfigFile"],
        }
    }

    fn matches(self, object: &Map<String, Value>) -> bool {
        self.required_keys()
            .iter()
            .all(|key| object.contains_key(*key))
    }

    /// The single shape `object` has. Objects with no shape, or with more
    /// than one, are rejected.
    fn of(object: &Map<String, Value>) -> Option<Shape> {
        let mut shapes = Shape::ALL.into_iter().filter(|shape| shape.matches(object));
        match (shapes.next(), shapes.next()) {
            (Some(shape), None) => Some(shape),
            _ => None,
        }
    }
}

/// Accumulator threaded through the line scan.
#[derive(Debug, Default)]
struct Scan {
    seen_structured: bool,
    collected: Structured,
}

enum Step {
    Continue(Scan),
    /// Unstructured output; the whole input is the result.
    Raw,
}

impl Scan {
    fn feed(mut self, line_number: usize, line: &str) -> Result<Step, FormatError> {
        let object = match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(object) => object,
            Err(_) if !self.seen_structured => return Ok(Step::Raw),
            Err(_) => {
                self.collected.remainder.push_str(line);
                self.collected.remainder.push('\n');
                return Ok(Step::Continue(self));
            }
        };

        let Some(shape) = Shape::of(&object) else {
            return Err(FormatError::UnknownShape {
                line: line_number,
                content: line.to_string(),
            });
        };

        let object = Value::Object(object);
        match shape {
            Shape::LogEvent => {
                let event = serde_json::from_value(object).map_err(|source| FormatError::Decode {
                    line: line_number,
                    kind: "log event",
                    source,
                })?;
                self.collected.log_events.push(event);
            }
            Shape::StatusRecord => {
                let record =
                    serde_json::from_value(object).map_err(|source| FormatError::Decode {
                        line: line_number,
                        kind: "status record",
                        source,
                    })?;
                self.collected.status_records.push(record);
            }
        }
        self.seen_structured = true;

        Ok(Step::Continue(self))
    }
}

/// Classify the complete output of one `limactl` invocation.
///
/// If the first non-blank line is not a JSON object, the whole input is
/// returned as [`ClassifiedOutput::Raw`]. Otherwise every JSON line must be
/// exactly one of the known shapes, and any non-JSON lines that follow are
/// kept in the remainder.
pub fn classify(input: &str) -> Result<ClassifiedOutput, FormatError> {
    let mut scan = Scan::default();
    for (index, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        scan = match scan.feed(index + 1, line)? {
            Step::Continue(scan) => scan,
            Step::Raw => return Ok(ClassifiedOutput::Raw(input.to_string())),
        };
    }

    Ok(ClassifiedOutput::Structured(scan.collected))
}
