//! Running `limactl`.
//!
//! [`Limactl`] builds the argument list and interprets what comes back;
//! actually starting the process sits behind [`ToolInvoker`], so callers can
//! wrap invocations in timeouts or swap in something else entirely.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use derive_getters::Getters;

use crate::classify::{classify, ClassifiedOutput};
use crate::config::Verbosity;
use crate::error::{DriverError, Result};
use crate::log::*;

/// Text captured from one invocation, stdout and stderr interleaved in
/// whatever order they arrived.
#[derive(Getters, Debug, Clone, PartialEq, Eq)]
pub struct RawInvocation {
    text: String,
    success: bool,
    status: String,
}

impl RawInvocation {
    pub fn new<S: Into<String>>(text: S, success: bool, status: S) -> Self {
        Self {
            text: text.into(),
            success,
            status: status.into(),
        }
    }
}

/// Starts a program and waits for it to exit. Every call runs to completion
/// before returning.
#[async_trait]
pub trait ToolInvoker: std::fmt::Debug + Send + Sync {
    async fn invoke(&self, program: &Path, args: &[String]) -> Result<RawInvocation>;
}

/// Runs the program as a local subprocess.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker;

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    #[tracing::instrument(skip(self))]
    async fn invoke(&self, program: &Path, args: &[String]) -> Result<RawInvocation> {
        use tokio::process::Command;
        use tokio_stream::StreamExt;
        use tokio_util::codec::{BytesCodec, FramedRead};

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DriverError::Spawn)?;

        let stdout = child.stdout.take().ok_or_else(|| not_captured("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| not_captured("stderr"))?;
        let mut stdout = FramedRead::new(stdout, BytesCodec::new());
        let mut stderr = FramedRead::new(stderr, BytesCodec::new());

        let mut captured = Vec::new();
        loop {
            tokio::select! {
                Some(next) = stdout.next() => {
                    captured.extend_from_slice(&next.map_err(DriverError::Spawn)?);
                }
                Some(next) = stderr.next() => {
                    captured.extend_from_slice(&next.map_err(DriverError::Spawn)?);
                }
                else => {
                    break;
                }
            }
        }

        let status = child.wait().await.map_err(DriverError::Spawn)?;
        trace!("{} exited with {}", program.display(), status);

        Ok(RawInvocation {
            text: String::from_utf8_lossy(&captured).into_owned(),
            success: status.success(),
            status: status.to_string(),
        })
    }
}

fn not_captured(stream: &str) -> DriverError {
    DriverError::Spawn(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{stream} was not captured"),
    ))
}

/// A located `limactl` executable.
#[derive(Debug, Clone)]
pub struct Limactl {
    path: PathBuf,
    verbosity: Verbosity,
    invoker: Arc<dyn ToolInvoker>,
}

impl Limactl {
    pub fn new<P: Into<PathBuf>>(path: P, verbosity: Verbosity, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            path: path.into(),
            verbosity,
            invoker,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The full argument list for an operation: non-interactive, JSON logs,
    /// log level from the configured verbosity.
    pub fn args_for(&self, operation: &[&str]) -> Vec<String> {
        let mut args = vec![
            "--tty=false".to_string(),
            "--log-format=json".to_string(),
            "--log-level".to_string(),
            self.verbosity.limactl_level().to_string(),
        ];
        args.extend(operation.iter().map(|arg| arg.to_string()));
        args
    }

    /// Run an operation and classify its output.
    ///
    /// The output is classified whether or not `limactl` succeeded. A failed
    /// invocation carries the classified output, and the last error log
    /// message is its reason; if the output could not be classified either,
    /// both problems are reported and the output is kept as raw text.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, operation: &[&str]) -> Result<ClassifiedOutput> {
        let args = self.args_for(operation);
        debug!("running {} {}", self.path.display(), args.join(" "));

        let raw = self.invoker.invoke(&self.path, &args).await?;
        let classified = classify(&raw.text);
        let command = operation.first().copied().unwrap_or_default().to_string();

        match (raw.success, classified) {
            (true, Ok(output)) => Ok(output),
            (true, Err(format)) => Err(format.into()),
            (false, Ok(output)) => Err(DriverError::Invocation {
                command,
                status: raw.status,
                output: Box::new(output),
            }),
            (false, Err(format)) => Err(DriverError::InvocationAndFormat {
                invocation: Box::new(DriverError::Invocation {
                    command,
                    status: raw.status,
                    output: Box::new(ClassifiedOutput::Raw(raw.text)),
                }),
                format,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Plays back canned `limactl` output and records what was asked of it.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedInvoker {
        responses: Mutex<VecDeque<Result<RawInvocation>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedInvoker {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn succeed(&self, text: &str) -> &Self {
            self.push(Ok(RawInvocation::new(text, true, "exit status: 0")))
        }

        pub(crate) fn fail(&self, text: &str) -> &Self {
            self.push(Ok(RawInvocation::new(text, false, "exit status: 1")))
        }

        pub(crate) fn fail_to_spawn(&self) -> &Self {
            self.push(Err(DriverError::Spawn(std::io::ErrorKind::NotFound.into())))
        }

        fn push(&self, response: Result<RawInvocation>) -> &Self {
            self.responses.lock().unwrap().push_back(response);
            self
        }

        /// Every invocation's arguments, with the fixed prefix stripped.
        pub(crate) fn operations(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|args| args[4..].to_vec())
                .collect()
        }

        pub(crate) fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(&self, _program: &Path, args: &[String]) -> Result<RawInvocation> {
            self.calls.lock().unwrap().push(args.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RawInvocation::new("", true, "exit status: 0")))
        }
    }
}

#[cfg(test)]
mod test {
    use super::testing::ScriptedInvoker;
    use super::*;

    const FATAL: &str = r#"{"level":"fatal","msg":"instance \"c1-m1\" already exists","time":"2024-05-01T10:00:00Z"}"#;

    fn limactl(invoker: Arc<ScriptedInvoker>, verbosity: Verbosity) -> Limactl {
        Limactl::new("/usr/local/bin/limactl", verbosity, invoker)
    }

    #[tokio::test]
    async fn test_fixed_prefix_precedes_operation() -> Result<()> {
        let invoker = ScriptedInvoker::new();
        limactl(invoker.clone(), Verbosity::Debug)
            .run(&["list", "c1-m1", "--format", "json"])
            .await?;

        assert_eq!(
            vec![vec![
                "--tty=false",
                "--log-format=json",
                "--log-level",
                "debug",
                "list",
                "c1-m1",
                "--format",
                "json",
            ]],
            invoker.calls()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_verbosity_selects_log_level() -> Result<()> {
        let invoker = ScriptedInvoker::new();
        limactl(invoker.clone(), Verbosity::Verbose).run(&["stop", "c1-m1"]).await?;
        limactl(invoker.clone(), Verbosity::Minimal).run(&["stop", "c1-m1"]).await?;

        let levels: Vec<String> = invoker.calls().into_iter().map(|c| c[3].clone()).collect();
        assert_eq!(vec!["trace", "warn"], levels);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_carries_last_error_message() {
        let invoker = ScriptedInvoker::new();
        invoker.fail(&format!("{FATAL}\n"));

        let err = limactl(invoker, Verbosity::Info)
            .run(&["create", "--name=c1-m1", "/tmp/c1-m1.yaml"])
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Invocation { ref command, .. } if command == "create"));
        assert_eq!(Some("instance \"c1-m1\" already exists"), err.tool_reason());
        assert!(err.to_string().ends_with(": instance \"c1-m1\" already exists"));
    }

    #[tokio::test]
    async fn test_failure_keeps_everything_printed() {
        let invoker = ScriptedInvoker::new();
        invoker.fail(&format!(
            "{}\nnoise\n{}\n",
            r#"{"level":"info","msg":"starting the instance","time":"2024-05-01T10:00:00Z"}"#,
            r#"{"level":"fatal","msg":"boom","time":"2024-05-01T10:00:01Z"}"#,
        ));

        let err = limactl(invoker, Verbosity::Info).run(&["start", "c1-m1"]).await.unwrap_err();

        assert_eq!(Some("boom"), err.tool_reason());
        let output = err.tool_output().expect("failed run keeps its output");
        let messages: Vec<&str> = output.log_events().iter().map(|e| e.message().as_str()).collect();
        assert_eq!(vec!["starting the instance", "boom"], messages);
        assert_eq!("noise\n", output.remainder());
    }

    #[tokio::test]
    async fn test_failure_with_unreadable_output_reports_both() {
        let invoker = ScriptedInvoker::new();
        invoker.fail("{\"unexpected\":true}\n");

        let err = limactl(invoker, Verbosity::Info).run(&["start", "c1-m1"]).await.unwrap_err();
        match err {
            DriverError::InvocationAndFormat { invocation, format } => {
                assert!(matches!(*invocation, DriverError::Invocation { .. }));
                assert_eq!(
                    Some("{\"unexpected\":true}\n"),
                    invocation.tool_output().and_then(ClassifiedOutput::raw_text)
                );
                assert_eq!(1, format.line());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_success_with_unreadable_output_is_format_error() {
        let invoker = ScriptedInvoker::new();
        invoker.succeed("{\"unexpected\":true}\n");

        let err = limactl(invoker, Verbosity::Info).run(&["start", "c1-m1"]).await.unwrap_err();
        assert!(matches!(err, DriverError::Format(_)));
        assert!(err.is_format_error());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_surfaced() {
        let invoker = ScriptedInvoker::new();
        invoker.fail_to_spawn();

        let err = limactl(invoker, Verbosity::Info).run(&["list"]).await.unwrap_err();
        assert!(matches!(err, DriverError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_captures_both_streams() -> Result<()> {
        let raw = ProcessInvoker
            .invoke(
                Path::new("sh"),
                &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            )
            .await?;

        assert!(!raw.success());
        assert!(raw.text().contains("out\n"));
        assert!(raw.text().contains("err\n"));
        Ok(())
    }
}
