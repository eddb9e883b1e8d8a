//! Commands run inside a machine over SSH.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SshCredentials;
use crate::error::{DriverError, Result};
use crate::log::*;

/// Build the command line for an executable and its arguments. Each word is
/// quoted for the remote shell.
pub fn command_line(exec_path: &str, args: &[&str]) -> String {
    shell_words::join(std::iter::once(exec_path).chain(args.iter().copied()))
}

/// Runs one command line on a remote host and returns its output. Every
/// call runs to completion before returning.
#[async_trait]
pub trait RemoteShell: std::fmt::Debug + Send + Sync {
    async fn run(&self, address: &str, command_line: &str) -> Result<String>;
}

/// Password-authenticated SSH.
#[derive(Debug, Clone)]
pub struct SshShell {
    credentials: SshCredentials,
    config: Arc<thrussh::client::Config>,
}

impl SshShell {
    pub fn new(credentials: SshCredentials) -> Self {
        Self {
            credentials,
            config: Arc::new(thrussh::client::Config::default()),
        }
    }
}

fn remote_error<E: std::fmt::Display>(address: &str) -> impl FnOnce(E) -> DriverError + '_ {
    move |e| DriverError::Remote {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    #[tracing::instrument(skip(self))]
    async fn run(&self, address: &str, command_line: &str) -> Result<String> {
        debug!("connecting to {}", address);
        let mut session = thrussh::client::connect(self.config.clone(), address, SshClient)
            .await
            .map_err(remote_error(address))?;

        let authenticated = session
            .authenticate_password(
                self.credentials.username().clone(),
                self.credentials.password().clone(),
            )
            .await
            .map_err(remote_error(address))?;
        if !authenticated {
            return Err(DriverError::Remote {
                address: address.to_string(),
                reason: format!(
                    "authentication as {} rejected",
                    self.credentials.username()
                ),
            });
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(remote_error(address))?;
        channel
            .exec(true, command_line.to_string())
            .await
            .map_err(remote_error(address))?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(frame) = channel.wait().await {
            match frame {
                thrussh::ChannelMsg::Data { data } => output.extend_from_slice(&data[..]),
                thrussh::ChannelMsg::ExtendedData { data, ext: _ } => {
                    output.extend_from_slice(&data[..])
                }
                thrussh::ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = Some(status)
                }
                thrussh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        match exit_status {
            Some(0) | None => Ok(output),
            Some(status) => Err(DriverError::Remote {
                address: address.to_string(),
                reason: format!("exited with status {status}: {}", output.trim_end()),
            }),
        }
    }
}

struct SshClient;

impl thrussh::client::Handler for SshClient {
    type Error = color_eyre::eyre::Report;
    type FutureUnit = futures::future::Ready<Result<(Self, thrussh::client::Session), Self::Error>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: thrussh::client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    // Machines are reached on localhost through Lima's port forward, and
    // their host keys are regenerated with every machine.
    fn check_server_key(
        self,
        _server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        self.finished_bool(true)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Records remote commands and answers them from a queue.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingShell {
        responses: Mutex<VecDeque<Result<String>>>,
        commands: Mutex<Vec<(String, String)>>,
    }

    impl RecordingShell {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn respond(&self, response: Result<String>) -> &Self {
            self.responses.lock().unwrap().push_back(response);
            self
        }

        /// `(address, command line)` pairs, in call order.
        pub(crate) fn commands(&self) -> Vec<(String, String)> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteShell for RecordingShell {
        async fn run(&self, address: &str, command_line: &str) -> Result<String> {
            self.commands
                .lock()
                .unwrap()
                .push((address.to_string(), command_line.to_string()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }
}
