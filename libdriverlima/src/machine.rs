//! One Lima virtual machine.
//!
//! A [`Machine`] caches the last status `limactl list` reported for it. Only
//! a query refreshes that cache; start and stop clear it rather than guess
//! at the outcome, because Lima's transitions can still be in flight (or
//! quietly fail) when `limactl` returns. Callers poll with
//! [`Machine::status`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::classify::{InstanceState, StatusRecord};
use crate::driver::qualified_machine_name;
use crate::error::{DriverError, Result};
use crate::log::*;
use crate::manifest::ManifestStore;
use crate::remote::{command_line, RemoteShell};
use crate::runner::Limactl;

const SUDO: &str = "/usr/bin/sudo";
const SET_HOSTNAME_SCRIPT: &str = "set-hostname.sh";
const PRIMARY_IP_SCRIPT: &str = "get-primary-ip.sh";
const SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MachineStatus {
    Running,
    Stopped,
    Unknown,
    Error,
}

impl From<&InstanceState> for MachineStatus {
    fn from(state: &InstanceState) -> Self {
        match state {
            InstanceState::Running => MachineStatus::Running,
            InstanceState::Stopped => MachineStatus::Stopped,
            InstanceState::Broken => MachineStatus::Error,
            InstanceState::Other(_) => MachineStatus::Unknown,
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            MachineStatus::Running => "Running",
            MachineStatus::Stopped => "Stopped",
            MachineStatus::Unknown => "Unknown",
            MachineStatus::Error => "Error",
        };
        f.write_str(status)
    }
}

/// Operations run inside a machine rather than through `limactl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredefinedCommand {
    /// Set the machine's hostname. Takes the new name as its only parameter.
    RenameMachine,
}

impl PredefinedCommand {
    pub fn name(self) -> &'static str {
        match self {
            PredefinedCommand::RenameMachine => "rename",
        }
    }
}

impl FromStr for PredefinedCommand {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rename" => Ok(PredefinedCommand::RenameMachine),
            _ => Err(DriverError::UnsupportedCommand(s.to_string())),
        }
    }
}

impl fmt::Display for PredefinedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct Machine {
    name: String,
    cluster: String,
    limactl: Limactl,
    shell: Arc<dyn RemoteShell>,
    manifests: ManifestStore,
    lock: Arc<Mutex<()>>,
    record: Option<StatusRecord>,
    status: MachineStatus,
    error_message: Option<String>,
}

impl Machine {
    pub(crate) fn new(
        name: String,
        cluster: String,
        limactl: Limactl,
        shell: Arc<dyn RemoteShell>,
        manifests: ManifestStore,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            name,
            cluster,
            limactl,
            shell,
            manifests,
            lock,
            record: None,
            status: MachineStatus::Unknown,
            error_message: None,
        }
    }

    pub(crate) fn with_status(mut self, status: MachineStatus) -> Self {
        self.status = status;
        self
    }

    /// The machine name. The operating system hostname should match it.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn qualified_name(&self) -> String {
        qualified_machine_name(&self.name, &self.cluster)
    }

    /// Status as of the last query, without asking Lima.
    pub fn cached_status(&self) -> MachineStatus {
        self.status
    }

    pub fn cached_record(&self) -> Option<&StatusRecord> {
        self.record.as_ref()
    }

    /// Host address and port for SSH into this machine. Lima forwards SSH
    /// to localhost, so this is known only once a query has reported the
    /// port.
    pub fn ssh_address(&self) -> Option<String> {
        self.record
            .as_ref()
            .map(|record| *record.ssh_local_port())
            .filter(|port| *port != 0)
            .map(|port| format!("localhost:{port}"))
    }

    /// Ask Lima for this machine's listing and cache it.
    pub async fn query(&mut self) -> Result<StatusRecord> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        self.refresh().await?;
        self.record
            .clone()
            .ok_or_else(|| DriverError::MachineNotFound(self.qualified_name()))
    }

    /// Query Lima and return the resulting status. Query failures show up as
    /// [`MachineStatus::Error`], with details in [`Machine::error`].
    pub async fn status(&mut self) -> MachineStatus {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        self.refresh_status().await
    }

    /// The last error seen for this machine. Meaningful when the status is
    /// [`MachineStatus::Error`].
    pub async fn error(&mut self) -> Option<String> {
        if self.record.is_none() && self.error_message.is_none() {
            let lock = Arc::clone(&self.lock);
            let _guard = lock.lock().await;
            self.refresh_status().await;
        }
        self.error_message.clone()
    }

    /// Start the machine. It may not have finished booting when this
    /// returns; poll [`Machine::status`].
    pub async fn start(&mut self) -> Result<()> {
        let qualified_name = self.qualified_name();
        self.transition(&["start", &qualified_name]).await
    }

    /// Stop the machine. It may not have finished stopping when this
    /// returns.
    pub async fn stop(&mut self) -> Result<()> {
        let qualified_name = self.qualified_name();
        self.transition(&["stop", &qualified_name]).await
    }

    /// Stop the machine forcibly. Lima should report it stopped afterwards,
    /// but this does not check.
    pub async fn force_stop(&mut self) -> Result<()> {
        let qualified_name = self.qualified_name();
        self.transition(&["stop", "-f", &qualified_name]).await
    }

    /// `limactl start` and `stop` already wait for the transition, so there
    /// is nothing to wait for here.
    pub async fn wait_for_state_change(&self, timeout: Duration) {
        trace!(
            "not waiting {:?} for {}: lima transitions are synchronous",
            timeout,
            self.qualified_name()
        );
    }

    /// The machine's primary IP address, read from inside the machine.
    /// `None` unless the machine is running.
    #[tracing::instrument(skip(self), fields(machine = %self.qualified_name()))]
    pub async fn ip_address(&mut self) -> Result<Option<String>> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        if self.refresh_status().await != MachineStatus::Running {
            return Ok(None);
        }

        let qualified_name = self.qualified_name();
        let output = match self
            .limactl
            .run(&["shell", &qualified_name, PRIMARY_IP_SCRIPT])
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!("error fetching ip address: {}", e);
                self.record_error(&e);
                return Err(e);
            }
        };

        match output.raw_text() {
            Some(text) => Ok(Some(text.trim_end_matches('\n').to_string())),
            None => Err(DriverError::UnexpectedOutput {
                command: "shell".into(),
                output: format!("{output:?}"),
            }),
        }
    }

    /// Forward a machine port to a host port. Only the SSH port needs
    /// explicit forwarding with Lima.
    pub async fn forward_port(&mut self, host_port: u16, machine_port: u16) -> Result<()> {
        if machine_port == SSH_PORT {
            return self.forward_ssh_port(host_port).await;
        }

        info!("forwarding port {machine_port} is not required by the lima driver");
        Ok(())
    }

    pub async fn unforward_port(&mut self, machine_port: u16) -> Result<()> {
        info!("unforwarding port {machine_port} is not required by the lima driver");
        Ok(())
    }

    /// Forward the machine's SSH port to `host_port`. The machine must be
    /// stopped: the port is set in the manifest, then in the created
    /// instance.
    #[tracing::instrument(skip(self), fields(machine = %self.qualified_name()))]
    pub async fn forward_ssh_port(&mut self, host_port: u16) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        let status = self.refresh_status().await;
        if status != MachineStatus::Stopped {
            return Err(DriverError::State(format!(
                "can only forward ports when machine is stopped ({} is {status})",
                self.qualified_name()
            )));
        }

        let qualified_name = self.qualified_name();
        let manifest = self.manifests.path_for(&qualified_name);
        let manifest = manifest.to_string_lossy();
        let setting = format!(".ssh.localPort = {host_port}");

        self.limactl
            .run(&["edit", &manifest, "--set", &setting])
            .await
            .map_err(|e| {
                warn!("could not update port forwarding in machine file: {}", e);
                e
            })?;

        self.limactl
            .run(&["edit", &qualified_name, "--set", &setting])
            .await
            .map_err(|e| e.after("updating the machine file", "updating the lima vm"))?;

        self.invalidate();
        Ok(())
    }

    pub fn implements_command(&self, command: &str) -> bool {
        command.parse::<PredefinedCommand>().is_ok()
    }

    /// Run a predefined command inside the machine.
    #[tracing::instrument(skip(self), fields(machine = %self.qualified_name()))]
    pub async fn execute_command(&mut self, command: PredefinedCommand, params: &[&str]) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        match command {
            PredefinedCommand::RenameMachine => {
                let new_name = params.first().ok_or(DriverError::MissingParameter {
                    command: "rename",
                    parameter: "new name",
                })?;
                self.run_remote(SUDO, &[SET_HOSTNAME_SCRIPT, *new_name]).await?;
                Ok(())
            }
        }
    }

    async fn run_remote(&mut self, exec_path: &str, args: &[&str]) -> Result<String> {
        if self.ssh_address().is_none() {
            self.refresh().await?;
        }
        let address = self.ssh_address().ok_or_else(|| {
            DriverError::State(format!(
                "{} has no SSH port; is it running?",
                self.qualified_name()
            ))
        })?;

        self.shell.run(&address, &command_line(exec_path, args)).await
    }

    async fn transition(&mut self, operation: &[&str]) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock().await;

        match self.limactl.run(operation).await {
            Ok(_) => {
                self.invalidate();
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn refresh_status(&mut self) -> MachineStatus {
        if let Err(e) = self.refresh().await {
            debug!("query for {} failed: {}", self.qualified_name(), e);
        }
        self.status
    }

    async fn refresh(&mut self) -> Result<()> {
        let qualified_name = self.qualified_name();
        let output = match self
            .limactl
            .run(&["list", &qualified_name, "--format", "json"])
            .await
        {
            Ok(output) => output,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        let Some(record) = output.status_records().first().cloned() else {
            let e = DriverError::MachineNotFound(qualified_name);
            self.record_error(&e);
            return Err(e);
        };

        self.status = MachineStatus::from(record.status());
        self.error_message = match record.status() {
            InstanceState::Broken => Some(format!("lima reports {qualified_name} as broken")),
            _ => None,
        };
        self.record = Some(record);
        Ok(())
    }

    fn invalidate(&mut self) {
        self.record = None;
        self.status = MachineStatus::Unknown;
        self.error_message = None;
    }

    fn record_error(&mut self, e: &DriverError) {
        self.record = None;
        self.status = MachineStatus::Error;
        self.error_message = Some(e.to_string());
    }
}
