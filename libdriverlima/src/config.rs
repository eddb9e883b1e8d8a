use std::fmt;
use std::path::PathBuf;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Name of the driver's configuration file in the user's kutti directory.
pub const CONFIG_FILE: &str = "driverlima.yaml";

/// How chatty the driver and `limactl` should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Error,
    Minimal,
    Info,
    Verbose,
    Debug,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Info
    }
}

impl Verbosity {
    /// Map `-q`/`-v` style flags onto a verbosity. `-v` wins over `-q`.
    pub fn from_flags(quiet: bool, verbose: usize) -> Self {
        match (quiet, verbose) {
            (true, 0) => Verbosity::Error,
            (false, 0) => Verbosity::Minimal,
            (_, 1) => Verbosity::Info,
            (_, 2) => Verbosity::Verbose,
            _ => Verbosity::Debug,
        }
    }

    /// The value passed to `limactl --log-level`.
    pub fn limactl_level(self) -> &'static str {
        match self {
            Verbosity::Error => "error",
            Verbosity::Minimal => "warn",
            Verbosity::Info => "info",
            Verbosity::Verbose => "trace",
            Verbosity::Debug => "debug",
        }
    }
}

/// Login used for commands run inside a machine over SSH. The image ships
/// with this account; it is never compiled into the driver.
#[derive(Getters, Clone, Serialize, Deserialize)]
pub struct SshCredentials {
    username: String,
    #[serde(default)]
    password: String,
}

impl SshCredentials {
    pub fn new<S: Into<String>>(username: S, password: S) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = password.into();
        self
    }

    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the driver needs from its host.
#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Explicit location of `limactl`. Looked up on `PATH` when unset.
    #[serde(default)]
    limactl_path: Option<PathBuf>,
    /// Where per-machine manifests are written. Defaults to the user cache
    /// directory.
    #[serde(default)]
    machines_dir: Option<PathBuf>,
    /// Image list in `limaimages.json` format.
    #[serde(default)]
    images_file: Option<PathBuf>,
    #[serde(default)]
    verbosity: Verbosity,
    credentials: SshCredentials,
}

impl DriverConfig {
    pub fn new(credentials: SshCredentials) -> Self {
        Self {
            limactl_path: None,
            machines_dir: None,
            images_file: None,
            verbosity: Verbosity::default(),
            credentials,
        }
    }

    /// `driverlima.yaml` in the user's kutti configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "kutti").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn with_limactl_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.limactl_path = Some(path.into());
        self
    }

    pub fn with_machines_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.machines_dir = Some(dir.into());
        self
    }

    pub fn with_images_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.images_file = Some(path.into());
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_credentials(mut self, credentials: SshCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Checks that the configuration is usable before any machine is touched.
    pub fn validate(&self) -> Result<()> {
        if self.credentials.username.trim().is_empty() {
            return Err(DriverError::Config("ssh username must not be empty".into()));
        }
        if let Some(dir) = &self.machines_dir {
            if dir.as_os_str().is_empty() {
                return Err(DriverError::Config("machines_dir must not be empty".into()));
            }
        }
        Ok(())
    }
}
