//! Loading the driver configuration.

use std::path::Path;

use color_eyre::eyre::{Result, WrapErr};
use driverlima::log::*;
use driverlima::{DriverConfig, SshCredentials, Verbosity};
use tokio::fs;

/// Environment variable consulted when the configuration has no password.
pub const PASSWORD_ENV: &str = "DRIVERLIMA_SSH_PASSWORD";

/// Account that kutti node images are built with.
pub const DEFAULT_SSH_USER: &str = "kuttiadmin";

/// Read the configuration from `path`, or from the default location if it
/// exists. Without either, a configuration for `ssh_user` is built.
pub async fn load(path: Option<&str>, ssh_user: Option<&str>) -> Result<DriverConfig> {
    let config = match path {
        Some(path) => read_config(Path::new(path)).await?,
        None => match DriverConfig::default_path() {
            Some(path) if path.is_file() => read_config(&path).await?,
            _ => {
                debug!("no configuration file, using defaults");
                DriverConfig::new(SshCredentials::new(
                    ssh_user.unwrap_or(DEFAULT_SSH_USER),
                    "",
                ))
            }
        },
    };

    let config = with_password(config, std::env::var(PASSWORD_ENV).ok());
    config.validate()?;
    Ok(config)
}

async fn read_config(path: &Path) -> Result<DriverConfig> {
    debug!("reading configuration from {}", path.display());
    let config = fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("Failed reading config file {}", path.display()))?;
    parse_config(&config)
}

pub fn parse_config(config: &str) -> Result<DriverConfig> {
    serde_yaml::from_str(config).wrap_err("deserializing driver config")
}

/// Fill in a password the configuration doesn't carry.
pub fn with_password(config: DriverConfig, password: Option<String>) -> DriverConfig {
    match password {
        Some(password) if !config.credentials().has_password() => {
            let credentials = config.credentials().clone().with_password(password);
            config.with_credentials(credentials)
        }
        _ => config,
    }
}

/// Command-line flags win over the file.
pub fn apply_overrides(config: DriverConfig, limactl: Option<&str>, verbosity: Verbosity) -> DriverConfig {
    let config = config.with_verbosity(verbosity);
    match limactl {
        Some(path) => config.with_limactl_path(path),
        None => config,
    }
}
