#![forbid(unsafe_code)]

//! # driverlima
//!
//! A kutti driver for [Lima](https://lima-vm.io). All talking to Lima goes
//! through the `limactl` command-line tool:
//!
//! - [`classify`] turns whatever `limactl` printed into typed records
//! - [`runner`] builds `limactl` invocations and captures their output
//! - [`machine`] drives one virtual machine through its lifecycle
//! - [`driver`] validates the tool, names machines per cluster, and creates
//!   them from the embedded manifest template
//!
//! Nodes are created from pre-built cloud images. Lima downloads and caches
//! the images itself, so the driver only needs to know where each image
//! lives; see [`image`].

pub mod classify;
pub mod config;
pub mod driver;
pub mod error;
pub mod image;
pub mod log;
pub mod machine;
pub mod manifest;
pub mod remote;
pub mod runner;

pub use classify::{ClassifiedOutput, LogEvent, LogLevel, StatusRecord};
pub use config::{DriverConfig, SshCredentials, Verbosity};
pub use driver::{Driver, DriverStatus};
pub use error::{DriverError, FormatError, Result};
pub use image::{Image, ImageCatalog, ImageStatus};
pub use machine::{Machine, MachineStatus, PredefinedCommand};
