//! The driver: finds `limactl`, names machines per cluster, and creates and
//! deletes them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::image::{Image, ImageCatalog};
use crate::log::*;
use crate::machine::{Machine, MachineStatus};
use crate::manifest::ManifestStore;
use crate::remote::{RemoteShell, SshShell};
use crate::runner::{Limactl, ProcessInvoker, ToolInvoker};

pub const DRIVER_NAME: &str = "lima";
pub const DRIVER_DESCRIPTION: &str = "Kutti driver for Lima";

const LIMACTL: &str = "limactl";
const SEPARATOR: char = '-';

/// The name Lima knows a machine by: cluster and machine name joined with a
/// dash.
pub fn qualified_machine_name(machine: &str, cluster: &str) -> String {
    format!("{cluster}{SEPARATOR}{machine}")
}

/// Rejects names that would make qualified names ambiguous or that Lima
/// would not accept. Machine names may not contain the separator, so a
/// qualified name always splits at its last dash.
fn check_names(machine: &str, cluster: &str) -> Result<()> {
    for (kind, name) in [("machine", machine), ("cluster", cluster)] {
        if name.is_empty() {
            return Err(DriverError::InvalidName {
                kind,
                name: name.to_string(),
                reason: "must not be empty",
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(DriverError::InvalidName {
                kind,
                name: name.to_string(),
                reason: "may only contain letters, digits, '-', '_' and '.'",
            });
        }
    }
    if machine.contains(SEPARATOR) {
        return Err(DriverError::InvalidName {
            kind: "machine",
            name: machine.to_string(),
            reason: "must not contain '-'",
        });
    }
    Ok(())
}

fn locate_limactl(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(DriverError::ToolNotFound(format!(
            "{} is not a file",
            path.display()
        ))),
        None => which::which(LIMACTL).map_err(|e| DriverError::ToolNotFound(e.to_string())),
    }
}

/// One lock per qualified machine name. Everything that changes a machine,
/// or its manifest, holds the machine's lock while it runs.
///
/// Only weak handles are kept: a lock lives as long as some machine or
/// operation holds it, and the entries of dropped locks are pruned.
#[derive(Debug, Clone, Default)]
pub struct IdentityLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>>,
}

impl IdentityLocks {
    pub fn for_identity(&self, qualified_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(qualified_name).and_then(Weak::upgrade) {
            return lock;
        }

        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(qualified_name.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Number of identities with a live lock.
    pub fn len(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|lock| lock.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DriverStatus {
    Unvalidated,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
enum Readiness {
    Unvalidated,
    Ready(Limactl),
    Failed(String),
}

#[derive(Debug)]
pub struct Driver {
    config: DriverConfig,
    images: ImageCatalog,
    manifests: ManifestStore,
    invoker: Arc<dyn ToolInvoker>,
    shell: Arc<dyn RemoteShell>,
    locks: IdentityLocks,
    readiness: Readiness,
}

impl Driver {
    /// Build a driver that runs `limactl` as a subprocess and reaches
    /// machines over SSH. `limactl` is not looked for until first needed.
    #[tracing::instrument]
    pub async fn new(config: DriverConfig) -> Result<Self> {
        config.validate()?;

        let images = match config.images_file().clone().or_else(ImageCatalog::default_path) {
            Some(path) => ImageCatalog::load(&path).await?,
            None => ImageCatalog::default(),
        };
        let manifests = match config.machines_dir() {
            Some(dir) => ManifestStore::new(dir),
            None => ManifestStore::in_user_cache()?,
        };
        let shell = Arc::new(SshShell::new(config.credentials().clone()));

        Ok(Self::from_parts(
            config,
            images,
            manifests,
            Arc::new(ProcessInvoker),
            shell,
        ))
    }

    /// Like [`Driver::new`], but fails unless `limactl` can be found.
    pub async fn initialize(config: DriverConfig) -> Result<Self> {
        let mut driver = Self::new(config).await?;
        driver.validate()?;
        Ok(driver)
    }

    pub fn from_parts(
        config: DriverConfig,
        images: ImageCatalog,
        manifests: ManifestStore,
        invoker: Arc<dyn ToolInvoker>,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        Self {
            config,
            images,
            manifests,
            invoker,
            shell,
            locks: IdentityLocks::default(),
            readiness: Readiness::Unvalidated,
        }
    }

    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn description(&self) -> &'static str {
        DRIVER_DESCRIPTION
    }

    /// All clusters share Lima's user-v2 network.
    pub fn uses_per_cluster_networking(&self) -> bool {
        false
    }

    /// Machines are reached through port forwards on localhost.
    pub fn uses_nat_networking(&self) -> bool {
        true
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Look for `limactl` unless it has already been found. A failure is
    /// remembered for [`Driver::error`] and retried on the next call.
    pub fn validate(&mut self) -> Result<()> {
        self.limactl().map(|_| ())
    }

    /// Validate, then report readiness. Never `Unvalidated`.
    pub fn status(&mut self) -> DriverStatus {
        if let Err(e) = self.validate() {
            debug!("driver not ready: {}", e);
        }
        self.readiness()
    }

    /// Readiness as of the last validation, without validating.
    pub fn readiness(&self) -> DriverStatus {
        match self.readiness {
            Readiness::Unvalidated => DriverStatus::Unvalidated,
            Readiness::Ready(_) => DriverStatus::Ready,
            Readiness::Failed(_) => DriverStatus::Error,
        }
    }

    /// Why the last validation failed.
    pub fn error(&self) -> Option<&str> {
        match &self.readiness {
            Readiness::Failed(message) => Some(message),
            _ => None,
        }
    }

    pub fn qualified_machine_name(&self, machine: &str, cluster: &str) -> String {
        qualified_machine_name(machine, cluster)
    }

    pub fn get_image(&self, k8s_version: &str) -> Result<&Image> {
        self.images
            .get(k8s_version)
            .ok_or_else(|| DriverError::ImageNotFound(k8s_version.to_string()))
    }

    /// For recording fetches and purges against the catalog.
    pub fn get_image_mut(&mut self, k8s_version: &str) -> Result<&mut Image> {
        self.images
            .get_mut(k8s_version)
            .ok_or_else(|| DriverError::ImageNotFound(k8s_version.to_string()))
    }

    pub fn list_images(&self) -> impl Iterator<Item = &Image> {
        self.images.images()
    }

    /// A handle on an existing machine. Its status is unknown until queried.
    pub fn get_machine(&mut self, machine: &str, cluster: &str) -> Result<Machine> {
        let limactl = self.limactl()?;
        check_names(machine, cluster)?;
        Ok(self.machine(limactl, machine, cluster))
    }

    /// Create a machine from the image for `k8s_version`.
    ///
    /// If `limactl create` fails, the manifest written for it stays on disk
    /// and nothing is rolled back; delete the machine to clean up.
    #[tracing::instrument(skip(self))]
    pub async fn new_machine(&mut self, machine: &str, cluster: &str, k8s_version: &str) -> Result<Machine> {
        let limactl = self.limactl()?;
        check_names(machine, cluster)?;
        let image = self.get_image(k8s_version)?.clone();
        if *image.deprecated() {
            warn!("image for Kubernetes version {k8s_version} is deprecated");
        }

        let qualified_name = qualified_machine_name(machine, cluster);
        let lock = self.locks.for_identity(&qualified_name);
        let _guard = lock.lock().await;

        let manifest = self.manifests.write(&qualified_name, image.source_url()).await?;
        let manifest = manifest.to_string_lossy();
        let name_arg = format!("--name={qualified_name}");

        info!("creating lima vm {qualified_name}");
        limactl
            .run(&["create", &name_arg, &manifest])
            .await
            .map_err(|e| {
                error!("limactl create failed, leaving {} in place", manifest);
                e.after("writing the machine file", "limactl create")
            })?;

        Ok(self
            .machine(limactl, machine, cluster)
            .with_status(MachineStatus::Stopped))
    }

    /// Remove the Lima instance, then its manifest. If the instance is gone
    /// but the manifest could not be removed, the error says so; retrying
    /// will then fail at the first step.
    #[tracing::instrument(skip(self))]
    pub async fn delete_machine(&mut self, machine: &str, cluster: &str) -> Result<()> {
        let limactl = self.limactl()?;
        check_names(machine, cluster)?;

        let qualified_name = qualified_machine_name(machine, cluster);
        let lock = self.locks.for_identity(&qualified_name);
        let _guard = lock.lock().await;

        info!("deleting lima vm {qualified_name}");
        limactl.run(&["rm", &qualified_name]).await?;
        self.manifests
            .remove(&qualified_name)
            .await
            .map_err(|e| e.after("removing the lima vm", "removing the machine file"))
    }

    fn machine(&self, limactl: Limactl, machine: &str, cluster: &str) -> Machine {
        let lock = self
            .locks
            .for_identity(&qualified_machine_name(machine, cluster));
        Machine::new(
            machine.to_string(),
            cluster.to_string(),
            limactl,
            self.shell.clone(),
            self.manifests.clone(),
            lock,
        )
    }

    fn limactl(&mut self) -> Result<Limactl> {
        if let Readiness::Ready(limactl) = &self.readiness {
            return Ok(limactl.clone());
        }

        match locate_limactl(self.config.limactl_path().as_deref()) {
            Ok(path) => {
                info!("using limactl at {}", path.display());
                let limactl = Limactl::new(path, *self.config.verbosity(), self.invoker.clone());
                self.readiness = Readiness::Ready(limactl.clone());
                Ok(limactl)
            }
            Err(e) => {
                self.readiness = Readiness::Failed(e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::config::SshCredentials;
    use crate::image::ImageStatus;
    use crate::machine::test::STOPPED;
    use crate::remote::testing::RecordingShell;
    use crate::runner::testing::ScriptedInvoker;

    const IMAGE_URL: &str = "https://github.com/kuttiproject/driver-lima-images/releases/download/v0.1/kutti-k8s-1.33.qcow2";
    const CREATE_FAILED: &str = r#"{"level":"fatal","msg":"instance \"c1-m1\" already exists","time":"2024-05-01T10:00:00Z"}"#;

    struct Fixture {
        dir: TempDir,
        invoker: Arc<ScriptedInvoker>,
        driver: Driver,
    }

    impl Fixture {
        fn limactl_path(&self) -> PathBuf {
            self.dir.path().join("bin").join("limactl")
        }

        fn manifest_path(&self, qualified_name: &str) -> PathBuf {
            self.dir
                .path()
                .join("machines")
                .join(format!("{qualified_name}.yaml"))
        }

        fn install_limactl(&self) {
            fs::create_dir_all(self.dir.path().join("bin")).unwrap();
            fs::write(self.limactl_path(), "#!/bin/sh\n").unwrap();
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let invoker = ScriptedInvoker::new();
        let config = DriverConfig::new(SshCredentials::new("kuttiadmin", "secret"))
            .with_limactl_path(dir.path().join("bin").join("limactl"));
        let driver = Driver::from_parts(
            config,
            ImageCatalog::from_images([Image::new("1.33", IMAGE_URL)]),
            ManifestStore::new(dir.path().join("machines")),
            invoker.clone(),
            RecordingShell::new(),
        );
        let fixture = Fixture {
            dir,
            invoker,
            driver,
        };
        fixture.install_limactl();
        fixture
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!("c1-m1", qualified_machine_name("m1", "c1"));
        assert_eq!(qualified_machine_name("m1", "c1"), qualified_machine_name("m1", "c1"));
        assert_ne!(qualified_machine_name("m1", "c1"), qualified_machine_name("m2", "c2"));
    }

    #[test]
    fn test_machine_names_may_not_contain_separator() {
        assert!(check_names("m1", "my-cluster").is_ok());
        assert!(matches!(
            check_names("b-c", "a"),
            Err(DriverError::InvalidName { kind: "machine", .. })
        ));
        assert!(matches!(
            check_names("m1", ""),
            Err(DriverError::InvalidName { kind: "cluster", .. })
        ));
        assert!(check_names("m 1", "c1").is_err());
    }

    #[test]
    fn test_readiness_does_not_validate() {
        let mut fixture = fixture();
        assert_eq!(DriverStatus::Unvalidated, fixture.driver.readiness());

        assert_eq!(DriverStatus::Ready, fixture.driver.status());
        assert_eq!(DriverStatus::Ready, fixture.driver.readiness());
    }

    #[test]
    fn test_image_status_changes_through_driver() -> Result<()> {
        let mut fixture = fixture();
        assert!(matches!(
            fixture.driver.get_image_mut("1.29"),
            Err(DriverError::ImageNotFound(_))
        ));

        fixture.driver.get_image_mut("1.33")?.fetch();
        assert_eq!(ImageStatus::Downloaded, *fixture.driver.get_image("1.33")?.status());

        fixture.driver.get_image_mut("1.33")?.purge_local();
        assert_eq!(ImageStatus::NotDownloaded, *fixture.driver.get_image("1.33")?.status());
        Ok(())
    }

    #[test]
    fn test_validation_is_retried_then_memoized() {
        let mut fixture = fixture();
        fs::remove_file(fixture.limactl_path()).unwrap();

        assert!(matches!(
            fixture.driver.validate(),
            Err(DriverError::ToolNotFound(_))
        ));
        assert_eq!(DriverStatus::Error, fixture.driver.status());
        assert!(fixture.driver.error().is_some());

        fixture.install_limactl();
        assert_eq!(DriverStatus::Ready, fixture.driver.status());
        assert_eq!(None, fixture.driver.error());

        fs::remove_file(fixture.limactl_path()).unwrap();
        assert!(fixture.driver.validate().is_ok());
    }

    #[test]
    fn test_get_machine_needs_limactl() {
        let mut fixture = fixture();
        fs::remove_file(fixture.limactl_path()).unwrap();

        assert!(matches!(
            fixture.driver.get_machine("m1", "c1"),
            Err(DriverError::ToolNotFound(_))
        ));
        assert!(fixture.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_machine_starts_with_empty_cache() -> Result<()> {
        let mut fixture = fixture();
        let machine = fixture.driver.get_machine("m1", "c1")?;

        assert_eq!("c1-m1", machine.qualified_name());
        assert_eq!(MachineStatus::Unknown, machine.cached_status());
        assert!(machine.cached_record().is_none());
        assert!(fixture.invoker.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_new_machine_writes_manifest_and_creates() -> Result<()> {
        let mut fixture = fixture();
        let machine = fixture.driver.new_machine("m1", "c1", "1.33").await?;

        let manifest = fixture.manifest_path("c1-m1");
        let written = fs::read_to_string(&manifest).unwrap();
        assert!(written.contains(IMAGE_URL));

        assert_eq!(
            vec![vec![
                "create".to_string(),
                "--name=c1-m1".to_string(),
                manifest.to_string_lossy().into_owned(),
            ]],
            fixture.invoker.operations()
        );
        assert_eq!(MachineStatus::Stopped, machine.cached_status());
        Ok(())
    }

    #[tokio::test]
    async fn test_new_machine_needs_known_image() {
        let mut fixture = fixture();

        assert!(matches!(
            fixture.driver.new_machine("m1", "c1", "1.29").await,
            Err(DriverError::ImageNotFound(version)) if version == "1.29"
        ));
        assert!(!fixture.manifest_path("c1-m1").exists());
        assert!(fixture.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_leaves_manifest() {
        let mut fixture = fixture();
        fixture.invoker.fail(CREATE_FAILED);

        let err = fixture
            .driver
            .new_machine("m1", "c1", "1.33")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DriverError::PartialFailure {
                step: "limactl create",
                ..
            }
        ));
        assert_eq!(Some("instance \"c1-m1\" already exists"), err.tool_reason());
        assert!(fixture.manifest_path("c1-m1").exists());
    }

    #[tokio::test]
    async fn test_delete_removes_instance_then_manifest() -> Result<()> {
        let mut fixture = fixture();
        fixture.driver.new_machine("m1", "c1", "1.33").await?;

        fixture.driver.delete_machine("m1", "c1").await?;

        assert_eq!(vec!["rm", "c1-m1"], fixture.invoker.operations()[1]);
        assert!(!fixture.manifest_path("c1-m1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_rm_keeps_manifest() -> Result<()> {
        let mut fixture = fixture();
        fixture.driver.new_machine("m1", "c1", "1.33").await?;
        fixture
            .invoker
            .fail(r#"{"level":"fatal","msg":"instance is running","time":"t"}"#);

        let err = fixture.driver.delete_machine("m1", "c1").await.unwrap_err();

        assert!(matches!(err, DriverError::Invocation { .. }));
        assert!(fixture.manifest_path("c1-m1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_without_manifest_is_partial_failure() {
        let mut fixture = fixture();

        assert!(matches!(
            fixture.driver.delete_machine("m1", "c1").await,
            Err(DriverError::PartialFailure {
                step: "removing the machine file",
                ..
            })
        ));
        assert_eq!(1, fixture.invoker.operations().len());
    }

    #[tokio::test]
    async fn test_start_after_create_invalidates_status() -> Result<()> {
        let mut fixture = fixture();
        let mut machine = fixture.driver.new_machine("m1", "c1", "1.33").await?;
        fixture.invoker.succeed("").succeed(STOPPED);

        machine.start().await?;
        assert_eq!(MachineStatus::Unknown, machine.cached_status());

        // Lima may report any state right after start.
        let status = machine.status().await;
        assert_eq!(status, machine.cached_status());
        Ok(())
    }

    #[test]
    fn test_machines_share_locks_by_identity() {
        let locks = IdentityLocks::default();
        assert!(Arc::ptr_eq(
            &locks.for_identity("c1-m1"),
            &locks.for_identity("c1-m1")
        ));
        assert!(!Arc::ptr_eq(
            &locks.for_identity("c1-m1"),
            &locks.for_identity("c1-m2")
        ));
    }

    #[test]
    fn test_dropped_locks_are_forgotten() {
        let locks = IdentityLocks::default();
        let held = locks.for_identity("c1-m1");
        drop(locks.for_identity("c1-m2"));
        assert_eq!(1, locks.len());

        drop(held);
        let _fresh = locks.for_identity("c1-m3");
        assert_eq!(1, locks.len());
        assert_eq!(1, locks.locks.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_deleted_machines_release_their_lock() -> Result<()> {
        let mut fixture = fixture();
        fixture.driver.new_machine("m1", "c1", "1.33").await?;
        fixture.driver.delete_machine("m1", "c1").await?;

        assert!(fixture.driver.locks.is_empty());
        Ok(())
    }

    #[test]
    fn test_driver_description() {
        let fixture = fixture();
        assert_eq!("lima", fixture.driver.name());
        assert_eq!("Kutti driver for Lima", fixture.driver.description());
        assert!(!fixture.driver.uses_per_cluster_networking());
        assert!(fixture.driver.uses_nat_networking());
    }
}
