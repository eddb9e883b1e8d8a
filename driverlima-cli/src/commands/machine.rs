use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use driverlima::log::*;
use driverlima::{Driver, Machine, PredefinedCommand};
use regex::Regex;

use super::{CliContext, Interactive};
use crate::settings::PASSWORD_ENV;

const CLUSTER_NAME: &str = "^[a-z0-9][a-z0-9_.-]*$";
// Machine names may not contain a dash; Lima names machines <cluster>-<machine>.
const MACHINE_NAME: &str = "^[a-z0-9][a-z0-9_.]*$";

pub struct MachineCommand;

struct Identity {
    cluster: String,
    machine: String,
}

impl MachineCommand {
    fn identity(&self, matches: &ArgMatches) -> Result<Identity> {
        let cluster_name = Regex::new(CLUSTER_NAME)?;
        let machine_name = Regex::new(MACHINE_NAME)?;
        Ok(Identity {
            cluster: self.read_argument_with_regex_validation(matches, "cluster", &cluster_name)?,
            machine: self.read_argument_with_regex_validation(matches, "machine", &machine_name)?,
        })
    }

    fn machine(&self, driver: &mut Driver, matches: &ArgMatches) -> Result<Machine> {
        let identity = self.identity(matches)?;
        driver
            .get_machine(&identity.machine, &identity.cluster)
            .wrap_err_with(|| format!("couldn't open machine {}", identity.machine))
    }

    async fn subcommand_create(&self, context: &CliContext<'_>) -> Result<()> {
        let identity = self.identity(context.matches)?;
        let k8s_version = self.read_argument_with_validator(context.matches, "k8s-version", &mut |_| Ok(()))?;

        let mut driver = context.driver().await?;
        let machine = driver
            .new_machine(&identity.machine, &identity.cluster, &k8s_version)
            .await?;
        info!("created machine {}", machine.qualified_name());
        println!("* created {}: {}", machine.qualified_name(), machine.cached_status());
        Ok(())
    }

    async fn subcommand_delete(&self, context: &CliContext<'_>) -> Result<()> {
        let identity = self.identity(context.matches)?;
        let mut driver = context.driver().await?;
        driver
            .delete_machine(&identity.machine, &identity.cluster)
            .await?;
        println!(
            "* deleted {}",
            driver.qualified_machine_name(&identity.machine, &identity.cluster)
        );
        Ok(())
    }

    async fn subcommand_transition(&self, context: &CliContext<'_>, transition: &str) -> Result<()> {
        let mut driver = context.driver().await?;
        let mut machine = self.machine(&mut driver, context.matches)?;
        match transition {
            "start" => machine.start().await?,
            "stop" => machine.stop().await?,
            "force-stop" => machine.force_stop().await?,
            other => return Err(super::CommandErrors::InvalidSubcommand(other.to_string()).into()),
        }
        machine.wait_for_state_change(std::time::Duration::from_secs(60)).await;
        println!("* {}: {}", machine.qualified_name(), machine.status().await);
        Ok(())
    }

    async fn subcommand_status(&self, context: &CliContext<'_>) -> Result<()> {
        let mut driver = context.driver().await?;
        let mut machine = self.machine(&mut driver, context.matches)?;

        if context.matches.get_flag("json") {
            let record = machine.query().await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            return Ok(());
        }

        let status = machine.status().await;
        println!("* {}: {}", machine.qualified_name(), status);
        if let Some(address) = machine.ssh_address() {
            println!("** ssh: {}", address);
        }
        if let Some(message) = machine.error().await {
            println!("** error: {}", message);
        }
        Ok(())
    }

    async fn subcommand_ip(&self, context: &CliContext<'_>) -> Result<()> {
        let mut driver = context.driver().await?;
        let mut machine = self.machine(&mut driver, context.matches)?;
        match machine.ip_address().await? {
            Some(address) => println!("{}", address),
            None => {
                warn!("{} is not running", machine.qualified_name());
                println!("* {} has no address: {}", machine.qualified_name(), machine.cached_status());
            }
        }
        Ok(())
    }

    async fn subcommand_forward_ssh(&self, context: &CliContext<'_>) -> Result<()> {
        let port = *context
            .matches
            .get_one::<u16>("port")
            .ok_or_else(|| super::CommandErrors::RequiredUserInputMissing("port".into()))?;

        let mut driver = context.driver().await?;
        let mut machine = self.machine(&mut driver, context.matches)?;
        machine.forward_ssh_port(port).await?;
        println!("* forwarded localhost:{} to {}:22", port, machine.qualified_name());
        Ok(())
    }

    async fn subcommand_rename(&self, context: &CliContext<'_>) -> Result<()> {
        let new_name = self.read_argument_with_validator(context.matches, "new-name", &mut |_| Ok(()))?;

        let mut config = context.config.clone();
        if !config.credentials().has_password() {
            debug!("{} not set, prompting", PASSWORD_ENV);
            let prompt = format!("Password for {}", config.credentials().username());
            let password = self.prompt_for_password(&prompt)?;
            let credentials = config.credentials().clone().with_password(password);
            config = config.with_credentials(credentials);
        }

        let mut driver = Driver::new(config).await?;
        let mut machine = self.machine(&mut driver, context.matches)?;
        let command = PredefinedCommand::RenameMachine;
        if !machine.implements_command(command.name()) {
            return Err(driverlima::DriverError::UnsupportedCommand(command.to_string()).into());
        }
        machine.execute_command(command, &[new_name.as_str()]).await?;
        println!("* renamed {} to {}", machine.qualified_name(), new_name);
        Ok(())
    }
}

#[async_trait]
impl<'a> super::Command<'a> for MachineCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let (name, matches) = match context.matches.subcommand() {
            Some(subcommand) => subcommand,
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        };
        let context = context.with_matches(matches);
        match name {
            "create" => self.subcommand_create(&context).await?,
            "delete" => self.subcommand_delete(&context).await?,
            "start" | "stop" | "force-stop" => self.subcommand_transition(&context, name).await?,
            "status" => self.subcommand_status(&context).await?,
            "ip" => self.subcommand_ip(&context).await?,
            "forward-ssh" => self.subcommand_forward_ssh(&context).await?,
            "rename" => self.subcommand_rename(&context).await?,
            _ => return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into()),
        }
        Ok(())
    }
}

impl<'a> super::Interactive<'a> for MachineCommand {}
