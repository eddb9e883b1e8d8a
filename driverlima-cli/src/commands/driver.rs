use async_trait::async_trait;
use color_eyre::eyre::Result;
use driverlima::log::*;
use driverlima::DriverStatus;

pub struct DriverCommand;

impl DriverCommand {
    async fn subcommand_status<'a>(&self, context: &'a super::CliContext<'a>) -> Result<()> {
        let mut driver = context.driver().await?;
        let status = driver.status();
        println!("* {} ({})", driver.name(), driver.description());
        println!("** status: {:?}", status);
        println!(
            "** networking: per-cluster {}, nat {}",
            driver.uses_per_cluster_networking(),
            driver.uses_nat_networking()
        );
        if status == DriverStatus::Error {
            let reason = driver.error().unwrap_or("unknown error");
            error!("driver not ready: {}", reason);
            println!("** error: {}", reason);
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> super::Command<'a> for DriverCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext<'a>) -> Result<()> {
        match context.matches.subcommand() {
            Some(("status", _)) => {
                self.subcommand_status(context).await?;
            }
            Some((name, _)) => {
                return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into())
            }
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}
