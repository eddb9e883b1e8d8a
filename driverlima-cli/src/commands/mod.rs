use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use dialoguer::Password;
use driverlima::{Driver, DriverConfig};
use regex::Regex;
use thiserror::Error;

pub mod driver;
pub mod images;
pub mod machine;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Prompt interaction failed.")]
    PromptInteractionFailed(
        #[from]
        #[source]
        dialoguer::Error,
    ),
    #[error("Required user input `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("No subcommand provided.")]
    NoSubcommandProvided,
}

pub struct CliContext<'a> {
    pub config: DriverConfig,
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(matches: &'a ArgMatches, config: DriverConfig) -> Self {
        Self { config, matches }
    }

    pub fn with_matches(&self, matches: &'a ArgMatches) -> Self {
        Self {
            config: self.config.clone(),
            matches,
        }
    }

    pub async fn driver(&self) -> Result<Driver> {
        Driver::new(self.config.clone())
            .await
            .wrap_err("Setting up the lima driver failed.")
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()>;
}

pub trait Interactive<'a> {
    fn prompt_for_password(&self, message: &'a str) -> Result<String> {
        Password::new()
            .with_prompt(message)
            .interact()
            .map_err(CommandErrors::PromptInteractionFailed)
            .wrap_err("Prompting for password failed.")
    }

    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    /// Read argument from the CLI args with regex validation.
    fn read_argument_with_regex_validation(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        regex: &'a Regex,
    ) -> Result<String> {
        self.read_argument_with_validator(arg_matches, id, &mut |input| {
            if regex.is_match(input) {
                Ok(())
            } else {
                Err(CommandErrors::InputValidationFailure(
                    id.into(),
                    regex.as_str().into(),
                ))
            }
        })
    }
}

#[cfg(test)]
mod test {
    use clap::Arg;

    use super::*;

    struct Probe;

    impl<'a> Interactive<'a> for Probe {}

    fn matches(args: &[&str]) -> ArgMatches {
        clap::Command::new("probe")
            .arg(Arg::new("machine"))
            .get_matches_from(args)
    }

    #[test]
    fn test_regex_validation() -> Result<()> {
        let regex = Regex::new("^[a-z0-9]+$")?;

        let good = matches(&["probe", "m1"]);
        assert_eq!("m1", Probe.read_argument_with_regex_validation(&good, "machine", &regex)?);

        let bad = matches(&["probe", "M-1"]);
        assert!(Probe
            .read_argument_with_regex_validation(&bad, "machine", &regex)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_missing_argument() {
        let none = matches(&["probe"]);
        let err = Probe
            .read_argument_with_validator(&none, "machine", &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CommandErrors>(),
            Some(CommandErrors::RequiredUserInputMissing(id)) if id == "machine"
        ));
    }
}
