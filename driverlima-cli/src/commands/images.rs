use async_trait::async_trait;
use color_eyre::eyre::Result;

pub struct ImagesCommand;

impl ImagesCommand {
    async fn subcommand_list<'a>(&self, context: &'a super::CliContext<'a>) -> Result<()> {
        let driver = context.driver().await?;
        let mut images = driver.list_images().peekable();
        if images.peek().is_none() {
            println!("* no images configured.");
            return Ok(());
        }
        println!("* images:");
        for image in images {
            println!(
                "** {}: {} ({:?}){}",
                image.k8s_version(),
                image.source_url(),
                image.status(),
                if *image.deprecated() { " [deprecated]" } else { "" }
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> super::Command<'a> for ImagesCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext<'a>) -> Result<()> {
        match context.matches.subcommand() {
            Some(("list", _)) => {
                self.subcommand_list(context).await?;
            }
            Some((name, _)) => {
                return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into())
            }
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}
