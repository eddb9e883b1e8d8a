#![forbid(unsafe_code)]

use clap::{command, value_parser, Arg, ArgAction};
use color_eyre::eyre::Result;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::commands::Command;

mod commands;
mod settings;

use driverlima::log::*;
use driverlima::Verbosity;

fn machine_command(name: &'static str, about: &'static str) -> clap::Command {
    clap::Command::new(name)
        .about(about)
        .arg(
            Arg::new("cluster")
                .help("Name of the cluster the machine belongs to.")
                .required(true),
        )
        .arg(
            Arg::new("machine")
                .help("Name of the machine within its cluster.")
                .required(true),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre()?;

    // Command configuration
    let matches = command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvvv.")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("config")
                .help("Path to the driver configuration file. Defaults to driverlima.yaml in the kutti config directory.")
                .short('c')
                .long("config")
                .global(true),
        )
        .arg(
            Arg::new("limactl")
                .help("Path to limactl. Looked up on PATH by default.")
                .long("limactl")
                .global(true),
        )
        .arg(
            Arg::new("ssh-user")
                .help("User for commands run inside machines, when the config file doesn't name one.")
                .long("ssh-user")
                .global(true),
        )
        .subcommand(
            command!("driver")
                .about("Inspect the driver.")
                .subcommand(command!("status").about("Check that limactl can be found.")),
        )
        .subcommand(
            command!("images")
                .about("Manage node images.")
                .subcommand(command!("list").about("List the images available to new machines.")),
        )
        .subcommand(
            command!("machine")
                .about("Manage machines.")
                .subcommand(
                    machine_command("create", "Create a machine.").arg(
                        Arg::new("k8s-version")
                            .help("Kubernetes version of the node image.")
                            .short('k')
                            .long("k8s-version")
                            .required(true),
                    ),
                )
                .subcommand(machine_command("start", "Start a machine."))
                .subcommand(machine_command("stop", "Stop a machine."))
                .subcommand(machine_command("force-stop", "Stop a machine without shutting it down."))
                .subcommand(machine_command("delete", "Delete a machine and its machine file."))
                .subcommand(
                    machine_command("status", "Show what Lima reports about a machine.").arg(
                        Arg::new("json")
                            .help("Print the full status record as JSON.")
                            .long("json")
                            .action(ArgAction::SetTrue),
                    ),
                )
                .subcommand(machine_command("ip", "Show the primary IP address of a running machine."))
                .subcommand(
                    machine_command("forward-ssh", "Forward a host port to the SSH port of a stopped machine.").arg(
                        Arg::new("port")
                            .help("Host port to forward.")
                            .short('p')
                            .long("port")
                            .required(true)
                            .value_parser(value_parser!(u16)),
                    ),
                )
                .subcommand(
                    machine_command("rename", "Set the hostname of a running machine.")
                        .arg(Arg::new("new-name").help("The new hostname.").required(true)),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    // Set up logging
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .compact();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize;
    let logging_config = if quiet && verbose == 0 {
        logging_config.with_max_level(LevelFilter::ERROR)
    } else if verbose > 0 {
        let level = match verbose {
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        logging_config.with_max_level(level)
    } else {
        logging_config.with_max_level(LevelFilter::ERROR)
    };

    let subscriber = logging_config.finish();
    subscriber.init();

    let config = settings::load(
        matches.get_one::<String>("config").map(String::as_str),
        matches.get_one::<String>("ssh-user").map(String::as_str),
    )
    .await?;
    let config = settings::apply_overrides(
        config,
        matches.get_one::<String>("limactl").map(String::as_str),
        Verbosity::from_flags(quiet, verbose),
    );

    // Run the commands
    if let Some((subcommand, matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(matches, config);
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        match subcommand {
            "driver" => commands::driver::DriverCommand::new().run(&ctx).await?,
            "images" => commands::images::ImagesCommand::new().run(&ctx).await?,
            "machine" => commands::machine::MachineCommand::new().run(&ctx).await?,
            _ => return Err(eyre!("Unrecognized subcommand: {}", subcommand)),
        }
    }
    Ok(())
}
