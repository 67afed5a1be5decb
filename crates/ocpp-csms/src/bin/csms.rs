//! OCPP CSMS Binary
//!
//! Command-line interface for running the OCPP Central System Management System

use anyhow::Context;
use clap::{value_parser, Arg, ArgMatches, Command};
use ocpp_csms::{utils::init_tracing, Config, Csms};
use std::{path::Path, process};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let matches = Command::new("ocpp-csms")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OCPP 1.6-J Central System")
        .subcommand_required(true)
        .subcommand(
            Command::new("start")
                .about("Start the CSMS server")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Configuration file path"),
                )
                .arg(
                    Arg::new("bind")
                        .short('b')
                        .long("bind")
                        .value_name("ADDRESS")
                        .help("Bind address, overrides the configuration"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .value_parser(value_parser!(u16))
                        .help("Listening port, overrides the configuration"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file and print the effective settings")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .required(true)
                        .help("Configuration file path"),
                ),
        )
        .get_matches();

    let result = match matches.subcommand() {
        Some(("start", sub_matches)) => start(sub_matches).await,
        Some(("check-config", sub_matches)) => check_config(sub_matches),
        _ => Err(anyhow::anyhow!("No subcommand provided. Use --help for usage information.")),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let path = matches.get_one::<String>("config").map(Path::new);
    Config::load(path).context("Failed to load configuration")
}

async fn start(matches: &ArgMatches) -> anyhow::Result<()> {
    let mut config = load_config(matches)?;
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.server.bind_address = bind.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    init_tracing(&config.logging.level, &config.logging.format)?;

    let mut csms = Csms::new(config).await.context("Failed to create CSMS")?;
    let addr = csms.start().await.context("Failed to start CSMS")?;
    info!("Accepting chargers on ws://{}/{{charger_id}}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Unable to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping CSMS...");

    csms.stop().await.context("Error during shutdown")?;
    info!("CSMS shutdown complete");
    Ok(())
}

fn check_config(matches: &ArgMatches) -> anyhow::Result<()> {
    // load() validates
    let config = load_config(matches)?;

    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
