use atrium::configuration::config::Config;
use atrium::controller::controller_handler::Controller;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "atrium")]
#[command(version = "0.0.2")]
#[command(about = "Sandboxed coding interview sessions with live terminal capture")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(env = "ATRIUM_CONFIG")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("Importing configuration from {}", args.config_file.display());
    let config = match Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration imported successfully");

    let mut controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    let result = tokio::spawn(async move {
        info!("Spawning the controller");
        controller.run().await
    });

    match result.await {
        Ok(Ok(())) => info!("Shut down cleanly"),
        Ok(Err(e)) => {
            error!("Error occured in the controller process: {}, exiting...", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Error joining at the end of execution: {}", e);
            std::process::exit(1);
        }
    }
}
