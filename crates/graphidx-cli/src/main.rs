mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match commands::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let format = cli.log_format.map(Into::into).unwrap_or(config.log_format);
    if let Err(e) = graphidx::telemetry::init_logging(format) {
        eprintln!("{}", e);
    }

    if commands::run(cli, config).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
