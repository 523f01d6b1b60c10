mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // `run` is a long-lived service; show lifecycle logs by default
    let verbosity = match cli.command {
        Command::Run(_) => cli.global.verbose.saturating_add(1),
        _ => cli.global.verbose,
    };
    init_tracing(verbosity, cli.global.log_json);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, json: bool) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = playsync_config::load_config(cli.global.config.as_deref())?;
    tracing::debug!(command = ?cli.command, "dispatching command");

    match cli.command {
        Command::Run(args) => commands::run::handle(args, &config, &cli.global).await,
        Command::Sync(args) => commands::sync::handle(args, &config, &cli.global).await,
        Command::Check => commands::check::handle(&config, &cli.global).await,
    }
}
