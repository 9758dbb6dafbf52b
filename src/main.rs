mod appstack;
mod bootstrap;
mod commands;
mod config;
mod consumer;
mod environment;
mod error;
mod ledger;
mod manifest;
mod precedence;
mod queue;
mod repo;
mod report;
mod script;
mod telemetry;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::bootstrap::BootstrapArgs;
use commands::resolve::ResolveArgs;
use commands::run::RunArgs;

#[derive(Debug, Parser)]
#[command(
    name = "fleetd",
    version,
    about = "Fleet agent: appstack bootstrap and remote command consumer"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent loop (bootstrap, then consume commands)
    Run(RunArgs),
    /// Bootstrap the host and exit
    Bootstrap(BootstrapArgs),
    /// Inspect a configuration tree (lookup or override merge)
    Resolve(ResolveArgs),
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Bootstrap(_) => "bootstrap",
            Self::Resolve(_) => "resolve",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run(args) => args.execute(),
        Commands::Bootstrap(args) => args.execute(),
        Commands::Resolve(args) => args.execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
