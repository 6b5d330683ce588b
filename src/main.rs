use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use confwatch::cli::commands::{init, rebuild, run};
use confwatch::cli::{Cli, Commands};
use confwatch::config::Settings;
use confwatch::logging;
use confwatch::watcher::WatchError;

/// Exit code when `rebuild` ran but an action failed.
const EXIT_ACTION_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<WatchError>() {
                Some(watch_err) => {
                    eprintln!("Error: {watch_err}");
                    eprintln!("Cannot guarantee: {}", watch_err.invariant());
                }
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config;
    let load = || Settings::load(config_path.as_deref()).map_err(WatchError::from);

    match cli.command {
        Commands::Init { path, force } => {
            init::run_init(&path, force)
                .with_context(|| format!("cannot initialize {}", path.display()))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            init::run_config(&load()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { quiet_period_ms } => {
            let mut settings = load()?;
            if let Some(ms) = quiet_period_ms {
                settings.watch.quiet_period_ms = ms;
            }
            logging::init_with_config(&settings.logging);

            run::run(&settings).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rebuild => {
            let settings = load()?;
            logging::init_with_config(&settings.logging);

            let invocation = rebuild::run(&settings).await?;
            if invocation.succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_ACTION_FAILED))
            }
        }
    }
}
