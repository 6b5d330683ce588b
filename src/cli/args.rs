//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Debounced configuration watcher
#[derive(Parser, Debug)]
#[command(
    name = "confwatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Watch a configuration tree and run a reload hook once changes settle",
    long_about = "Watch a configuration tree, collapse bursts of changes, and run a reload \
                  or table-compile hook under a host-wide lock.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to settings.toml (default: /etc/confwatch/settings.toml when present)
    #[arg(short, long, global = true, env = "CONFWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start watching
    #[command(about = "Watch the configured tree until interrupted")]
    Run {
        /// Quiet period in milliseconds (overrides config)
        #[arg(short, long)]
        quiet_period_ms: Option<u64>,
    },

    /// Run the action once
    #[command(about = "Run the action once for the whole tree under the lock")]
    Rebuild,

    /// Show the effective configuration
    #[command(about = "Display active settings")]
    Config,

    /// Write a default settings file
    #[command(about = "Write a default settings file")]
    Init {
        /// Where to write the file
        #[arg(value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,

        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from([
            "confwatch",
            "run",
            "--config",
            "/tmp/settings.toml",
            "-q",
            "250",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/settings.toml")));
        assert!(matches!(
            cli.command,
            Commands::Run {
                quiet_period_ms: Some(250)
            }
        ));
    }

    #[test]
    fn test_init_defaults_to_system_path() {
        let cli = Cli::try_parse_from(["confwatch", "init", "--force"]).unwrap();
        match cli.command {
            Commands::Init { path, force } => {
                assert_eq!(path, PathBuf::from(DEFAULT_CONFIG_PATH));
                assert!(force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
