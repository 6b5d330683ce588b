//! Init and Config commands.

use std::path::Path;

use crate::config::{ConfigError, Settings};

/// Run init command - write a default settings file.
pub fn run_init(path: &Path, force: bool) -> Result<(), ConfigError> {
    let path = Settings::init_config_file(path, force)?;
    println!("Created configuration file at: {}", path.display());
    println!("Edit this file to customize your settings.");
    Ok(())
}

/// Run config command - display the effective configuration.
pub fn run_config(config: &Settings) {
    println!("Current Configuration:");
    println!("{}", "=".repeat(50));
    match toml::to_string_pretty(config) {
        Ok(toml_str) => println!("{toml_str}"),
        Err(e) => eprintln!("Error displaying config: {e}"),
    }
}
