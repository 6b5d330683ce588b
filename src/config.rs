//! Configuration for the watcher.
//!
//! Layered with figment:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `CONFWATCH_` and use double
//! underscores to separate nested levels:
//! - `CONFWATCH_WATCH__QUIET_PERIOD_MS=2000` sets `watch.quiet_period_ms`
//! - `CONFWATCH_LOCK__PATH=/run/confwatch.lock` sets `lock.path`
//! - `CONFWATCH_ACTION__POLICY=per-file` sets `action.policy`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::watcher::{ActionPolicy, EventKind, WatchError, WatchSpec};

/// Settings file read when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/confwatch/settings.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CONFWATCH_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to write configuration: {0}")]
    Write(String),
}

impl From<ConfigError> for WatchError {
    fn from(e: ConfigError) -> Self {
        WatchError::Config {
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// What to watch and how to debounce it
    #[serde(default)]
    pub watch: WatchConfig,

    /// Host-wide lock settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Action run for each settled burst
    #[serde(default)]
    pub action: ActionConfig,

    /// Log levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Root of the watched tree
    #[serde(default = "default_watch_root")]
    pub root: PathBuf,

    /// Paths whose events are ignored. Relative entries resolve against `root`.
    /// Files rewritten by the reload action belong here.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<PathBuf>,

    /// Event kinds that count as a change
    #[serde(default = "default_events")]
    pub events: Vec<EventKind>,

    /// Quiet time after the last event before a burst settles
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// Pause between attempts to re-establish a lost watch
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LockConfig {
    /// Lock file shared by every watcher on the host
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ActionConfig {
    /// `whole-tree` runs the reload command once per burst,
    /// `per-file` runs the compile command for each changed table
    #[serde(default)]
    pub policy: ActionPolicy,

    /// Reload hook for the whole-tree policy, run without extra arguments
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,

    /// Table compiler for the per-file policy, run with the table path appended
    #[serde(default = "default_compile_command")]
    pub compile_command: Vec<String>,

    /// Extensions that mark a lookup table. An empty entry matches files
    /// without an extension.
    #[serde(default = "default_table_extensions")]
    pub table_extensions: Vec<String>,

    /// Kill an action that runs longer than this. Unbounded when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for every module
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `confwatch::watcher::source = "debug"`
    #[serde(default)]
    pub modules: IndexMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_watch_root() -> PathBuf {
    PathBuf::from("/etc/postfix")
}
fn default_exclude() -> Vec<PathBuf> {
    vec![PathBuf::from("main.cf"), PathBuf::from("master.cf")]
}
fn default_events() -> Vec<EventKind> {
    EventKind::ALL.to_vec()
}
fn default_quiet_period_ms() -> u64 {
    5_000
}
fn default_resubscribe_delay_ms() -> u64 {
    1_000
}
fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("confwatch.lock")
}
fn default_reload_command() -> Vec<String> {
    vec!["postfix".to_string(), "reload".to_string()]
}
fn default_compile_command() -> Vec<String> {
    vec!["postmap".to_string()]
}
fn default_table_extensions() -> Vec<String> {
    vec![String::new()]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watch: WatchConfig::default(),
            lock: LockConfig::default(),
            action: ActionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: default_watch_root(),
            exclude: default_exclude(),
            events: default_events(),
            quiet_period_ms: default_quiet_period_ms(),
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            policy: ActionPolicy::default(),
            reload_command: default_reload_command(),
            compile_command: default_compile_command(),
            table_extensions: default_table_extensions(),
            timeout_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: IndexMap::new(),
        }
    }
}

impl WatchConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    /// Build the immutable watch spec for this configuration.
    pub fn spec(&self) -> WatchSpec {
        WatchSpec::new(&self.root)
            .exclude(&self.exclude)
            .kinds(self.events.iter().copied())
    }
}

impl ActionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Settings {
    /// Load configuration from defaults, the settings file and the environment.
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) if !p.exists() => return Err(ConfigError::NotFound(p.to_path_buf())),
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };

        Self::figment(&config_path)
            // Double underscore separates nested levels; single underscores
            // stay part of the field name.
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str()
                    .to_lowercase()
                    .replace("__", ".")
                    .into()
            }))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Load configuration from defaults and a settings file only.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
    }

    /// Reject settings the watcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch.quiet_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "watch.quiet_period_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.watch.events.is_empty() {
            return Err(ConfigError::Invalid {
                field: "watch.events",
                reason: "at least one event kind is required".to_string(),
            });
        }

        let (field, command) = match self.action.policy {
            ActionPolicy::WholeTree => ("action.reload_command", &self.action.reload_command),
            ActionPolicy::PerFile => ("action.compile_command", &self.action.compile_command),
        };
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field,
                reason: format!("a program is required for the {} policy", self.action.policy),
            });
        }

        if self.action.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "action.timeout_secs",
                reason: "must be greater than zero when set".to_string(),
            });
        }

        Ok(())
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;
        std::fs::write(path, toml_string).map_err(|e| ConfigError::Write(e.to_string()))?;

        Ok(())
    }

    /// Write a default settings file.
    pub fn init_config_file(path: impl AsRef<Path>, force: bool) -> Result<PathBuf, ConfigError> {
        let config_path = path.as_ref().to_path_buf();

        if !force && config_path.exists() {
            return Err(ConfigError::Write(format!(
                "{} already exists. Use --force to overwrite",
                config_path.display()
            )));
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.watch.root, PathBuf::from("/etc/postfix"));
        assert_eq!(settings.watch.quiet_period(), Duration::from_secs(5));
        assert_eq!(settings.watch.events.len(), 5);
        assert_eq!(settings.action.policy, ActionPolicy::WholeTree);
        assert!(settings.lock.path.ends_with("confwatch.lock"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_spec_excludes_live_config() {
        let spec = Settings::default().watch.spec();
        assert!(spec.is_excluded(Path::new("/etc/postfix/main.cf")));
        assert!(spec.is_excluded(Path::new("/etc/postfix/master.cf")));
        assert!(!spec.is_excluded(Path::new("/etc/postfix/virtual_alias")));
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
[watch]
root = "/srv/cfg"
exclude = ["/srv/cfg/main.cf"]
events = ["created", "moved_to"]
quiet_period_ms = 2000

[lock]
path = "/run/confwatch/reload.lock"

[action]
policy = "per-file"
compile_command = ["postmap", "-v"]
table_extensions = ["", "map"]
timeout_secs = 30

[logging]
default = "debug"

[logging.modules]
"confwatch::watcher::source" = "trace"
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_file(&config_path).unwrap();
        assert_eq!(settings.watch.root, PathBuf::from("/srv/cfg"));
        assert_eq!(settings.watch.exclude, vec![PathBuf::from("/srv/cfg/main.cf")]);
        assert_eq!(settings.watch.events, vec![EventKind::Created, EventKind::MovedTo]);
        assert_eq!(settings.watch.quiet_period_ms, 2000);
        assert_eq!(settings.lock.path, PathBuf::from("/run/confwatch/reload.lock"));
        assert_eq!(settings.action.policy, ActionPolicy::PerFile);
        assert_eq!(settings.action.compile_command, vec!["postmap", "-v"]);
        assert_eq!(settings.action.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.logging.default, "debug");
        assert_eq!(settings.logging.modules["confwatch::watcher::source"], "trace");
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        fs::write(&config_path, "[watch]\nquiet_period_ms = 250\n").unwrap();

        let settings = Settings::load_file(&config_path).unwrap();

        // Modified value
        assert_eq!(settings.watch.quiet_period_ms, 250);

        // Default values should still be present
        assert_eq!(settings.watch.exclude.len(), 2);
        assert_eq!(settings.action.reload_command, vec!["postfix", "reload"]);
        assert_eq!(settings.logging.default, "info");
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("absent.toml");

        let err = Settings::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut settings = Settings::default();
        settings.watch.quiet_period_ms = 0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "watch.quiet_period_ms", .. })
        ));

        let mut settings = Settings::default();
        settings.action.policy = ActionPolicy::PerFile;
        settings.action.compile_command.clear();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "action.compile_command", .. })
        ));

        // The unused command may be empty.
        let mut settings = Settings::default();
        settings.action.compile_command.clear();
        assert!(settings.validate().is_ok());

        let mut settings = Settings::default();
        settings.watch.events.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_save_and_init() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("etc/settings.toml");

        let mut settings = Settings::default();
        settings.watch.quiet_period_ms = 1234;
        settings.action.policy = ActionPolicy::PerFile;
        settings.save(&config_path).unwrap();

        let loaded = Settings::load_file(&config_path).unwrap();
        assert_eq!(loaded.watch.quiet_period_ms, 1234);
        assert_eq!(loaded.action.policy, ActionPolicy::PerFile);

        // init refuses to clobber without force
        assert!(Settings::init_config_file(&config_path, false).is_err());
        Settings::init_config_file(&config_path, true).unwrap();
        let reset = Settings::load_file(&config_path).unwrap();
        assert_eq!(reset.watch.quiet_period_ms, 5_000);
    }
}
