//! Downstream action runner.
//!
//! Spawns the reload hook (whole-tree policy) or the table compiler
//! (per-file policy) and waits for it. Failures are reported on the returned
//! [`ActionInvocation`]; they never stop the watcher.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use walkdir::WalkDir;

use super::error::WatchError;
use super::event::Trigger;
use crate::config::ActionConfig;

/// Environment variable carrying the trigger label to the child.
pub const ENV_TRIGGER: &str = "CONFWATCH_TRIGGER";
/// Environment variable carrying the newline-separated changed paths.
pub const ENV_CHANGED_PATHS: &str = "CONFWATCH_CHANGED_PATHS";

/// How a trigger maps to child processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionPolicy {
    /// One reload hook per trigger, regardless of which paths changed.
    #[default]
    WholeTree,
    /// One compiler run per changed lookup table.
    PerFile,
}

impl fmt::Display for ActionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPolicy::WholeTree => f.write_str("whole-tree"),
            ActionPolicy::PerFile => f.write_str("per-file"),
        }
    }
}

/// Result of a single child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Non-zero exit. `None` when the child was killed by a signal.
    Failed(Option<i32>),
    SpawnFailed(String),
    TimedOut(Duration),
}

/// One spawned command.
#[derive(Debug, Clone)]
pub struct CommandRun {
    pub program: String,
    /// Table path for per-file runs.
    pub target: Option<PathBuf>,
    pub outcome: RunOutcome,
}

impl CommandRun {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// The failure as an error, if the run failed.
    pub fn error(&self) -> Option<WatchError> {
        let reason = match &self.outcome {
            RunOutcome::Success => return None,
            RunOutcome::Failed(Some(code)) => format!("exit status {code}"),
            RunOutcome::Failed(None) => "terminated by signal".to_string(),
            RunOutcome::SpawnFailed(reason) => format!("could not start: {reason}"),
            RunOutcome::TimedOut(limit) => format!("timed out after {}s", limit.as_secs()),
        };
        let command = match &self.target {
            Some(target) => format!("{} {}", self.program, target.display()),
            None => self.program.clone(),
        };
        Some(WatchError::ActionExecution { command, reason })
    }
}

/// Record of one trigger being handled. Used for logging only.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub trigger: Trigger,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub runs: Vec<CommandRun>,
}

impl ActionInvocation {
    /// True when every spawned command succeeded (or nothing needed running).
    pub fn succeeded(&self) -> bool {
        self.runs.iter().all(CommandRun::succeeded)
    }

    pub fn errors(&self) -> impl Iterator<Item = WatchError> + '_ {
        self.runs.iter().filter_map(CommandRun::error)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Runs the configured action for settled bursts.
#[derive(Debug, Clone)]
pub struct ActionRunner {
    policy: ActionPolicy,
    reload_command: Vec<String>,
    compile_command: Vec<String>,
    table_extensions: HashSet<String>,
    root: PathBuf,
    exclude: HashSet<PathBuf>,
    timeout: Option<Duration>,
}

impl ActionRunner {
    /// Whole-tree runner invoking `command` once per trigger.
    pub fn whole_tree(command: Vec<String>) -> Self {
        Self {
            policy: ActionPolicy::WholeTree,
            reload_command: command,
            compile_command: Vec::new(),
            table_extensions: HashSet::new(),
            root: PathBuf::new(),
            exclude: HashSet::new(),
            timeout: None,
        }
    }

    /// Per-file runner invoking `command <table>` for each changed table.
    ///
    /// `root` is walked for full rebuilds.
    pub fn per_file(command: Vec<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            policy: ActionPolicy::PerFile,
            reload_command: Vec::new(),
            compile_command: command,
            table_extensions: std::iter::once(String::new()).collect(),
            root: root.into(),
            exclude: HashSet::new(),
            timeout: None,
        }
    }

    /// Build a runner from configuration.
    pub fn from_config(
        config: &ActionConfig,
        root: impl Into<PathBuf>,
        exclude: &HashSet<PathBuf>,
    ) -> Self {
        Self {
            policy: config.policy,
            reload_command: config.reload_command.clone(),
            compile_command: config.compile_command.clone(),
            table_extensions: config.table_extensions.iter().cloned().collect(),
            root: root.into(),
            exclude: exclude.clone(),
            timeout: config.timeout(),
        }
    }

    /// Extensions that mark a lookup table. `""` matches extension-less files.
    pub fn with_table_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.table_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Paths never handed to the compiler.
    pub fn with_exclude(mut self, exclude: HashSet<PathBuf>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn policy(&self) -> ActionPolicy {
        self.policy
    }

    /// Handle a trigger. Waits for every spawned child before returning.
    pub async fn run(&self, trigger: &Trigger) -> ActionInvocation {
        let started_at = Local::now();

        let runs = match self.policy {
            ActionPolicy::WholeTree => vec![self.run_reload(trigger).await],
            ActionPolicy::PerFile => {
                let tables = self.tables_for(trigger);
                if tables.is_empty() {
                    crate::debug_event!("action", "no tables to compile");
                }
                let mut runs = Vec::with_capacity(tables.len());
                for table in tables {
                    runs.push(self.run_compile(trigger, &table).await);
                }
                runs
            }
        };

        ActionInvocation {
            trigger: trigger.clone(),
            started_at,
            finished_at: Local::now(),
            runs,
        }
    }

    /// Lookup tables the per-file policy compiles for `trigger`.
    ///
    /// A burst that names the root itself (a recovered watch) cannot say which
    /// tables changed, so it compiles the whole tree like a full rebuild.
    pub fn tables_for(&self, trigger: &Trigger) -> Vec<PathBuf> {
        match trigger {
            Trigger::Burst(burst) if !burst.contains(&self.root) => burst
                .paths()
                .filter(|path| self.is_table(path))
                .map(Path::to_path_buf)
                .collect(),
            Trigger::Burst(_) => {
                crate::log_event!("action", "root changed", "compiling every table");
                self.walk_tables()
            }
            Trigger::FullRebuild => self.walk_tables(),
        }
    }

    fn walk_tables(&self) -> Vec<PathBuf> {
        let mut tables: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("[action] skipping unreadable entry: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.is_table(path))
            .collect();
        tables.sort();
        tables
    }

    /// A regular, non-excluded file with a recognized table extension.
    pub fn is_table(&self, path: &Path) -> bool {
        if self.exclude.contains(path) {
            return false;
        }
        let is_file = std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            return false;
        }
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.table_extensions.contains(&extension)
    }

    async fn run_reload(&self, trigger: &Trigger) -> CommandRun {
        let changed = match trigger {
            Trigger::Burst(burst) => burst
                .paths()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("\n"),
            Trigger::FullRebuild => String::new(),
        };

        self.spawn(&self.reload_command, None, trigger.label(), &changed)
            .await
    }

    async fn run_compile(&self, trigger: &Trigger, table: &Path) -> CommandRun {
        let changed = table.to_string_lossy();
        self.spawn(&self.compile_command, Some(table), trigger.label(), &changed)
            .await
    }

    async fn spawn(
        &self,
        argv: &[String],
        target: Option<&Path>,
        trigger_label: &str,
        changed: &str,
    ) -> CommandRun {
        let program = argv.first().cloned().unwrap_or_default();
        let finish = |outcome| CommandRun {
            program: program.clone(),
            target: target.map(Path::to_path_buf),
            outcome,
        };

        if program.is_empty() {
            return finish(RunOutcome::SpawnFailed("no command configured".to_string()));
        }

        let mut command = Command::new(&program);
        command
            .args(&argv[1..])
            .env(ENV_TRIGGER, trigger_label)
            .env(ENV_CHANGED_PATHS, changed)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(target) = target {
            command.arg(target);
        }

        crate::debug_event!("action", "spawning", "{}", argv.join(" "));

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return finish(RunOutcome::SpawnFailed(e.to_string())),
        };

        let output = match self.timeout {
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                // Dropping the future kills the child (kill_on_drop).
                Err(_) => return finish(RunOutcome::TimedOut(limit)),
            },
            None => child.wait_with_output().await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => return finish(RunOutcome::SpawnFailed(e.to_string())),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            crate::debug_event!("action", "stdout", "{}", stdout.trim_end());
        }

        if output.status.success() {
            if !stderr.trim().is_empty() {
                crate::debug_event!("action", "stderr", "{}", stderr.trim_end());
            }
            finish(RunOutcome::Success)
        } else {
            if !stderr.trim().is_empty() {
                tracing::warn!("[action] {program}: {}", stderr.trim_end());
            }
            finish(RunOutcome::Failed(output.status.code()))
        }
    }
}
