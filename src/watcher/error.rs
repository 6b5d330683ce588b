//! Error types for the configuration watcher.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
///
/// Only errors that break watch availability or lock exclusivity are fatal.
/// Runtime watch failures trigger a resubscription and action failures are
/// isolated to the invocation that produced them.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Cannot watch {path}: {reason}")]
    WatchSetup { path: PathBuf, reason: String },

    #[error("Watch on {path} was invalidated: {reason}")]
    WatchRuntime { path: PathBuf, reason: String },

    #[error("Lock file {path} is unavailable: {reason}")]
    LockUnavailable { path: PathBuf, reason: String },

    #[error("Action '{command}' failed: {reason}")]
    ActionExecution { command: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl WatchError {
    /// Whether the process must stop when this error surfaces.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            WatchError::WatchRuntime { .. } | WatchError::ActionExecution { .. }
        )
    }

    /// The invariant that could not be upheld, for fatal diagnostics.
    pub fn invariant(&self) -> &'static str {
        match self {
            WatchError::WatchSetup { .. } | WatchError::WatchRuntime { .. } => {
                "configuration tree must be watchable"
            }
            WatchError::LockUnavailable { .. } => "reload actions must run one at a time",
            WatchError::ActionExecution { .. } => "reload action must succeed",
            WatchError::Config { .. } => "settings must be valid",
            WatchError::ChannelClosed => "watch pipeline must stay connected",
        }
    }
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        let path = e.paths.first().cloned().unwrap_or_default();
        WatchError::WatchSetup {
            path,
            reason: e.to_string(),
        }
    }
}
