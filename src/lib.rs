pub mod cli;
pub mod config;
pub mod logging;
pub mod watcher;

pub use config::{ConfigError, Settings};
pub use watcher::{
    ActionInvocation, ActionPolicy, ActionRunner, Burst, ChangeEvent, ConfigWatcher,
    CriticalSectionGate, Debouncer, EventKind, EventSource, Trigger, WatchError, WatchSpec,
};
