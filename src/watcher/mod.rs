//! Debounced configuration watcher.
//!
//! Watches a directory tree, collapses bursts of changes into a single
//! trigger, and runs a reload action while holding a host-wide lock.
//!
//! # Architecture
//!
//! ```text
//! EventSource (notify::RecommendedWatcher, recursive)
//!   - filters exclusions and unwanted kinds
//!   - resubscribes when the watch is invalidated
//!         |
//!     Debouncer (timer reset on every event)
//!         |  Burst
//!    ConfigWatcher
//!         |
//!  CriticalSectionGate (flock on lock file)
//!         |
//!    ActionRunner (whole-tree reload | per-file compile)
//! ```

mod action;
mod debouncer;
mod error;
mod event;
mod gate;
mod service;
mod source;

pub use action::{
    ActionInvocation, ActionPolicy, ActionRunner, CommandRun, ENV_CHANGED_PATHS, ENV_TRIGGER,
    RunOutcome,
};
pub use debouncer::Debouncer;
pub use error::WatchError;
pub use event::{Burst, ChangeEvent, EventKind, Trigger, WatchSpec};
pub use gate::{CriticalSectionGate, LockGuard};
pub use service::{ConfigWatcher, ConfigWatcherBuilder};
pub use source::{ChangeStream, DEFAULT_RESUBSCRIBE_DELAY, EventSource};
