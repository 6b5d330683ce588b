//! Rebuild command - one full-tree action under the lock.

use crate::config::Settings;
use crate::watcher::{ActionInvocation, ConfigWatcher, Trigger, WatchError};

/// Run the configured action once for the whole tree.
///
/// Waits for the lock like any burst would. Action failures are reported on
/// the returned invocation.
pub async fn run(settings: &Settings) -> Result<ActionInvocation, WatchError> {
    let watcher = ConfigWatcher::from_settings(settings)?;
    watcher.gate().prepare()?;

    crate::log_event!(
        "rebuild",
        "requested",
        "{}",
        watcher.spec().root().display()
    );
    watcher.handle(Trigger::FullRebuild).await
}
