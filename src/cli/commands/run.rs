//! Run command - the long-running watcher.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::watcher::{ConfigWatcher, WatchError};

/// Watch until SIGINT or SIGTERM.
///
/// Returns only after shutdown or on a fatal error.
pub async fn run(settings: &Settings) -> Result<(), WatchError> {
    let watcher = ConfigWatcher::from_settings(settings)?;
    let shutdown = shutdown_on_signal().map_err(|e| WatchError::WatchSetup {
        path: settings.watch.root.clone(),
        reason: format!("cannot install signal handlers: {e}"),
    })?;

    watcher.watch(shutdown).await
}

/// Token cancelled on the first SIGINT or SIGTERM.
fn shutdown_on_signal() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        crate::log_event!("watcher", "shutdown", "received {name}");
        trigger.cancel();
    });

    Ok(token)
}
