//! Watcher service wiring source, debouncer, gate and runner together.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::action::{ActionInvocation, ActionRunner};
use super::debouncer::Debouncer;
use super::error::WatchError;
use super::event::{Trigger, WatchSpec};
use super::gate::CriticalSectionGate;
use super::source::{ChangeStream, DEFAULT_RESUBSCRIBE_DELAY, EventSource};
use crate::config::Settings;

/// Settled bursts waiting for the lock.
const BURST_CHANNEL_CAPACITY: usize = 32;

/// Debounced configuration watcher.
///
/// One instance owns all of its state, so several watchers can run side by
/// side in one process.
pub struct ConfigWatcher {
    spec: WatchSpec,
    quiet_period: Duration,
    resubscribe_delay: Duration,
    gate: CriticalSectionGate,
    runner: ActionRunner,
    /// Receives every finished invocation.
    reporter: Option<mpsc::UnboundedSender<ActionInvocation>>,
}

impl ConfigWatcher {
    /// Create a builder for configuring the watcher.
    pub fn builder() -> ConfigWatcherBuilder {
        ConfigWatcherBuilder::new()
    }

    /// Build a watcher from validated settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, WatchError> {
        settings.validate()?;

        let spec = settings.watch.spec();
        let runner =
            ActionRunner::from_config(&settings.action, spec.root(), spec.excluded_paths());

        ConfigWatcher::builder()
            .spec(spec)
            .quiet_period(settings.watch.quiet_period())
            .resubscribe_delay(settings.watch.resubscribe_delay())
            .lock_path(settings.lock.path.clone())
            .runner(runner)
            .build()
    }

    pub fn spec(&self) -> &WatchSpec {
        &self.spec
    }

    pub fn gate(&self) -> &CriticalSectionGate {
        &self.gate
    }

    /// Watch the configured tree until `shutdown` fires.
    ///
    /// Returns an error only for fatal conditions: the tree cannot be watched
    /// or the lock file cannot be used.
    pub async fn watch(self, shutdown: CancellationToken) -> Result<(), WatchError> {
        let source = EventSource::subscribe(self.spec.clone())?
            .with_resubscribe_delay(self.resubscribe_delay);

        self.run(source, shutdown).await
    }

    /// Drive the pipeline from any change stream.
    ///
    /// Bursts are handled one at a time in settle order. Shutdown stops
    /// intake and abandons a wait for the lock; an action already running is
    /// allowed to finish.
    pub async fn run<S>(self, events: S, shutdown: CancellationToken) -> Result<(), WatchError>
    where
        S: ChangeStream + 'static,
    {
        self.gate.prepare()?;

        let (burst_tx, mut burst_rx) = mpsc::channel(BURST_CHANNEL_CAPACITY);
        let debouncer = Debouncer::new(self.quiet_period);
        let debounce = tokio::spawn(debouncer.observe(events, burst_tx, shutdown.clone()));

        crate::log_event!(
            "watcher",
            "started",
            "{} (quiet {}ms, lock {}, {} policy)",
            self.spec.root().display(),
            self.quiet_period.as_millis(),
            self.gate.lock_path().display(),
            self.runner.policy()
        );

        let result = loop {
            let burst = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                burst = burst_rx.recv() => match burst {
                    Some(burst) => burst,
                    None => break Ok(()),
                },
            };

            let guard = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    crate::log_event!(
                        "watcher",
                        "shutdown",
                        "dropped settled burst of {} paths while waiting for the lock",
                        burst.len()
                    );
                    break Ok(());
                }
                guard = self.gate.acquire() => match guard {
                    Ok(guard) => guard,
                    Err(e) => break Err(e),
                },
            };

            self.dispatch(&Trigger::Burst(burst)).await;
            drop(guard);
        };

        debounce.abort();
        let result = match (result, debounce.await) {
            (Ok(()), Err(e)) if e.is_panic() => {
                tracing::error!("[watcher] debounce task panicked");
                Err(WatchError::ChannelClosed)
            }
            (result, _) => result,
        };

        match &result {
            Ok(()) => crate::log_event!("watcher", "stopped"),
            Err(e) => tracing::error!("[watcher] {e}"),
        }
        result
    }

    /// Run the action for one trigger under the lock.
    ///
    /// Action failures are logged and returned on the invocation. Only lock
    /// failures surface as errors.
    pub async fn handle(&self, trigger: Trigger) -> Result<ActionInvocation, WatchError> {
        let trigger = &trigger;
        self.gate.with_lock(move || self.dispatch(trigger)).await
    }

    /// Run the action. The caller holds the lock.
    async fn dispatch(&self, trigger: &Trigger) -> ActionInvocation {
        let invocation = self.runner.run(trigger).await;

        report(&invocation);
        if let Some(reporter) = &self.reporter {
            let _ = reporter.send(invocation.clone());
        }
        invocation
    }
}

fn report(invocation: &ActionInvocation) {
    let elapsed_ms = invocation.elapsed().num_milliseconds();
    let label = invocation.trigger.label();

    if invocation.succeeded() {
        crate::log_event!(
            "action",
            "completed",
            "{label}: {} commands in {elapsed_ms}ms",
            invocation.runs.len()
        );
        return;
    }

    for err in invocation.errors() {
        tracing::error!("[action] {err}");
    }
    tracing::warn!("[action] {label} finished with failures after {elapsed_ms}ms; still watching");
}

/// Builder for constructing a ConfigWatcher.
pub struct ConfigWatcherBuilder {
    spec: Option<WatchSpec>,
    runner: Option<ActionRunner>,
    lock_path: Option<PathBuf>,
    quiet_period: Duration,
    resubscribe_delay: Duration,
    reporter: Option<mpsc::UnboundedSender<ActionInvocation>>,
}

impl ConfigWatcherBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            spec: None,
            runner: None,
            lock_path: None,
            quiet_period: Duration::from_secs(5),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            reporter: None,
        }
    }

    /// Set what to watch.
    pub fn spec(mut self, spec: WatchSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Set the action runner.
    pub fn runner(mut self, runner: ActionRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the lock file path.
    pub fn lock_path(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    /// Set the quiet period.
    pub fn quiet_period(mut self, period: Duration) -> Self {
        self.quiet_period = period;
        self
    }

    /// Set the quiet period in milliseconds.
    pub fn quiet_period_ms(self, ms: u64) -> Self {
        self.quiet_period(Duration::from_millis(ms))
    }

    /// Set the pause between resubscription attempts.
    pub fn resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Send every finished invocation to `tx`.
    pub fn report_to(mut self, tx: mpsc::UnboundedSender<ActionInvocation>) -> Self {
        self.reporter = Some(tx);
        self
    }

    /// Build the ConfigWatcher.
    pub fn build(self) -> Result<ConfigWatcher, WatchError> {
        let spec = self.spec.ok_or_else(|| WatchError::Config {
            reason: "Watch spec is required".to_string(),
        })?;

        let runner = self.runner.ok_or_else(|| WatchError::Config {
            reason: "Action runner is required".to_string(),
        })?;

        if self.quiet_period.is_zero() {
            return Err(WatchError::Config {
                reason: "Quiet period must be greater than zero".to_string(),
            });
        }

        let lock_path = self
            .lock_path
            .unwrap_or_else(|| std::env::temp_dir().join("confwatch.lock"));

        Ok(ConfigWatcher {
            spec,
            quiet_period: self.quiet_period,
            resubscribe_delay: self.resubscribe_delay,
            gate: CriticalSectionGate::new(lock_path),
            runner,
            reporter: self.reporter,
        })
    }
}

impl Default for ConfigWatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
