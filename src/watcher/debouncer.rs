//! Burst debouncing for configuration changes.
//!
//! Editors and deployment tooling rewrite several files in quick succession.
//! The debouncer folds those writes into one burst and only emits it once the
//! tree has been quiet for the configured period.

use std::future;
use std::path::PathBuf;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::event::{Burst, ChangeEvent};
use super::source::ChangeStream;

/// Coalesces change events into bursts.
///
/// Holds one accumulator and a single deadline. Every recorded event pushes
/// the deadline out to `now + quiet_period`; there is never more than one
/// pending timer.
#[derive(Debug)]
pub struct Debouncer {
    /// Pending changes, deduplicated by path in first-seen order.
    pending: IndexMap<PathBuf, ChangeEvent>,
    /// Raw events folded into the pending burst.
    event_count: usize,
    /// When the first pending event arrived.
    started_at: Option<Instant>,
    /// When the pending burst settles unless another event arrives.
    deadline: Option<Instant>,
    quiet_period: Duration,
}

impl Debouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            pending: IndexMap::new(),
            event_count: 0,
            started_at: None,
            deadline: None,
            quiet_period,
        }
    }

    /// Create a debouncer with the quiet period in milliseconds.
    pub fn from_millis(quiet_period_ms: u64) -> Self {
        Self::new(Duration::from_millis(quiet_period_ms))
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Record a change and reset the deadline.
    pub fn record(&mut self, event: ChangeEvent) {
        self.record_at(event, Instant::now());
    }

    fn record_at(&mut self, event: ChangeEvent, now: Instant) {
        self.started_at.get_or_insert(now);
        self.event_count += 1;
        self.pending.insert(event.path.clone(), event);
        self.deadline = Some(now + self.quiet_period);
    }

    /// When the pending burst will settle, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the pending burst if its deadline has passed.
    pub fn take_settled(&mut self, now: Instant) -> Option<Burst> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        let started_at = self.started_at.take().unwrap_or(deadline);
        let events = std::mem::take(&mut self.pending);
        let event_count = std::mem::replace(&mut self.event_count, 0);
        self.deadline = None;

        Some(Burst::new(events, event_count, started_at, now))
    }

    /// Drop the pending burst without emitting it.
    ///
    /// Returns how many distinct paths were discarded.
    pub fn cancel(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.event_count = 0;
        self.started_at = None;
        self.deadline = None;
        dropped
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drive the debouncer from a change stream until shutdown.
    ///
    /// Settled bursts are sent in settle order. A settle that falls due at the
    /// same instant as a new event is emitted first. On shutdown the pending
    /// burst is dropped. When the stream ends, the pending burst still settles
    /// before this returns.
    pub async fn observe<S>(
        mut self,
        mut events: S,
        bursts: mpsc::Sender<Burst>,
        shutdown: CancellationToken,
    ) where
        S: ChangeStream,
    {
        let mut stream_open = true;

        loop {
            if !stream_open && !self.has_pending() {
                crate::debug_event!("debounce", "input closed");
                return;
            }

            let deadline = self.deadline;

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    let dropped = self.cancel();
                    if dropped > 0 {
                        crate::log_event!("debounce", "shutdown", "dropped {dropped} unsettled paths");
                    }
                    return;
                }

                _ = wait_until(deadline) => {
                    if let Some(burst) = self.take_settled(Instant::now()) {
                        crate::log_event!(
                            "debounce",
                            "settled",
                            "{} paths from {} events",
                            burst.len(),
                            burst.event_count()
                        );
                        if bursts.send(burst).await.is_err() {
                            crate::debug_event!("debounce", "receiver closed");
                            return;
                        }
                    }
                }

                next = events.next_change(), if stream_open => {
                    match next {
                        Some(event) => {
                            crate::debug_event!("debounce", "recorded", "{} {}", event.kind, event.path.display());
                            self.record(event);
                        }
                        None => stream_open = false,
                    }
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::event::EventKind;
    use std::path::Path;

    fn change(path: &str) -> ChangeEvent {
        ChangeEvent::new(path, EventKind::Modified)
    }

    #[test]
    fn test_settles_after_quiet_period() {
        let mut debouncer = Debouncer::from_millis(50);
        let t0 = Instant::now();

        debouncer.record_at(change("/cfg/tables/aliases"), t0);

        assert!(debouncer.take_settled(t0).is_none());
        assert!(
            debouncer
                .take_settled(t0 + Duration::from_millis(49))
                .is_none()
        );

        let burst = debouncer
            .take_settled(t0 + Duration::from_millis(50))
            .unwrap();
        assert_eq!(burst.len(), 1);
        assert!(burst.contains(Path::new("/cfg/tables/aliases")));
        assert!(!debouncer.has_pending());
        assert!(debouncer.deadline().is_none());
    }

    #[test]
    fn test_new_event_resets_deadline() {
        let mut debouncer = Debouncer::from_millis(50);
        let t0 = Instant::now();

        debouncer.record_at(change("/cfg/a"), t0);
        debouncer.record_at(change("/cfg/b"), t0 + Duration::from_millis(30));

        // 60ms after the first event, only 30ms after the second.
        assert!(
            debouncer
                .take_settled(t0 + Duration::from_millis(60))
                .is_none()
        );
        assert_eq!(
            debouncer.deadline(),
            Some(t0 + Duration::from_millis(80))
        );

        let burst = debouncer
            .take_settled(t0 + Duration::from_millis(80))
            .unwrap();
        let paths: Vec<&Path> = burst.paths().collect();
        assert_eq!(paths, vec![Path::new("/cfg/a"), Path::new("/cfg/b")]);
    }

    #[test]
    fn test_duplicate_paths_keep_one_representative() {
        let mut debouncer = Debouncer::from_millis(10);
        let t0 = Instant::now();

        debouncer.record_at(ChangeEvent::new("/cfg/x", EventKind::Created), t0);
        debouncer.record_at(ChangeEvent::new("/cfg/y", EventKind::Created), t0);
        debouncer.record_at(ChangeEvent::new("/cfg/x", EventKind::Modified), t0);

        let burst = debouncer
            .take_settled(t0 + Duration::from_millis(10))
            .unwrap();
        assert_eq!(burst.len(), 2);
        assert_eq!(burst.event_count(), 3);
        let first = burst.events().next().unwrap();
        assert_eq!(first.path, PathBuf::from("/cfg/x"));
        assert_eq!(first.kind, EventKind::Modified);
    }

    #[test]
    fn test_cancel_drops_pending() {
        let mut debouncer = Debouncer::from_millis(10);
        let t0 = Instant::now();

        debouncer.record_at(change("/cfg/a"), t0);
        debouncer.record_at(change("/cfg/b"), t0);

        assert_eq!(debouncer.cancel(), 2);
        assert!(
            debouncer
                .take_settled(t0 + Duration::from_secs(1))
                .is_none()
        );
    }

    /// Feed `(offset_secs, path)` pairs through `observe` on the paused clock
    /// and collect bursts with their settle offsets.
    async fn run_schedule(quiet_secs: u64, schedule: Vec<(u64, &'static str)>) -> Vec<(u64, Burst)> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (burst_tx, mut burst_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let start = Instant::now();

        let debouncer = Debouncer::new(Duration::from_secs(quiet_secs));
        let task = tokio::spawn(debouncer.observe(event_rx, burst_tx, shutdown.clone()));

        tokio::spawn(async move {
            for (offset, path) in schedule {
                sleep_until(start + Duration::from_secs(offset)).await;
                let _ = event_tx.send(change(path)).await;
            }
        });

        let mut out = Vec::new();
        while let Some(burst) = burst_rx.recv().await {
            let offset = burst.settled_at().duration_since(start).as_secs();
            out.push((offset, burst));
        }
        task.await.unwrap();
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_events_never_coalesce() {
        let bursts = run_schedule(5, vec![(0, "/cfg/a"), (5, "/cfg/b"), (12, "/cfg/c")]).await;

        assert_eq!(bursts.len(), 3);
        for (_, burst) in &bursts {
            assert_eq!(burst.len(), 1);
        }
        let offsets: Vec<u64> = bursts.iter().map(|(t, _)| *t).collect();
        assert_eq!(offsets, vec![5, 10, 17]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_events_form_one_burst() {
        let bursts = run_schedule(
            5,
            vec![(0, "/cfg/a"), (1, "/cfg/b"), (3, "/cfg/c"), (7, "/cfg/d")],
        )
        .await;

        assert_eq!(bursts.len(), 1);
        let (settled, burst) = &bursts[0];
        assert_eq!(*settled, 12);
        assert_eq!(burst.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_unsettled_burst() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (burst_tx, mut burst_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(Debouncer::from_millis(5_000).observe(
            event_rx,
            burst_tx,
            shutdown.clone(),
        ));

        event_tx.send(change("/cfg/a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert!(burst_rx.recv().await.is_none());
    }
}
