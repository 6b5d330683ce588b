//! Filesystem event source for the watched configuration tree.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use super::error::WatchError;
use super::event::{ChangeEvent, EventKind, WatchSpec};

/// Capacity of the channel between the notify thread and the async side.
const RAW_CHANNEL_CAPACITY: usize = 256;

/// Default pause between resubscription attempts.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// A lazy sequence of change events.
///
/// Implemented by [`EventSource`] for live filesystem events and by plain
/// channel receivers so the debouncer can be driven from anywhere.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next change, or `None` once the stream has ended.
    async fn next_change(&mut self) -> Option<ChangeEvent>;
}

#[async_trait]
impl ChangeStream for mpsc::Receiver<ChangeEvent> {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.recv().await
    }
}

/// Recursive watch over a directory tree.
///
/// Owns the notify subscription. If the OS handle is invalidated (root
/// deleted, event queue overflow) the source resubscribes on its own and
/// reports one synthetic change for the root so lost events still lead to
/// an action.
pub struct EventSource {
    spec: WatchSpec,
    raw_tx: mpsc::Sender<notify::Result<Event>>,
    raw_rx: mpsc::Receiver<notify::Result<Event>>,
    /// `None` while waiting to resubscribe.
    watcher: Option<notify::RecommendedWatcher>,
    ready: VecDeque<ChangeEvent>,
    resubscribe_delay: Duration,
}

impl EventSource {
    /// Start watching `spec.root()` recursively.
    ///
    /// Fails with [`WatchError::WatchSetup`] when the root is missing or not a
    /// directory.
    pub fn subscribe(spec: WatchSpec) -> Result<Self, WatchError> {
        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let watcher = open_watcher(&spec, raw_tx.clone())?;

        crate::log_event!("source", "watching", "{}", spec.root().display());

        Ok(Self {
            spec,
            raw_tx,
            raw_rx,
            watcher: Some(watcher),
            ready: VecDeque::new(),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        })
    }

    /// Set the pause between resubscription attempts.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    pub fn spec(&self) -> &WatchSpec {
        &self.spec
    }

    /// Next accepted change event.
    ///
    /// Cancel safe: dropping the future mid-resubscription resumes the
    /// attempt on the next call.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }

            if self.watcher.is_none() {
                self.resubscribe().await;
                continue;
            }

            match self.raw_rx.recv().await? {
                Ok(event) => self.handle_raw(event),
                Err(e) => {
                    let err = WatchError::WatchRuntime {
                        path: self.spec.root().to_path_buf(),
                        reason: e.to_string(),
                    };
                    if self.spec.root().is_dir() {
                        tracing::warn!("[source] {err}");
                    } else {
                        tracing::warn!("[source] {err}; resubscribing");
                        self.watcher = None;
                    }
                }
            }
        }
    }

    fn handle_raw(&mut self, event: Event) {
        if event.need_rescan() {
            let err = WatchError::WatchRuntime {
                path: self.spec.root().to_path_buf(),
                reason: "event queue overflowed".to_string(),
            };
            tracing::warn!("[source] {err}; resubscribing");
            self.watcher = None;
            return;
        }

        let lost = root_lost(&event, self.spec.root());

        self.ready.extend(translate(event, &self.spec));

        if let Some(reason) = lost {
            let err = WatchError::WatchRuntime {
                path: self.spec.root().to_path_buf(),
                reason: reason.to_string(),
            };
            tracing::warn!("[source] {err}; resubscribing");
            self.watcher = None;
        }
    }

    async fn resubscribe(&mut self) {
        loop {
            sleep(self.resubscribe_delay).await;

            match open_watcher(&self.spec, self.raw_tx.clone()) {
                Ok(watcher) => {
                    self.watcher = Some(watcher);
                    break;
                }
                Err(e) => {
                    crate::debug_event!("source", "waiting for root", "{e}");
                }
            }
        }

        crate::log_event!("source", "resubscribed", "{}", self.spec.root().display());

        let root = self.spec.root().to_path_buf();
        if self.spec.wants(EventKind::Modified) {
            self.ready
                .push_back(ChangeEvent::new(root, EventKind::Modified));
        }
    }
}

/// Whether `event` means the watched root inode is gone from `root`.
///
/// A root moved away keeps its old watch, so the new directory at the same
/// path would never be seen.
fn root_lost(event: &Event, root: &Path) -> Option<&'static str> {
    if !event.paths.iter().any(|p| p == root) {
        return None;
    }
    match event.kind {
        notify::EventKind::Remove(_) => Some("root directory removed"),
        notify::EventKind::Modify(ModifyKind::Name(_)) => Some("root directory renamed"),
        _ => None,
    }
}

#[async_trait]
impl ChangeStream for EventSource {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.next().await
    }
}

fn open_watcher(
    spec: &WatchSpec,
    tx: mpsc::Sender<notify::Result<Event>>,
) -> Result<notify::RecommendedWatcher, WatchError> {
    let root = spec.root();
    if !root.exists() {
        return Err(WatchError::WatchSetup {
            path: root.to_path_buf(),
            reason: "path does not exist".to_string(),
        });
    }
    if !root.is_dir() {
        return Err(WatchError::WatchSetup {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.blocking_send(res);
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| WatchError::WatchSetup {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

    Ok(watcher)
}

/// Map a raw notify event to accepted change events.
pub(crate) fn translate(event: Event, spec: &WatchSpec) -> Vec<ChangeEvent> {
    let Event { kind, paths, .. } = event;

    let mapped: Vec<(PathBuf, EventKind)> = match kind {
        notify::EventKind::Modify(ModifyKind::Name(mode)) => map_rename(paths, mode),
        other => match map_kind(other) {
            Some(kind) => paths.into_iter().map(|p| (p, kind)).collect(),
            None => Vec::new(),
        },
    };

    mapped
        .into_iter()
        .filter(|(path, kind)| {
            let accepted = spec.accepts(path, *kind);
            if !accepted {
                crate::debug_event!("source", "suppressed", "{kind} {}", path.display());
            }
            accepted
        })
        .map(|(path, kind)| ChangeEvent::new(path, kind))
        .collect()
}

fn map_kind(kind: notify::EventKind) -> Option<EventKind> {
    match kind {
        notify::EventKind::Create(_) => Some(EventKind::Created),
        notify::EventKind::Modify(ModifyKind::Metadata(_)) => None,
        notify::EventKind::Modify(_) => Some(EventKind::Modified),
        notify::EventKind::Remove(_) => Some(EventKind::Deleted),
        notify::EventKind::Access(_) => None,
        notify::EventKind::Any | notify::EventKind::Other => Some(EventKind::Modified),
    }
}

fn map_rename(paths: Vec<PathBuf>, mode: RenameMode) -> Vec<(PathBuf, EventKind)> {
    match mode {
        RenameMode::Both => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.first() {
                out.push((from.clone(), EventKind::MovedFrom));
            }
            if let Some(to) = paths.get(1) {
                out.push((to.clone(), EventKind::MovedTo));
            }
            out
        }
        RenameMode::From => paths.into_iter().map(|p| (p, EventKind::MovedFrom)).collect(),
        RenameMode::To => paths.into_iter().map(|p| (p, EventKind::MovedTo)).collect(),
        RenameMode::Any | RenameMode::Other => paths
            .into_iter()
            .map(|p| {
                let kind = if exists_no_follow(&p) {
                    EventKind::MovedTo
                } else {
                    EventKind::MovedFrom
                };
                (p, kind)
            })
            .collect(),
    }
}

fn exists_no_follow(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}
