//! Event, burst and watch-spec types shared by the watcher pipeline.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Kind of filesystem change reported by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    MovedFrom,
    MovedTo,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 5] = [
        EventKind::Created,
        EventKind::Modified,
        EventKind::Deleted,
        EventKind::MovedFrom,
        EventKind::MovedTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
            EventKind::MovedFrom => "moved_from",
            EventKind::MovedTo => "moved_to",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to watch. Immutable for the lifetime of a watcher.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    root: PathBuf,
    exclude: HashSet<PathBuf>,
    kinds: HashSet<EventKind>,
}

impl WatchSpec {
    /// Watch `root` for every event kind, excluding nothing.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclude: HashSet::new(),
            kinds: EventKind::ALL.into_iter().collect(),
        }
    }

    /// Exclude paths. Relative entries are resolved against the root.
    pub fn exclude<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            let path = path.as_ref();
            let resolved = if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.root.join(path)
            };
            self.exclude.insert(resolved);
        }
        self
    }

    /// Restrict the event kinds that are reported.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn excluded_paths(&self) -> &HashSet<PathBuf> {
        &self.exclude
    }

    /// Exact-match exclusion check.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.contains(path)
    }

    pub fn wants(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Whether an event for `path` with `kind` should be reported.
    pub fn accepts(&self, path: &Path, kind: EventKind) -> bool {
        self.wants(kind) && !self.is_excluded(path)
    }
}

/// A single observed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: EventKind,
    pub observed_at: Instant,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: EventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Instant::now(),
        }
    }
}

/// A settled group of changes.
///
/// Paths are kept in first-seen order with the latest event per path, so
/// every distinct path seen before the settle point is represented once.
#[derive(Debug, Clone)]
pub struct Burst {
    events: IndexMap<PathBuf, ChangeEvent>,
    event_count: usize,
    started_at: Instant,
    settled_at: Instant,
}

impl Burst {
    pub(crate) fn new(
        events: IndexMap<PathBuf, ChangeEvent>,
        event_count: usize,
        started_at: Instant,
        settled_at: Instant,
    ) -> Self {
        Self {
            events,
            event_count,
            started_at,
            settled_at,
        }
    }

    /// Distinct paths in first-seen order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.events.keys().map(PathBuf::as_path)
    }

    /// Latest event for each distinct path.
    pub fn events(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.values()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.events.contains_key(path)
    }

    /// Number of distinct paths.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of raw events folded into this burst.
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn settled_at(&self) -> Instant {
        self.settled_at
    }
}

/// What caused an action to run.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// A settled burst of changes.
    Burst(Burst),
    /// An explicit request to rebuild everything.
    FullRebuild,
}

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Burst(_) => "burst",
            Trigger::FullRebuild => "full-rebuild",
        }
    }
}
