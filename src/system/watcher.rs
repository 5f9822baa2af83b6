// src/system/watcher.rs

//! Recursive file watching with glob filters and per-path debouncing.
//!
//! Raw OS events arrive on notify's callback thread and are forwarded to a
//! *collector* thread, which filters them and feeds the [`Debouncer`]. A
//! *producer* thread drains paths whose events have settled and hands them to
//! the subscriber callback.

use crate::{
    core::cache::{self, FileFingerprint},
    models::{WatchKind, WatchRoot},
};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Invalid watch glob '{glob}': {source}")]
    Glob {
        glob: String,
        #[source]
        source: globset::Error,
    },
    #[error("Could not watch '{path}': {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("Watcher failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Modified,
    Created,
    Deleted,
    Moved,
}

/// One settled change of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: EventKind,
    /// The kind of root the path was matched under.
    pub root: WatchKind,
    /// Some raw event for this path arrived while the watcher was paused.
    pub during_pause: bool,
    /// Some raw event for this path arrived while a shell command was running.
    pub during_command: bool,
}

/// What the subscriber receives.
#[derive(Debug)]
pub enum WatchSignal {
    Changes(Vec<FileEvent>),
    /// The backend failed and could not be re-subscribed.
    Failed(WatchError),
}

pub type WatchCallback = Arc<dyn Fn(WatchSignal) + Send + Sync>;

// --- Filtering ---

#[derive(Debug)]
struct RootFilter {
    path: PathBuf,
    kind: WatchKind,
    include: GlobSet,
    exclude: GlobSet,
}

/// Include/exclude glob sets per watch root. Globs match the path relative
/// to the root, and `*` does not cross `/`.
#[derive(Debug, Default)]
pub struct Filter {
    roots: Vec<RootFilter>,
}

fn glob_set(globs: &[String]) -> Result<GlobSet, WatchError> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        let compiled: Glob = GlobBuilder::new(glob)
            .literal_separator(true)
            .build()
            .map_err(|source| WatchError::Glob {
                glob: glob.clone(),
                source,
            })?;
        builder.add(compiled);
    }
    builder.build().map_err(|source| WatchError::Glob {
        glob: globs.join(", "),
        source,
    })
}

impl Filter {
    pub fn new(spec: &[WatchRoot]) -> Result<Self, WatchError> {
        let roots = spec
            .iter()
            .map(|root| {
                Ok(RootFilter {
                    path: dunce::canonicalize(&root.path).unwrap_or_else(|_| root.path.clone()),
                    kind: root.kind,
                    include: glob_set(&root.include)?,
                    exclude: glob_set(&root.exclude)?,
                })
            })
            .collect::<Result<Vec<_>, WatchError>>()?;
        Ok(Self { roots })
    }

    /// The kind of the first root that includes `path`, if any does.
    pub fn classify(&self, path: &Path) -> Option<WatchKind> {
        self.roots.iter().find_map(|root| {
            let relative = path.strip_prefix(&root.path).ok()?;
            if relative.as_os_str().is_empty() || root.exclude.is_match(relative) {
                return None;
            }
            root.include.is_match(relative).then_some(root.kind)
        })
    }

    /// Root directories to subscribe to, skipping ones nested in another.
    fn subscription_roots(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut sorted: Vec<&PathBuf> = self.roots.iter().map(|r| &r.path).collect();
        sorted.sort();
        sorted.dedup();
        for path in sorted {
            if !paths.iter().any(|p| path.starts_with(p)) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

// --- Debouncing ---

#[derive(Debug)]
struct PendingEvent {
    event: FileEvent,
    last_seen: Instant,
}

/// Collapses events on the same path until the path has been quiet for the
/// debounce window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: BTreeMap<PathBuf, PendingEvent>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, event: FileEvent, now: Instant) {
        match self.pending.get_mut(&event.path) {
            Some(pending) => {
                pending.event.kind = merge_kind(pending.event.kind, event.kind);
                pending.event.during_pause |= event.during_pause;
                pending.event.during_command |= event.during_command;
                pending.last_seen = now;
            }
            None => {
                self.pending.insert(
                    event.path.clone(),
                    PendingEvent {
                        event,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Removes and returns every event that has settled by `now`, by path.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<FileEvent> {
        let window = self.window;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|p| p.event))
            .collect()
    }

    /// When the earliest pending event settles.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.last_seen + self.window).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn merge_kind(previous: EventKind, next: EventKind) -> EventKind {
    match (previous, next) {
        (EventKind::Created, EventKind::Modified) => EventKind::Created,
        (EventKind::Deleted, EventKind::Created) => EventKind::Modified,
        (_, next) => next,
    }
}

fn convert(event: &notify::Event) -> Vec<(PathBuf, EventKind)> {
    use notify::event::{EventKind as Raw, ModifyKind};
    let kind = match event.kind {
        Raw::Create(_) => EventKind::Created,
        Raw::Modify(ModifyKind::Name(_)) => EventKind::Moved,
        Raw::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        Raw::Modify(_) => EventKind::Modified,
        Raw::Remove(_) => EventKind::Deleted,
        _ => return Vec::new(),
    };
    event.paths.iter().map(|p| (p.clone(), kind)).collect()
}

// --- The watcher ---

enum Raw {
    Notify(notify::Result<notify::Event>),
    Stop,
}

#[derive(Debug, Default)]
struct Queue {
    failures: Vec<WatchError>,
    stopped: bool,
}

struct Shared {
    filter: RwLock<Filter>,
    spec: RwLock<Vec<WatchRoot>>,
    debouncer: Mutex<(Debouncer, Queue)>,
    wake: Condvar,
    paused: AtomicBool,
    command_running: Arc<AtomicBool>,
    backend: Mutex<Option<RecommendedWatcher>>,
    raw_tx: Mutex<mpsc::Sender<Raw>>,
    fingerprints: Mutex<HashMap<PathBuf, FileFingerprint>>,
}

impl Shared {
    /// Replaces the OS subscription and the filter. The previous backend is
    /// dropped, which unsubscribes it.
    fn subscribe(&self, spec: &[WatchRoot]) -> Result<(), WatchError> {
        let filter = Filter::new(spec)?;
        let tx = self
            .raw_tx
            .lock()
            .map_err(|_| WatchError::Backend("event channel poisoned".to_string()))?
            .clone();
        let mut backend = notify::recommended_watcher(move |res| {
            tx.send(Raw::Notify(res)).ok();
        })
        .map_err(|source| WatchError::Notify {
            path: PathBuf::new(),
            source,
        })?;

        for path in filter.subscription_roots() {
            if !path.is_dir() {
                log::debug!("Watch root '{}' does not exist, skipped.", path.display());
                continue;
            }
            backend
                .watch(&path, RecursiveMode::Recursive)
                .map_err(|source| WatchError::Notify {
                    path: path.clone(),
                    source,
                })?;
            log::debug!("Watching '{}'.", path.display());
        }

        if let Ok(mut slot) = self.backend.lock() {
            *slot = Some(backend);
        }
        if let Ok(mut current) = self.filter.write() {
            *current = filter;
        }
        if let Ok(mut current) = self.spec.write() {
            *current = spec.to_vec();
        }
        Ok(())
    }

    /// Modified events whose file content did not change are spurious.
    fn is_spurious(&self, path: &Path, kind: EventKind) -> bool {
        let Ok(mut known) = self.fingerprints.lock() else {
            return false;
        };
        if kind == EventKind::Deleted {
            known.remove(path);
            return false;
        }
        let Ok(fingerprint) = cache::calculate_fingerprint(path) else {
            return false;
        };
        let same = known.get(path).is_some_and(|old| old.same_content(&fingerprint));
        known.insert(path.to_path_buf(), fingerprint);
        same && kind == EventKind::Modified
    }
}

/// A running watcher. Dropping it stops both threads.
pub struct FileWatcher {
    shared: Arc<Shared>,
    collector: Option<JoinHandle<()>>,
    producer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl FileWatcher {
    /// Subscribes to `spec` and starts the collector and producer threads.
    ///
    /// `command_running` is sampled for every raw event to set
    /// [`FileEvent::during_command`].
    pub fn start(
        spec: &[WatchRoot],
        debounce: Duration,
        command_running: Arc<AtomicBool>,
        callback: WatchCallback,
    ) -> Result<Self, WatchError> {
        let (raw_tx, raw_rx) = mpsc::channel::<Raw>();
        let shared = Arc::new(Shared {
            filter: RwLock::new(Filter::default()),
            spec: RwLock::new(Vec::new()),
            debouncer: Mutex::new((Debouncer::new(debounce), Queue::default())),
            wake: Condvar::new(),
            paused: AtomicBool::new(false),
            command_running,
            backend: Mutex::new(None),
            raw_tx: Mutex::new(raw_tx),
            fingerprints: Mutex::new(HashMap::new()),
        });
        shared.subscribe(spec)?;

        let collector = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("watcher-collector".to_string())
                .spawn(move || collect(&shared, &raw_rx))
                .map_err(|e| WatchError::Backend(e.to_string()))?
        };
        let producer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("watcher-producer".to_string())
                .spawn(move || produce(&shared, &callback))
                .map_err(|e| WatchError::Backend(e.to_string()))?
        };

        Ok(Self {
            shared,
            collector: Some(collector),
            producer: Some(producer),
        })
    }

    /// Swaps the watched roots in place. Safe to call from the callback.
    pub fn resubscribe(&self, spec: &[WatchRoot]) -> Result<(), WatchError> {
        self.shared.subscribe(spec)
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Stops both threads and waits for them.
    pub fn shutdown(&mut self) {
        if let Ok(mut slot) = self.shared.backend.lock() {
            slot.take();
        }
        if let Ok(tx) = self.shared.raw_tx.lock() {
            tx.send(Raw::Stop).ok();
        }
        if let Ok(mut guard) = self.shared.debouncer.lock() {
            guard.1.stopped = true;
        }
        self.shared.wake.notify_all();
        for handle in [self.collector.take(), self.producer.take()].into_iter().flatten() {
            handle.join().ok();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn collect(shared: &Shared, raw_rx: &mpsc::Receiver<Raw>) {
    while let Ok(raw) = raw_rx.recv() {
        let event = match raw {
            Raw::Stop => break,
            Raw::Notify(Ok(event)) => event,
            Raw::Notify(Err(e)) => {
                log::warn!("Watcher error: {}. Re-subscribing.", e);
                let spec = shared.spec.read().map(|s| s.clone()).unwrap_or_default();
                if let Err(e) = shared.subscribe(&spec) {
                    if let Ok(mut guard) = shared.debouncer.lock() {
                        guard.1.failures.push(e);
                    }
                    shared.wake.notify_all();
                }
                continue;
            }
        };

        let during_pause = shared.paused.load(Ordering::SeqCst);
        let during_command = shared.command_running.load(Ordering::SeqCst);
        let now = Instant::now();
        let accepted: Vec<FileEvent> = {
            let Ok(filter) = shared.filter.read() else {
                continue;
            };
            convert(&event)
                .into_iter()
                .filter_map(|(path, kind)| {
                    filter.classify(&path).map(|root| FileEvent {
                        path,
                        kind,
                        root,
                        during_pause,
                        during_command,
                    })
                })
                .collect()
        };
        if accepted.is_empty() {
            continue;
        }
        if let Ok(mut guard) = shared.debouncer.lock() {
            for event in accepted {
                guard.0.push(event, now);
            }
        }
        shared.wake.notify_all();
    }
}

fn produce(shared: &Shared, callback: &WatchCallback) {
    loop {
        let (events, failures) = {
            let Ok(mut guard) = shared.debouncer.lock() else {
                return;
            };
            loop {
                if guard.1.stopped {
                    return;
                }
                let now = Instant::now();
                let ready = guard.0.drain_ready(now);
                if !ready.is_empty() || !guard.1.failures.is_empty() {
                    break (ready, std::mem::take(&mut guard.1.failures));
                }
                let timeout = guard
                    .0
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or(Duration::from_secs(1));
                guard = match shared.wake.wait_timeout(guard, timeout) {
                    Ok((guard, _)) => guard,
                    Err(_) => return,
                };
            }
        };

        for failure in failures {
            callback(WatchSignal::Failed(failure));
        }
        let events: Vec<FileEvent> = events
            .into_iter()
            .filter(|e| !shared.is_spurious(&e.path, e.kind))
            .collect();
        if !events.is_empty() {
            log::debug!("{} settled file event(s).", events.len());
            callback(WatchSignal::Changes(events));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn root(path: &Path, kind: WatchKind, include: &[&str], exclude: &[&str]) -> WatchRoot {
        WatchRoot {
            path: path.to_path_buf(),
            kind,
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn event(path: &str, kind: EventKind) -> FileEvent {
        FileEvent {
            path: PathBuf::from(path),
            kind,
            root: WatchKind::Definition,
            during_pause: false,
            during_command: false,
        }
    }

    #[test]
    fn test_filter_include_exclude() {
        let filter = Filter::new(&[
            root(
                Path::new("/p"),
                WatchKind::Definition,
                &["env_*.toml", "config/**/*.toml"],
                &["**/.*", "build/**"],
            ),
            root(Path::new("/p/lib"), WatchKind::Sources, &["**/*.stm"], &[]),
        ])
        .unwrap();

        assert_eq!(filter.classify(Path::new("/p/env_local.toml")), Some(WatchKind::Definition));
        assert_eq!(filter.classify(Path::new("/p/config/a/b.toml")), Some(WatchKind::Definition));
        assert_eq!(filter.classify(Path::new("/p/sub/env_local.toml")), None);
        assert_eq!(filter.classify(Path::new("/p/.env_local.toml")), None);
        assert_eq!(filter.classify(Path::new("/p/build/config/x.toml")), None);
        assert_eq!(filter.classify(Path::new("/p/lib/pkg/car.stm")), Some(WatchKind::Sources));
        assert_eq!(filter.classify(Path::new("/elsewhere/env_local.toml")), None);
        assert_eq!(filter.subscription_roots(), vec![PathBuf::from("/p")]);
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let err = Filter::new(&[root(Path::new("/p"), WatchKind::Definition, &["a[b"], &[])]).unwrap_err();
        assert!(matches!(err, WatchError::Glob { .. }));
    }

    #[test]
    fn test_debouncer_coalesces_per_path() {
        let start = Instant::now();
        let window = Duration::from_millis(100);
        let mut debouncer = Debouncer::new(window);

        debouncer.push(event("/p/a", EventKind::Created), start);
        debouncer.push(event("/p/a", EventKind::Modified), start + Duration::from_millis(50));
        let mut during = event("/p/a", EventKind::Modified);
        during.during_command = true;
        debouncer.push(during, start + Duration::from_millis(90));
        debouncer.push(event("/p/b", EventKind::Modified), start + Duration::from_millis(10));

        assert!(debouncer.drain_ready(start + Duration::from_millis(100)).is_empty());
        let ready = debouncer.drain_ready(start + Duration::from_millis(120));
        assert_eq!(ready, vec![event("/p/b", EventKind::Modified)]);

        assert_eq!(debouncer.next_deadline(), Some(start + Duration::from_millis(190)));
        let ready = debouncer.drain_ready(start + Duration::from_millis(190));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].kind, EventKind::Created);
        assert!(ready[0].during_command);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_delete_then_create_is_a_modification() {
        assert_eq!(merge_kind(EventKind::Deleted, EventKind::Created), EventKind::Modified);
        assert_eq!(merge_kind(EventKind::Modified, EventKind::Deleted), EventKind::Deleted);
    }

    #[test]
    fn test_watcher_emits_one_event_per_settled_change() {
        let dir = tempdir().unwrap();
        let base = dunce::canonicalize(dir.path()).unwrap();
        let (tx, rx) = mpsc::channel();
        let callback: WatchCallback = Arc::new(move |signal| {
            if let WatchSignal::Changes(events) = signal {
                tx.send(events).ok();
            }
        });

        let mut watcher = FileWatcher::start(
            &[root(&base, WatchKind::Definition, &["env_*.toml"], &["**/.*"])],
            Duration::from_millis(100),
            Arc::new(AtomicBool::new(false)),
            callback,
        )
        .unwrap();

        let file = base.join("env_local.toml");
        for i in 0..3 {
            fs::write(&file, format!("# {}\n", i)).unwrap();
        }
        fs::write(base.join("notes.txt"), "ignored").unwrap();

        let events = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, file);
        watcher.shutdown();
    }
}
