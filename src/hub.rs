//! SourceHub: owns the platform source, the notification thread, and the
//! routing tables
//!
//! A hub lazily constructs one platform source and runs at most one
//! notification thread over it. The thread exists exactly while the total
//! watch count is above zero: the watch that takes it 0→1 spawns the
//! thread, the removal that takes it back to zero signals the stop flag
//! and joins. Every session using the hub registers an event route keyed
//! by its session id; raw events are resolved against the registry and
//! forwarded to the owning session's channel only.
//!
//! The hub mutex guards the registry, the routes, and the worker slot. It
//! is held for those critical sections only, never across `poll`, and the
//! join on the notification thread happens after the lock is released so
//! an in-flight delivery can finish with a clean drop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::channel::EventChannel;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, WatchHandle};
use crate::platform::{RawAction, RawEvent, Source};
use crate::registry::{Listener, SessionId, WatchRegistry};

/// Upper bound on how stale a stop request can go unnoticed.
pub(crate) const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// The platform source is constructed on first use; a failed construction
/// is remembered so every later watch attempt fails fast with the same
/// code instead of hammering the OS.
enum SourceState {
    Idle,
    Ready(Arc<Source>),
    Failed(i32),
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

struct HubInner {
    source: SourceState,
    registry: WatchRegistry,
    routes: HashMap<SessionId, EventChannel>,
    worker: Option<Worker>,
}

impl HubInner {
    fn ensure_source(&mut self) -> Result<Arc<Source>> {
        match &self.source {
            SourceState::Ready(source) => Ok(Arc::clone(source)),
            SourceState::Failed(errno) => Err(Error::Init { errno: *errno }),
            SourceState::Idle => match Source::init() {
                Ok(source) => {
                    let source = Arc::new(source);
                    self.source = SourceState::Ready(Arc::clone(&source));
                    Ok(source)
                }
                Err(err) => {
                    self.source = SourceState::Failed(err.os_error_code().unwrap_or(0));
                    Err(err)
                }
            },
        }
    }
}

/// Shared notification source and its single background loop.
///
/// A [`Session`](crate::Session) created with [`Session::new`](crate::Session::new)
/// owns a private hub; pass an `Arc<SourceHub>` to
/// [`Session::with_hub`](crate::Session::with_hub) to share one OS source
/// (and one notification thread) across sessions.
pub struct SourceHub {
    inner: Mutex<HubInner>,
    poll_timeout: Duration,
    next_session: AtomicU64,
}

impl Default for SourceHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceHub {
    pub fn new() -> Self {
        Self::with_poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    /// A hub whose notification loop wakes at least every `poll_timeout`.
    /// Shorter timeouts tighten stop latency at the cost of more wakeups.
    pub fn with_poll_timeout(poll_timeout: Duration) -> Self {
        SourceHub {
            inner: Mutex::new(HubInner {
                source: SourceState::Idle,
                registry: WatchRegistry::new(),
                routes: HashMap::new(),
                worker: None,
            }),
            poll_timeout,
            next_session: AtomicU64::new(1),
        }
    }

    /// Total live watches across all sessions on this hub.
    pub fn watch_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Whether the notification thread is currently running.
    pub fn loop_running(&self) -> bool {
        self.lock().worker.is_some()
    }

    pub(crate) fn allocate_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_route(&self, session: SessionId, channel: EventChannel) {
        self.lock().routes.insert(session, channel);
    }

    pub(crate) fn session_watch_count(&self, session: SessionId) -> usize {
        self.lock().registry.session_count(session)
    }

    /// Associated rather than a method because the notification thread
    /// needs its own `Arc` back to the hub.
    pub(crate) fn watch(
        hub: &Arc<SourceHub>,
        session: SessionId,
        path: &Path,
    ) -> Result<WatchHandle> {
        let mut inner = hub.lock();
        let source = inner.ensure_source()?;
        let handle = source.add_watch(path)?;
        let is_dir = path.metadata().map(|meta| meta.is_dir()).unwrap_or(false);

        let listener = Listener {
            session,
            path: path.to_path_buf(),
            is_dir,
        };
        // A second session watching the same path on a shared source may
        // get the same handle back; the registry tracks both owners and the
        // OS watch is released only when the last one unwatches.
        if let Some(old) = inner.registry.insert(handle, listener) {
            debug!(
                "session {session} re-watched `{}`; superseding its listener on handle {handle}",
                old.path.display()
            );
        }

        if inner.worker.is_none() {
            let stop = Arc::new(AtomicBool::new(false));
            let spawned = thread::Builder::new()
                .name("pathwatch-notify".into())
                .spawn({
                    let hub = Arc::clone(hub);
                    let source = Arc::clone(&source);
                    let stop = Arc::clone(&stop);
                    move || notification_loop(hub, source, stop)
                });
            match spawned {
                Ok(handle_thread) => {
                    inner.worker = Some(Worker {
                        stop,
                        thread: handle_thread,
                    });
                }
                Err(err) => {
                    inner.registry.remove(handle, session);
                    if !inner.registry.is_watched(handle) {
                        source.remove_watch(handle);
                    }
                    return Err(Error::Watch {
                        path: path.to_path_buf(),
                        errno: err.raw_os_error().unwrap_or(0),
                    });
                }
            }
        }

        trace!("watch {handle} -> `{}`", path.display());
        Ok(handle)
    }

    /// Unknown handles and handles owned by another session are a no-op;
    /// stale-handle tolerance is part of the contract.
    pub(crate) fn unwatch(&self, session: SessionId, handle: WatchHandle) {
        let worker = {
            let mut inner = self.lock();
            if inner.registry.remove(handle, session).is_none() {
                trace!("unwatch of unknown handle {handle}; ignoring");
                return;
            }
            // Another session may still own this handle; the OS watch goes
            // away only with its last owner.
            if !inner.registry.is_watched(handle) {
                if let SourceState::Ready(source) = &inner.source {
                    source.remove_watch(handle);
                }
            }
            trace!("unwatch {handle}");
            if inner.registry.is_empty() {
                inner.worker.take()
            } else {
                None
            }
        };
        if let Some(worker) = worker {
            stop_worker(worker);
        }
    }

    /// Bulk teardown for a session: drops all of its watches, closes its
    /// event route, and stops the loop when no watches remain.
    pub(crate) fn remove_session(&self, session: SessionId) {
        let worker = {
            let mut inner = self.lock();
            let removed = inner.registry.remove_session(session);
            if let SourceState::Ready(source) = &inner.source {
                for (handle, _) in &removed {
                    if !inner.registry.is_watched(*handle) {
                        source.remove_watch(*handle);
                    }
                }
            }
            if let Some(route) = inner.routes.remove(&session) {
                route.close();
            }
            if inner.registry.is_empty() {
                inner.worker.take()
            } else {
                None
            }
        };
        if let Some(worker) = worker {
            stop_worker(worker);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stop_worker(worker: Worker) {
    worker.stop.store(true, Ordering::SeqCst);
    if worker.thread.join().is_err() {
        warn!("notification thread panicked during shutdown");
    }
}

fn notification_loop(hub: Arc<SourceHub>, source: Arc<Source>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let raws = match source.poll(hub.poll_timeout) {
            Ok(raws) => raws,
            Err(err) => {
                warn!("notification loop stopping after poll failure: {err}");
                return;
            }
        };
        if raws.is_empty() {
            continue;
        }

        let inner = hub.lock();
        for raw in raws {
            let owners = inner.registry.owners(raw.handle);
            if owners.is_empty() {
                // Removed while the event was in flight.
                trace!("dropping event for stale handle {}", raw.handle);
                continue;
            }
            // One OS event fans out to every session owning the handle.
            for listener in owners {
                let Some(event) = normalize(raw.clone(), listener) else {
                    continue;
                };
                if let Some(route) = inner.routes.get(&listener.session) {
                    route.send(event);
                }
            }
        }
    }
}

/// Turns a raw platform notification into the delivered event: child
/// classification against the listener's watched path, path annotation,
/// and the macOS spurious-create filter.
fn normalize(raw: RawEvent, listener: &Listener) -> Option<Event> {
    let handle = raw.handle;

    if let (Some(name), true) = (&raw.name, listener.is_dir) {
        let kind = match raw.action {
            RawAction::Create => EventKind::ChildCreate,
            RawAction::Delete => EventKind::ChildDelete,
            RawAction::Change => EventKind::ChildChange,
            RawAction::Rename => EventKind::ChildRename,
        };
        let new_path = listener.path.join(name);
        if kind == EventKind::ChildCreate && !fresh_creation(&new_path) {
            trace!("suppressing spurious create for `{}`", new_path.display());
            return None;
        }
        let old_path = raw.old_name.as_ref().map(|old| listener.path.join(old));
        return Some(Event {
            kind,
            handle,
            new_path,
            old_path,
        });
    }

    let kind = match raw.action {
        RawAction::Create => EventKind::Create,
        RawAction::Delete => EventKind::Delete,
        RawAction::Change => EventKind::Change,
        RawAction::Rename => EventKind::Rename,
    };
    let new_path = raw
        .resolved_path
        .unwrap_or_else(|| listener.path.clone());
    if kind == EventKind::Create && !fresh_creation(&new_path) {
        return None;
    }
    let old_path = (kind == EventKind::Rename).then(|| listener.path.clone());
    Some(Event {
        kind,
        handle,
        new_path,
        old_path,
    })
}

/// Files moved into a watched directory arrive as creates on some macOS
/// filesystems; a genuinely new file has matching birth and modification
/// times. Best effort, and a no-op elsewhere. Note the kqueue source
/// itself reports no create actions (directory contents are opaque to
/// `EVFILT_VNODE`), so on macOS this guards only creates synthesized
/// above the source, e.g. by an embedding layer's directory rescan.
#[cfg(target_os = "macos")]
fn fresh_creation(path: &Path) -> bool {
    crate::platform::is_fresh_creation(path)
}

#[cfg(not(target_os = "macos"))]
fn fresh_creation(_path: &Path) -> bool {
    true
}
