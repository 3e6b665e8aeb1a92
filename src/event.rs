//! Normalized change events and watch handles

use std::fmt;
use std::path::PathBuf;

/// Platform-native representation of a watch handle.
///
/// POSIX watch primitives hand out small integers (an inotify watch
/// descriptor or a kqueue file descriptor); Windows hands out a native
/// handle value that may exceed 32 bits.
#[cfg(windows)]
pub type RawHandle = u64;

/// Platform-native representation of a watch handle.
#[cfg(not(windows))]
pub type RawHandle = i32;

/// Opaque identifier for one registered watch.
///
/// Returned by [`Session::watch`](crate::Session::watch) and accepted by
/// [`Session::unwatch`](crate::Session::unwatch). Unique among the live
/// watches of one notification source; the OS may reuse the underlying
/// value after a watch is removed, so a handle must never be treated as
/// live past its explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(RawHandle);

impl WatchHandle {
    pub(crate) fn from_raw(raw: RawHandle) -> Self {
        WatchHandle(raw)
    }

    /// The platform-native handle value.
    pub fn raw(self) -> RawHandle {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of change a [`Event`] describes.
///
/// The `Child*` variants describe a change to an entry inside a watched
/// directory; the plain variants describe a change to the watched entity
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Delete,
    Change,
    Rename,
    ChildCreate,
    ChildDelete,
    ChildChange,
    ChildRename,
    /// Reserved for raw notifications the engine cannot classify.
    Unknown,
}

impl EventKind {
    /// The wire string delivered to host bindings.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Delete => "delete",
            EventKind::Change => "change",
            EventKind::Rename => "rename",
            EventKind::ChildCreate => "child-create",
            EventKind::ChildDelete => "child-delete",
            EventKind::ChildChange => "child-change",
            EventKind::ChildRename => "child-rename",
            EventKind::Unknown => "unknown",
        }
    }

    /// True for the child-of-watched-directory variants.
    pub fn is_child(self) -> bool {
        matches!(
            self,
            EventKind::ChildCreate
                | EventKind::ChildDelete
                | EventKind::ChildChange
                | EventKind::ChildRename
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized change notification.
///
/// Constructed by the notification loop, moved through the event channel,
/// and handed to the session's callback exactly once. Immutable after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Handle of the watch this event belongs to.
    pub handle: WatchHandle,
    /// Affected path. For child events this is the watched directory joined
    /// with the reported entry name; for events on the watched entity itself
    /// it is the watched path (for renames, the resolved post-rename path
    /// where the platform can report it).
    pub new_path: PathBuf,
    /// Pre-rename path; present only for rename events.
    pub old_path: Option<PathBuf>,
}
