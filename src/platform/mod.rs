//! Platform notification sources
//!
//! One implementation per OS family, each exposing the same surface:
//! `init` acquires the OS descriptor/queue, `add_watch`/`remove_watch`
//! register interest, and `poll` blocks up to a bounded timeout and yields
//! whatever raw events are ready. `add_watch` and `remove_watch` are safe
//! to call while another thread sits in `poll`.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::event::WatchHandle;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::Source;
#[cfg(target_os = "linux")]
pub(crate) use linux::parse_event_buffer;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub(crate) use macos::{is_fresh_creation, Source};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::Source;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("pathwatch supports Linux (inotify), macOS (kqueue), and Windows");

/// What the OS reported, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawAction {
    Create,
    Delete,
    Change,
    Rename,
}

/// One platform notification, consumed immediately by the notification
/// loop and never stored. A populated `name` marks a child event (an entry
/// inside the watched directory); without one the event describes the
/// watched entity itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEvent {
    pub handle: WatchHandle,
    pub action: RawAction,
    /// Entry name relative to the watched directory, for child events.
    pub name: Option<OsString>,
    /// Pre-rename entry name, for paired child renames.
    pub old_name: Option<OsString>,
    /// Post-rename absolute path, where the platform can resolve it
    /// (kqueue's `F_GETPATH`).
    pub resolved_path: Option<PathBuf>,
}

impl RawEvent {
    /// An event on the watched entity itself.
    pub fn on_self(handle: WatchHandle, action: RawAction) -> Self {
        RawEvent {
            handle,
            action,
            name: None,
            old_name: None,
            resolved_path: None,
        }
    }

    /// An event on an entry inside the watched directory.
    pub fn on_child(handle: WatchHandle, action: RawAction, name: OsString) -> Self {
        RawEvent {
            handle,
            action,
            name: Some(name),
            old_name: None,
            resolved_path: None,
        }
    }

    /// A paired rename of an entry inside the watched directory.
    pub fn child_rename(handle: WatchHandle, old_name: OsString, new_name: OsString) -> Self {
        RawEvent {
            handle,
            action: RawAction::Rename,
            name: Some(new_name),
            old_name: Some(old_name),
            resolved_path: None,
        }
    }

    /// A rename of the watched entity itself, with the resolved new path.
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    pub fn renamed(handle: WatchHandle, resolved_path: Option<PathBuf>) -> Self {
        RawEvent {
            handle,
            action: RawAction::Rename,
            name: None,
            old_name: None,
            resolved_path,
        }
    }
}
