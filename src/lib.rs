//! Structured filesystem change notifications.
//!
//! `pathwatch` watches files and directories and delivers create, delete,
//! change, and rename events to a registered callback, including the
//! `child-*` variants for entries inside a watched directory. It is the
//! core engine only: per-platform notification sources (inotify on Linux,
//! kqueue on macOS, `ReadDirectoryChangesW` on Windows), a registry of
//! live watches, a background notification thread that exists exactly
//! while something is watched, and a channel that moves events to the
//! consumer's dispatch thread.
//!
//! ```no_run
//! use pathwatch::Session;
//!
//! let mut session = Session::new();
//! session.set_callback(|event| {
//!     println!("{} {}", event.kind, event.new_path.display());
//! });
//! let handle = session.watch("/some/dir")?;
//! // ... events arrive on the callback ...
//! session.unwatch(handle);
//! # Ok::<(), pathwatch::Error>(())
//! ```
//!
//! Callbacks run on the session's own dispatch thread, never on the
//! notification thread, so a slow callback delays delivery but never
//! event capture. Several sessions can share one OS source by passing
//! the same [`SourceHub`] to [`Session::with_hub`]; routing stays strictly
//! per-session.
//!
//! Platform notes: POSIX watches files or directories directly; Windows
//! watching is directory-granular and rejects plain files. Events for one
//! path preserve the OS-reported order; there is no ordering guarantee
//! across paths.

mod channel;
mod error;
mod event;
mod hub;
mod platform;
mod registry;
mod session;

pub use error::{Error, Result};
pub use event::{Event, EventKind, RawHandle, WatchHandle};
pub use hub::SourceHub;
pub use session::Session;

/// Entry points for the fuzz targets; not part of the public API.
#[cfg(target_os = "linux")]
#[doc(hidden)]
pub mod fuzzing {
    /// Runs the inotify buffer parser over arbitrary bytes.
    pub fn parse_inotify_buffer(data: &[u8]) {
        let _ = crate::platform::parse_event_buffer(data);
    }
}
