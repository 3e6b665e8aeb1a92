//! Registry of live watches
//!
//! Maps each live handle to the sessions that own it and the paths they
//! registered. A handle usually has one owner, but a shared source can
//! hand two sessions the same handle for the same path (inotify returns
//! one watch descriptor per inode), so ownership is a list: every owner
//! keeps its own route, and the OS-level watch is released only when the
//! last owner is removed. The registry carries no lock of its own: the
//! hub's mutex guards every access, because handle removal races with
//! in-flight event delivery for that handle.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::event::WatchHandle;

/// Identifier of one logical watch owner (one embedding environment).
pub(crate) type SessionId = u64;

/// Per-watch state: a plain data association, no behavior.
#[derive(Debug, Clone)]
pub(crate) struct Listener {
    /// Session that owns this watch; events are routed only to its channel.
    pub session: SessionId,
    /// The path as registered, used to annotate and classify raw events.
    pub path: PathBuf,
    /// Whether the registered path was a directory at watch time. Child
    /// classification only applies to directory watches.
    pub is_dir: bool,
}

#[derive(Debug, Default)]
pub(crate) struct WatchRegistry {
    watches: HashMap<WatchHandle, Vec<Listener>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a handle→listener association. A session that already owns
    /// the handle has its listener replaced (watching the same path twice
    /// from one session yields the same handle) and the old one returned;
    /// a different session is added as a further owner.
    pub fn insert(&mut self, handle: WatchHandle, listener: Listener) -> Option<Listener> {
        let owners = self.watches.entry(handle).or_default();
        if let Some(existing) = owners
            .iter_mut()
            .find(|owned| owned.session == listener.session)
        {
            return Some(std::mem::replace(existing, listener));
        }
        owners.push(listener);
        None
    }

    /// Removes `session`'s ownership of `handle`, leaving other owners in
    /// place. `None` when the session does not own the handle.
    pub fn remove(&mut self, handle: WatchHandle, session: SessionId) -> Option<Listener> {
        let owners = self.watches.get_mut(&handle)?;
        let position = owners.iter().position(|owned| owned.session == session)?;
        let removed = owners.remove(position);
        if owners.is_empty() {
            self.watches.remove(&handle);
        }
        Some(removed)
    }

    /// All owners of `handle`, in registration order; empty when the
    /// handle is unknown or stale.
    pub fn owners(&self, handle: WatchHandle) -> &[Listener] {
        self.watches
            .get(&handle)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether any session still owns `handle`. The OS-level watch may be
    /// released only once this is false.
    pub fn is_watched(&self, handle: WatchHandle) -> bool {
        self.watches.contains_key(&handle)
    }

    /// Removes every watch owned by `session`, for bulk teardown. Handles
    /// with surviving owners stay registered.
    pub fn remove_session(&mut self, session: SessionId) -> Vec<(WatchHandle, Listener)> {
        let mut removed = Vec::new();
        self.watches.retain(|handle, owners| {
            if let Some(position) = owners.iter().position(|owned| owned.session == session) {
                removed.push((*handle, owners.remove(position)));
            }
            !owners.is_empty()
        });
        removed
    }

    /// Number of live watches owned by `session`.
    pub fn session_count(&self, session: SessionId) -> usize {
        self.watches
            .values()
            .flatten()
            .filter(|owned| owned.session == session)
            .count()
    }

    /// Total live watches; two sessions sharing one handle count twice.
    pub fn len(&self) -> usize {
        self.watches.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawHandle;

    fn listener(session: SessionId, path: &str) -> Listener {
        Listener {
            session,
            path: PathBuf::from(path),
            is_dir: true,
        }
    }

    fn handle(raw: i32) -> WatchHandle {
        WatchHandle::from_raw(raw as RawHandle)
    }

    #[test]
    fn test_insert_owners_remove() {
        let mut registry = WatchRegistry::new();
        assert!(registry.insert(handle(1), listener(7, "/a")).is_none());
        assert_eq!(registry.owners(handle(1)).len(), 1);
        assert!(registry.owners(handle(2)).is_empty());

        let removed = registry.remove(handle(1), 7).expect("listener present");
        assert_eq!(removed.path, PathBuf::from("/a"));
        assert!(registry.remove(handle(1), 7).is_none());
        assert!(!registry.is_watched(handle(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_session_rewatch_supersedes() {
        let mut registry = WatchRegistry::new();
        registry.insert(handle(1), listener(7, "/a"));
        let old = registry.insert(handle(1), listener(7, "/a"));
        assert_eq!(old.map(|l| l.session), Some(7));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.session_count(7), 1);
    }

    #[test]
    fn test_shared_handle_keeps_both_owners() {
        let mut registry = WatchRegistry::new();
        assert!(registry.insert(handle(1), listener(7, "/a")).is_none());
        assert!(registry.insert(handle(1), listener(9, "/a")).is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.session_count(7), 1);
        assert_eq!(registry.session_count(9), 1);
        assert_eq!(registry.owners(handle(1)).len(), 2);

        // Releasing one owner must not release the handle itself.
        registry.remove(handle(1), 9).expect("owner present");
        assert!(registry.is_watched(handle(1)));
        assert_eq!(registry.owners(handle(1))[0].session, 7);

        registry.remove(handle(1), 7).expect("owner present");
        assert!(!registry.is_watched(handle(1)));
    }

    #[test]
    fn test_remove_by_non_owner_is_rejected() {
        let mut registry = WatchRegistry::new();
        registry.insert(handle(1), listener(7, "/a"));
        assert!(registry.remove(handle(1), 9).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_session_is_selective() {
        let mut registry = WatchRegistry::new();
        registry.insert(handle(1), listener(7, "/a"));
        registry.insert(handle(1), listener(8, "/a"));
        registry.insert(handle(2), listener(8, "/b"));
        registry.insert(handle(3), listener(7, "/c"));
        assert_eq!(registry.session_count(7), 2);

        let removed = registry.remove_session(7);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.session_count(7), 0);
        // The shared handle survives through its remaining owner.
        assert!(registry.is_watched(handle(1)));
        assert_eq!(registry.owners(handle(1))[0].session, 8);
    }
}
