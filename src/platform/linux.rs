//! inotify-based notification source
//!
//! One inotify descriptor per source; watch descriptors double as the
//! engine's handles. The poll step waits on the descriptor with a bounded
//! timeout, reads one batch, and walks the packed `inotify_event` records.
//! `IN_MOVED_FROM`/`IN_MOVED_TO` pairs are matched by cookie within the
//! batch so a rename inside a watched directory surfaces as one event;
//! inotify never reports the destination of a move out of view, so an
//! unpaired `IN_MOVED_FROM` degrades to a child delete and a self-move to
//! a delete of the watched entity.

use std::ffi::{CString, OsString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::time::Duration;

use log::warn;

use super::{RawAction, RawEvent};
use crate::error::Error;
use crate::event::WatchHandle;

/// Needs to hold sizeof(inotify_event) + a filename per record.
const EVENT_BUFFER_SIZE: usize = 4096;

/// Fixed-size prefix of an inotify_event record: wd, mask, cookie, len.
const EVENT_HEADER_SIZE: usize = 16;

const WATCH_MASK: u32 = libc::IN_ATTRIB
    | libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MODIFY
    | libc::IN_MOVE
    | libc::IN_MOVE_SELF
    | libc::IN_DELETE_SELF;

#[derive(Debug)]
pub(crate) struct Source {
    fd: OwnedFd,
}

impl Source {
    pub fn init() -> Result<Self, Error> {
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Init {
                errno: last_errno(),
            });
        }
        Ok(Source {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn add_watch(&self, path: &Path) -> Result<WatchHandle, Error> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Watch {
            path: path.to_path_buf(),
            errno: libc::EINVAL,
        })?;
        let wd = unsafe {
            libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), WATCH_MASK)
        };
        if wd < 0 {
            return Err(Error::Watch {
                path: path.to_path_buf(),
                errno: last_errno(),
            });
        }
        Ok(WatchHandle::from_raw(wd))
    }

    /// Idempotent: the kernel reports EINVAL for a descriptor it no longer
    /// knows and we move on, matching OS watch-removal tolerance.
    pub fn remove_watch(&self, handle: WatchHandle) {
        unsafe {
            libc::inotify_rm_watch(self.fd.as_raw_fd(), handle.raw());
        }
    }

    /// Blocks up to `timeout` for the descriptor to become readable, then
    /// reads and parses one batch. `Ok(vec![])` on timeout or EINTR; `Err`
    /// only for fatal read failures.
    pub fn poll(&self, timeout: Duration) -> io::Result<Vec<RawEvent>> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(Vec::new());
        }

        let mut buf = [0u8; EVENT_BUFFER_SIZE];
        let read = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
            )
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "inotify descriptor closed",
            ));
        }
        Ok(parse_event_buffer(&buf[..read as usize]))
    }
}

/// One decoded inotify record.
struct Entry {
    wd: i32,
    mask: u32,
    cookie: u32,
    name: Option<OsString>,
}

/// Walks a packed inotify event buffer into raw engine events. Bounds are
/// checked on every record so truncated or garbage input yields whatever
/// prefix parses cleanly instead of a panic.
pub(crate) fn parse_event_buffer(buf: &[u8]) -> Vec<RawEvent> {
    let entries = decode_entries(buf);
    let mut consumed = vec![false; entries.len()];
    let mut events = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        if entry.mask & libc::IN_Q_OVERFLOW != 0 {
            warn!("inotify event queue overflowed; events were lost");
            continue;
        }
        // IN_IGNORED follows watch removal; the registry entry is already
        // gone by the time we would route it.
        if entry.mask & libc::IN_IGNORED != 0 {
            continue;
        }

        let handle = WatchHandle::from_raw(entry.wd);

        // inotify does not report the destination of a self-move, so a
        // moved watched entity is reported as deleted.
        if entry.mask & (libc::IN_DELETE_SELF | libc::IN_MOVE_SELF) != 0 {
            events.push(RawEvent::on_self(handle, RawAction::Delete));
            continue;
        }

        match &entry.name {
            Some(name) => {
                if entry.mask & libc::IN_MOVED_FROM != 0 {
                    let partner = entries
                        .iter()
                        .enumerate()
                        .skip(i + 1)
                        .find(|(j, other)| {
                            !consumed[*j]
                                && other.wd == entry.wd
                                && other.cookie == entry.cookie
                                && other.mask & libc::IN_MOVED_TO != 0
                                && other.name.is_some()
                        });
                    if let Some((j, partner)) = partner {
                        consumed[j] = true;
                        events.push(RawEvent::child_rename(
                            handle,
                            name.clone(),
                            partner.name.clone().unwrap_or_default(),
                        ));
                    } else {
                        // Moved somewhere we cannot see; from this watch's
                        // point of view the entry is gone.
                        events.push(RawEvent::on_child(handle, RawAction::Delete, name.clone()));
                    }
                } else if entry.mask & libc::IN_MOVED_TO != 0 {
                    events.push(RawEvent::on_child(handle, RawAction::Create, name.clone()));
                } else if entry.mask & libc::IN_CREATE != 0 {
                    events.push(RawEvent::on_child(handle, RawAction::Create, name.clone()));
                } else if entry.mask & libc::IN_DELETE != 0 {
                    events.push(RawEvent::on_child(handle, RawAction::Delete, name.clone()));
                } else if entry.mask & (libc::IN_MODIFY | libc::IN_ATTRIB) != 0 {
                    events.push(RawEvent::on_child(handle, RawAction::Change, name.clone()));
                }
            }
            None => {
                if entry.mask & (libc::IN_MODIFY | libc::IN_ATTRIB) != 0 {
                    events.push(RawEvent::on_self(handle, RawAction::Change));
                }
            }
        }
    }

    events
}

fn decode_entries(buf: &[u8]) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while buf.len() >= EVENT_HEADER_SIZE && offset <= buf.len() - EVENT_HEADER_SIZE {
        let wd = read_i32(buf, offset);
        let mask = read_u32(buf, offset + 4);
        let cookie = read_u32(buf, offset + 8);
        let name_len = read_u32(buf, offset + 12) as usize;

        let name_end = match (offset + EVENT_HEADER_SIZE).checked_add(name_len) {
            Some(end) if end <= buf.len() => end,
            _ => break,
        };
        let name_bytes = &buf[offset + EVENT_HEADER_SIZE..name_end];
        // The kernel pads the name field with NULs up to the reported length.
        let trimmed = match name_bytes.iter().position(|&b| b == 0) {
            Some(nul) => &name_bytes[..nul],
            None => name_bytes,
        };
        let name = if trimmed.is_empty() {
            None
        } else {
            Some(OsString::from_vec(trimmed.to_vec()))
        };

        entries.push(Entry {
            wd,
            mask,
            cookie,
            name,
        });
        offset = name_end;
    }
    entries
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_record(buf: &mut Vec<u8>, wd: i32, mask: u32, cookie: u32, name: &str) {
        let name_len = if name.is_empty() { 0 } else { name.len() + 1 };
        buf.extend_from_slice(&wd.to_ne_bytes());
        buf.extend_from_slice(&mask.to_ne_bytes());
        buf.extend_from_slice(&cookie.to_ne_bytes());
        buf.extend_from_slice(&(name_len as u32).to_ne_bytes());
        if name_len > 0 {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
    }

    #[test]
    fn test_child_create_carries_name() {
        let mut buf = Vec::new();
        push_record(&mut buf, 3, libc::IN_CREATE, 0, "new.txt");
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RawAction::Create);
        assert_eq!(events[0].name.as_deref(), Some("new.txt".as_ref()));
        assert_eq!(events[0].handle.raw(), 3);
    }

    #[test]
    fn test_self_modify_has_no_name() {
        let mut buf = Vec::new();
        push_record(&mut buf, 5, libc::IN_MODIFY, 0, "");
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RawAction::Change);
        assert!(events[0].name.is_none());
    }

    #[test]
    fn test_self_delete_and_self_move_map_to_delete() {
        let mut buf = Vec::new();
        push_record(&mut buf, 5, libc::IN_DELETE_SELF, 0, "");
        push_record(&mut buf, 6, libc::IN_MOVE_SELF, 0, "");
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.action == RawAction::Delete && e.name.is_none()));
    }

    #[test]
    fn test_rename_pair_matched_by_cookie() {
        let mut buf = Vec::new();
        push_record(&mut buf, 3, libc::IN_MOVED_FROM, 77, "before.txt");
        push_record(&mut buf, 3, libc::IN_MOVED_TO, 77, "after.txt");
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RawAction::Rename);
        assert_eq!(events[0].old_name.as_deref(), Some("before.txt".as_ref()));
        assert_eq!(events[0].name.as_deref(), Some("after.txt".as_ref()));
    }

    #[test]
    fn test_unpaired_moves_degrade() {
        let mut buf = Vec::new();
        push_record(&mut buf, 3, libc::IN_MOVED_FROM, 11, "gone.txt");
        push_record(&mut buf, 3, libc::IN_MOVED_TO, 22, "arrived.txt");
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, RawAction::Delete);
        assert_eq!(events[0].name.as_deref(), Some("gone.txt".as_ref()));
        assert_eq!(events[1].action, RawAction::Create);
        assert_eq!(events[1].name.as_deref(), Some("arrived.txt".as_ref()));
    }

    #[test]
    fn test_cookie_pairing_requires_same_watch() {
        // A move between two watched directories is two events, one per
        // listener, never a cross-directory rename.
        let mut buf = Vec::new();
        push_record(&mut buf, 3, libc::IN_MOVED_FROM, 9, "a.txt");
        push_record(&mut buf, 4, libc::IN_MOVED_TO, 9, "a.txt");
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, RawAction::Delete);
        assert_eq!(events[0].handle.raw(), 3);
        assert_eq!(events[1].action, RawAction::Create);
        assert_eq!(events[1].handle.raw(), 4);
    }

    #[test]
    fn test_ignored_and_overflow_records_are_skipped() {
        let mut buf = Vec::new();
        push_record(&mut buf, 3, libc::IN_IGNORED, 0, "");
        push_record(&mut buf, -1, libc::IN_Q_OVERFLOW, 0, "");
        push_record(&mut buf, 4, libc::IN_CREATE, 0, "kept.txt");
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].handle.raw(), 4);
    }

    #[test]
    fn test_truncated_buffer_does_not_panic() {
        let mut buf = Vec::new();
        push_record(&mut buf, 3, libc::IN_CREATE, 0, "whole.txt");
        push_record(&mut buf, 4, libc::IN_CREATE, 0, "cut.txt");
        buf.truncate(buf.len() - 3);
        let events = parse_event_buffer(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name.as_deref(), Some("whole.txt".as_ref()));
    }

    #[test]
    fn test_length_past_buffer_end_stops_cleanly() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3i32.to_ne_bytes());
        buf.extend_from_slice(&libc::IN_CREATE.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&u32::MAX.to_ne_bytes());
        assert!(parse_event_buffer(&buf).is_empty());
    }

    #[test]
    fn test_live_source_reports_child_events() {
        let dir = tempfile::tempdir().unwrap();
        let source = Source::init().unwrap();
        let handle = source.add_watch(dir.path()).unwrap();

        std::fs::write(dir.path().join("probe.txt"), b"x").unwrap();

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.extend(source.poll(Duration::from_millis(200)).unwrap());
            if !seen.is_empty() {
                break;
            }
        }
        assert!(seen
            .iter()
            .any(|e| e.handle == handle
                && e.action == RawAction::Create
                && e.name.as_deref() == Some("probe.txt".as_ref())));
    }

    #[test]
    fn test_add_watch_missing_path_reports_errno() {
        let source = Source::init().unwrap();
        let err = source
            .add_watch(Path::new("/no/such/pathwatch/dir"))
            .unwrap_err();
        assert_eq!(err.os_error_code(), Some(libc::ENOENT));
    }

    #[test]
    fn test_remove_watch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = Source::init().unwrap();
        let handle = source.add_watch(dir.path()).unwrap();
        source.remove_watch(handle);
        source.remove_watch(handle);
    }
}
