//! ReadDirectoryChangesW-based notification source
//!
//! Windows only reports changes at directory granularity, so every watch
//! opens the directory itself and keeps one overlapped read outstanding.
//! Each slot owns a stable `OVERLAPPED`, a completion event and the result
//! buffer, boxed so the kernel-held pointers never move. The poll step
//! waits on all completion events plus a wake event that `add_watch` and
//! `remove_watch` pulse so the wait set is rebuilt after registry changes.
//!
//! Removal cannot free a slot immediately: the kernel still owns its
//! buffer until the cancelled read completes. Cancelled slots are parked
//! on a retired list and reaped by the poll thread once their I/O drains.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::warn;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_IO_INCOMPLETE, HANDLE, INVALID_HANDLE_VALUE, WAIT_FAILED,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects,
};

use super::{RawAction, RawEvent};
use crate::error::Error;
use crate::event::WatchHandle;

/// Result buffer per outstanding read, in bytes. u32-backed so the kernel
/// gets the DWORD alignment ReadDirectoryChangesW requires.
const BUFFER_WORDS: usize = 1024;

/// WaitForMultipleObjects tops out at 64 handles; one is the wake event.
/// Beyond the cap the wait set rotates round-robin over the sorted slot
/// order (see `rotate_wait_keys`), so overflow watches degrade to
/// timeout-paced delivery with bounded, deterministic starvation.
const MAX_WAIT_SLOTS: usize = 63;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_LAST_ACCESS
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_SECURITY;

#[repr(C)]
struct Slot {
    overlapped: OVERLAPPED,
    buffer: [u32; BUFFER_WORDS],
    dir: HANDLE,
}

struct State {
    slots: HashMap<u64, Box<Slot>>,
    /// Cancelled slots whose overlapped read has not drained yet.
    retired: Vec<Box<Slot>>,
    /// Rotation position into the sorted slot keys for oversized wait sets.
    wait_cursor: usize,
    overflow_warned: bool,
}

pub(crate) struct Source {
    state: Mutex<State>,
    wake_event: HANDLE,
}

// HANDLEs are process-wide kernel object references; the mutex guards the
// slot table and the kernel synchronizes the objects themselves.
unsafe impl Send for Source {}
unsafe impl Sync for Source {}

impl Source {
    pub fn init() -> Result<Self, Error> {
        let wake_event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if wake_event == 0 {
            return Err(Error::Init {
                errno: last_errno(),
            });
        }
        Ok(Source {
            state: Mutex::new(State {
                slots: HashMap::new(),
                retired: Vec::new(),
                wait_cursor: 0,
                overflow_warned: false,
            }),
            wake_event,
        })
    }

    pub fn add_watch(&self, path: &Path) -> Result<WatchHandle, Error> {
        let meta = std::fs::metadata(path).map_err(|err| Error::Watch {
            path: path.to_path_buf(),
            errno: err.raw_os_error().unwrap_or(0),
        })?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory {
                path: path.to_path_buf(),
            });
        }

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let dir = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                0,
            )
        };
        if dir == INVALID_HANDLE_VALUE {
            return Err(Error::Watch {
                path: path.to_path_buf(),
                errno: last_errno(),
            });
        }

        let completion = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if completion == 0 {
            let errno = last_errno();
            unsafe {
                CloseHandle(dir);
            }
            return Err(Error::Watch {
                path: path.to_path_buf(),
                errno,
            });
        }

        let mut slot = Box::new(Slot {
            overlapped: unsafe { std::mem::zeroed() },
            buffer: [0; BUFFER_WORDS],
            dir,
        });
        slot.overlapped.hEvent = completion;

        if !queue_read(&mut slot) {
            let errno = last_errno();
            close_slot(&slot);
            return Err(Error::Watch {
                path: path.to_path_buf(),
                errno,
            });
        }

        let handle = WatchHandle::from_raw(dir as u64);
        {
            let mut state = lock(&self.state);
            state.slots.insert(handle.raw(), slot);
        }
        unsafe {
            SetEvent(self.wake_event);
        }
        Ok(handle)
    }

    pub fn remove_watch(&self, handle: WatchHandle) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.slots.remove(&handle.raw()) {
            unsafe {
                CancelIoEx(slot.dir, &slot.overlapped);
            }
            state.retired.push(slot);
            unsafe {
                SetEvent(self.wake_event);
            }
        }
    }

    pub fn poll(&self, timeout: Duration) -> io::Result<Vec<RawEvent>> {
        let (wait_handles, wait_keys) = {
            let mut state = lock(&self.state);
            reap_retired(&mut state);

            let mut sorted: Vec<u64> = state.slots.keys().copied().collect();
            sorted.sort_unstable();
            let (keys, cursor) = rotate_wait_keys(&sorted, state.wait_cursor, MAX_WAIT_SLOTS);
            state.wait_cursor = cursor;
            if sorted.len() > MAX_WAIT_SLOTS {
                if !state.overflow_warned {
                    state.overflow_warned = true;
                    warn!(
                        "watching {} directories, beyond the wait-set limit of \
                         {MAX_WAIT_SLOTS}; overflow watches are serviced round-robin",
                        sorted.len()
                    );
                }
            } else {
                state.overflow_warned = false;
            }

            let mut handles = vec![self.wake_event];
            for key in &keys {
                if let Some(slot) = state.slots.get(key) {
                    handles.push(slot.overlapped.hEvent);
                }
            }
            (handles, keys)
        };

        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let waited = unsafe {
            WaitForMultipleObjects(
                wait_handles.len() as u32,
                wait_handles.as_ptr(),
                0,
                timeout_ms,
            )
        };
        if waited == WAIT_TIMEOUT {
            return Ok(Vec::new());
        }
        if waited == WAIT_FAILED {
            return Err(io::Error::last_os_error());
        }
        let index = (waited - WAIT_OBJECT_0) as usize;
        if index == 0 {
            // Woken for a wait-set change; rebuild on the next pass.
            unsafe {
                ResetEvent(self.wake_event);
            }
            return Ok(Vec::new());
        }
        let Some(key) = wait_keys.get(index - 1).copied() else {
            return Ok(Vec::new());
        };

        let mut state = lock(&self.state);
        let Some(slot) = state.slots.get_mut(&key) else {
            // Retired between the wait and the lock.
            return Ok(Vec::new());
        };
        unsafe {
            ResetEvent(slot.overlapped.hEvent);
        }

        let handle = WatchHandle::from_raw(key);
        let mut transferred: u32 = 0;
        let ok =
            unsafe { GetOverlappedResult(slot.dir, &slot.overlapped, &mut transferred, 0) };
        if ok == 0 {
            // The read died, typically because the directory itself was
            // deleted or moved out from under us.
            if let Some(slot) = state.slots.remove(&key) {
                close_slot(&slot);
            }
            return Ok(vec![RawEvent::on_self(handle, RawAction::Delete)]);
        }

        let mut events = Vec::new();
        if transferred == 0 {
            // Too many changes for the buffer; the kernel dropped detail.
            warn!("change buffer for watch {handle} overflowed; events were lost");
        } else {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    slot.buffer.as_ptr().cast::<u8>(),
                    (transferred as usize).min(BUFFER_WORDS * 4),
                )
            };
            events = parse_notify_buffer(handle, bytes);
        }

        if !queue_read(slot) {
            if let Some(slot) = state.slots.remove(&key) {
                close_slot(&slot);
            }
            events.push(RawEvent::on_self(handle, RawAction::Delete));
        }
        Ok(events)
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        let state = &mut *state;
        for (_, slot) in state.slots.drain() {
            unsafe {
                CancelIoEx(slot.dir, &slot.overlapped);
            }
            state.retired.push(slot);
        }
        // Cancelled reads complete promptly; wait each one out so the
        // kernel is done with the buffers before they are freed.
        for slot in state.retired.drain(..) {
            let mut transferred: u32 = 0;
            unsafe {
                GetOverlappedResult(slot.dir, &slot.overlapped, &mut transferred, 1);
            }
            close_slot(&slot);
        }
        unsafe {
            CloseHandle(self.wake_event);
        }
    }
}

/// Issues (or re-issues) the overlapped read for a slot.
fn queue_read(slot: &mut Slot) -> bool {
    let ok = unsafe {
        ReadDirectoryChangesW(
            slot.dir,
            slot.buffer.as_mut_ptr().cast(),
            (BUFFER_WORDS * 4) as u32,
            0,
            NOTIFY_FILTER,
            ptr::null_mut(),
            &mut slot.overlapped,
            None,
        )
    };
    ok != 0
}

/// Drops retired slots whose cancelled I/O has completed; the rest stay
/// parked for a later pass.
fn reap_retired(state: &mut State) {
    state.retired.retain(|slot| {
        let mut transferred: u32 = 0;
        let ok = unsafe { GetOverlappedResult(slot.dir, &slot.overlapped, &mut transferred, 0) };
        if ok == 0 && unsafe { GetLastError() } == ERROR_IO_INCOMPLETE {
            return true;
        }
        close_slot(slot);
        false
    });
}

fn close_slot(slot: &Slot) {
    unsafe {
        CloseHandle(slot.overlapped.hEvent);
        CloseHandle(slot.dir);
    }
}

/// Walks a FILE_NOTIFY_INFORMATION chain. Rename halves arrive as adjacent
/// OLD_NAME/NEW_NAME records in one buffer and are fused into a single
/// rename; a half missing its partner degrades to a delete or create.
fn parse_notify_buffer(handle: WatchHandle, buf: &[u8]) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut pending_old: Option<OsString> = None;
    let mut offset = 0usize;

    loop {
        if buf.len() - offset < 12 {
            break;
        }
        let next = read_u32(buf, offset) as usize;
        let action = read_u32(buf, offset + 4);
        let name_bytes = read_u32(buf, offset + 8) as usize;

        let name_end = match (offset + 12).checked_add(name_bytes) {
            Some(end) if end <= buf.len() => end,
            _ => break,
        };
        let name_units: Vec<u16> = buf[offset + 12..name_end]
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        let name = OsString::from_wide(&name_units);

        if action == FILE_ACTION_RENAMED_OLD_NAME {
            if let Some(stale) = pending_old.replace(name) {
                events.push(RawEvent::on_child(handle, RawAction::Delete, stale));
            }
        } else {
            if action == FILE_ACTION_RENAMED_NEW_NAME {
                if let Some(old) = pending_old.take() {
                    events.push(RawEvent::child_rename(handle, old, name));
                } else {
                    events.push(RawEvent::on_child(handle, RawAction::Create, name));
                }
            } else {
                if let Some(stale) = pending_old.take() {
                    events.push(RawEvent::on_child(handle, RawAction::Delete, stale));
                }
                match action {
                    FILE_ACTION_ADDED => {
                        events.push(RawEvent::on_child(handle, RawAction::Create, name))
                    }
                    FILE_ACTION_REMOVED => {
                        events.push(RawEvent::on_child(handle, RawAction::Delete, name))
                    }
                    FILE_ACTION_MODIFIED => {
                        events.push(RawEvent::on_child(handle, RawAction::Change, name))
                    }
                    _ => {}
                }
            }
        }

        if next == 0 {
            break;
        }
        match offset.checked_add(next) {
            Some(advanced) if advanced > offset && advanced < buf.len() => offset = advanced,
            _ => break,
        }
    }

    if let Some(stale) = pending_old {
        events.push(RawEvent::on_child(handle, RawAction::Delete, stale));
    }
    events
}

/// Picks which slots join the wait set. At or under `cap` every slot is
/// waited on; above it the selection rotates round-robin over the sorted
/// key order, so a slot waits at most ceil(n / cap) poll intervals for
/// its next turn.
fn rotate_wait_keys(keys: &[u64], cursor: usize, cap: usize) -> (Vec<u64>, usize) {
    if keys.len() <= cap {
        return (keys.to_vec(), 0);
    }
    let start = cursor % keys.len();
    let selected = keys.iter().cycle().skip(start).take(cap).copied().collect();
    (selected, (start + cap) % keys.len())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_ref(s: &str) -> &std::ffi::OsStr {
        std::ffi::OsStr::new(s)
    }

    fn push_record(buf: &mut Vec<u8>, action: u32, name: &str, last: bool) {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_bytes = units.len() * 2;
        let record_len = 12 + name_bytes;
        let next = if last { 0 } else { record_len as u32 };
        buf.extend_from_slice(&next.to_ne_bytes());
        buf.extend_from_slice(&action.to_ne_bytes());
        buf.extend_from_slice(&(name_bytes as u32).to_ne_bytes());
        for unit in units {
            buf.extend_from_slice(&unit.to_ne_bytes());
        }
    }

    #[test]
    fn test_added_and_removed_records() {
        let handle = WatchHandle::from_raw(7);
        let mut buf = Vec::new();
        push_record(&mut buf, FILE_ACTION_ADDED, "new.txt", false);
        push_record(&mut buf, FILE_ACTION_REMOVED, "old.txt", true);
        let events = parse_notify_buffer(handle, &buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, RawAction::Create);
        assert_eq!(events[0].name.as_deref(), Some(name_ref("new.txt")));
        assert_eq!(events[1].action, RawAction::Delete);
        assert_eq!(events[1].name.as_deref(), Some(name_ref("old.txt")));
    }

    #[test]
    fn test_rename_halves_fuse() {
        let handle = WatchHandle::from_raw(7);
        let mut buf = Vec::new();
        push_record(&mut buf, FILE_ACTION_RENAMED_OLD_NAME, "before.txt", false);
        push_record(&mut buf, FILE_ACTION_RENAMED_NEW_NAME, "after.txt", true);
        let events = parse_notify_buffer(handle, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RawAction::Rename);
        assert_eq!(events[0].old_name.as_deref(), Some(name_ref("before.txt")));
        assert_eq!(events[0].name.as_deref(), Some(name_ref("after.txt")));
    }

    #[test]
    fn test_unpaired_rename_halves_degrade() {
        let handle = WatchHandle::from_raw(7);
        let mut buf = Vec::new();
        push_record(&mut buf, FILE_ACTION_RENAMED_OLD_NAME, "moved-away.txt", true);
        let events = parse_notify_buffer(handle, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RawAction::Delete);

        let mut buf = Vec::new();
        push_record(&mut buf, FILE_ACTION_RENAMED_NEW_NAME, "moved-in.txt", true);
        let events = parse_notify_buffer(handle, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RawAction::Create);
    }

    #[test]
    fn test_wait_set_rotation_covers_every_slot() {
        let keys: Vec<u64> = (0..5).collect();
        let mut cursor = 0;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let (selected, next) = rotate_wait_keys(&keys, cursor, 2);
            assert_eq!(selected.len(), 2);
            seen.extend(selected);
            cursor = next;
        }
        assert_eq!(seen.len(), 5, "rotation skipped a slot");
    }

    #[test]
    fn test_wait_set_under_cap_is_complete() {
        let keys: Vec<u64> = (0..3).collect();
        let (selected, cursor) = rotate_wait_keys(&keys, 7, MAX_WAIT_SLOTS);
        assert_eq!(selected, keys);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_truncated_buffer_does_not_panic() {
        let handle = WatchHandle::from_raw(7);
        let mut buf = Vec::new();
        push_record(&mut buf, FILE_ACTION_ADDED, "whole.txt", false);
        push_record(&mut buf, FILE_ACTION_MODIFIED, "cut.txt", true);
        buf.truncate(buf.len() - 5);
        let events = parse_notify_buffer(handle, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name.as_deref(), Some(name_ref("whole.txt")));
    }

    #[test]
    fn test_live_source_reports_child_create() {
        let dir = tempfile::tempdir().unwrap();
        let source = Source::init().unwrap();
        let handle = source.add_watch(dir.path()).unwrap();

        std::fs::write(dir.path().join("probe.txt"), b"x").unwrap();

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.extend(source.poll(Duration::from_millis(200)).unwrap());
            if seen.iter().any(|e| e.action == RawAction::Create) {
                break;
            }
        }
        assert!(seen
            .iter()
            .any(|e| e.handle == handle
                && e.action == RawAction::Create
                && e.name.as_deref() == Some(name_ref("probe.txt"))));
    }

    #[test]
    fn test_watching_a_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();
        let source = Source::init().unwrap();
        assert!(matches!(
            source.add_watch(&file),
            Err(Error::NotADirectory { .. })
        ));
    }
}
