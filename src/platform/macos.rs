//! kqueue-based notification source
//!
//! Every watched path gets its own descriptor opened with `O_EVTONLY` and
//! registered on a shared kqueue with `EVFILT_VNODE`; the descriptor is the
//! engine handle. kqueue reports what happened to the entity itself and
//! nothing about directory contents, so child-level detail is recovered
//! upstream by rescanning. A rename invalidates the path the descriptor was
//! registered under, so the new path is resolved with `F_GETPATH` and the
//! descriptor is closed; the caller re-watches under the new name. Because
//! rename and delete close descriptors from the poll thread while the
//! caller still holds the handle, descriptor ownership is tracked in a
//! set and each number is closed exactly once.

use std::collections::HashSet;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{RawAction, RawEvent};
use crate::error::Error;
use crate::event::WatchHandle;

/// How many kernel events one poll step drains at most.
const EVENT_BATCH: usize = 32;

const VNODE_FLAGS: u32 =
    libc::NOTE_WRITE | libc::NOTE_DELETE | libc::NOTE_RENAME | libc::NOTE_ATTRIB;

#[derive(Debug)]
pub(crate) struct Source {
    kq: OwnedFd,
    /// Watch descriptors this source currently owns. Rename and delete
    /// retire a descriptor from the poll thread itself while the caller's
    /// handle stays live in the registry, so every close goes through this
    /// set: whoever removes the number closes it, and a number no longer
    /// here is never closed — the OS may already have reused it for an
    /// unrelated file.
    live: Mutex<HashSet<i32>>,
}

impl Source {
    pub fn init() -> Result<Self, Error> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::Init {
                errno: last_errno(),
            });
        }
        Ok(Source {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
            live: Mutex::new(HashSet::new()),
        })
    }

    pub fn add_watch(&self, path: &Path) -> Result<WatchHandle, Error> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Watch {
            path: path.to_path_buf(),
            errno: libc::EINVAL,
        })?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_EVTONLY) };
        if fd < 0 {
            return Err(Error::Watch {
                path: path.to_path_buf(),
                errno: last_errno(),
            });
        }

        let change = libc::kevent {
            ident: fd as usize,
            filter: libc::EVFILT_VNODE,
            flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
            fflags: VNODE_FLAGS,
            data: 0,
            udata: ptr::null_mut(),
        };
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            let errno = last_errno();
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Watch {
                path: path.to_path_buf(),
                errno,
            });
        }
        lock(&self.live).insert(fd);
        Ok(WatchHandle::from_raw(fd))
    }

    /// Closing the descriptor drops its kqueue registration. Handles whose
    /// descriptor was already retired by the poll thread (rename, delete)
    /// are a no-op; closing their number again could hit whatever the OS
    /// reassigned it to.
    pub fn remove_watch(&self, handle: WatchHandle) {
        self.retire(handle.raw());
    }

    /// Closes `fd` iff this source still owns it, under the `live` lock so
    /// a concurrent `remove_watch`/retire pair cannot double-close.
    fn retire(&self, fd: i32) {
        let mut live = lock(&self.live);
        if live.remove(&fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }

    pub fn poll(&self, timeout: Duration) -> io::Result<Vec<RawEvent>> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs().min(i64::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let mut batch: [libc::kevent; EVENT_BATCH] = unsafe { std::mem::zeroed() };
        let ready = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                batch.as_mut_ptr(),
                EVENT_BATCH as libc::c_int,
                &ts,
            )
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut events = Vec::new();
        for kev in &batch[..ready as usize] {
            let fd = kev.ident as i32;
            let handle = WatchHandle::from_raw(fd);

            if kev.fflags & libc::NOTE_RENAME != 0 {
                // The registered path is stale from here on; report where
                // the entity went and retire the descriptor.
                let resolved = resolve_path(fd);
                self.retire(fd);
                events.push(RawEvent::renamed(handle, resolved));
                continue;
            }
            if kev.fflags & libc::NOTE_DELETE != 0 {
                self.retire(fd);
                events.push(RawEvent::on_self(handle, RawAction::Delete));
                continue;
            }
            if kev.fflags & libc::NOTE_WRITE != 0 {
                events.push(RawEvent::on_self(handle, RawAction::Change));
                continue;
            }
            if kev.fflags & libc::NOTE_ATTRIB != 0 {
                // Truncation to zero arrives as a bare NOTE_ATTRIB on some
                // filesystems; anything else attribute-only is noise.
                if unsafe { libc::lseek(fd, 0, libc::SEEK_END) } == 0 {
                    events.push(RawEvent::on_self(handle, RawAction::Change));
                }
            }
        }
        Ok(events)
    }
}

/// Asks the kernel for the descriptor's current path. Returns `None` when
/// F_GETPATH fails, e.g. after the target was unlinked mid-rename.
fn resolve_path(fd: i32) -> Option<PathBuf> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let rc = unsafe { libc::fcntl(fd, libc::F_GETPATH, buf.as_mut_ptr()) };
    if rc < 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(len);
    if buf.is_empty() {
        return None;
    }
    Some(PathBuf::from(std::ffi::OsString::from_vec(buf)))
}

/// HFS+ and APFS deliver a create for files that were merely moved into a
/// watched directory. A genuinely new file has equal birth and modification
/// times; a moved one keeps its original birth time. Best effort: when the
/// entry cannot be stat'ed the create is reported as-is. The kqueue source
/// never produces create events itself, so this check fires only for
/// creates synthesized above it.
pub(crate) fn is_fresh_creation(path: &Path) -> bool {
    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return true,
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(c_path.as_ptr(), &mut st) } != 0 {
        return true;
    }
    st.st_birthtime == st.st_mtime && st.st_birthtime_nsec == st.st_mtime_nsec
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
