//! Session: the public watch/unwatch/callback surface
//!
//! A session is one logical watch owner, typically one embedding
//! environment. It owns the consumer side of its event channel and a
//! dispatch thread that invokes the registered callback, so the callback
//! never runs on the notification thread. Dropping the session removes
//! all of its watches, closes the channel, and joins the dispatcher.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::warn;

use crate::channel;
use crate::error::{Error, Result};
use crate::event::{Event, WatchHandle};
use crate::hub::SourceHub;
use crate::registry::SessionId;

type EventCallback = Box<dyn FnMut(Event) + Send + 'static>;

pub struct Session {
    hub: Arc<SourceHub>,
    id: SessionId,
    callback: Arc<Mutex<Option<EventCallback>>>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with a private [`SourceHub`]: its own OS source and its
    /// own notification thread.
    pub fn new() -> Self {
        Self::with_hub(Arc::new(SourceHub::new()))
    }

    /// A session on a shared hub. All sessions on one hub share a single
    /// OS source and notification thread; events are still routed only to
    /// the session that registered the watch.
    pub fn with_hub(hub: Arc<SourceHub>) -> Self {
        let id = hub.allocate_session();
        Session {
            hub,
            id,
            callback: Arc::new(Mutex::new(None)),
            dispatcher: None,
        }
    }

    /// Registers the consumer callback. Must be called before
    /// [`watch`](Session::watch). Calling it again replaces the callback;
    /// the replacement applies to every event delivered after the call
    /// returns, while a delivery already in the callback finishes on the
    /// old one.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(Event) + Send + 'static,
    {
        *lock(&self.callback) = Some(Box::new(callback));
        if self.dispatcher.is_some() {
            return;
        }

        let (tx, rx) = channel::channel();
        self.hub.register_route(self.id, tx);
        let callback = Arc::clone(&self.callback);
        self.dispatcher = Some(thread::spawn(move || {
            while let Some(event) = rx.recv() {
                if let Some(callback) = lock(&callback).as_mut() {
                    callback(event);
                }
            }
        }));
    }

    /// Starts watching `path` and returns the handle identifying the
    /// watch. Fails with [`Error::NoCallback`] until a callback is
    /// registered; otherwise errors come from the OS registration.
    pub fn watch<P: AsRef<Path>>(&self, path: P) -> Result<WatchHandle> {
        if lock(&self.callback).is_none() {
            return Err(Error::NoCallback);
        }
        SourceHub::watch(&self.hub, self.id, path.as_ref())
    }

    /// Stops watching. Unknown or stale handles are ignored; at most one
    /// poll interval of already-captured events may still be delivered.
    pub fn unwatch(&self, handle: WatchHandle) {
        self.hub.unwatch(self.id, handle);
    }

    /// Live watches owned by this session.
    pub fn watch_count(&self) -> usize {
        self.hub.session_watch_count(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Closes this session's route, which ends the dispatcher's recv
        // loop, and stops the notification thread if no watches remain.
        self.hub.remove_session(self.id);
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                warn!("dispatch thread panicked during shutdown");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
