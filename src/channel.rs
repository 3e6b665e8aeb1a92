//! Producer/consumer hand-off between the notification thread and the
//! session's dispatch thread
//!
//! FIFO per channel. Once the channel is closed (session teardown), `send`
//! becomes a guaranteed no-op and queued events are abandoned without being
//! delivered; the background loop has no way to report delivery failure to
//! its caller, so there is nothing to propagate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::event::Event;

pub(crate) fn channel() -> (EventChannel, EventReceiver) {
    let (tx, rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    (
        EventChannel {
            tx,
            closed: Arc::clone(&closed),
        },
        EventReceiver { rx, closed },
    )
}

/// Producer side, held by the hub's route table and used by the
/// notification loop.
#[derive(Debug)]
pub(crate) struct EventChannel {
    tx: Sender<Event>,
    closed: Arc<AtomicBool>,
}

impl EventChannel {
    /// Hands an event to the consumer side. Never blocks; after `close`
    /// (or once the receiver is gone) the event is silently dropped.
    pub fn send(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(event);
    }

    /// Marks the channel closed. In-flight sends complete or are dropped;
    /// the receiver stops yielding events.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Consumer side, owned by the session's dispatch thread.
#[derive(Debug)]
pub(crate) struct EventReceiver {
    rx: Receiver<Event>,
    closed: Arc<AtomicBool>,
}

impl EventReceiver {
    /// Blocks for the next event. Returns `None` once the channel is
    /// closed or the producer side is gone; events still queued at close
    /// are not delivered.
    pub fn recv(&self) -> Option<Event> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        match self.rx.recv() {
            Ok(event) if !self.closed.load(Ordering::SeqCst) => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, RawHandle, WatchHandle};
    use std::path::PathBuf;

    fn event(n: i32) -> Event {
        Event {
            kind: EventKind::ChildChange,
            handle: WatchHandle::from_raw(n as RawHandle),
            new_path: PathBuf::from(format!("/watched/{n}")),
            old_path: None,
        }
    }

    #[test]
    fn test_delivery_is_fifo() {
        let (tx, rx) = channel();
        tx.send(event(1));
        tx.send(event(2));
        tx.send(event(3));
        assert_eq!(rx.recv().map(|e| e.handle.raw()), Some(1 as RawHandle));
        assert_eq!(rx.recv().map(|e| e.handle.raw()), Some(2 as RawHandle));
        assert_eq!(rx.recv().map(|e| e.handle.raw()), Some(3 as RawHandle));
    }

    #[test]
    fn test_send_after_close_is_dropped() {
        let (tx, rx) = channel();
        tx.send(event(1));
        tx.close();
        tx.send(event(2));
        assert!(rx.recv().is_none());
    }

    #[test]
    fn test_recv_after_producer_drop() {
        let (tx, rx) = channel();
        tx.send(event(1));
        drop(tx);
        assert_eq!(rx.recv().map(|e| e.handle.raw()), Some(1 as RawHandle));
        assert!(rx.recv().is_none());
    }

    #[test]
    fn test_close_abandons_queued_events() {
        let (tx, rx) = channel();
        tx.send(event(1));
        tx.send(event(2));
        tx.close();
        assert!(rx.recv().is_none());
        assert!(rx.recv().is_none());
    }
}
