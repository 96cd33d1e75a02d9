//! Per-connection request tracking, used to implement `Tflush`.
//!
//! Every dispatched request (other than `Tversion`/`Tflush` themselves) gets
//! a tracker keyed by its tag. `flush(oldtag)` looks the tracker up, marks it
//! cancelled, and waits on its completion event; the handler task notifies
//! that event once its response has been handed to the send lock. Whichever
//! side — the handler completing, or `flush` taking ownership — runs second
//! is responsible for removing the entry from the map.

use std::{collections::HashMap, sync::Arc, sync::atomic::{AtomicBool, Ordering}};
use tokio::sync::Mutex;

use crate::sched::Event;

/// State shared between a dispatched request's handler task and any
/// `flush` that targets it by tag.
#[derive(Debug, Default)]
pub struct RequestTracker {
    cancelled: AtomicBool,
    done: Event,
}

impl RequestTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            done: Event::new(),
        })
    }

    /// Mark the request as flushed. The handler itself does not currently
    /// consult this flag (requests run to completion rather than aborting
    /// mid-syscall), but it records the event for observability and for
    /// handlers that want to shortcut expensive work.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Called by the handler task once its response (if any) has been
    /// handed to the connection's send lock.
    pub fn complete(&self) {
        self.done.set();
    }

    /// Suspend until `complete` has been called.
    pub async fn wait(&self) {
        self.done.wait().await;
    }
}

/// Map from request tag to its tracker, guarded by a lock rather than an
/// `RwLock` since every access (insert, remove, take) mutates.
#[derive(Debug, Default)]
pub struct TrackerTable {
    inner: Mutex<HashMap<u16, Arc<RequestTracker>>>,
}

impl TrackerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
        })
    }

    pub async fn register(&self, tag: u16) -> Arc<RequestTracker> {
        let tracker = RequestTracker::new();
        self.inner.lock().await.insert(tag, tracker.clone());
        tracker
    }

    /// Best-effort removal by the completing handler; a racing `flush` may
    /// already have removed the same entry, which is fine.
    pub async fn forget(&self, tag: u16) {
        self.inner.lock().await.remove(&tag);
    }

    /// Take ownership of the tracker for `oldtag`, if still present. Used by
    /// `flush`: a tag not found here is treated as already completed.
    pub async fn take(&self, oldtag: u16) -> Option<Arc<RequestTracker>> {
        self.inner.lock().await.remove(&oldtag)
    }
}
