//! Cross-thread wakeup for the foreground worker.
//!
//! The interrupt is the sole signal that pulls the foreground worker out of
//! IDLE. It is edge-triggered: `take()` consumes the flag, and the worker
//! restarts its cycle from the top after every wakeup. The flag is always
//! set **before** the IMAP library's interrupt primitive fires, so a
//! notification landing between the two cannot be lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

/// How long one IDLE waits before re-issuing. Kept under the common
/// 29-minute NAT/server timeout.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 20);

type StopFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct Interrupt {
    flag: AtomicBool,
    stop: Mutex<Option<StopFn>>,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Interrupt {
        Interrupt::default()
    }

    /// Wake the foreground worker: flag first, then the registered idle
    /// stop primitive, then any async waiters.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let stop = self.stop.lock().unwrap().take();
        if let Some(stop) = stop {
            stop();
        }
        self.notify.notify_waiters();
    }

    /// Consume the flag. Edge-triggered: returns true at most once per
    /// interrupt.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The IMAP backend registers the handle that breaks its current IDLE
    /// here, just before blocking.
    pub fn register_stop(&self, stop: StopFn) {
        let mut slot = self.stop.lock().unwrap();
        // Interrupted between registration attempts: fire immediately so
        // the fresh IDLE doesn't absorb an already-delivered wakeup.
        if self.flag.load(Ordering::SeqCst) {
            drop(slot);
            stop();
            return;
        }
        *slot = Some(stop);
    }

    pub fn clear_stop(&self) {
        self.stop.lock().unwrap().take();
    }

    /// Await an interrupt or the timeout, whichever first. Used by fake
    /// backends standing in for real IDLE.
    pub async fn wait(&self, timeout: Duration) {
        if self.flag.load(Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
