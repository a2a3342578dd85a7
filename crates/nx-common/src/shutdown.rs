//! Cooperative Shutdown / Cancellation Handle
//!
//! A single flag shared between the worker pool, the workflow engine, and
//! in-flight adapter calls. Long operations check `is_triggered` between
//! units of work and select on `wait` while idle. Triggering is idempotent
//! and sticky.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag and wake all waiters.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Suspend until the flag trips. Returns immediately if already tripped.
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        // Re-check after registering to close the trigger/wait race.
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
