//! Cooperative task cancellation.
//!
//! Every long-lived task (session driver, SIP transaction + subtasks, media
//! connection) holds an [`Interrupt`] handle. `interrupt()` raises a flag
//! and wakes sleepers; tasks observe it at their next suspension point via
//! `select!` on [`Interrupt::interrupted`] and unwind, dropping sockets and
//! buffers on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

/// A cloneable cancellation handle.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `interrupt` has been called.
    pub async fn interrupted(&self) {
        loop {
            // Arm the waiter before checking to close the set-then-wait race.
            let notified = self.inner.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_after_interrupt() {
        let intr = Interrupt::new();
        let waiter = intr.clone();
        let task = tokio::spawn(async move {
            waiter.interrupted().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        intr.interrupt();
        assert!(task.await.unwrap());
        assert!(intr.is_interrupted());
    }

    #[tokio::test]
    async fn already_interrupted_resolves_immediately() {
        let intr = Interrupt::new();
        intr.interrupt();
        intr.interrupted().await;
    }
}
