//! Run cancellation.
//!
//! A single token is threaded from the CLI's signal handler down to every
//! suspension point (image pulls, container waits, log streaming, prompts).
//! The first cancellation requests a graceful stop; a second escalates to
//! immediate force-kill.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;

const STATE_RUNNING: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_FORCED: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: AtomicU8,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The second call escalates to force-kill.
    pub fn cancel(&self) {
        let first = self.inner.state.compare_exchange(
            STATE_RUNNING,
            STATE_CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if first.is_err() {
            let _ = self.inner.state.compare_exchange(
                STATE_CANCELLED,
                STATE_FORCED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != STATE_RUNNING
    }

    pub fn is_forced(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_FORCED
    }

    /// Resolve when cancellation is requested; pending forever otherwise.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}
