use core::{future::poll_fn, task::Poll};

use atomic_waker::AtomicWaker;
use portable_atomic::{AtomicUsize, Ordering};

/// Counting interrupt signal shared between the ISR and the driver worker.
///
/// The ISR side calls [IrqSignal::raise], the worker consumes signals with
/// [IrqSignal::take] from its poll loop. Signals raised while the worker is mid-cycle stay
/// queued, which is how the coordinator notices that another interrupt arrived before it
/// went idle.
pub struct IrqSignal {
    waker: AtomicWaker,
    queued: AtomicUsize,
}
impl IrqSignal {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued: AtomicUsize::new(0),
        }
    }
    /// Queue one signal and wake the worker.
    ///
    /// Callable from true interrupt context.
    pub fn raise(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }
    /// Consume one queued signal, if any.
    pub fn take(&self) -> bool {
        self.queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |queued| {
                queued.checked_sub(1)
            })
            .is_ok()
    }
    /// Check for queued signals without consuming one.
    pub fn pending(&self) -> bool {
        self.queued.load(Ordering::Relaxed) != 0
    }
    /// Drop all queued signals.
    pub fn reset(&self) {
        self.queued.store(0, Ordering::Relaxed);
    }
    /// Asynchronously wait until at least one signal is queued.
    ///
    /// Does not consume the signal, so the worker can drive consumption entirely through
    /// [IrqSignal::take].
    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.queued.load(Ordering::Relaxed) == 0 {
                self.waker.register(cx.waker());
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await
    }
}
impl Default for IrqSignal {
    fn default() -> Self {
        Self::new()
    }
}
