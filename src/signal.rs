//! `DeferredSignal`: a settable, re-creatable async signal.
//!
//! spec.md §9 calls for "a thin `DeferredSignal` abstraction with operations
//! `{new_pending, resolve, reject, replace_pending, replace_rejected}`".
//! The teacher (`llrt_stream_web`) gets this for free from `rquickjs`'s own
//! `Promise`/resolve-function pair (see `utils/promise.rs`); without a JS
//! engine underneath us we build the same shape directly on
//! `tokio::sync::watch`, wrapped in an `Arc` so a signal can be cloned
//! cheaply and observed from both the stream's internals and a writer
//! handle that outlives a single lock/release cycle.
//!
//! Crucially, every clone of a `DeferredSignal` must keep observing the
//! *same* logical signal for its entire lifetime, including across a
//! "replace_pending" reset: the writer handle caches its own clones of
//! `ready`/`closed` once at construction (`writer.rs::acquire`), separate
//! from the clones held in `Shared`'s `WriterEntry`, and nothing ever makes
//! the writer re-fetch a fresh clone afterwards. So a reset is implemented
//! by sending a fresh "pending" value down the *existing* channel rather
//! than by swapping in a new one — every outstanding clone shares the one
//! `watch::Sender` for the signal's whole lifetime, not just until the next
//! reset.

use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot-or-resettable future value. Cloning a `DeferredSignal` shares
/// the same underlying channel for as long as either clone lives: settling
/// or resetting through one clone is immediately observable through every
/// other, including ones already `.await`ing [`DeferredSignal::wait`].
pub(crate) struct DeferredSignal<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for DeferredSignal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DeferredSignal<T> {
    /// A signal with no value yet.
    pub(crate) fn pending() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// A signal that is already settled.
    pub(crate) fn settled(value: T) -> Self {
        let (tx, _rx) = watch::channel(Some(value));
        Self { tx: Arc::new(tx) }
    }

    /// Settle this signal with `value`, regardless of its current state.
    /// This is `resolve`/`reject`/`replace_rejected` all at once: spec.md's
    /// distinction between "reject in place" and "replace with a freshly
    /// rejected signal" is only observable through a stale clone of the
    /// *old* channel, and this implementation never produces one — settling
    /// the existing channel in place is equivalent, and reaches every clone.
    pub(crate) fn force_settle(&self, value: T) {
        let _ = self.tx.send(Some(value));
    }

    /// Reset this signal back to pending in place. Used when backpressure
    /// is (re)applied: `writer.ready` must go back to pending even though
    /// the old signal may already have resolved. Sends `None` down the same
    /// channel every clone of this signal already holds, so a writer handle
    /// that cached its own clone at construction still observes the reset.
    pub(crate) fn reset_to_pending(&self) {
        let _ = self.tx.send(None);
    }

    /// Await the settled value. If the channel's sender is ever dropped
    /// without a value ever being sent (which only happens if every handle
    /// to this particular signal instance is dropped), this pends forever
    /// rather than erroring — matching the semantics of an abandoned,
    /// never-replaced promise that nobody can resolve anymore.
    pub(crate) async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(v) = rx.borrow().clone() {
                return v;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
