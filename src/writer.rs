//! The producer-facing writer handle.
//!
//! Grounded in `writable/default_writer.rs`
//! (`WritableStreamDefaultWriter<'js>`,
//! `set_up_writable_stream_default_writer`,
//! `writable_stream_default_writer_write`,
//! `writable_stream_default_writer_release`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::controller::{update_backpressure, Core, StreamState, WriterEntry, WriterSignal};
use crate::error::{AlreadyLocked, CloseError, ReleasedError, SignalError, StateErrorKind, WriteError};
use crate::signal::DeferredSignal;
use crate::sink::UnderlyingSink;
use crate::stream::{close_with_error_propagation, stream_abort, stream_close};

/// spec.md §4.3 "Writer Handle".
pub struct WritableStreamDefaultWriter<S: UnderlyingSink> {
    core: Arc<Core<S>>,
    /// Clones of the same [`DeferredSignal`] channels stored in
    /// `Shared::writer` (see `acquire` below). Cached here once and never
    /// re-fetched through the lock — safe because `DeferredSignal::
    /// reset_to_pending`/`force_settle` mutate the channel in place rather
    /// than replacing it, so this clone keeps observing every settle/reset
    /// the stream's internals apply to the `Shared` copy for as long as
    /// both are alive.
    ready: WriterSignal<S::Error>,
    closed: WriterSignal<S::Error>,
    /// Set once `release_lock` has run on *this* handle; independent of
    /// whether some other writer has since locked the same stream.
    released: AtomicBool,
}

impl<S: UnderlyingSink> WritableStreamDefaultWriter<S> {
    /// spec.md §4.3 "Writer construction": binds the writer to the stream
    /// (must be unlocked) and initializes `ready`/`closed` per the table
    /// there.
    pub(crate) fn acquire(core: Arc<Core<S>>) -> Result<Self, AlreadyLocked> {
        let mut shared = core.shared.lock().unwrap();
        if shared.locked {
            return Err(AlreadyLocked);
        }
        shared.locked = true;

        let ready = match &shared.state {
            StreamState::Writable => {
                if shared.backpressure {
                    DeferredSignal::pending()
                } else {
                    DeferredSignal::settled(Ok(()))
                }
            }
            StreamState::Erroring(err) => DeferredSignal::settled(Err(SignalError::Sink(err.clone()))),
            StreamState::Closed => DeferredSignal::settled(Ok(())),
            StreamState::Errored(err) => DeferredSignal::settled(Err(SignalError::Sink(err.clone()))),
        };
        let closed = match &shared.state {
            StreamState::Closed => DeferredSignal::settled(Ok(())),
            StreamState::Errored(err) => DeferredSignal::settled(Err(SignalError::Sink(err.clone()))),
            StreamState::Writable | StreamState::Erroring(_) => DeferredSignal::pending(),
        };

        shared.writer = Some(WriterEntry {
            ready: ready.clone(),
            closed: closed.clone(),
        });
        drop(shared);

        Ok(Self {
            core,
            ready,
            closed,
            released: AtomicBool::new(false),
        })
    }

    /// spec.md §4.3 `write(chunk)`.
    pub async fn write(&self, chunk: S::Chunk) -> Result<(), WriteError<S::Error>> {
        if self.released.load(Ordering::Acquire) {
            return Err(WriteError::Released);
        }
        let size = self.core.strategy.size(&chunk);

        let completion = {
            let mut shared = self.core.shared.lock().unwrap();
            match &shared.state {
                StreamState::Errored(e) | StreamState::Erroring(e) => {
                    return Err(WriteError::Sink(e.clone()));
                }
                StreamState::Closed => return Err(WriteError::State(StateErrorKind::NotWritable)),
                StreamState::Writable => {}
            }
            if shared.close_queued_or_in_flight() {
                return Err(WriteError::State(StateErrorKind::NotWritable));
            }

            let completion = DeferredSignal::pending();
            shared.write_requests.push_back(completion.clone());
            shared
                .queue
                .push_back(crate::controller::QueueEntry::Write { chunk, size });
            shared.queue_total_size += size;

            if !shared.close_queued_or_in_flight() && matches!(shared.state, StreamState::Writable) {
                let bp = shared.desired_size().map(|d| d <= 0.0).unwrap_or(false);
                update_backpressure(&mut shared, bp);
            }
            completion
        };
        crate::stream::spawn_drive(self.core.clone());
        completion.wait().await.map_err(WriteError::Sink)
    }

    /// spec.md §4.3 `close()`: delegates to the stream's internal close.
    pub async fn close(&self) -> Result<(), CloseError<S::Error>> {
        if self.released.load(Ordering::Acquire) {
            return Err(CloseError::Released);
        }
        stream_close(&self.core).await
    }

    /// spec.md §4.4 `CloseWithErrorPropagation`.
    pub async fn close_with_error_propagation(&self) -> Result<(), CloseError<S::Error>> {
        if self.released.load(Ordering::Acquire) {
            return Err(CloseError::Released);
        }
        close_with_error_propagation(&self.core).await
    }

    /// spec.md §4.3 `abort(reason)`: delegates to the stream's internal abort.
    pub async fn abort(&self, reason: S::Error) -> Result<(), crate::error::AbortError<S::Error>> {
        if self.released.load(Ordering::Acquire) {
            return Err(crate::error::AbortError::Released);
        }
        stream_abort(&self.core, reason)
            .await
            .map_err(crate::error::AbortError::Sink)
    }

    /// spec.md §4.3 `releaseLock()`. Idempotent.
    pub fn release_lock(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut shared = self.core.shared.lock().unwrap();
        if let Some(entry) = shared.writer.take() {
            entry.ready.force_settle(Err(SignalError::Released));
            entry.closed.force_settle(Err(SignalError::Released));
        }
        shared.locked = false;
        // `self.ready`/`self.closed` are clones of the very channel just
        // settled above, so they already observe the `Released` rejection:
        // no separate post-release cache is needed.
    }

    /// spec.md §4.3 `desiredSize`: `null` if errored/erroring, `0` if
    /// closed, otherwise `highWaterMark - queueTotalSize`.
    pub fn desired_size(&self) -> Result<Option<f64>, ReleasedError> {
        if self.released.load(Ordering::Acquire) {
            return Err(ReleasedError);
        }
        Ok(self.core.shared.lock().unwrap().desired_size())
    }

    /// spec.md §4.3 `ready`.
    pub async fn ready(&self) -> Result<(), SignalError<S::Error>> {
        self.ready.wait().await
    }

    /// spec.md §4.3 `closed`.
    pub async fn closed(&self) -> Result<(), SignalError<S::Error>> {
        self.closed.wait().await
    }
}

impl<S: UnderlyingSink> Drop for WritableStreamDefaultWriter<S> {
    fn drop(&mut self) {
        self.release_lock();
    }
}
