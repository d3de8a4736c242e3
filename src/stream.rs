//! The root `WritableStream` handle and the `drive` loop that plays the
//! part of the teacher's `upon_promise` continuations.
//!
//! Grounded in `writable/stream/mod.rs` (`WritableStream<'js>`,
//! `writable_stream_abort`, `writable_stream_close`,
//! `set_up_writable_stream_default_controller_from_underlying_sink`).

use std::sync::Arc;

use tracing::{error, trace};

use crate::controller::{
    advance_queue_if_needed, finish_abort, finish_in_flight_close, finish_in_flight_close_with_error,
    finish_in_flight_write, finish_in_flight_write_with_error, start_erroring, Core, NextStep,
    PendingAbortRequest, Shared, StreamState, WritableStreamController,
};
use crate::error::AlreadyLocked;
use crate::sink::UnderlyingSink;
use crate::signal::DeferredSignal;
use crate::strategy::QueuingStrategy;
use crate::writer::WritableStreamDefaultWriter;

/// spec.md §6: "new Stream(underlyingSink?, queuingStrategy?)". The root
/// handle; cheap to clone (an `Arc` underneath), mirroring the teacher's
/// `WritableStream` being a JS class instance shared by reference.
pub struct WritableStream<S: UnderlyingSink> {
    pub(crate) core: Arc<Core<S>>,
}

impl<S: UnderlyingSink> Clone for WritableStream<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<S: UnderlyingSink> WritableStream<S> {
    /// Construct a stream and start driving `sink` immediately in the
    /// background (spec.md §4.2 "start lifecycle"): `sink.start` is invoked
    /// right away, and the stream can be written to before it settles —
    /// those writes simply queue until `started` flips.
    pub fn new(sink: S, strategy: impl QueuingStrategy<S::Chunk> + 'static) -> Self {
        let high_water_mark = strategy.high_water_mark();
        let core = Arc::new(Core {
            shared: std::sync::Mutex::new(Shared::new(high_water_mark)),
            sink: tokio::sync::Mutex::new(sink),
            strategy: Box::new(strategy),
        });
        tokio::spawn(run_start(core.clone()));
        Self { core }
    }

    /// spec.md §6: `locked: bool`.
    pub fn locked(&self) -> bool {
        self.core.shared.lock().unwrap().locked
    }

    /// spec.md §6: `getWriter() -> Writer`; throws if already locked.
    pub fn get_writer(&self) -> Result<WritableStreamDefaultWriter<S>, AlreadyLocked> {
        WritableStreamDefaultWriter::acquire(self.core.clone())
    }

    /// spec.md §4.1 `abort()`/§6 `abort(reason?)`; rejects if locked.
    pub async fn abort(&self, reason: S::Error) -> Result<(), crate::error::AbortError<S::Error>> {
        if self.core.shared.lock().unwrap().locked {
            return Err(crate::error::AbortError::State(
                crate::error::StateErrorKind::Locked,
            ));
        }
        stream_abort(&self.core, reason)
            .await
            .map_err(crate::error::AbortError::Sink)
    }

    /// spec.md §4.1 `close()`/§6 `close()`; rejects if locked.
    pub async fn close(&self) -> Result<(), crate::error::CloseError<S::Error>> {
        if self.core.shared.lock().unwrap().locked {
            return Err(crate::error::CloseError::State(
                crate::error::StateErrorKind::Locked,
            ));
        }
        stream_close(&self.core).await
    }
}

/// The internal abort algorithm, shared by `WritableStream::abort` and
/// `WritableStreamDefaultWriter::abort`.
pub(crate) async fn stream_abort<S: UnderlyingSink>(
    core: &Arc<Core<S>>,
    reason: S::Error,
) -> Result<(), S::Error> {
    let (completion, should_drive) = {
        let mut shared = core.shared.lock().unwrap();
        if matches!(shared.state, StreamState::Closed | StreamState::Errored(_)) {
            return Ok(());
        }
        if let Some(pending) = &shared.pending_abort_request {
            (pending.completion.clone(), false)
        } else {
            let was_already_erroring = matches!(shared.state, StreamState::Erroring(_));
            let completion = DeferredSignal::pending();
            shared.pending_abort_request = Some(PendingAbortRequest {
                completion: completion.clone(),
                reason: if was_already_erroring {
                    None
                } else {
                    Some(reason.clone())
                },
                was_already_erroring,
            });
            if !was_already_erroring {
                start_erroring(&mut shared, reason);
            }
            (completion, true)
        }
    };
    if should_drive {
        spawn_drive(core.clone());
    }
    completion.wait().await
}

/// The internal close algorithm, shared by `WritableStream::close` and
/// `WritableStreamDefaultWriter::close`. spec.md §4.1 `close()`.
pub(crate) async fn stream_close<S: UnderlyingSink>(
    core: &Arc<Core<S>>,
) -> Result<(), crate::error::CloseError<S::Error>> {
    use crate::error::{CloseError, StateErrorKind};

    let completion = {
        let mut shared = core.shared.lock().unwrap();
        if matches!(shared.state, StreamState::Closed | StreamState::Errored(_)) {
            return Err(CloseError::State(StateErrorKind::NotWritable));
        }
        if shared.close_queued_or_in_flight() {
            return Err(CloseError::State(StateErrorKind::AlreadyClosing));
        }
        let completion = DeferredSignal::pending();
        shared.close_request = Some(completion.clone());
        if shared.backpressure && matches!(shared.state, StreamState::Writable) {
            if let Some(writer) = &shared.writer {
                writer.ready.force_settle(Ok(()));
            }
        }
        shared.queue.push_back(crate::controller::QueueEntry::Close);
        completion
    };
    spawn_drive(core.clone());
    completion.wait().await.map_err(CloseError::Sink)
}

/// spec.md §4.4 `CloseWithErrorPropagation`.
pub(crate) async fn close_with_error_propagation<S: UnderlyingSink>(
    core: &Arc<Core<S>>,
) -> Result<(), crate::error::CloseError<S::Error>> {
    use crate::error::CloseError;

    let already_settled = {
        let shared = core.shared.lock().unwrap();
        if shared.close_queued_or_in_flight() || matches!(shared.state, StreamState::Closed) {
            Some(Ok(()))
        } else if let StreamState::Errored(err) = &shared.state {
            Some(Err(CloseError::Sink(err.clone())))
        } else {
            None
        }
    };
    match already_settled {
        Some(result) => result,
        None => stream_close(core).await,
    }
}

/// Run `sink.start`, then fall straight into the same `drive` loop every
/// other entry point spawns — this is the task that eventually processes
/// any write/close queued before `started` flips.
async fn run_start<S: UnderlyingSink>(core: Arc<Core<S>>) {
    let controller = WritableStreamController { core: core.clone() };
    let result = {
        let mut sink = core.sink.lock().await;
        sink.start(&controller).await
    };
    {
        let mut shared = core.shared.lock().unwrap();
        shared.started = true;
        if let Err(err) = result {
            error!("sink start failed");
            if matches!(shared.state, StreamState::Writable) {
                start_erroring(&mut shared, err);
            }
        }
    }
    drive(core).await;
}

/// Fire-and-forget: spawn [`drive`] to pick up any work that just became
/// possible. Safe to call redundantly — a `drive` task that finds nothing
/// to do (or finds the in-flight guard already held by a sibling) just
/// returns immediately.
pub(crate) fn spawn_drive<S: UnderlyingSink>(core: Arc<Core<S>>) {
    tokio::spawn(drive(core));
}

/// The loop that plays the role of the teacher's `upon_promise`
/// continuations: decide the next step under the lock, perform it against
/// the sink without holding the lock, apply the result under the lock, and
/// repeat until there's nothing left to do.
async fn drive<S: UnderlyingSink>(core: Arc<Core<S>>) {
    loop {
        let step = {
            let mut shared = core.shared.lock().unwrap();
            advance_queue_if_needed(&mut shared)
        };
        match step {
            NextStep::None => return,
            NextStep::Write { chunk } => {
                let controller = WritableStreamController { core: core.clone() };
                let result = {
                    let mut sink = core.sink.lock().await;
                    sink.write(chunk, &controller).await
                };
                let mut shared = core.shared.lock().unwrap();
                match result {
                    Ok(()) => {
                        trace!("write settled");
                        finish_in_flight_write(&mut shared);
                    }
                    Err(err) => {
                        error!("write failed");
                        finish_in_flight_write_with_error(&mut shared, err);
                    }
                }
            }
            NextStep::Close => {
                let result = {
                    let mut sink = core.sink.lock().await;
                    sink.close().await
                };
                let mut shared = core.shared.lock().unwrap();
                match result {
                    Ok(()) => finish_in_flight_close(&mut shared),
                    Err(err) => {
                        error!("close failed");
                        finish_in_flight_close_with_error(&mut shared, err);
                    }
                }
            }
            NextStep::Abort { reason, completion } => {
                let result = {
                    let mut sink = core.sink.lock().await;
                    sink.abort(reason).await
                };
                let mut shared = core.shared.lock().unwrap();
                finish_abort(&mut shared, completion, result);
                return;
            }
        }
    }
}
