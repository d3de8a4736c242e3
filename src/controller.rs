//! The controller's queue plus the stream state machine that drives it.
//!
//! This is the combined translation of the teacher's
//! `writable/default_controller.rs` (`WritableStreamDefaultController`,
//! `AdvanceQueueIfNeeded`, `ProcessWrite`, `ProcessClose`) and the state-
//! machine half of `writable/stream/mod.rs` (`WritableStreamState`,
//! `StartErroring`, `FinishErroring`, `FinishInFlightWrite*`,
//! `FinishInFlightClose*`, `UpdateBackpressure`). The teacher keeps these as
//! two separate JS classes talking to each other through a `stream` back-
//! pointer; since nothing here needs to cross a script-engine boundary,
//! they're folded into one `Shared<C, E>` struct guarded by a single lock
//! (spec.md's invariants are stated over the stream+controller pair as a
//! whole anyway — see spec.md §3).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::error::SignalError;
use crate::signal::DeferredSignal;
use crate::sink::UnderlyingSink;
use crate::strategy::QueuingStrategy;

/// One entry in the controller's sized FIFO (spec.md §3, "controller.queue").
pub(crate) enum QueueEntry<C> {
    Write { chunk: C, size: f64 },
    Close,
}

/// spec.md §3's `{Writable, Closed, Erroring, Errored}` state, carrying the
/// stored error alongside the states that have one.
#[derive(Clone)]
pub(crate) enum StreamState<E> {
    Writable,
    Erroring(E),
    Closed,
    Errored(E),
}

impl<E: Clone> StreamState<E> {
    pub(crate) fn stored_error(&self) -> Option<E> {
        match self {
            StreamState::Erroring(e) | StreamState::Errored(e) => Some(e.clone()),
            StreamState::Writable | StreamState::Closed => None,
        }
    }
}

/// A `write`/`close` completion the producer is awaiting.
pub(crate) type RequestSignal<E> = DeferredSignal<Result<(), E>>;
/// A `ready`/`closed` signal the writer exposes.
pub(crate) type WriterSignal<E> = DeferredSignal<Result<(), SignalError<E>>>;

/// spec.md §3's `PendingAbortRequest`.
pub(crate) struct PendingAbortRequest<E> {
    pub(crate) completion: RequestSignal<E>,
    /// `None` once `was_already_erroring`: spec.md §9's Open Question is
    /// resolved by eliding the reason in that branch, since it's never read
    /// (the original error always wins).
    pub(crate) reason: Option<E>,
    pub(crate) was_already_erroring: bool,
}

/// The live writer's two resettable signals (spec.md §3, "Writer holds...
/// two DeferredSignals").
pub(crate) struct WriterEntry<E> {
    pub(crate) ready: WriterSignal<E>,
    pub(crate) closed: WriterSignal<E>,
}

/// Everything spec.md §3 describes as Stream+Controller state, behind one
/// lock. Locked only for short synchronous critical sections — never held
/// across an `.await`.
pub(crate) struct Shared<C, E> {
    pub(crate) state: StreamState<E>,
    pub(crate) locked: bool,
    pub(crate) started: bool,

    pub(crate) queue: VecDeque<QueueEntry<C>>,
    pub(crate) queue_total_size: f64,
    /// Size of the write currently in flight, kept out of `queue` (it was
    /// already popped so the sink could own the chunk) but still counted
    /// toward `queue_total_size` until it succeeds — spec.md's desiredSize
    /// must still reflect an in-flight chunk (invariant 7 is evaluated "at
    /// the end of any operation that mutated the queue", and an in-flight
    /// write hasn't been dequeued yet).
    pub(crate) in_flight_write_size: Option<f64>,
    pub(crate) high_water_mark: f64,

    pub(crate) write_requests: VecDeque<RequestSignal<E>>,
    pub(crate) in_flight_write_request: Option<RequestSignal<E>>,
    pub(crate) close_request: Option<RequestSignal<E>>,
    pub(crate) in_flight_close_request: Option<RequestSignal<E>>,
    pub(crate) pending_abort_request: Option<PendingAbortRequest<E>>,

    pub(crate) backpressure: bool,
    pub(crate) writer: Option<WriterEntry<E>>,
}

impl<C, E: Clone> Shared<C, E> {
    pub(crate) fn new(high_water_mark: f64) -> Self {
        Self {
            state: StreamState::Writable,
            locked: false,
            started: false,
            queue: VecDeque::new(),
            queue_total_size: 0.0,
            in_flight_write_size: None,
            high_water_mark,
            write_requests: VecDeque::new(),
            in_flight_write_request: None,
            close_request: None,
            in_flight_close_request: None,
            pending_abort_request: None,
            backpressure: high_water_mark <= 0.0,
            writer: None,
        }
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        match &self.state {
            StreamState::Errored(_) | StreamState::Erroring(_) => None,
            StreamState::Closed => Some(0.0),
            StreamState::Writable => Some(self.high_water_mark - self.queue_total_size),
        }
    }

    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close_request.is_some()
    }
}

/// What the `drive` loop (in `crate::stream`) must do next, decided entirely
/// under the `Shared` lock by [`advance_queue_if_needed`].
pub(crate) enum NextStep<C, E> {
    /// Nothing to do; the `drive` task may exit.
    None,
    Write { chunk: C },
    Close,
    Abort {
        reason: E,
        completion: RequestSignal<E>,
    },
}

/// Bundles the synchronous state (`Shared`) with the sink, which is only
/// ever touched from within the `drive` loop.
pub(crate) struct Core<S: UnderlyingSink> {
    pub(crate) shared: Mutex<Shared<S::Chunk, S::Error>>,
    pub(crate) sink: AsyncMutex<S>,
    pub(crate) strategy: Box<dyn QueuingStrategy<S::Chunk>>,
}

/// Handed to [`UnderlyingSink`] methods. The only surface the teacher's
/// `WritableStreamDefaultController` exposes to sink callbacks (spec.md §6,
/// "Controller surface (to sinks)").
pub struct WritableStreamController<S: UnderlyingSink> {
    pub(crate) core: Arc<Core<S>>,
}

impl<S: UnderlyingSink> Clone for WritableStreamController<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<S: UnderlyingSink> WritableStreamController<S> {
    /// Error the stream out of band. A no-op unless the stream is currently
    /// `Writable` (spec.md §6: "usable only while state = Writable;
    /// otherwise a no-op").
    pub fn error(&self, reason: S::Error) {
        let transitioned = {
            let mut shared = self.core.shared.lock().unwrap();
            if matches!(shared.state, StreamState::Writable) {
                start_erroring(&mut shared, reason);
                true
            } else {
                false
            }
        };
        if transitioned {
            crate::stream::spawn_drive(self.core.clone());
        }
    }
}

/// spec.md §4.1 `StartErroring(err)`. Precondition: `state = Writable`.
///
/// Unlike the teacher, this never itself cascades into `FinishErroring`
/// synchronously: that cascade is always discovered by the `drive` loop's
/// next call to [`advance_queue_if_needed`] (spawned by every caller right
/// after this returns). See SPEC_FULL.md's concurrency-translation note and
/// DESIGN.md's Open Question log for why this is safe.
pub(crate) fn start_erroring<C, E: Clone>(shared: &mut Shared<C, E>, err: E) {
    debug!("stream erroring");
    shared.state = StreamState::Erroring(err.clone());
    if let Some(writer) = &shared.writer {
        writer.ready.force_settle(Err(SignalError::Sink(err)));
    }
}

/// spec.md §4.2 `AdvanceQueueIfNeeded`, folded together with the "cascade
/// into FinishErroring" branch of spec.md §4.1.
pub(crate) fn advance_queue_if_needed<C, E: Clone>(shared: &mut Shared<C, E>) -> NextStep<C, E> {
    if !shared.started {
        return NextStep::None;
    }
    if shared.in_flight_write_request.is_some() || shared.in_flight_close_request.is_some() {
        return NextStep::None;
    }
    match &shared.state {
        StreamState::Closed | StreamState::Errored(_) => NextStep::None,
        StreamState::Erroring(err) => {
            let err = err.clone();
            finish_erroring(shared, err)
        }
        StreamState::Writable => match shared.queue.front() {
            None => NextStep::None,
            Some(QueueEntry::Close) => process_close(shared),
            Some(QueueEntry::Write { .. }) => process_write(shared),
        },
    }
}

/// spec.md §4.2 `ProcessWrite`.
fn process_write<C, E>(shared: &mut Shared<C, E>) -> NextStep<C, E> {
    let completion = shared
        .write_requests
        .pop_front()
        .expect("a queued write record implies a matching write request");
    shared.in_flight_write_request = Some(completion);
    let (chunk, size) = match shared.queue.pop_front() {
        Some(QueueEntry::Write { chunk, size }) => (chunk, size),
        _ => unreachable!("process_write called with a non-write queue front"),
    };
    shared.in_flight_write_size = Some(size);
    trace!("dispatching write to sink");
    NextStep::Write { chunk }
}

/// spec.md §4.2 `ProcessClose`.
fn process_close<C, E>(shared: &mut Shared<C, E>) -> NextStep<C, E> {
    let completion = shared
        .close_request
        .take()
        .expect("a queued close marker implies a close request");
    shared.in_flight_close_request = Some(completion);
    match shared.queue.pop_front() {
        Some(QueueEntry::Close) => {}
        _ => unreachable!("process_close called with a non-close queue front"),
    }
    debug_assert!(shared.queue.is_empty(), "close marker must be the last entry");
    trace!("dispatching close to sink");
    NextStep::Close
}

/// spec.md §4.1 `FinishInFlightWrite` (success half).
pub(crate) fn finish_in_flight_write<C, E: Clone>(shared: &mut Shared<C, E>) {
    let completion = shared
        .in_flight_write_request
        .take()
        .expect("finish_in_flight_write with nothing in flight");
    completion.force_settle(Ok(()));
    if let Some(size) = shared.in_flight_write_size.take() {
        shared.queue_total_size -= size;
        if shared.queue_total_size < 0.0 {
            shared.queue_total_size = 0.0;
        }
    }
    if !shared.close_queued_or_in_flight() && matches!(shared.state, StreamState::Writable) {
        let bp = shared.desired_size().map(|d| d <= 0.0).unwrap_or(false);
        update_backpressure(shared, bp);
    }
}

/// spec.md §4.1 `FinishInFlightWriteWithError`.
pub(crate) fn finish_in_flight_write_with_error<C, E: Clone>(shared: &mut Shared<C, E>, err: E) {
    let completion = shared
        .in_flight_write_request
        .take()
        .expect("finish_in_flight_write_with_error with nothing in flight");
    completion.force_settle(Err(err.clone()));
    deal_with_rejection(shared, err);
}

/// spec.md §4.1 `FinishInFlightClose` (success half).
pub(crate) fn finish_in_flight_close<C, E: Clone>(shared: &mut Shared<C, E>) {
    let completion = shared
        .in_flight_close_request
        .take()
        .expect("finish_in_flight_close with nothing in flight");
    completion.force_settle(Ok(()));
    if let StreamState::Erroring(_) = &shared.state {
        // A late error while erroring is discarded: closing won the race.
        if let Some(pending) = shared.pending_abort_request.take() {
            pending.completion.force_settle(Ok(()));
        }
    }
    debug!("stream closed");
    shared.state = StreamState::Closed;
    if let Some(writer) = &shared.writer {
        writer.closed.force_settle(Ok(()));
    }
}

/// spec.md §4.1 `FinishInFlightCloseWithError`.
pub(crate) fn finish_in_flight_close_with_error<C, E: Clone>(shared: &mut Shared<C, E>, err: E) {
    let completion = shared
        .in_flight_close_request
        .take()
        .expect("finish_in_flight_close_with_error with nothing in flight");
    completion.force_settle(Err(err.clone()));
    if let Some(pending) = &shared.pending_abort_request {
        pending.completion.force_settle(Err(err.clone()));
        shared.pending_abort_request = None;
    }
    deal_with_rejection(shared, err);
}

/// spec.md §4.1: "dispatch to error machinery" shared by both
/// `FinishInFlightWriteWithError` and a rejected `start`/`controller.error`.
fn deal_with_rejection<C, E: Clone>(shared: &mut Shared<C, E>, err: E) {
    match shared.state {
        StreamState::Writable => start_erroring(shared, err),
        StreamState::Erroring(_) => {
            // The in-flight op that just failed was the one FinishErroring
            // was waiting on; the next `advance_queue_if_needed` call picks
            // this up since `in_flight_*` is already cleared by the caller.
        }
        StreamState::Closed | StreamState::Errored(_) => {
            unreachable!("deal_with_rejection while not Writable/Erroring")
        }
    }
}

/// spec.md §4.1 `FinishErroring`. Precondition: `state = Erroring ∧
/// ¬hasOperationMarkedInFlight` (checked by the caller,
/// [`advance_queue_if_needed`]).
fn finish_erroring<C, E: Clone>(shared: &mut Shared<C, E>, err: E) -> NextStep<C, E> {
    shared.state = StreamState::Errored(err.clone());
    shared.queue.clear();
    shared.queue_total_size = 0.0;
    shared.in_flight_write_size = None;
    for request in shared.write_requests.drain(..) {
        request.force_settle(Err(err.clone()));
    }

    let abort_request = match shared.pending_abort_request.take() {
        None => {
            reject_close_and_closed(shared, err);
            return NextStep::None;
        }
        Some(req) => req,
    };

    if abort_request.was_already_erroring {
        abort_request.completion.force_settle(Err(err.clone()));
        reject_close_and_closed(shared, err);
        return NextStep::None;
    }

    let reason = abort_request
        .reason
        .clone()
        .expect("reason must be set when not already erroring");
    NextStep::Abort {
        reason,
        completion: abort_request.completion,
    }
}

fn reject_close_and_closed<C, E: Clone>(shared: &mut Shared<C, E>, err: E) {
    warn!("stream errored");
    if let Some(close_request) = shared.close_request.take() {
        close_request.force_settle(Err(err.clone()));
    }
    if let Some(writer) = &shared.writer {
        writer.closed.force_settle(Err(SignalError::Sink(err)));
    }
}

/// Called by the `drive` loop once `sink.abort` has settled, applying the
/// second half of spec.md §4.1 `FinishErroring` step 6: "Either way,
/// subsequently reject close+closed."
pub(crate) fn finish_abort<C, E: Clone>(
    shared: &mut Shared<C, E>,
    completion: RequestSignal<E>,
    result: Result<(), E>,
) {
    completion.force_settle(result);
    let err = shared
        .state
        .stored_error()
        .expect("state must be Errored once abort settles");
    reject_close_and_closed(shared, err);
}

/// spec.md §4.1 `UpdateBackpressure(bp)`.
pub(crate) fn update_backpressure<C, E: Clone>(shared: &mut Shared<C, E>, bp: bool) {
    if bp == shared.backpressure {
        return;
    }
    shared.backpressure = bp;
    if let Some(writer) = &shared.writer {
        if bp {
            writer.ready.reset_to_pending();
        } else {
            writer.ready.force_settle(Ok(()));
        }
    }
}

impl<E> fmt::Debug for StreamState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Writable => write!(f, "Writable"),
            StreamState::Erroring(_) => write!(f, "Erroring"),
            StreamState::Closed => write!(f, "Closed"),
            StreamState::Errored(_) => write!(f, "Errored"),
        }
    }
}
