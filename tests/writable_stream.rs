//! End-to-end scenarios against a fake sink, covering the externally
//! observable behaviors described for this state machine: write ordering,
//! backpressure transitions, error propagation, abort preemption, close
//! with error propagation, and writer-lock release.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use writable_stream::{
    ByteLengthQueuingStrategy, CountQueuingStrategy, SignalError, UnderlyingSink, WritableStream,
    WritableStreamController, WriteError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError(String);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestError {}

fn err(msg: &str) -> TestError {
    TestError(msg.to_string())
}

/// One `sink.write` call waiting on the test to decide how it settles.
struct WriteGateRequest {
    chunk: &'static str,
    respond: oneshot::Sender<Result<(), TestError>>,
}

#[derive(Clone, Default)]
struct SinkHandles {
    writes: Arc<Mutex<Vec<&'static str>>>,
    closes: Arc<Mutex<u32>>,
    aborts: Arc<Mutex<Vec<TestError>>>,
}

/// A fake [`UnderlyingSink`] that records every call it receives and,
/// optionally, blocks each `write` on an externally driven gate so tests
/// can observe in-flight state before deciding how the write settles.
struct RecordingSink {
    handles: SinkHandles,
    write_gate: Option<mpsc::UnboundedSender<WriteGateRequest>>,
    close_result: Result<(), TestError>,
}

impl RecordingSink {
    fn ungated() -> (Self, SinkHandles) {
        let handles = SinkHandles::default();
        (
            Self {
                handles: handles.clone(),
                write_gate: None,
                close_result: Ok(()),
            },
            handles,
        )
    }

    fn gated() -> (Self, SinkHandles, mpsc::UnboundedReceiver<WriteGateRequest>) {
        let handles = SinkHandles::default();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                handles: handles.clone(),
                write_gate: Some(tx),
                close_result: Ok(()),
            },
            handles,
            rx,
        )
    }

    fn failing_close(reason: TestError) -> (Self, SinkHandles) {
        let handles = SinkHandles::default();
        (
            Self {
                handles: handles.clone(),
                write_gate: None,
                close_result: Err(reason),
            },
            handles,
        )
    }
}

#[async_trait::async_trait]
impl UnderlyingSink for RecordingSink {
    type Chunk = &'static str;
    type Error = TestError;

    async fn write(
        &mut self,
        chunk: Self::Chunk,
        _controller: &WritableStreamController<Self>,
    ) -> Result<(), Self::Error> {
        self.handles.writes.lock().unwrap().push(chunk);
        if let Some(gate) = &self.write_gate {
            let (tx, rx) = oneshot::channel();
            gate.send(WriteGateRequest { chunk, respond: tx }).ok();
            return rx.await.unwrap_or(Ok(()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        *self.handles.closes.lock().unwrap() += 1;
        self.close_result.clone()
    }

    async fn abort(&mut self, reason: Self::Error) -> Result<(), Self::Error> {
        self.handles.aborts.lock().unwrap().push(reason);
        Ok(())
    }
}

/// Scenario 1: happy path — every write settles, in the order issued, and
/// the sink sees them in that same order.
#[tokio::test]
async fn happy_path_writes_settle_in_order() {
    let (sink, handles) = RecordingSink::ungated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(2.0));
    let writer = stream.get_writer().unwrap();

    writer.write("a").await.unwrap();
    writer.write("b").await.unwrap();
    writer.write("c").await.unwrap();

    assert_eq!(*handles.writes.lock().unwrap(), vec!["a", "b", "c"]);
    writer.ready().await.unwrap();
    writer.close().await.unwrap();
    assert_eq!(*handles.closes.lock().unwrap(), 1);
}

/// Scenario 2 (adjusted to the formal invariant in spec.md §3 point 7
/// rather than the prose walkthrough's off-by-one framing): with hwm=1,
/// `ready` flips to pending once an in-flight write makes `desiredSize <=
/// 0`, and flips back once the write settles and desiredSize rises above
/// zero again.
#[tokio::test]
async fn backpressure_engages_and_lifts_around_in_flight_writes() {
    let (sink, _handles, mut write_gate) = RecordingSink::gated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(1.0));
    let writer = Arc::new(stream.get_writer().unwrap());

    // desiredSize starts at 1 (> 0): ready is already resolved.
    writer.ready().await.unwrap();
    assert_eq!(writer.desired_size().unwrap(), Some(1.0));

    let wa = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("a").await })
    };
    let gate_a = write_gate.recv().await.expect("write(\"a\") reached the sink");
    assert_eq!(gate_a.chunk, "a");

    // "a" is in flight: desiredSize is 0, backpressure is engaged.
    assert_eq!(writer.desired_size().unwrap(), Some(0.0));
    assert!(
        tokio::time::timeout(Duration::from_millis(20), writer.ready())
            .await
            .is_err(),
        "ready must stay pending while a single in-flight write saturates hwm=1"
    );

    gate_a.respond.send(Ok(())).unwrap();
    wa.await.unwrap().unwrap();

    // desiredSize rose back to 1 once "a" settled: ready resolves.
    writer.ready().await.unwrap();
    assert_eq!(writer.desired_size().unwrap(), Some(1.0));
}

/// Scenario 3: a write rejection errors the whole stream; the failed
/// write's own future carries the error, every later write rejects with
/// the same stored error, and so does `closed`.
#[tokio::test]
async fn write_error_errors_the_stream() {
    let (sink, handles, mut write_gate) = RecordingSink::gated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(10.0));
    let writer = Arc::new(stream.get_writer().unwrap());

    let wa = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("a").await })
    };
    let gate_a = write_gate.recv().await.unwrap();
    gate_a.respond.send(Ok(())).unwrap();
    assert!(wa.await.unwrap().is_ok());

    let wb = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("b").await })
    };
    let gate_b = write_gate.recv().await.unwrap();
    let boom = err("boom");
    gate_b.respond.send(Err(boom.clone())).unwrap();
    assert_eq!(wb.await.unwrap(), Err(WriteError::Sink(boom.clone())));

    assert_eq!(
        writer.write("c").await,
        Err(WriteError::Sink(boom.clone()))
    );
    assert_eq!(writer.closed().await, Err(SignalError::Sink(boom)));
    assert_eq!(*handles.writes.lock().unwrap(), vec!["a", "b"]);
}

/// Scenario 4: aborting while writes are queued rejects the not-yet-
/// dispatched ones with the abort reason, lets the in-flight write settle
/// normally, and invokes `sink.abort` exactly once, after that write
/// settles.
#[tokio::test]
async fn abort_preempts_queued_writes() {
    let (sink, handles, mut write_gate) = RecordingSink::gated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(10.0));
    let writer = Arc::new(stream.get_writer().unwrap());

    let wa = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("a").await })
    };
    let gate_a = write_gate.recv().await.unwrap();

    let wb = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("b").await })
    };
    let wc = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("c").await })
    };
    // Let "b"/"c" finish their synchronous enqueue step; neither should
    // ever reach the sink, since "a" holds the only in-flight slot.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let reason = err("aborted");
    let abort_fut = {
        let writer = writer.clone();
        let reason = reason.clone();
        tokio::spawn(async move { writer.abort(reason).await })
    };

    assert_eq!(
        wb.await.unwrap(),
        Err(WriteError::Sink(reason.clone())),
        "b was queued but not dispatched: abort must preempt it"
    );
    assert_eq!(
        wc.await.unwrap(),
        Err(WriteError::Sink(reason.clone())),
        "c was queued but not dispatched: abort must preempt it"
    );

    // "a" was already in flight: it is not interrupted and resolves.
    gate_a.respond.send(Ok(())).unwrap();
    assert!(wa.await.unwrap().is_ok());

    assert!(abort_fut.await.unwrap().is_ok());
    assert_eq!(*handles.aborts.lock().unwrap(), vec![reason]);
    assert_eq!(*handles.writes.lock().unwrap(), vec!["a"]);
    assert!(
        write_gate.try_recv().is_err(),
        "sink.write must never have been called for b or c"
    );
}

/// Scenario 5: close, then a `sink.close` rejection — the close future
/// rejects with that error, the stream errors, and `sink.abort` is never
/// called (no abort after close was attempted).
#[tokio::test]
async fn close_error_propagation_errors_without_aborting() {
    let boom = err("close failed");
    let (sink, handles) = RecordingSink::failing_close(boom.clone());
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(10.0));
    let writer = stream.get_writer().unwrap();

    let close_result = writer.close().await;
    assert_eq!(close_result, Err(writable_stream::CloseError::Sink(boom.clone())));
    assert_eq!(writer.closed().await, Err(SignalError::Sink(boom)));
    assert_eq!(*handles.closes.lock().unwrap(), 1);
    assert!(
        handles.aborts.lock().unwrap().is_empty(),
        "sink.abort must never run after sink.close was attempted"
    );
}

/// Scenario 5b: a pending `abort()` concurrent with a rejecting close also
/// rejects with the close error, and still never reaches `sink.abort`.
#[tokio::test]
async fn concurrent_abort_during_failing_close_shares_the_close_error() {
    let boom = err("close failed");
    let (sink, handles) = RecordingSink::failing_close(boom.clone());
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(10.0));
    let writer = Arc::new(stream.get_writer().unwrap());

    let close_fut = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.close().await })
    };
    // abort() arriving once close is queued/in-flight joins the same
    // error path rather than issuing a second sink interaction.
    let abort_fut = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.abort(err("ignored, close already attempted")).await })
    };

    let close_result = close_fut.await.unwrap();
    let abort_result = abort_fut.await.unwrap();

    assert_eq!(close_result, Err(writable_stream::CloseError::Sink(boom.clone())));
    assert_eq!(abort_result, Err(writable_stream::AbortError::Sink(boom)));
    assert!(handles.aborts.lock().unwrap().is_empty());
}

/// Scenario 6: releasing a writer whose `ready` is pending settles both
/// `ready` and `closed` with a released-lock error, future writes on that
/// handle reject the same way, and the stream itself stays writable and
/// can be re-locked.
#[tokio::test]
async fn release_lock_rejects_pending_signals_and_allows_relock() {
    let (sink, _handles, mut write_gate) = RecordingSink::gated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(1.0));
    let writer = stream.get_writer().unwrap();

    let writer = Arc::new(writer);
    let wa = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("a").await })
    };
    let gate_a = write_gate.recv().await.unwrap();
    // hwm=1 and one in-flight write: ready is pending.
    assert!(
        tokio::time::timeout(Duration::from_millis(20), writer.ready())
            .await
            .is_err()
    );

    writer.release_lock();

    assert_eq!(writer.ready().await, Err(SignalError::Released));
    assert_eq!(writer.closed().await, Err(SignalError::Released));
    assert_eq!(writer.write("late").await, Err(WriteError::Released));

    // The in-flight write on the old sink handle still settles normally;
    // releasing the writer doesn't interrupt it.
    gate_a.respond.send(Ok(())).unwrap();
    wa.await.unwrap().unwrap();

    assert!(!stream.locked());
    let _second_writer = stream.get_writer().expect("stream can be relocked after release");
}

/// `releaseLock` is idempotent, and dropping a writer releases it too.
#[tokio::test]
async fn drop_releases_the_writer_lock() {
    let (sink, _handles) = RecordingSink::ungated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(1.0));
    {
        let writer = stream.get_writer().unwrap();
        writer.release_lock();
        writer.release_lock(); // idempotent
    }
    assert!(!stream.locked());

    let writer = stream.get_writer().unwrap();
    assert!(stream.locked());
    drop(writer);
    assert!(!stream.locked());
}

/// `getWriter` throws (here: errors) while the stream already has a writer.
#[tokio::test]
async fn get_writer_rejects_while_locked() {
    let (sink, _handles) = RecordingSink::ungated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(1.0));
    let _writer = stream.get_writer().unwrap();
    assert!(stream.get_writer().is_err());
}

/// `close()` rejects once a close has already been queued.
#[tokio::test]
async fn double_close_rejects_with_state_error() {
    let (sink, _handles) = RecordingSink::ungated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(1.0));
    let writer = Arc::new(stream.get_writer().unwrap());

    let w1 = writer.clone();
    let first = tokio::spawn(async move { w1.close().await });
    tokio::task::yield_now().await;

    let second = writer.close().await;
    assert!(second.is_err());
    first.await.unwrap().unwrap();
}

/// spec.md §4.4 `CloseWithErrorPropagation`: resolves immediately once the
/// stream is already closed, and rejects with the stored error once the
/// stream is errored, instead of raising a fresh `StateError`.
#[tokio::test]
async fn close_with_error_propagation_matches_terminal_state() {
    let (sink, _handles) = RecordingSink::ungated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(1.0));
    let writer = stream.get_writer().unwrap();

    writer.close().await.unwrap();
    // Already closed: resolves instead of erroring on a second close call.
    writer.close_with_error_propagation().await.unwrap();

    let boom = err("boom");
    let (sink, handles, mut write_gate) = RecordingSink::gated();
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(10.0));
    let writer = Arc::new(stream.get_writer().unwrap());
    let wa = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write("a").await })
    };
    let gate_a = write_gate.recv().await.unwrap();
    gate_a.respond.send(Err(boom.clone())).unwrap();
    wa.await.unwrap();

    assert_eq!(
        writer.close_with_error_propagation().await,
        Err(writable_stream::CloseError::Sink(boom))
    );
    assert_eq!(*handles.closes.lock().unwrap(), 0);
}

/// A sink whose `start` reaches for `controller.error(e)` itself, the way
/// spec.md §6 describes for out-of-band failures unrelated to any
/// particular write.
struct ErroringStartSink {
    reason: TestError,
}

#[async_trait::async_trait]
impl UnderlyingSink for ErroringStartSink {
    type Chunk = &'static str;
    type Error = TestError;

    async fn start(
        &mut self,
        controller: &WritableStreamController<Self>,
    ) -> Result<(), Self::Error> {
        controller.error(self.reason.clone());
        Ok(())
    }

    async fn write(
        &mut self,
        _chunk: Self::Chunk,
        _controller: &WritableStreamController<Self>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// spec.md §6's controller surface: `error(e)` lets the sink fail the
/// stream out of band, without going through a rejected write/close/abort.
#[tokio::test]
async fn controller_error_fails_the_stream_out_of_band() {
    let reason = err("out-of-band");
    let sink = ErroringStartSink {
        reason: reason.clone(),
    };
    let stream = WritableStream::new(sink, CountQueuingStrategy::new(10.0));
    let writer = stream.get_writer().unwrap();

    assert_eq!(writer.write("a").await, Err(WriteError::Sink(reason.clone())));
    assert_eq!(writer.closed().await, Err(SignalError::Sink(reason)));
}

/// A gated sink over `Vec<u8>` chunks, for exercising
/// `ByteLengthQueuingStrategy` (size = byte length, not chunk count).
struct BytesRecordingSink {
    write_gate: mpsc::UnboundedSender<BytesWriteGateRequest>,
}

struct BytesWriteGateRequest {
    len: usize,
    respond: oneshot::Sender<Result<(), TestError>>,
}

#[async_trait::async_trait]
impl UnderlyingSink for BytesRecordingSink {
    type Chunk = Vec<u8>;
    type Error = TestError;

    async fn write(
        &mut self,
        chunk: Self::Chunk,
        _controller: &WritableStreamController<Self>,
    ) -> Result<(), Self::Error> {
        let (tx, rx) = oneshot::channel();
        self.write_gate
            .send(BytesWriteGateRequest {
                len: chunk.len(),
                respond: tx,
            })
            .ok();
        rx.await.unwrap_or(Ok(()))
    }
}

/// spec.md §6's `ByteLengthQueuingStrategy`: a chunk's contribution to
/// `desiredSize` is its byte length, not 1-per-chunk.
#[tokio::test]
async fn byte_length_queuing_strategy_sizes_by_byte_length() {
    let (tx, mut write_gate) = mpsc::unbounded_channel();
    let sink = BytesRecordingSink { write_gate: tx };
    let stream = WritableStream::new(sink, ByteLengthQueuingStrategy::new(10.0));
    let writer = Arc::new(stream.get_writer().unwrap());

    assert_eq!(writer.desired_size().unwrap(), Some(10.0));

    let chunk = vec![0u8; 4];
    let w1 = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write(chunk).await })
    };
    let gate1 = write_gate.recv().await.unwrap();
    assert_eq!(gate1.len, 4);
    // The 4-byte chunk is in flight: desiredSize = 10 - 4 = 6, still positive.
    assert_eq!(writer.desired_size().unwrap(), Some(6.0));
    writer.ready().await.unwrap();

    gate1.respond.send(Ok(())).unwrap();
    w1.await.unwrap().unwrap();
    assert_eq!(writer.desired_size().unwrap(), Some(10.0));

    let big_chunk = vec![0u8; 11];
    let w2 = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write(big_chunk).await })
    };
    let gate2 = write_gate.recv().await.unwrap();
    assert_eq!(gate2.len, 11);
    // An 11-byte chunk alone exceeds hwm=10: desiredSize goes negative.
    assert_eq!(writer.desired_size().unwrap(), Some(-1.0));
    assert!(
        tokio::time::timeout(Duration::from_millis(20), writer.ready())
            .await
            .is_err()
    );
    gate2.respond.send(Ok(())).unwrap();
    w2.await.unwrap().unwrap();
    writer.ready().await.unwrap();
}
