//! The underlying sink: the four algorithms spec.md §6 names
//! (`start`/`write`/`close`/`abort`).
//!
//! Grounded in the teacher's `writable/stream/sink.rs` (`UnderlyingSink<'js>`)
//! and the `StartAlgorithm`/`WriteAlgorithm`/`CloseAlgorithm`/`AbortAlgorithm`
//! dispatchers in `writable/default_controller.rs`. There the four callbacks
//! are optional dynamically-typed JS functions converted from a dictionary;
//! here, since every sink is known statically, they're default-provided
//! trait methods instead.

use crate::controller::WritableStreamController;

/// A sink chunks are delivered to, one at a time, in order.
///
/// `start`/`close`/`abort` default to succeeding immediately, matching the
/// teacher's treatment of an absent callback as a no-op resolved promise.
#[async_trait::async_trait]
pub trait UnderlyingSink: Send + 'static {
    /// The type of value written to this sink.
    type Chunk: Send + 'static;
    /// The error type this sink's operations — and `controller.error` calls
    /// made while driving it — can produce. This *is* spec.md's
    /// `storedError`: once any operation rejects with a value of this type,
    /// that value is what the stream remembers and surfaces everywhere.
    type Error: std::error::Error + Clone + Send + Sync + 'static;

    /// Called once, before any chunk is delivered. Receives the controller
    /// so the sink can call `controller.error(e)` itself (e.g. in reaction
    /// to some out-of-band failure) even before the first write.
    async fn start(
        &mut self,
        _controller: &WritableStreamController<Self>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called once per accepted chunk, strictly in order, never while
    /// another `write`/`close` is outstanding (spec.md §5, ordering
    /// guarantee 2).
    async fn write(
        &mut self,
        chunk: Self::Chunk,
        controller: &WritableStreamController<Self>,
    ) -> Result<(), Self::Error>;

    /// Called at most once, after every queued write has drained
    /// successfully.
    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called at most once, and never after `close` has been invoked
    /// (spec.md §5, ordering guarantee 4).
    async fn abort(&mut self, _reason: Self::Error) -> Result<(), Self::Error> {
        Ok(())
    }
}
