//! A pipelined, backpressure-aware writable stream core.
//!
//! This crate implements the writable-stream half of the WHATWG streams
//! state machine: a producer writes chunks through a
//! [`WritableStreamDefaultWriter`], which queues them on a
//! [`WritableStream`] and delivers them, in order and one at a time, to an
//! [`UnderlyingSink`]. Backpressure, close, abort, and error propagation are
//! all derived from four sink-supplied async operations
//! (`start`/`write`/`close`/`abort`) plus a [`QueuingStrategy`].
//!
//! The readable-stream side, transform streams, and pipe loops are out of
//! scope; this crate models only the writable core and its controller.

mod controller;
mod error;
mod signal;
mod sink;
mod strategy;
mod stream;
mod writer;

pub use error::{
    AbortError, AlreadyLocked, CloseError, ReleasedError, SignalError, StateErrorKind, WriteError,
};
pub use sink::UnderlyingSink;
pub use strategy::{ByteLengthQueuingStrategy, ByteSized, CountQueuingStrategy, QueuingStrategy};
pub use stream::WritableStream;
pub use writer::WritableStreamDefaultWriter;

/// Handed to [`UnderlyingSink`] methods; exposes only `error(reason)` to the
/// sink, matching the teacher's `WritableStreamDefaultController`.
pub use controller::WritableStreamController;
