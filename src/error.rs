//! Hand-rolled error types for the writer- and controller-facing surfaces.
//!
//! No `thiserror`/`anyhow` here, matching the rest of this corpus: errors
//! are small enums with manual `Display`/`Error` impls.

use std::fmt;

/// A state violation reported synchronously at a writer/stream entry point,
/// without ever touching the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// The stream already has an active writer.
    Locked,
    /// A close has already been requested or is in flight.
    AlreadyClosing,
    /// The stream is closed, errored, or a close is queued/in-flight.
    NotWritable,
}

impl fmt::Display for StateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateErrorKind::Locked => write!(f, "the stream already has a writer"),
            StateErrorKind::AlreadyClosing => write!(f, "the stream is already closing"),
            StateErrorKind::NotWritable => write!(f, "the stream is closed, closing, or errored"),
        }
    }
}

/// Error returned by [`crate::WritableStreamDefaultWriter::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError<E> {
    /// A `StateError` per spec.md §7 — raised without consulting the sink.
    State(StateErrorKind),
    /// The writer's lock was released before this call settled.
    Released,
    /// The stream's stored error: the value the sink (or `controller.error`) produced.
    Sink(E),
}

impl<E: fmt::Display> fmt::Display for WriteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::State(kind) => write!(f, "{kind}"),
            WriteError::Released => write!(f, "writer's lock was released"),
            WriteError::Sink(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for WriteError<E> {}

/// Error returned by `close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseError<E> {
    State(StateErrorKind),
    Released,
    Sink(E),
}

impl<E: fmt::Display> fmt::Display for CloseError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseError::State(kind) => write!(f, "{kind}"),
            CloseError::Released => write!(f, "writer's lock was released"),
            CloseError::Sink(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CloseError<E> {}

/// Error returned by `abort`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError<E> {
    State(StateErrorKind),
    Released,
    Sink(E),
}

impl<E: fmt::Display> fmt::Display for AbortError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortError::State(kind) => write!(f, "{kind}"),
            AbortError::Released => write!(f, "writer's lock was released"),
            AbortError::Sink(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AbortError<E> {}

/// Error returned by `get_writer` when the stream already has an active writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyLocked;

impl fmt::Display for AlreadyLocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the stream already has a writer")
    }
}

impl std::error::Error for AlreadyLocked {}

/// Error returned by `desired_size` once the writer's lock has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedError;

impl fmt::Display for ReleasedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writer's lock was released")
    }
}

impl std::error::Error for ReleasedError {}

/// The value a [`crate::signal::DeferredSignal`] for `ready`/`closed` settles
/// with when it rejects: either the stream's stored sink error, or the fixed
/// "released" reason applied to a writer whose lock was released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError<E> {
    Sink(E),
    Released,
}

impl<E: fmt::Display> fmt::Display for SignalError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::Sink(e) => write!(f, "{e}"),
            SignalError::Released => write!(f, "writer's lock was released"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for SignalError<E> {}
