use thiserror::Error;

/// Errors surfaced by channels, pipelines and the per-channel serializer.
///
/// Transport adapters map their I/O failures into [`Error::Io`]; everything
/// else is a framework-level condition with well-defined handling (see the
/// per-variant docs).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required value was absent, e.g. a write without a connection or a
    /// connect without a remote address.
    #[error("nil object")]
    NilObject,

    /// A payload reached a point that cannot handle its concrete type, e.g.
    /// an outbound object the transport cannot encode.
    #[error("unknown object type")]
    UnknownObjectType,

    /// The operation was attempted on a channel past its inactive
    /// transition.
    #[error("channel not active")]
    NotActive,

    /// Internal sentinel: a read deadline fired while the connection is
    /// still alive, or a zero-byte read happened. The read pump loops on it
    /// without firing any event.
    #[error("skip")]
    Skip,

    /// The operation's future was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// An inbound message fell off the end of the pipeline without any
    /// handler consuming it.
    #[error("message not caught")]
    UnhandledRead,

    /// A handler panicked; the payload is converted into this error and
    /// delivered to the same handler's `error_caught`.
    #[error("handler panic: {0}")]
    HandlerPanic(String),

    /// Error raised by the underlying connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
