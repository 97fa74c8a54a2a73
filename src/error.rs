//! Error types returned by the local pipe API and the routing layer.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`crate::pipe::MessagePipe`], [`crate::routed::RoutedChannel`]
/// and the broker control plane.
///
/// The local-pipe variants (`NotFound` through `DeadlineExceeded`) are returned by
/// value from the port API. The remaining variants describe
/// channel- and transport-level failures, which are delivered to dispatchers via
/// [`crate::dispatcher::Delegate::on_error`] rather than returned from a call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nothing queued to read, and the peer port is still open.
    #[error("no message queued")]
    NotFound,

    /// The read buffer was too small, or a write's size was implausible.
    #[error("resource exhausted (next message is {0} bytes)")]
    ResourceExhausted(usize),

    /// A null buffer with nonzero length, a null handle array with nonzero
    /// count, or some other malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The peer port is closed and can no longer be written to, or can never
    /// satisfy the waiter flags requested.
    #[error("peer port is closed")]
    FailedPrecondition,

    /// Delivered to a bound dispatcher when its peer closed its end of the pipe.
    #[error("peer closed its end of the route")]
    ReadShutdown,

    /// A waiter was cancelled by `Close`/`CancelAllWaiters`.
    #[error("waiter cancelled")]
    Cancelled,

    /// A timed wait expired before its flags were satisfied.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The flag being armed is already satisfied and can't be waited on.
    #[error("waiter condition already satisfied")]
    AlreadyExists,

    /// The underlying transport failed (link down, I/O error).
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A frame violated the wire protocol (bad length, unknown opcode,
    /// duplicate `ROUTE_CLOSED`, oversized handle count, ...). Fatal to the
    /// channel that received it.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// `AddRoute`/`RemoveRoute` called with `pipe_id == 0`, or a route that
    /// is already bound / not bound to the caller.
    #[error("invalid route: {0}")]
    InvalidRoute(&'static str),
}
