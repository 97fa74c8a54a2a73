//! The demultiplexer-facing delegate surface: the two callbacks a bound
//! route receives, modeled as a small trait rather than an inheritance
//! hierarchy.

use crate::error::Error;
use crate::handle::PlatformHandle;

/// Identifies a logical pipe within one [`crate::routed::RoutedChannel`].
/// Reserved value `0` is [`crate::frame::CONTROL_ROUTE`] and is never a
/// valid user route.
pub type PipeId = u64;

/// The callback surface a [`crate::routed::RoutedChannel`] drives a bound
/// route's dispatcher through. Implementations must not call back into the
/// same `RoutedChannel` on the same stack — inbound dispatch runs with the
/// channel's internal lock held, so reentrant calls would deadlock; queue
/// follow-up work through an [`crate::io_worker::TaskRunner`] instead.
///
/// `Sync` as well as `Send`: a bound route's dispatcher is reached through a
/// `Weak<dyn Delegate>` stored in the channel's shared routing table, and
/// `Arc`/`Weak` only implement `Send` for a `T` that is both.
pub trait Delegate: Send + Sync {
    /// A data frame addressed to this route arrived, in FIFO order relative
    /// to every other frame the peer sent on this same route.
    fn on_read_message(&self, bytes: Vec<u8>, handles: Vec<PlatformHandle>);

    /// The route entered an error/shutdown state. Exactly one of these will
    /// ever be delivered to a bound dispatcher for `READ_SHUTDOWN`; transport
    /// failures may additionally deliver this with a different error after
    /// the fact.
    fn on_error(&self, error: Error);
}
