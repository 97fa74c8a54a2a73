//! `portmux` — a broker-mediated, multiplexed message pipe fabric for
//! cross-process IPC.
//!
//! One [`transport::Transport`] byte stream (or, on Unix, one
//! `SCM_RIGHTS`-carrying socket) between two processes can carry many
//! independent, ordered [`pipe::MessagePipe`]s at once: a
//! [`routed::RoutedChannel`] demultiplexes inbound frames by route id and
//! buffers frames that arrive before their route is bound, so registration
//! races never reorder or drop a message. A [`broker::BrokerHost`] lets
//! processes that don't share a direct transport be introduced to each
//! other by a common parent, the same way a browser's privileged process
//! introduces two sandboxed renderers.
//!
//! ```text
//! process A                         process B
//! ┌─────────────┐  Transport   ┌─────────────┐
//! │ RoutedChannel│◄───────────►│ RoutedChannel│
//! │  route 7 ───┼──MessagePipe─┼─── route 7  │
//! │  route 0 (control) ────────┼─── route 0  │
//! └─────────────┘              └─────────────┘
//! ```
//!
//! Application code rarely touches [`routed::RoutedChannel`] directly —
//! [`registry::Registry`] and [`registry::MessagePipeDispatcher`] wire a
//! bound route straight to a [`pipe::MessagePipe`] so the familiar
//! `write_message`/`read_message`/`wait` surface is all a caller needs.

pub mod broker;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handle;
pub mod io_worker;
pub mod pipe;
pub mod registry;
pub mod routed;
pub mod transport;

pub use broker::{BrokerClient, BrokerEvent, BrokerHost, Introduction, ProcessId, BROKER_ROUTE};
pub use dispatcher::{Delegate, PipeId};
pub use error::{Error, Result};
pub use frame::{FrameLimits, FramedMessage};
pub use handle::PlatformHandle;
pub use io_worker::{TaskRunner, ThreadTaskRunner};
pub use pipe::{MessagePipe, PortIndex, ReadFlags, RoutedChannelConfig, WaitFlags};
pub use registry::{MessagePipeDispatcher, Registry};
pub use routed::RoutedChannel;
pub use transport::{ByteTransport, Transport};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct InlineRunner;
    impl TaskRunner for InlineRunner {
        fn post(&self, task: io_worker::Task) {
            task();
        }
    }

    struct Collector(Mutex<Vec<Vec<u8>>>);
    impl Delegate for Collector {
        fn on_read_message(&self, bytes: Vec<u8>, _handles: Vec<PlatformHandle>) {
            self.0.lock().unwrap().push(bytes);
        }
        fn on_error(&self, _error: Error) {}
    }

    /// Two independent routes multiplexed over one `RoutedChannel`: each
    /// keeps its own FIFO order and tearing one down doesn't disturb the
    /// other — full multi-process coverage lives in the
    /// `portmux-integration-test` crate).
    #[test]
    fn two_routes_stay_independent_over_one_channel() {
        let transport = Arc::new(ByteTransport::new(
            Cursor::new(Vec::<u8>::new()),
            Vec::<u8>::new(),
            FrameLimits::default(),
        ));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let flag = destroyed.clone();
        let channel = RoutedChannel::new(
            transport,
            Arc::new(InlineRunner),
            FrameLimits::default(),
            Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let a = Arc::new(Collector(Mutex::new(Vec::new())));
        let b = Arc::new(Collector(Mutex::new(Vec::new())));
        let a_delegate: Arc<dyn Delegate> = a.clone();
        let b_delegate: Arc<dyn Delegate> = b.clone();
        channel.add_route(1, &a_delegate).unwrap();
        channel.add_route(2, &b_delegate).unwrap();

        channel.write_message(1, b"hello-1".to_vec(), Vec::new()).unwrap();
        channel.write_message(2, b"hello-2".to_vec(), Vec::new()).unwrap();

        assert_eq!(channel.route_count(), 2);
        channel.remove_route(1, &a_delegate).unwrap();
        assert_eq!(channel.route_count(), 1);
        channel.remove_route(2, &b_delegate).unwrap();
        assert_eq!(channel.route_count(), 0);

        assert_eq!(destroyed.load(Ordering::SeqCst), 0, "transport never failed, so the channel must not self-destruct");
    }
}
