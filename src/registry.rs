//! Process-local dispatcher registry: resolves a `(peer_process, pipe_id)`
//! pair arriving from the broker into a bound route on the right
//! [`RoutedChannel`], lazily creating that channel's entry the first time a
//! given peer process is seen.

use crate::broker::ProcessId;
use crate::dispatcher::{Delegate, PipeId};
use crate::error::{Error, Result};
use crate::handle::PlatformHandle;
use crate::pipe::{MessagePipe, PortIndex, ReadFlags, WaitFlags};
use crate::routed::RoutedChannel;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bridges one multiplexed route to an application-facing [`MessagePipe`]:
/// `on_read_message`/`on_error` from [`RoutedChannel`] land on port `One`,
/// the application reads/writes/waits on port `Zero`. Closing the
/// dispatcher closes port `Zero` locally and unbinds the route, then drops
/// the dispatcher's reference to the channel — the channel keeps itself
/// alive via its remaining routes or self-destructs once empty.
pub struct MessagePipeDispatcher {
    pipe: MessagePipe,
    channel: Arc<RoutedChannel>,
    pipe_id: PipeId,
    closed: AtomicBool,
}

impl MessagePipeDispatcher {
    fn new(channel: Arc<RoutedChannel>, pipe_id: PipeId) -> Arc<Self> {
        Arc::new(Self {
            pipe: MessagePipe::new(),
            channel,
            pipe_id,
            closed: AtomicBool::new(false),
        })
    }

    pub fn pipe_id(&self) -> PipeId {
        self.pipe_id
    }

    pub fn write_message(&self, bytes: Vec<u8>, handles: Vec<PlatformHandle>) -> Result<()> {
        self.channel.write_message(self.pipe_id, bytes, handles)
    }

    pub fn read_message(&self, max_buffer: usize, flags: ReadFlags) -> Result<(Vec<u8>, Vec<PlatformHandle>)> {
        self.pipe.read_message_with_handles(PortIndex::Zero, max_buffer, flags)
    }

    pub fn add_waiter(
        &self,
        flags: WaitFlags,
        context: u64,
        callback: Box<dyn FnOnce(Result<()>) + Send>,
    ) -> Result<()> {
        self.pipe.add_waiter(PortIndex::Zero, flags, context, callback)
    }

    pub fn cancel_all_waiters(&self) {
        self.pipe.cancel_all_waiters(PortIndex::Zero);
    }

    /// Idempotent. Unbinds from the channel and closes the local port; the
    /// underlying `RoutedChannel` decides, per its own state, whether a
    /// `ROUTE_CLOSED` frame goes out.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pipe.close(PortIndex::Zero);
        let delegate: Arc<dyn Delegate> = self.clone();
        self.channel.remove_route(self.pipe_id, &delegate)
    }
}

impl Delegate for MessagePipeDispatcher {
    fn on_read_message(&self, bytes: Vec<u8>, handles: Vec<PlatformHandle>) {
        if let Err(err) = self.pipe.write_message(PortIndex::One, bytes, handles) {
            log::debug!("dropping inbound message for closed local pipe {}: {err}", self.pipe_id);
        }
    }

    fn on_error(&self, error: Error) {
        log::debug!("pipe {} entering shutdown: {error}", self.pipe_id);
        self.pipe.close(PortIndex::One);
    }
}

/// Maps a peer process to its shared [`RoutedChannel`]. The corresponding
/// pipe-id-to-dispatcher mapping is kept by each [`MessagePipeDispatcher`]
/// itself rather than centrally — the registry only needs to find the
/// right channel, not enumerate every live dispatcher.
pub struct Registry {
    channels: Mutex<HashMap<ProcessId, Arc<RoutedChannel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the `RoutedChannel` for `peer`, lazily constructing one via
    /// `make` on first use.
    pub fn channel_for(&self, peer: ProcessId, make: impl FnOnce() -> Arc<RoutedChannel>) -> Arc<RoutedChannel> {
        self.channels.lock().entry(peer).or_insert_with(make).clone()
    }

    pub fn channel(&self, peer: ProcessId) -> Option<Arc<RoutedChannel>> {
        self.channels.lock().get(&peer).cloned()
    }

    /// Drops this registry's reference to `peer`'s channel. Called once the
    /// channel has reported itself idle (no routes, transport down), so the
    /// registry isn't the thing keeping a dead channel alive.
    pub fn forget_channel(&self, peer: ProcessId) {
        self.channels.lock().remove(&peer);
    }

    /// Services an inbound `ConnectMessagePipe(pipe_id, peer)` from the
    /// broker: finds or creates `peer`'s channel and binds a fresh
    /// dispatcher to `pipe_id` on it.
    pub fn connect_message_pipe(
        &self,
        peer: ProcessId,
        pipe_id: PipeId,
        make_channel: impl FnOnce() -> Arc<RoutedChannel>,
    ) -> Result<Arc<MessagePipeDispatcher>> {
        let channel = self.channel_for(peer, make_channel);
        let dispatcher = MessagePipeDispatcher::new(channel.clone(), pipe_id);
        let delegate: Arc<dyn Delegate> = dispatcher.clone();
        channel.add_route(pipe_id, &delegate)?;
        Ok(dispatcher)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameLimits;
    use crate::io_worker::{Task, TaskRunner};
    use crate::transport::ByteTransport;
    use std::io::Cursor;

    struct InlineRunner;
    impl TaskRunner for InlineRunner {
        fn post(&self, task: Task) {
            task();
        }
    }

    fn test_channel() -> Arc<RoutedChannel> {
        let transport = Arc::new(ByteTransport::new(
            Cursor::new(Vec::<u8>::new()),
            Vec::<u8>::new(),
            FrameLimits::default(),
        ));
        RoutedChannel::new(transport, Arc::new(InlineRunner), FrameLimits::default(), Box::new(|| {}))
    }

    #[test]
    fn connect_message_pipe_lazily_creates_and_reuses_channel() {
        let registry = Registry::new();
        let peer = ProcessId::generate();

        let dispatcher_a = registry.connect_message_pipe(peer, 1, test_channel).unwrap();
        let dispatcher_b = registry.connect_message_pipe(peer, 2, || panic!("should not be called twice")).unwrap();

        assert_eq!(dispatcher_a.channel.route_count(), dispatcher_b.channel.route_count());
        assert!(Arc::ptr_eq(&dispatcher_a.channel, &dispatcher_b.channel));
    }

    #[test]
    fn closing_dispatcher_unbinds_and_closes_local_port() {
        let registry = Registry::new();
        let peer = ProcessId::generate();
        let dispatcher = registry.connect_message_pipe(peer, 1, test_channel).unwrap();

        dispatcher.close().unwrap();
        assert_eq!(dispatcher.channel.route_count(), 0);
        assert!(matches!(
            dispatcher.read_message(64, ReadFlags::None),
            Err(Error::NotFound) | Err(Error::FailedPrecondition)
        ));
    }

    #[test]
    fn inbound_message_is_readable_through_dispatcher() {
        let registry = Registry::new();
        let peer = ProcessId::generate();
        let dispatcher = registry.connect_message_pipe(peer, 1, test_channel).unwrap();

        dispatcher.on_read_message(vec![1, 2, 3], Vec::new());
        let (bytes, _) = dispatcher.read_message(64, ReadFlags::None).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
