//! `RoutedChannel`: ordered per-pipe delivery multiplexed over one shared
//! [`Transport`]. This is the component that turns a single byte stream (or
//! datagram socket) into many independent, FIFO-ordered pipes.

use crate::dispatcher::{Delegate, PipeId};
use crate::error::{Error, Result};
use crate::frame::{FrameLimits, FramedMessage, CONTROL_ROUTE};
use crate::handle::PlatformHandle;
use crate::io_worker::{Pumpable, TaskRunner};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

struct PendingMessage {
    route_id: PipeId,
    bytes: Vec<u8>,
    handles: Vec<PlatformHandle>,
}

struct State {
    routes: HashMap<PipeId, Weak<dyn Delegate>>,
    /// Frames that arrived addressed to a route nobody has bound yet,
    /// in arrival order. Drained (filtered by route id, order preserved)
    /// the moment [`RoutedChannel::add_route`] binds that route.
    pending: Vec<PendingMessage>,
    /// Pipe ids the peer has told us, via an internal `ROUTE_CLOSED` frame,
    /// that it has torn down. A single set serves two jobs: detecting a
    /// duplicate `ROUTE_CLOSED` for the same pipe (hard protocol error) and
    /// letting a racing local `RemoveRoute` recognize that the peer already
    /// closed its side, so it must not send a second `ROUTE_CLOSED` of its
    /// own — the two sides meet exactly once, never twice.
    closed_routes: HashSet<PipeId>,
    transport_down: bool,
}

/// Multiplexes many [`crate::pipe::MessagePipe`]-backed routes over one
/// [`Transport`]. Always used behind an `Arc`, since deferred self-teardown
/// and the I/O worker's pump loop both need to hold a reference to the
/// channel independent of any particular caller's stack frame.
pub struct RoutedChannel {
    transport: Arc<dyn Transport>,
    io_worker: Arc<dyn TaskRunner>,
    limits: FrameLimits,
    state: Mutex<State>,
    /// Fires exactly once, when the channel has no bound routes left and
    /// its transport has failed. Typically owned by a
    /// [`crate::registry::Registry`] entry; firing it is what actually
    /// drops the last strong reference and lets the channel deallocate —
    /// there is no `delete this` in Rust, only giving up ownership.
    on_idle: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RoutedChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        io_worker: Arc<dyn TaskRunner>,
        limits: FrameLimits,
        on_idle: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            io_worker,
            limits,
            state: Mutex::new(State {
                routes: HashMap::new(),
                pending: Vec::new(),
                closed_routes: HashSet::new(),
                transport_down: false,
            }),
            on_idle: Mutex::new(Some(on_idle)),
        })
    }

    /// The frame size/handle-count ceilings this channel enforces on decode.
    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    pub fn route_count(&self) -> usize {
        self.state.lock().routes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().transport_down
    }

    /// Binds `pipe_id` to `dispatcher`. Delivers, in arrival order and
    /// still under the channel's lock, any frames that arrived for this
    /// route before it was bound. If the peer already closed this route
    /// while it was unbound, delivers `OnError(ReadShutdown)` last, after
    /// every buffered message.
    pub fn add_route(self: &Arc<Self>, pipe_id: PipeId, dispatcher: &Arc<dyn Delegate>) -> Result<()> {
        log::trace!("add_route pipe={pipe_id}");
        if pipe_id == CONTROL_ROUTE {
            return Err(Error::InvalidRoute("pipe id 0 is reserved for control traffic"));
        }

        let mut state = self.state.lock();
        if state.routes.contains_key(&pipe_id) {
            return Err(Error::InvalidRoute("route is already bound"));
        }
        state.routes.insert(pipe_id, Arc::downgrade(dispatcher));
        log::debug!("pipe {pipe_id} bound");

        let buffered = std::mem::take(&mut state.pending);
        let mut remaining = Vec::with_capacity(buffered.len());
        let mut drained = Vec::new();
        for msg in buffered {
            if msg.route_id == pipe_id {
                drained.push(msg);
            } else {
                remaining.push(msg);
            }
        }
        state.pending = remaining;

        for msg in drained {
            dispatcher.on_read_message(msg.bytes, msg.handles);
        }

        if state.closed_routes.contains(&pipe_id) {
            dispatcher.on_error(Error::ReadShutdown);
        }

        Ok(())
    }

    /// Unbinds `pipe_id`. `dispatcher` must be the exact `Arc` currently
    /// bound to it. Sends an internal `ROUTE_CLOSED` frame unless the peer
    /// already told us it closed this route first, in which case the two
    /// sides have met and nothing goes out on the wire.
    pub fn remove_route(self: &Arc<Self>, pipe_id: PipeId, dispatcher: &Arc<dyn Delegate>) -> Result<()> {
        log::trace!("remove_route pipe={pipe_id}");
        let mut state = self.state.lock();
        match state.routes.get(&pipe_id).and_then(Weak::upgrade) {
            Some(bound) if Arc::ptr_eq(&bound, dispatcher) => {}
            Some(_) => return Err(Error::InvalidRoute("dispatcher does not match current binding")),
            None => return Err(Error::InvalidRoute("route is not bound")),
        }
        state.routes.remove(&pipe_id);

        if !state.closed_routes.remove(&pipe_id) && !state.transport_down {
            let frame = FramedMessage::route_closed(pipe_id);
            if let Err(err) = self.transport.send(frame) {
                log::warn!("transport failed while sending ROUTE_CLOSED for pipe {pipe_id}: {err}");
                state.transport_down = true;
            }
        }

        let should_destruct = state.routes.is_empty() && state.transport_down;
        drop(state);

        log::debug!("pipe {pipe_id} unbound");
        if should_destruct {
            self.defer_self_destruct();
        }
        Ok(())
    }

    /// Writes an application message on `pipe_id`. Route 0 is reserved; use
    /// [`RoutedChannel::add_route`]/[`RoutedChannel::remove_route`] instead.
    /// Rejects payloads or handle counts past [`Self::limits`] with
    /// `ResourceExhausted` before ever touching the transport, mirroring the
    /// same ceiling frame decode enforces on the inbound side.
    pub fn write_message(&self, pipe_id: PipeId, bytes: Vec<u8>, handles: Vec<PlatformHandle>) -> Result<()> {
        if pipe_id == CONTROL_ROUTE {
            return Err(Error::InvalidRoute("cannot write application data on the control route"));
        }
        if bytes.len() > self.limits.max_payload_len || handles.len() as u32 > self.limits.max_handles {
            return Err(Error::ResourceExhausted(bytes.len()));
        }
        self.transport.send(FramedMessage::data(pipe_id, bytes, handles))
    }

    /// Pumps the transport once for inbound frames, dispatching each to its
    /// bound route or buffering it if unbound. Intended to run cooperatively
    /// on the shared I/O worker thread; see [`Pumpable`].
    pub fn pump(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let result = self.transport.poll(&mut |frame| this.dispatch_inbound(frame));
        if let Err(err) = result {
            self.handle_transport_error(err);
        }
    }

    fn dispatch_inbound(&self, frame: FramedMessage) {
        if frame.route_id == CONTROL_ROUTE {
            self.dispatch_control(frame);
            return;
        }

        let mut state = self.state.lock();
        if let Some(dispatcher) = state.routes.get(&frame.route_id).and_then(Weak::upgrade) {
            log::trace!("dispatching frame to bound pipe {}", frame.route_id);
            dispatcher.on_read_message(frame.payload, frame.handles);
            return;
        }
        log::trace!("buffering frame for unbound pipe {}", frame.route_id);
        state.pending.push(PendingMessage {
            route_id: frame.route_id,
            bytes: frame.payload,
            handles: frame.handles,
        });
    }

    fn dispatch_control(&self, frame: FramedMessage) {
        let closed_pipe = match frame.parse_route_closed() {
            Ok(id) => id,
            Err(msg) => {
                log::error!("control route protocol violation: {msg}");
                self.handle_transport_error(Error::Protocol(msg));
                return;
            }
        };

        let mut state = self.state.lock();
        if !state.closed_routes.insert(closed_pipe) {
            drop(state);
            log::warn!("duplicate ROUTE_CLOSED received for pipe {closed_pipe}");
            self.handle_transport_error(Error::Protocol("duplicate ROUTE_CLOSED for the same pipe"));
            return;
        }
        log::debug!("peer closed pipe {closed_pipe}");

        if let Some(dispatcher) = state.routes.get(&closed_pipe).and_then(Weak::upgrade) {
            dispatcher.on_error(Error::ReadShutdown);
        }
    }

    /// Marks the transport dead, notifies every currently-bound dispatcher,
    /// and — only if no routes remain bound at that instant — destructs
    /// inline. Called from the I/O worker thread, so there is no caller
    /// upstack for an inline destruction to interrupt.
    fn handle_transport_error(&self, err: Error) {
        let mut state = self.state.lock();
        if state.transport_down {
            return;
        }
        log::error!("transport failed, tearing down channel: {err}");
        state.transport_down = true;

        let bindings: Vec<_> = state.routes.values().filter_map(Weak::upgrade).collect();
        let empty = state.routes.is_empty();
        drop(state);

        let message = err.to_string();
        for dispatcher in bindings {
            dispatcher.on_error(Error::Transport(std::io::Error::other(message.clone())));
        }

        if empty {
            self.fire_on_idle();
        }
    }

    fn defer_self_destruct(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.io_worker.post(Box::new(move || this.fire_on_idle()));
    }

    fn fire_on_idle(&self) {
        if let Some(cb) = self.on_idle.lock().take() {
            cb();
        }
    }
}

/// Adapts a `Weak<RoutedChannel>` to [`Pumpable`] so it can be registered
/// on a [`crate::io_worker::ThreadTaskRunner`] without granting the worker
/// ownership of the channel. `RoutedChannel::pump` itself needs `&Arc<Self>`
/// (to clone a reference into the dispatch closure), which `Pumpable`'s
/// `&self`-only contract can't express directly.
pub struct ChannelPump(Weak<RoutedChannel>);

impl ChannelPump {
    pub fn new(channel: &Arc<RoutedChannel>) -> Self {
        Self(Arc::downgrade(channel))
    }
}

impl Pumpable for ChannelPump {
    fn pump(&self) {
        if let Some(channel) = self.0.upgrade() {
            channel.pump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ByteTransport;
    use parking_lot::Mutex as PMutex;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingDelegate {
        messages: PMutex<Vec<(Vec<u8>, usize)>>,
        errors: PMutex<Vec<String>>,
    }

    impl RecordingDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: PMutex::new(Vec::new()),
                errors: PMutex::new(Vec::new()),
            })
        }
    }

    impl Delegate for RecordingDelegate {
        fn on_read_message(&self, bytes: Vec<u8>, handles: Vec<PlatformHandle>) {
            self.messages.lock().push((bytes, handles.len()));
        }

        fn on_error(&self, error: Error) {
            self.errors.lock().push(error.to_string());
        }
    }

    struct NullRunner;
    impl TaskRunner for NullRunner {
        fn post(&self, task: crate::io_worker::Task) {
            task();
        }
    }

    fn loopback_channel() -> Arc<RoutedChannel> {
        loopback_channel_with_idle_flag().0
    }

    fn loopback_channel_with_idle_flag() -> (Arc<RoutedChannel>, Arc<AtomicBool>) {
        let transport: Arc<dyn Transport> = Arc::new(ByteTransport::new(
            Cursor::new(Vec::<u8>::new()),
            Vec::<u8>::new(),
            FrameLimits::default(),
        ));
        let destroyed = Arc::new(AtomicBool::new(false));
        let flag = destroyed.clone();
        let channel = RoutedChannel::new(
            transport,
            Arc::new(NullRunner),
            FrameLimits::default(),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        (channel, destroyed)
    }

    #[test]
    fn add_route_rejects_control_route() {
        let channel = loopback_channel();
        let delegate: Arc<dyn Delegate> = RecordingDelegate::new();
        assert!(matches!(
            channel.add_route(CONTROL_ROUTE, &delegate),
            Err(Error::InvalidRoute(_))
        ));
    }

    #[test]
    fn add_route_twice_for_same_pipe_fails() {
        let channel = loopback_channel();
        let delegate: Arc<dyn Delegate> = RecordingDelegate::new();
        channel.add_route(7, &delegate).unwrap();
        assert!(matches!(channel.add_route(7, &delegate), Err(Error::InvalidRoute(_))));
    }

    #[test]
    fn remove_route_requires_matching_dispatcher() {
        let channel = loopback_channel();
        let a: Arc<dyn Delegate> = RecordingDelegate::new();
        let b: Arc<dyn Delegate> = RecordingDelegate::new();
        channel.add_route(3, &a).unwrap();
        assert!(matches!(channel.remove_route(3, &b), Err(Error::InvalidRoute(_))));
        channel.remove_route(3, &a).unwrap();
    }

    #[test]
    fn write_message_rejects_payload_past_limits() {
        let transport: Arc<dyn Transport> = Arc::new(ByteTransport::new(
            Cursor::new(Vec::<u8>::new()),
            Vec::<u8>::new(),
            FrameLimits::default(),
        ));
        let tiny_limits = FrameLimits {
            max_payload_len: 4,
            max_handles: 1,
        };
        let channel = RoutedChannel::new(transport, Arc::new(NullRunner), tiny_limits, Box::new(|| {}));

        assert!(matches!(
            channel.write_message(1, vec![0u8; 5], Vec::new()),
            Err(Error::ResourceExhausted(5))
        ));
        channel.write_message(1, vec![0u8; 4], Vec::new()).unwrap();
    }

    #[test]
    fn pending_frames_are_delivered_in_order_once_bound() {
        let channel = loopback_channel();

        channel.dispatch_inbound(FramedMessage::data(9, b"first".to_vec(), Vec::new()));
        channel.dispatch_inbound(FramedMessage::data(9, b"second".to_vec(), Vec::new()));
        channel.dispatch_inbound(FramedMessage::data(1, b"unrelated".to_vec(), Vec::new()));

        let delegate = RecordingDelegate::new();
        let dyn_delegate: Arc<dyn Delegate> = delegate.clone();
        channel.add_route(9, &dyn_delegate).unwrap();

        let messages = delegate.messages.lock();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, b"first");
        assert_eq!(messages[1].0, b"second");
    }

    #[test]
    fn route_closed_while_unbound_is_delivered_as_error_on_bind() {
        let channel = loopback_channel();
        channel.dispatch_control(FramedMessage::route_closed(5));

        let delegate = RecordingDelegate::new();
        let dyn_delegate: Arc<dyn Delegate> = delegate.clone();
        channel.add_route(5, &dyn_delegate).unwrap();

        assert_eq!(delegate.errors.lock().len(), 1);
    }

    #[test]
    fn route_closed_while_bound_delivers_error_immediately_and_suppresses_local_send() {
        let channel = loopback_channel();
        let delegate = RecordingDelegate::new();
        let dyn_delegate: Arc<dyn Delegate> = delegate.clone();
        channel.add_route(11, &dyn_delegate).unwrap();

        channel.dispatch_control(FramedMessage::route_closed(11));
        assert_eq!(delegate.errors.lock().len(), 1);

        // Peer already told us it closed 11; our own RemoveRoute must not
        // attempt to send a second ROUTE_CLOSED (no transport to send on
        // here, so failure would show up as a transport error instead of
        // a clean Ok).
        channel.remove_route(11, &dyn_delegate).unwrap();
    }

    #[test]
    fn duplicate_route_closed_is_a_protocol_violation() {
        let channel = loopback_channel();
        channel.dispatch_control(FramedMessage::route_closed(20));
        channel.dispatch_control(FramedMessage::route_closed(20));
        assert!(channel.is_closed());
    }

    #[test]
    fn transport_error_notifies_bound_routes_and_self_destructs_when_empty() {
        let channel = loopback_channel();
        channel.handle_transport_error(Error::FailedPrecondition);
        assert!(channel.is_closed());
    }

    /// S5: with routes {3, 5, 7} bound, a transport failure delivers exactly
    /// one `OnError` to each and must not self-destruct while any route is
    /// still bound; destruction happens only after the last `RemoveRoute`.
    #[test]
    fn transport_error_with_bound_routes_defers_destruction_until_last_remove() {
        let (channel, destroyed) = loopback_channel_with_idle_flag();

        let a = RecordingDelegate::new();
        let b = RecordingDelegate::new();
        let c = RecordingDelegate::new();
        let a_delegate: Arc<dyn Delegate> = a.clone();
        let b_delegate: Arc<dyn Delegate> = b.clone();
        let c_delegate: Arc<dyn Delegate> = c.clone();
        channel.add_route(3, &a_delegate).unwrap();
        channel.add_route(5, &b_delegate).unwrap();
        channel.add_route(7, &c_delegate).unwrap();

        channel.handle_transport_error(Error::FailedPrecondition);
        assert_eq!(a.errors.lock().len(), 1);
        assert_eq!(b.errors.lock().len(), 1);
        assert_eq!(c.errors.lock().len(), 1);
        assert!(channel.is_closed(), "transport is down");
        assert!(
            !destroyed.load(Ordering::SeqCst),
            "must not self-destruct while routes are still bound"
        );

        channel.remove_route(3, &a_delegate).unwrap();
        assert!(!destroyed.load(Ordering::SeqCst));
        channel.remove_route(5, &b_delegate).unwrap();
        assert!(!destroyed.load(Ordering::SeqCst));
        channel.remove_route(7, &c_delegate).unwrap();
        assert!(
            destroyed.load(Ordering::SeqCst),
            "must self-destruct once the last bound route is removed"
        );

        // A second transport error notification is not expected in practice
        // (the transport fails once), but handle_transport_error itself is
        // idempotent against being called twice.
        channel.handle_transport_error(Error::FailedPrecondition);
    }
}
