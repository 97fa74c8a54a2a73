//! `MessagePipe`: the local, in-process two-port buffered endpoint that the
//! routing layer dispatches into.

use crate::error::{Error, Result};
use crate::handle::PlatformHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which side of the pipe a [`Port`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortIndex {
    Zero,
    One,
}

impl PortIndex {
    fn idx(self) -> usize {
        match self {
            PortIndex::Zero => 0,
            PortIndex::One => 1,
        }
    }

    fn peer(self) -> PortIndex {
        match self {
            PortIndex::Zero => PortIndex::One,
            PortIndex::One => PortIndex::Zero,
        }
    }
}

/// Flags a waiter can be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFlags(u8);

impl WaitFlags {
    pub const READABLE: WaitFlags = WaitFlags(0b01);
    pub const WRITABLE: WaitFlags = WaitFlags(0b10);

    pub fn contains(self, other: WaitFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: WaitFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for WaitFlags {
    type Output = WaitFlags;
    fn bitor(self, rhs: WaitFlags) -> WaitFlags {
        WaitFlags(self.0 | rhs.0)
    }
}

struct QueuedMessage {
    bytes: Vec<u8>,
    handles: Vec<PlatformHandle>,
}

/// Ceilings `MessagePipe::write_message` enforces before queuing a message,
/// mirroring the ones [`crate::frame::FrameLimits`] enforces on the wire so
/// a local write can't exceed what the channel could ever have framed.
#[derive(Debug, Clone, Copy)]
pub struct RoutedChannelConfig {
    pub max_payload_size: usize,
    pub max_handles_per_message: usize,
}

impl Default for RoutedChannelConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 128 * 1024 * 1024,
            max_handles_per_message: 64,
        }
    }
}

/// Controls `ReadMessage`'s behavior when the caller's buffer is too small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFlags {
    /// Leave the oversized message at the head of the queue.
    None,
    /// Discard the oversized message even though it couldn't be delivered.
    MayDiscard,
}

struct WaiterEntry {
    context: u64,
    flags: WaitFlags,
    callback: Box<dyn FnOnce(Result<()>) + Send>,
}

struct PortState {
    incoming: VecDeque<QueuedMessage>,
    self_closed: bool,
    peer_closed: bool,
    waiters: Vec<WaiterEntry>,
}

impl PortState {
    fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            self_closed: false,
            peer_closed: false,
            waiters: Vec::new(),
        }
    }

    fn readable(&self) -> bool {
        !self.incoming.is_empty()
    }

    fn readable_unsatisfiable(&self) -> bool {
        self.incoming.is_empty() && self.peer_closed
    }

    fn writable(&self) -> bool {
        !self.peer_closed
    }
}

struct Inner {
    ports: [PortState; 2],
}

/// Two in-memory ports, each with a FIFO of buffered messages. Writing on
/// one port enqueues onto the *other* port's queue.
pub struct MessagePipe {
    inner: Arc<Mutex<Inner>>,
    config: RoutedChannelConfig,
}

impl Clone for MessagePipe {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config,
        }
    }
}

impl Default for MessagePipe {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePipe {
    pub fn new() -> Self {
        Self::with_config(RoutedChannelConfig::default())
    }

    pub fn with_config(config: RoutedChannelConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ports: [PortState::new(), PortState::new()],
            })),
            config,
        }
    }

    /// Writes a message onto `port`'s peer queue. Rejects payloads or handle
    /// counts past this pipe's [`RoutedChannelConfig`] with
    /// `ResourceExhausted` before ever queuing anything.
    pub fn write_message(&self, port: PortIndex, bytes: Vec<u8>, handles: Vec<PlatformHandle>) -> Result<()> {
        if bytes.len() > self.config.max_payload_size || handles.len() > self.config.max_handles_per_message {
            return Err(Error::ResourceExhausted(bytes.len()));
        }

        let mut inner = self.inner.lock();
        let peer_idx = port.peer().idx();
        if inner.ports[peer_idx].self_closed {
            return Err(Error::FailedPrecondition);
        }

        inner.ports[peer_idx].incoming.push_back(QueuedMessage { bytes, handles });
        self.wake_satisfied(&mut inner, port.peer(), WaitFlags::READABLE);
        Ok(())
    }

    /// Reads the head message on `port`'s own queue, given a caller-supplied
    /// maximum buffer size. Returns the message bytes and its attached
    /// handles as owned values rather than filling caller-supplied
    /// out-parameters, the idiomatic Rust shape for what would otherwise be
    /// a C-style buffer/length/handle-count API.
    ///
    /// On `ResourceExhausted`, the error carries the next message's actual
    /// size, so a caller can retry with a big-enough buffer without a
    /// separate size query.
    pub fn read_message_with_handles(
        &self,
        port: PortIndex,
        max_buffer: usize,
        flags: ReadFlags,
    ) -> Result<(Vec<u8>, Vec<PlatformHandle>)> {
        let mut inner = self.inner.lock();
        let state = &mut inner.ports[port.idx()];

        let Some(head) = state.incoming.front() else {
            return if state.peer_closed {
                Err(Error::FailedPrecondition)
            } else {
                Err(Error::NotFound)
            };
        };

        if head.bytes.len() > max_buffer {
            let size = head.bytes.len();
            if flags == ReadFlags::MayDiscard {
                state.incoming.pop_front();
            }
            return Err(Error::ResourceExhausted(size));
        }

        let msg = state.incoming.pop_front().unwrap();
        Ok((msg.bytes, msg.handles))
    }

    /// Closes `port`. Wakes the peer's waiters (READABLE stays satisfiable
    /// while its queue is nonempty, then becomes unsatisfiable; WRITABLE
    /// becomes unsatisfiable immediately) and cancels any waiters still
    /// registered on `port` itself.
    pub fn close(&self, port: PortIndex) {
        let mut inner = self.inner.lock();

        if inner.ports[port.idx()].self_closed {
            // Idempotent: closing an already-closed port is a no-op.
            return;
        }
        inner.ports[port.idx()].self_closed = true;

        let own_waiters = std::mem::take(&mut inner.ports[port.idx()].waiters);
        for w in own_waiters {
            (w.callback)(Err(Error::Cancelled));
        }

        let peer = port.peer();
        inner.ports[peer.idx()].peer_closed = true;

        let peer_waiters = std::mem::take(&mut inner.ports[peer.idx()].waiters);
        let peer_state_readable = inner.ports[peer.idx()].readable();
        for w in peer_waiters {
            if w.flags.contains(WaitFlags::WRITABLE) {
                (w.callback)(Err(Error::FailedPrecondition));
            } else if w.flags.contains(WaitFlags::READABLE) {
                if peer_state_readable {
                    (w.callback)(Ok(()));
                } else {
                    (w.callback)(Err(Error::FailedPrecondition));
                }
            }
        }
    }

    /// Registers `callback` to fire once when `port` satisfies any of
    /// `flags`. Rejects synchronously (without ever arming) if the condition
    /// is already satisfied (`AlreadyExists`) or can never be satisfied
    /// (`FailedPrecondition`).
    pub fn add_waiter(
        &self,
        port: PortIndex,
        flags: WaitFlags,
        context: u64,
        callback: Box<dyn FnOnce(Result<()>) + Send>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = &inner.ports[port.idx()];

        if flags.contains(WaitFlags::READABLE) && state.readable() {
            return Err(Error::AlreadyExists);
        }
        if flags.contains(WaitFlags::WRITABLE) && state.writable() {
            return Err(Error::AlreadyExists);
        }
        if flags.contains(WaitFlags::READABLE) && state.readable_unsatisfiable() {
            return Err(Error::FailedPrecondition);
        }
        if flags.contains(WaitFlags::WRITABLE) && !state.writable() {
            return Err(Error::FailedPrecondition);
        }

        inner.ports[port.idx()].waiters.push(WaiterEntry { context, flags, callback });
        Ok(())
    }

    /// Drops every waiter currently registered on `port`, waking each with
    /// `Cancelled`.
    pub fn cancel_all_waiters(&self, port: PortIndex) {
        let mut inner = self.inner.lock();
        let waiters = std::mem::take(&mut inner.ports[port.idx()].waiters);
        drop(inner);
        for w in waiters {
            (w.callback)(Err(Error::Cancelled));
        }
    }

    /// Blocks the calling thread until `port` satisfies `flags`, `timeout`
    /// elapses, or the wait is cancelled. Convenience built on
    /// [`Self::add_waiter`] using a private condvar per call, for tests and
    /// for synchronous call sites that don't want to wire up their own
    /// callback-based watcher.
    pub fn wait(&self, port: PortIndex, flags: WaitFlags, timeout: Option<Duration>) -> Result<()> {
        let slot: Arc<(Mutex<Option<Result<()>>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let slot_cb = slot.clone();

        match self.add_waiter(
            port,
            flags,
            0,
            Box::new(move |result| {
                let mut guard = slot_cb.0.lock();
                *guard = Some(result);
                slot_cb.1.notify_one();
            }),
        ) {
            Ok(()) => {}
            Err(Error::AlreadyExists) => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut guard = slot.0.lock();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::DeadlineExceeded);
                    }
                    let timed_out = slot.1.wait_for(&mut guard, deadline - now).timed_out();
                    if timed_out && guard.is_none() {
                        return Err(Error::DeadlineExceeded);
                    }
                }
                None => slot.1.wait(&mut guard),
            }
        }
    }

    fn wake_satisfied(&self, inner: &mut Inner, port: PortIndex, satisfied: WaitFlags) {
        let state = &mut inner.ports[port.idx()];
        let mut remaining = Vec::with_capacity(state.waiters.len());
        for w in std::mem::take(&mut state.waiters) {
            if w.flags.intersects(satisfied) {
                (w.callback)(Ok(()));
            } else {
                remaining.push(w);
            }
        }
        state.waiters = remaining;
    }
}
