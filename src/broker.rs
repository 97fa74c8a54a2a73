//! The broker control plane: a well-known parent-side service
//! that lets two unrelated child processes, each already connected to the
//! broker, be introduced to each other without either one directly
//! handling the other's transport.
//!
//! Three messages, all carried as `Data` frames on [`BROKER_ROUTE`] (never
//! the control route, which belongs to the multiplexer itself), all sent
//! broker-to-child — there is no child-to-broker wire request; a host
//! application decides when to introduce two of its children and calls
//! [`BrokerHost::connect_to_process`]/[`BrokerHost::connect_message_pipe`]
//! directly:
//!
//! - `Hello`: a child announces its [`ProcessId`] to the broker.
//! - `ConnectToProcess`: the broker hands a child a fresh `Transport`
//!   handle (a connected socket pair endpoint) plus the peer process it
//!   connects to, so the child can stand up a direct `RoutedChannel` to
//!   that peer without further broker mediation.
//! - `ConnectMessagePipe`: once two children already share a direct
//!   channel (from a prior `ConnectToProcess`), the broker tells each side
//!   which pipe id to bind for a new logical pipe and which peer owns the
//!   other end — no new handle needed, since they already have a channel.

use crate::error::{Error, Result};
use crate::handle::PlatformHandle;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

/// The fixed route both `BrokerHost` and `BrokerClient` use for control
/// traffic on whatever channel connects a child to the broker. Never 0
/// (reserved for `RoutedChannel`'s own internal control frame).
pub const BROKER_ROUTE: u64 = 1;

/// Opaque identity for a process participating in broker introductions.
/// Generated once per process at startup, not derived from the OS pid,
/// which can be recycled by the OS after the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire messages exchanged on [`BROKER_ROUTE`]. Intentionally hand-rolled
/// rather than routed through an application-payload serialization path:
/// the broker protocol is multiplexer plumbing, not user data.
enum BrokerMessage {
    Hello { process: ProcessId },
    ConnectToProcess { peer_process_id: ProcessId, pipe_id: u64 },
    ConnectMessagePipe { pipe_id: u64, peer_process_id: ProcessId },
}

const TAG_HELLO: u8 = 0;
const TAG_CONNECT_TO_PROCESS: u8 = 1;
const TAG_CONNECT_MESSAGE_PIPE: u8 = 2;

impl BrokerMessage {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            BrokerMessage::Hello { process } => {
                out.push(TAG_HELLO);
                out.extend_from_slice(process.as_uuid().as_bytes());
            }
            BrokerMessage::ConnectToProcess { peer_process_id, pipe_id } => {
                out.push(TAG_CONNECT_TO_PROCESS);
                out.extend_from_slice(peer_process_id.as_uuid().as_bytes());
                out.extend_from_slice(&pipe_id.to_le_bytes());
            }
            BrokerMessage::ConnectMessagePipe { pipe_id, peer_process_id } => {
                out.push(TAG_CONNECT_MESSAGE_PIPE);
                out.extend_from_slice(&pipe_id.to_le_bytes());
                out.extend_from_slice(peer_process_id.as_uuid().as_bytes());
            }
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&TAG_HELLO) if bytes.len() == 17 => {
                let process = ProcessId(Uuid::from_slice(&bytes[1..17]).map_err(|_| {
                    Error::Protocol("malformed process id in HELLO")
                })?);
                Ok(BrokerMessage::Hello { process })
            }
            Some(&TAG_CONNECT_TO_PROCESS) if bytes.len() == 25 => {
                let peer_process_id = ProcessId(Uuid::from_slice(&bytes[1..17]).map_err(|_| {
                    Error::Protocol("malformed process id in CONNECT_TO_PROCESS")
                })?);
                let mut pipe_id_buf = [0u8; 8];
                pipe_id_buf.copy_from_slice(&bytes[17..25]);
                Ok(BrokerMessage::ConnectToProcess {
                    peer_process_id,
                    pipe_id: u64::from_le_bytes(pipe_id_buf),
                })
            }
            Some(&TAG_CONNECT_MESSAGE_PIPE) if bytes.len() == 25 => {
                let mut pipe_id_buf = [0u8; 8];
                pipe_id_buf.copy_from_slice(&bytes[1..9]);
                let peer_process_id = ProcessId(Uuid::from_slice(&bytes[9..25]).map_err(|_| {
                    Error::Protocol("malformed process id in CONNECT_MESSAGE_PIPE")
                })?);
                Ok(BrokerMessage::ConnectMessagePipe {
                    pipe_id: u64::from_le_bytes(pipe_id_buf),
                    peer_process_id,
                })
            }
            _ => Err(Error::Protocol("unrecognized broker message")),
        }
    }
}

/// Bookkeeping record of one completed introduction. The handle(s) a
/// `ConnectToProcess` introduction carries are delivered directly to each
/// child over its own control channel as part of making the introduction —
/// not returned here — since the two children, not the introduction's
/// caller, are the ones who end up owning them.
pub struct Introduction {
    pub requester: ProcessId,
    pub target: ProcessId,
    pub pipe_id: u64,
}

/// Creates a fresh, connected pair of OS handles suitable for standing up a
/// direct [`crate::transport::Transport`] between two processes: on Unix, a
/// connected [`UnixStream`](std::os::unix::net::UnixStream) pair, split
/// into its two owned halves. `SCM_RIGHTS` lets either endpoint be handed
/// to an arbitrary process without further duplication, which is why only
/// Unix has a real implementation today — `unix::FdTransport` is this
/// crate's only handle-carrying transport.
#[cfg(unix)]
fn make_transport_pair() -> Result<(PlatformHandle, PlatformHandle)> {
    use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;

    let (a, b) = UnixStream::pair().map_err(Error::from)?;
    let a = unsafe { OwnedFd::from_raw_fd(a.into_raw_fd()) };
    let b = unsafe { OwnedFd::from_raw_fd(b.into_raw_fd()) };
    Ok((PlatformHandle::from_fd(a), PlatformHandle::from_fd(b)))
}

#[cfg(not(unix))]
fn make_transport_pair() -> Result<(PlatformHandle, PlatformHandle)> {
    Err(Error::Protocol(
        "cross-process handle-pair vending requires a handle-carrying transport, only implemented for unix's FdTransport",
    ))
}

/// Parent-side broker: tracks which connected child `RoutedChannel`s map to
/// which [`ProcessId`], and introduces two of them on request.
pub struct BrokerHost {
    clients: parking_lot::Mutex<HashMap<ProcessId, Arc<crate::routed::RoutedChannel>>>,
    next_pipe_id: std::sync::atomic::AtomicU64,
}

impl BrokerHost {
    pub fn new() -> Self {
        Self {
            clients: parking_lot::Mutex::new(HashMap::new()),
            next_pipe_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Registers a child's control channel under the identity it announced
    /// in its `Hello`.
    pub fn register_client(&self, process: ProcessId, channel: Arc<crate::routed::RoutedChannel>) {
        self.clients.lock().insert(process, channel);
    }

    pub fn unregister_client(&self, process: ProcessId) {
        self.clients.lock().remove(&process);
    }

    fn both_clients(
        &self,
        requester: ProcessId,
        target: ProcessId,
    ) -> Result<(Arc<crate::routed::RoutedChannel>, Arc<crate::routed::RoutedChannel>)> {
        if requester == target {
            return Err(Error::InvalidArgument("cannot introduce a process to itself"));
        }
        let clients = self.clients.lock();
        let requester_channel = clients.get(&requester).cloned().ok_or(Error::NotFound)?;
        let target_channel = clients.get(&target).cloned().ok_or(Error::NotFound)?;
        Ok((requester_channel, target_channel))
    }

    /// Introduces `requester` and `target` for the first time: allocates a
    /// fresh pipe id, creates a new handle pair via
    /// [`make_transport_pair`], and sends each side a `ConnectToProcess`
    /// carrying its half, so both can stand up a direct `RoutedChannel` to
    /// each other without further broker mediation. Fails with
    /// [`Error::NotFound`] if either process isn't currently registered, or
    /// [`Error::InvalidArgument`] if `requester == target`.
    pub fn connect_to_process(&self, requester: ProcessId, target: ProcessId) -> Result<Introduction> {
        let (requester_channel, target_channel) = self.both_clients(requester, target)?;

        let pipe_id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed);
        let (handle_for_requester, handle_for_target) = make_transport_pair()?;

        log::debug!("introducing {requester} <-> {target} on pipe {pipe_id} with a fresh transport pair");
        requester_channel.write_message(
            BROKER_ROUTE,
            BrokerMessage::ConnectToProcess { peer_process_id: target, pipe_id }.encode(),
            vec![handle_for_requester],
        )?;
        target_channel.write_message(
            BROKER_ROUTE,
            BrokerMessage::ConnectToProcess { peer_process_id: requester, pipe_id }.encode(),
            vec![handle_for_target],
        )?;

        Ok(Introduction { requester, target, pipe_id })
    }

    /// Introduces a new pipe id between `requester` and `target`, who must
    /// already share a direct channel from a prior
    /// [`Self::connect_to_process`] — no handle is created or sent, since
    /// the two sides already have a transport between them.
    pub fn connect_message_pipe(&self, requester: ProcessId, target: ProcessId) -> Result<Introduction> {
        let (requester_channel, target_channel) = self.both_clients(requester, target)?;

        let pipe_id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("connecting message pipe {pipe_id} between {requester} <-> {target}");
        requester_channel.write_message(
            BROKER_ROUTE,
            BrokerMessage::ConnectMessagePipe { pipe_id, peer_process_id: target }.encode(),
            Vec::new(),
        )?;
        target_channel.write_message(
            BROKER_ROUTE,
            BrokerMessage::ConnectMessagePipe { pipe_id, peer_process_id: requester }.encode(),
            Vec::new(),
        )?;

        Ok(Introduction { requester, target, pipe_id })
    }

    fn encode_hello(process: ProcessId) -> Vec<u8> {
        BrokerMessage::Hello { process }.encode()
    }
}

impl Default for BrokerHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Child-side counterpart: wraps the broker route's
/// [`crate::routed::RoutedChannel`] write path with the `Hello` encoding,
/// and decodes inbound broker messages for its owner to act on.
pub struct BrokerClient {
    process: ProcessId,
    channel: Arc<crate::routed::RoutedChannel>,
    broker_route: u64,
}

impl BrokerClient {
    pub fn new(process: ProcessId, channel: Arc<crate::routed::RoutedChannel>, broker_route: u64) -> Self {
        Self {
            process,
            channel,
            broker_route,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process
    }

    pub fn send_hello(&self) -> Result<()> {
        self.channel
            .write_message(self.broker_route, BrokerHost::encode_hello(self.process), Vec::new())
    }

    /// Decodes a message received on the broker route, plus whatever
    /// handles arrived attached to it, into the event the owner should act
    /// on. `ConnectToProcess` requires exactly one attached handle — its
    /// whole purpose is handing one over — and is a protocol violation
    /// without it.
    pub fn decode(bytes: &[u8], mut handles: Vec<PlatformHandle>) -> Result<BrokerEvent> {
        match BrokerMessage::decode(bytes)? {
            BrokerMessage::Hello { process } => Ok(BrokerEvent::PeerHello(process)),
            BrokerMessage::ConnectToProcess { peer_process_id, pipe_id } => {
                let handle = handles
                    .pop()
                    .ok_or(Error::Protocol("CONNECT_TO_PROCESS missing its transport handle"))?;
                Ok(BrokerEvent::ConnectToProcess { peer_process_id, pipe_id, handle })
            }
            BrokerMessage::ConnectMessagePipe { pipe_id, peer_process_id } => {
                Ok(BrokerEvent::PipeReady { pipe_id, peer_process_id })
            }
        }
    }
}

/// A decoded broker-route message, ready for the owning process to act on.
pub enum BrokerEvent {
    PeerHello(ProcessId),
    ConnectToProcess { peer_process_id: ProcessId, pipe_id: u64, handle: PlatformHandle },
    PipeReady { pipe_id: u64, peer_process_id: ProcessId },
}
