//! The `Transport` contract plus `ByteTransport`, the default
//! length-prefixed framer over any duplex byte stream.
//!
//! A real carrier between two processes is swappable behind this trait —
//! the routing layer only needs the contract — but a runnable crate has to
//! ship at least one working implementation, so this module supplies the
//! plain one and [`unix::FdTransport`] supplies the handle-carrying one.

use crate::error::{Error, Result};
use crate::frame::{decode, encode, FrameLimits, FramedMessage};
use parking_lot::Mutex;
use std::io::{Read, Write};

/// What a [`crate::routed::RoutedChannel`] needs from its underlying carrier.
///
/// Implementations are expected to be non-blocking frame sinks with
/// internal queuing on the send side: writes do not block. `poll` is
/// driven exclusively from the I/O worker and must not block indefinitely;
/// it should drain whatever is immediately available and return.
pub trait Transport: Send + Sync {
    /// Enqueues `frame` for delivery. May return a transport error if the
    /// link is already known to be down.
    fn send(&self, frame: FramedMessage) -> Result<()>;

    /// Delivers every frame currently available to `on_frame`, in arrival
    /// order, then returns. Returns `Err` exactly once, the first time the
    /// transport notices it is down; callers must treat that as terminal.
    fn poll(&self, on_frame: &mut dyn FnMut(FramedMessage)) -> Result<()>;
}

/// A length-prefixed framer over any `Read + Write` stream: a `u64`-style
/// length prefix followed by the full frame header.
///
/// Carries no handles: any [`PlatformHandle`](crate::handle::PlatformHandle)s
/// attached to a sent frame are simply dropped (closed, via `OwnedFd`/
/// `OwnedHandle`'s own `Drop`) rather than silently leaked, keeping every
/// handle closed exactly once even though this transport can't actually
/// deliver them anywhere.
pub struct ByteTransport {
    writer: Mutex<Box<dyn Write + Send>>,
    inbound_rx: crossbeam_channel::Receiver<std::io::Result<Option<FramedMessage>>>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
}

impl ByteTransport {
    /// Spawns a dedicated reader thread draining `reader` into frames, and
    /// wraps `writer` for synchronous sends.
    pub fn new<R, W>(reader: R, writer: W, limits: FrameLimits) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reader_thread = std::thread::Builder::new()
            .name("portmux-transport-reader".into())
            .spawn(move || {
                let mut reader = reader;
                loop {
                    match decode(&mut reader, Vec::new(), limits) {
                        Ok(frame) => {
                            if tx.send(Ok(frame)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn transport reader thread");

        Self {
            writer: Mutex::new(Box::new(writer)),
            inbound_rx: rx,
            reader_thread: Some(reader_thread),
        }
    }
}

impl Drop for ByteTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_thread.take() {
            // The reader thread exits on its own once the peer end of the
            // stream closes; we don't forcibly interrupt a blocking read.
            drop(handle);
        }
    }
}

impl Transport for ByteTransport {
    fn send(&self, frame: FramedMessage) -> Result<()> {
        let mut w = self.writer.lock();
        encode(&mut *w, &frame)?;
        w.flush()?;
        Ok(())
    }

    fn poll(&self, on_frame: &mut dyn FnMut(FramedMessage)) -> Result<()> {
        loop {
            match self.inbound_rx.try_recv() {
                Ok(Ok(Some(frame))) => on_frame(frame),
                // A frame failed header validation — drop it and keep
                // draining, it isn't fatal on its own.
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Err(Error::from(e)),
                Err(crossbeam_channel::TryRecvError::Empty) => return Ok(()),
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    return Err(Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "transport reader thread exited",
                    )))
                }
            }
        }
    }
}

#[cfg(unix)]
pub mod unix {
    //! `FdTransport`: a `UnixStream`-backed transport that actually carries
    //! [`PlatformHandle`](crate::handle::PlatformHandle)s across the wire via
    //! `SCM_RIGHTS`, grounded on the reference pack's `interprocess`
    //! ancillary-message code (`os::unix::udsocket::cmsg::ancillary`).
    //!
    //! `UnixStream` is `SOCK_STREAM` and preserves no message boundaries, so
    //! one `sendmsg` worth of bytes can arrive split across several
    //! `recvmsg` calls; the receive side runs a small stateful assembler
    //! (header, then exactly the declared payload length) across as many
    //! `poll` ticks as it takes, the same "read the header, then read
    //! exactly `len` more bytes" discipline `frame::decode` uses for
    //! `ByteTransport`. Ancillary `SCM_RIGHTS` data is collected as it
    //! arrives and only checked against the header's declared handle count
    //! once the frame is fully assembled, since POSIX attaches it to
    //! whichever `recvmsg` call consumes the start of its `sendmsg`, not
    //! necessarily the call that completes the frame.

    use super::Transport;
    use crate::error::{Error, Result};
    use crate::frame::{FrameLimits, FrameType, FramedMessage};
    use crate::handle::PlatformHandle;
    use parking_lot::Mutex;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
    use std::os::unix::net::UnixStream;

    const HEADER_LEN: usize = 20;
    const DISCARD_CHUNK: usize = 4096;

    struct ParsedHeader {
        len: usize,
        ty: FrameType,
        route_id: u64,
        num_handles: u32,
    }

    /// Where the per-connection frame assembler is within one frame. A
    /// `UnixStream` is `SOCK_STREAM`: one `sendmsg` worth of bytes can land
    /// across several `recvmsg` calls, so the header and payload each need
    /// to tolerate being filled incrementally across multiple `poll` ticks.
    enum Phase {
        Header(Vec<u8>),
        Payload { header: ParsedHeader, buf: Vec<u8> },
        /// Header parsed but rejected (bad type/oversized); still have to
        /// read and drop exactly its declared length to stay framed with
        /// the peer, same as `frame::drain`.
        Discard { remaining: usize },
    }

    impl Default for Phase {
        fn default() -> Self {
            Phase::Header(Vec::with_capacity(HEADER_LEN))
        }
    }

    #[derive(Default)]
    struct Assembler {
        phase: Phase,
        /// Ancillary handles accumulated so far for the frame in progress.
        /// `SCM_RIGHTS` data rides with whichever `recvmsg` call consumes
        /// the start of its `sendmsg`, not necessarily the call that
        /// completes the frame, so handles are collected across the whole
        /// header+payload lifecycle and only checked against the header's
        /// declared count once the frame is fully assembled.
        handles: Vec<PlatformHandle>,
    }

    pub struct FdTransport {
        stream: Mutex<UnixStream>,
        limits: FrameLimits,
        assembler: Mutex<Assembler>,
    }

    impl FdTransport {
        /// Wraps `stream`, which is switched to non-blocking mode so
        /// `poll` never stalls the I/O worker.
        pub fn new(stream: UnixStream, limits: FrameLimits) -> io::Result<Self> {
            stream.set_nonblocking(true)?;
            Ok(Self {
                stream: Mutex::new(stream),
                limits,
                assembler: Mutex::new(Assembler::default()),
            })
        }

        fn send_raw(&self, frame: &FramedMessage, fds: &[RawFd]) -> io::Result<()> {
            let mut header = Vec::with_capacity(20 + frame.payload.len());
            header.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
            header.extend_from_slice(&(if frame.ty == FrameType::Data { 0u32 } else { 1u32 }).to_le_bytes());
            header.extend_from_slice(&frame.route_id.to_le_bytes());
            header.extend_from_slice(&(fds.len() as u32).to_le_bytes());
            header.extend_from_slice(&frame.payload);

            let stream = self.stream.lock();
            let sock_fd = stream.as_raw_fd();

            let iov = libc::iovec {
                iov_base: header.as_ptr() as *mut libc::c_void,
                iov_len: header.len(),
            };

            let cmsg_space = unsafe { libc::CMSG_SPACE((fds.len() * std::mem::size_of::<RawFd>()) as u32) } as usize;
            let mut cmsg_buf = vec![0u8; if fds.is_empty() { 0 } else { cmsg_space }];

            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &iov as *const _ as *mut _;
            msg.msg_iovlen = 1;

            if !fds.is_empty() {
                msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = cmsg_buf.len() as _;

                unsafe {
                    let cmsg = libc::CMSG_FIRSTHDR(&msg);
                    (*cmsg).cmsg_level = libc::SOL_SOCKET;
                    (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                    (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as u32) as _;
                    std::ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg) as *mut RawFd, fds.len());
                }
            }

            let sent = unsafe { libc::sendmsg(sock_fd, &msg, 0) };
            if sent < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Performs exactly one `recvmsg` call, bounded to at most `max_len`
        /// bytes, and returns whatever bytes and ancillary handles that one
        /// call yielded — possibly fewer than `max_len` bytes, since
        /// `SOCK_STREAM` makes no message-boundary guarantee.
        fn recvmsg_bounded(&self, max_len: usize) -> io::Result<(Vec<u8>, Vec<PlatformHandle>)> {
            let stream = self.stream.lock();
            let sock_fd = stream.as_raw_fd();

            let mut buf = vec![0u8; max_len];
            let cmsg_space = unsafe {
                libc::CMSG_SPACE((self.limits.max_handles as usize * std::mem::size_of::<RawFd>()) as u32)
            } as usize;
            let mut cmsg_buf = vec![0u8; cmsg_space];

            let iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };

            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &iov as *const _ as *mut _;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_buf.len() as _;

            let n = unsafe { libc::recvmsg(sock_fd, &mut msg, 0) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the socket"));
            }
            let n = n as usize;
            buf.truncate(n);

            let mut handles = Vec::new();
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                        let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                        let payload_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                        let count = payload_len / std::mem::size_of::<RawFd>();
                        for i in 0..count {
                            let fd = std::ptr::read_unaligned(data.add(i));
                            handles.push(PlatformHandle::from_raw(fd));
                        }
                    }
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }

            Ok((buf, handles))
        }

        /// Advances the frame assembler by at most one `recvmsg` call.
        /// Returns `Ok(Some(frame))` once a complete, valid frame has been
        /// assembled; `Ok(None)` if the frame isn't complete yet (the
        /// caller's `poll` loop should stop for this tick once this turns
        /// into `WouldBlock`) or if an invalid frame was discarded;
        /// propagates I/O errors otherwise. Never reads past the boundary
        /// the header declares, so a payload of any size up to
        /// `limits.max_payload_len` is received correctly without the
        /// fixed-buffer panic/desync a single oversized `recvmsg` risked.
        fn recv_raw(&self) -> io::Result<Option<FramedMessage>> {
            let mut asm = self.assembler.lock();

            let max_len = match &asm.phase {
                Phase::Header(buf) => HEADER_LEN - buf.len(),
                Phase::Payload { header, buf } => header.len - buf.len(),
                Phase::Discard { remaining } => (*remaining).min(DISCARD_CHUNK),
            };

            let (chunk, new_handles) = self.recvmsg_bounded(max_len.max(1))?;
            asm.handles.extend(new_handles);

            let phase = std::mem::take(&mut asm.phase);
            match phase {
                Phase::Header(mut buf) => {
                    buf.extend_from_slice(&chunk);
                    if buf.len() < HEADER_LEN {
                        asm.phase = Phase::Header(buf);
                        return Ok(None);
                    }

                    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
                    let ty_raw = u32::from_le_bytes(buf[4..8].try_into().unwrap());
                    let route_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
                    let num_handles = u32::from_le_bytes(buf[16..20].try_into().unwrap());

                    let ty = match ty_raw {
                        0 => Some(FrameType::Data),
                        1 => Some(FrameType::Internal),
                        _ => None,
                    };

                    // Validate before committing to a payload buffer sized
                    // off an attacker- or bug-controlled length, same as
                    // `frame::decode`.
                    let ty = match ty {
                        Some(ty) if len <= self.limits.max_payload_len && num_handles <= self.limits.max_handles => ty,
                        _ => {
                            log::warn!(
                                "discarding frame on route {route_id}: oversized or unknown type (len={len}, handles={num_handles})"
                            );
                            asm.handles.clear();
                            asm.phase = if len == 0 { Phase::default() } else { Phase::Discard { remaining: len } };
                            return Ok(None);
                        }
                    };

                    asm.phase = Phase::Payload {
                        header: ParsedHeader { len, ty, route_id, num_handles },
                        buf: Vec::with_capacity(len),
                    };
                    Ok(None)
                }
                Phase::Payload { header, mut buf } => {
                    buf.extend_from_slice(&chunk);
                    if buf.len() < header.len {
                        asm.phase = Phase::Payload { header, buf };
                        return Ok(None);
                    }

                    if asm.handles.len() != header.num_handles as usize {
                        log::warn!(
                            "discarding frame on route {}: handle count mismatch (header said {}, got {})",
                            header.route_id,
                            header.num_handles,
                            asm.handles.len()
                        );
                        asm.handles.clear();
                        asm.phase = Phase::default();
                        return Ok(None);
                    }

                    let handles = std::mem::take(&mut asm.handles);
                    asm.phase = Phase::default();
                    Ok(Some(FramedMessage { ty: header.ty, route_id: header.route_id, payload: buf, handles }))
                }
                Phase::Discard { remaining } => {
                    // Handles attached to a discarded frame must still be
                    // closed, not leaked — dropping them here runs
                    // `PlatformHandle`'s `Drop`.
                    asm.handles.clear();
                    let left = remaining - chunk.len();
                    asm.phase = if left == 0 { Phase::default() } else { Phase::Discard { remaining: left } };
                    Ok(None)
                }
            }
        }
    }

    impl Transport for FdTransport {
        fn send(&self, frame: FramedMessage) -> Result<()> {
            // Handles are consumed here: their raw values are duplicated
            // into the peer's process by the kernel, then this process's
            // copies are closed, completing the move.
            let raw_fds: Vec<OwnedFd> = frame
                .handles
                .into_iter()
                .map(|h| unsafe { OwnedFd::from_raw_fd(h.into_raw()) })
                .collect();
            let raw_fd_values: Vec<RawFd> = raw_fds.iter().map(|fd| fd.as_raw_fd()).collect();

            let result = self.send_raw(&frame, &raw_fd_values).map_err(Error::from);
            // `raw_fds` drops here regardless of outcome, closing our local
            // copies whether or not the send succeeded.
            result
        }

        fn poll(&self, on_frame: &mut dyn FnMut(FramedMessage)) -> Result<()> {
            loop {
                match self.recv_raw() {
                    Ok(Some(frame)) => on_frame(frame),
                    // A malformed datagram; keep draining, the socket is
                    // still healthy.
                    Ok(None) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(Error::from(e)),
                }
            }
        }
    }
}
