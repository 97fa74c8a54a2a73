//! Wire frame format and the route-0 internal control frame.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [ total_len: u32 ][ type: u32 ][ route_id: u64 ][ num_handles: u32 ][ payload: total_len bytes ]
//! ```
//!
//! `total_len` covers the payload only; handles ride out-of-band via
//! whatever the concrete [`crate::transport::Transport`] uses (ancillary
//! data on Unix, broker-mediated duplication on Windows).

use crate::handle::PlatformHandle;
use std::io::{self, Read, Write};

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Application payload, routed to a bound dispatcher.
    Data,
    /// Multiplexing control message (today: only `ROUTE_CLOSED` on route 0).
    Internal,
}

impl FrameType {
    fn to_u32(self) -> u32 {
        match self {
            FrameType::Data => 0,
            FrameType::Internal => 1,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::Internal),
            _ => None,
        }
    }
}

/// The route id reserved for [`RoutedChannel`](crate::routed::RoutedChannel)'s
/// own control traffic. Never a valid user pipe id.
pub const CONTROL_ROUTE: u64 = 0;

/// Opcode for the sole internal control message today. No version field;
/// unrecognized opcodes are rejected rather than guessed at.
pub const OPCODE_ROUTE_CLOSED: u8 = 0;

/// Minimum number of payload bytes for a frame to even be considered — the
/// fixed header is read separately, this is just the payload-size floor a
/// frame of a given type must meet to not be discarded outright.
const MIN_PAYLOAD_LEN: [(FrameType, usize); 1] = [(FrameType::Internal, 1 + 8)];

fn min_len_for(ty: FrameType) -> usize {
    MIN_PAYLOAD_LEN
        .iter()
        .find(|(t, _)| *t == ty)
        .map(|(_, n)| *n)
        .unwrap_or(0)
}

/// One complete frame: an application or control message plus its attached
/// handles, tagged with the route it belongs to.
pub struct FramedMessage {
    pub ty: FrameType,
    pub route_id: u64,
    pub payload: Vec<u8>,
    pub handles: Vec<PlatformHandle>,
}

impl FramedMessage {
    pub fn data(route_id: u64, payload: Vec<u8>, handles: Vec<PlatformHandle>) -> Self {
        Self {
            ty: FrameType::Data,
            route_id,
            payload,
            handles,
        }
    }

    /// Builds the `ROUTE_CLOSED` control frame for `closed_pipe_id`.
    pub fn route_closed(closed_pipe_id: u64) -> Self {
        let mut payload = Vec::with_capacity(9);
        payload.push(OPCODE_ROUTE_CLOSED);
        payload.extend_from_slice(&closed_pipe_id.to_le_bytes());
        Self {
            ty: FrameType::Internal,
            route_id: CONTROL_ROUTE,
            payload,
            handles: Vec::new(),
        }
    }

    /// Parses `self` as a `ROUTE_CLOSED` control frame. Any other shape on
    /// the control route is a protocol violation.
    pub fn parse_route_closed(&self) -> Result<u64, &'static str> {
        if self.ty != FrameType::Internal {
            return Err("control route received non-internal frame");
        }
        if self.payload.len() != 1 + 8 {
            return Err("control frame has wrong length for its opcode");
        }
        if self.payload[0] != OPCODE_ROUTE_CLOSED {
            return Err("unknown control opcode");
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload[1..9]);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Limits enforced at frame-decode time, before any allocation proportional
/// to an attacker- or bug-controlled length is made.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_payload_len: usize,
    pub max_handles: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_payload_len: 128 * 1024 * 1024,
            max_handles: 64,
        }
    }
}

/// Writes one frame's header + payload to `w`. Handles are the caller's
/// responsibility to ship out-of-band (see [`crate::transport`]).
pub fn encode(w: &mut impl Write, frame: &FramedMessage) -> io::Result<()> {
    w.write_all(&(frame.payload.len() as u32).to_le_bytes())?;
    w.write_all(&frame.ty.to_u32().to_le_bytes())?;
    w.write_all(&frame.route_id.to_le_bytes())?;
    w.write_all(&(frame.handles.len() as u32).to_le_bytes())?;
    w.write_all(&frame.payload)?;
    Ok(())
}

/// Reads one frame's header + payload from `r`. `handles` must already have
/// been collected out-of-band by the caller and are attached to the result
/// verbatim (their count is cross-checked against the header).
///
/// Returns `Ok(None)` for a frame that fails validation and must be
/// discarded without being delivered anywhere: this is not an error, since a
/// single corrupt frame on an otherwise-healthy stream isn't necessarily
/// fatal for `Data` frames — callers decide fatality (control-route
/// violations are fatal to the channel; stray oversized `Data` frames are
/// simply dropped here).
pub fn decode(
    r: &mut impl Read,
    handles: Vec<PlatformHandle>,
    limits: FrameLimits,
) -> io::Result<Option<FramedMessage>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut ty_buf = [0u8; 4];
    r.read_exact(&mut ty_buf)?;
    let ty = FrameType::from_u32(u32::from_le_bytes(ty_buf));

    let mut route_buf = [0u8; 8];
    r.read_exact(&mut route_buf)?;
    let route_id = u64::from_le_bytes(route_buf);

    let mut num_handles_buf = [0u8; 4];
    r.read_exact(&mut num_handles_buf)?;
    let num_handles = u32::from_le_bytes(num_handles_buf);

    // Validate before allocating/reading the payload so an attacker- or
    // bug-controlled length can't be used to force a huge allocation.
    let ty = match ty {
        Some(ty) if len <= limits.max_payload_len && num_handles <= limits.max_handles => ty,
        _ => {
            log::warn!("discarding frame on route {route_id}: oversized or unknown type (len={len}, handles={num_handles})");
            // Still have to drain `len` bytes to keep the stream framed.
            drain(r, len)?;
            return Ok(None);
        }
    };

    if len < min_len_for(ty) {
        log::warn!("discarding undersized frame on route {route_id}: {len} bytes");
        drain(r, len)?;
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;

    if handles.len() != num_handles as usize {
        // Out-of-band handle count didn't match the header; the frame is
        // malformed regardless of payload validity.
        log::warn!("discarding frame on route {route_id}: handle count mismatch (header said {num_handles}, got {})", handles.len());
        return Ok(None);
    }

    Ok(Some(FramedMessage {
        ty,
        route_id,
        payload,
        handles,
    }))
}

fn drain(r: &mut impl Read, mut len: usize) -> io::Result<()> {
    let mut scratch = [0u8; 4096];
    while len > 0 {
        let n = len.min(scratch.len());
        r.read_exact(&mut scratch[..n])?;
        len -= n;
    }
    Ok(())
}
