//! Cross-platform owned OS handle with move semantics.
//!
//! Generalizes the common "owned pipe half" abstraction from "a pipe
//! half" to "any platform handle that can ride along with a [`FramedMessage`](crate::frame::FramedMessage)".

use std::fmt;

#[cfg(unix)]
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};

#[cfg(windows)]
use std::os::windows::io::{IntoRawHandle, OwnedHandle, RawHandle};

/// An OS handle with exclusive ownership. Transfer through a [`FramedMessage`]
/// is a move: the sender's `PlatformHandle` is consumed by the send and the
/// receiver's dispatcher takes ownership of a new one.
///
/// On Unix this is a file descriptor; on Windows, a `HANDLE`. Both carry their
/// underlying OS-owned type so `close()` happens automatically on drop if the
/// handle is ever dropped without being sent or delivered.
pub struct PlatformHandle(Inner);

#[cfg(unix)]
struct Inner(OwnedFd);

#[cfg(windows)]
struct Inner(OwnedHandle);

impl PlatformHandle {
    #[cfg(unix)]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self(Inner(fd))
    }

    #[cfg(windows)]
    pub fn from_handle(handle: OwnedHandle) -> Self {
        Self(Inner(handle))
    }

    /// Raw, platform-specific integer value. Only meaningful for logging and
    /// for round-tripping through the wire protocol's out-of-band channel;
    /// never compare raw values for equality across processes.
    #[cfg(unix)]
    pub fn as_raw(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.0 .0.as_raw_fd()
    }

    #[cfg(windows)]
    pub fn as_raw(&self) -> RawHandle {
        use std::os::windows::io::AsRawHandle;
        self.0 .0.as_raw_handle()
    }

    /// Consumes this handle, returning the raw value and relinquishing
    /// ownership to the caller. The caller becomes responsible for closing it.
    #[cfg(unix)]
    pub fn into_raw(self) -> RawFd {
        self.0 .0.into_raw_fd()
    }

    #[cfg(windows)]
    pub fn into_raw(self) -> RawHandle {
        self.0 .0.into_raw_handle()
    }

    /// Reconstructs a `PlatformHandle` from a raw value already owned by the
    /// current process (i.e. already duplicated in, on Windows; already
    /// `dup`'d or received via `SCM_RIGHTS`, on Unix).
    ///
    /// # Safety
    ///
    /// `raw` must be a valid, currently-open, exclusively-owned handle.
    #[cfg(unix)]
    pub unsafe fn from_raw(raw: RawFd) -> Self {
        use std::os::fd::FromRawFd;
        Self(Inner(unsafe { OwnedFd::from_raw_fd(raw) }))
    }

    #[cfg(windows)]
    pub unsafe fn from_raw(raw: RawHandle) -> Self {
        use std::os::windows::io::FromRawHandle;
        Self(Inner(unsafe { OwnedHandle::from_raw_handle(raw) }))
    }
}

impl fmt::Debug for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PlatformHandle").field(&self.as_raw()).finish()
    }
}
