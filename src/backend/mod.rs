//! The event-loop backend: an external collaborator per spec.md §1
//! ("The event loop itself (two interchangeable backends exist)"), consumed
//! through the seven operations listed in spec.md §6:
//! `do_dispose_socket`, `do_write`, `do_read_start`, `do_read_stop`,
//! `do_export`, `do_import`, `get_peername_uncached`.
//!
//! Two implementations exist, grown from the teacher's `reactor.rs`
//! epoll/kqueue `sys` modules: `epoll::Epoll` (Linux) and `kqueue::Kqueue`
//! (macOS/BSD). Nothing above this module is aware of which one is in use.

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
pub mod kqueue;
pub mod sockaddr;

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// A write request: a list of byte slices dispatched as a single contiguous
/// event-loop write (spec.md §5: "Writes within a single `write` call are
/// delivered as a single contiguous event-loop write").
pub type IoVec<'a> = &'a [u8];

/// Outcome delivered to a write completion callback: `Ok(())` on success, or
/// the I/O error observed by the backend.
pub type WriteResult = io::Result<()>;

/// A detached socket, as produced by `EventLoopBackend::export` and consumed
/// by `EventLoopBackend::import` (spec.md §4.8, §3 "Export record").
pub struct Detached {
    pub fd: RawFd,
}

/// The seven operations the socket/TLS core needs from an event-loop
/// backend. Implementors own the registration of a file descriptor for
/// readability/writability notifications and the delivery of bytes/
/// completions back into the core via the callbacks passed to
/// `read_start`/`write`.
pub trait EventLoopBackend {
    /// Tears the socket down: deregisters it from the loop and closes the
    /// file descriptor. Never fails from the caller's perspective (spec.md
    /// §4.7: dispose always succeeds).
    fn dispose_socket(&mut self, fd: RawFd);

    /// Queues a contiguous write of `bufs` and arranges for `cb` to be
    /// invoked exactly once, on a later turn of the loop, with the result.
    fn write(&mut self, fd: RawFd, bufs: &[IoVec<'_>], cb: Box<dyn FnOnce(WriteResult)>) -> io::Result<()>;

    /// Arms readability notifications for `fd`; `cb` is invoked with a
    /// borrowed view of the bytes just read into the backend's scratch
    /// buffer (empty slice on EOF) or an error, repeatedly, until
    /// `read_stop` is called. The slice is only valid for the duration of
    /// the callback.
    fn read_start(&mut self, fd: RawFd, cb: Box<dyn FnMut(io::Result<&[u8]>)>) -> io::Result<()>;

    /// Idempotent, immediate (spec.md §5: "`read_stop` is idempotent and
    /// immediate").
    fn read_stop(&mut self, fd: RawFd);

    /// Detaches `fd` from this backend instance without closing it, for
    /// migration to another loop instance (spec.md §4.8).
    fn export(&mut self, fd: RawFd) -> io::Result<Detached>;

    /// Re-attaches a previously detached descriptor to this backend
    /// instance.
    fn import(&mut self, detached: Detached) -> io::Result<RawFd>;

    /// Uncached `getpeername(2)` lookup; the result is cached by the caller
    /// (spec.md §1: "Peer-name caching ... treated as leaf utilities").
    fn get_peername_uncached(&self, fd: RawFd) -> io::Result<SocketAddr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}
