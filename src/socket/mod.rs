//! The `Socket` entity (spec.md §3): an abstract handle with a file-
//! descriptor identity, an application-level input buffer, at most one
//! pending read/write callback, an optional cached peer address, an
//! optional TLS session, a close hook, and latency-optimization state.
//!
//! Every `Socket` is held behind `Rc<RefCell<_>>` as a [`Handle`]. Backend
//! callbacks capture a `Weak` reference back into it rather than a raw
//! pointer (spec.md §9 "Cyclic references": "implement as adapter-holds-
//! weak-handle-to-socket, the adapter is always called from code that
//! already owns the socket"). Methods therefore take `&Handle` rather than
//! `&mut self`, upgrading and borrowing for the duration of the call.

pub mod lifecycle;

use crate::backend::EventLoopBackend;
use crate::buffer::{Buffer, Prototype};
use crate::error::SocketError;
use crate::net::Address;
use crate::tls::session::TlsSession;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

pub type Backend = Rc<RefCell<dyn EventLoopBackend>>;

/// At most one pending write callback per spec.md §3 invariant 3.
pub type WriteCallback = Box<dyn FnOnce(Result<(), SocketError>)>;
/// At most one pending read callback; delivers decrypted bytes for a TLS
/// socket, raw bytes for a plaintext one.
pub type ReadCallback = Box<dyn FnMut(Result<&[u8], SocketError>)>;
pub type CloseHook = Box<dyn FnOnce()>;

pub struct Socket {
    pub(crate) fd: RawFd,
    pub(crate) backend: Backend,
    /// Cleartext for a TLS socket, raw bytes otherwise.
    pub(crate) input: Buffer,
    pub(crate) peername_cache: Option<Address>,
    pub(crate) tls: Option<TlsSession>,
    pub(crate) close_hook: Option<CloseHook>,
    pub(crate) read_cb: Option<ReadCallback>,
    pub(crate) write_pending: bool,
    pub(crate) write_cb: Option<WriteCallback>,
    /// Latched by the write pipeline's race-protection path (spec.md §4.5,
    /// §7): the next scheduled write reports an I/O error instead of a
    /// normal completion.
    pub(crate) write_error_latched: bool,
}

/// A `Socket` shared between the owner and the backend callbacks registered
/// on its behalf.
#[derive(Clone)]
pub struct Handle(Rc<RefCell<Socket>>);

impl Handle {
    pub fn new(fd: RawFd, backend: Backend) -> Self {
        Self(Rc::new(RefCell::new(Socket {
            fd,
            backend,
            input: Buffer::new(Prototype::Pooling),
            peername_cache: None,
            tls: None,
            close_hook: None,
            read_cb: None,
            write_pending: false,
            write_cb: None,
            write_error_latched: false,
        })))
    }

    pub fn downgrade(&self) -> Weak<RefCell<Socket>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn from_rc(rc: Rc<RefCell<Socket>>) -> Self {
        Self(rc)
    }

    pub(crate) fn rc(&self) -> &Rc<RefCell<Socket>> {
        &self.0
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, Socket> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, Socket> {
        self.0.borrow_mut()
    }

    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    pub fn is_tls(&self) -> bool {
        self.0.borrow().tls.is_some()
    }

    pub fn set_close_hook(&self, hook: CloseHook) {
        self.0.borrow_mut().close_hook = Some(hook);
    }

    /// Invalidated only by `set_peername` or socket destruction (spec.md §3
    /// invariant 5).
    pub fn set_peername(&self, addr: Option<Address>) {
        self.0.borrow_mut().peername_cache = addr;
    }

    pub fn peername(&self) -> Option<Address> {
        self.0.borrow().peername_cache.clone()
    }

    /// `read_start(cb)` (spec.md §6). For a plaintext socket this arms the
    /// backend directly and forwards bytes straight through; for a TLS
    /// socket control passes to the read pipeline, which arms the backend
    /// itself once the handshake has completed.
    pub fn read_start(&self, cb: ReadCallback) {
        {
            let mut s = self.0.borrow_mut();
            s.read_cb = Some(cb);
        }
        let is_tls = self.0.borrow().tls.is_some();
        if is_tls {
            crate::tls::pipeline::decode_ssl_input(self);
        } else {
            self.arm_plaintext_read();
        }
    }

    pub(crate) fn arm_plaintext_read(&self) {
        let fd = self.0.borrow().fd;
        let weak = self.downgrade();
        self.0.borrow().backend.borrow_mut().read_start(
            fd,
            Box::new(move |res: std::io::Result<&[u8]>| {
                let Some(rc) = weak.upgrade() else { return };
                let mut s = rc.borrow_mut();
                if let Some(cb) = s.read_cb.as_mut() {
                    match res {
                        Ok(bytes) => cb(Ok(bytes)),
                        Err(e) => cb(Err(SocketError::Io(e))),
                    }
                }
            }),
        );
    }

    /// `read_stop()` — idempotent, immediate (spec.md §5).
    pub fn read_stop(&self) {
        let mut s = self.0.borrow_mut();
        s.read_cb = None;
        let fd = s.fd;
        s.backend.borrow_mut().read_stop(fd);
    }

    /// `write(iovecs, cb)` (spec.md §6, §4.5).
    pub fn write(&self, iovecs: Vec<Vec<u8>>, cb: WriteCallback) {
        let (latched, is_tls) = {
            let s = self.0.borrow();
            (s.write_error_latched, s.tls.is_some())
        };
        if latched {
            self.0.borrow_mut().write_error_latched = false;
            cb(Err(SocketError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "latched write error from a prior fatal read",
            ))));
            return;
        }
        {
            let mut s = self.0.borrow_mut();
            debug_assert!(!s.write_pending, "at most one outstanding write per Socket");
            s.write_pending = true;
            s.write_cb = Some(cb);
        }
        if is_tls {
            crate::tls::pipeline::write(self, iovecs);
        } else {
            let refs: Vec<&[u8]> = iovecs.iter().map(|v| v.as_slice()).collect();
            let (fd, backend) = {
                let s = self.0.borrow();
                (s.fd, s.backend.clone())
            };
            let weak = self.downgrade();
            let _ = backend.borrow_mut().write(
                fd,
                &refs,
                Box::new(move |res| {
                    let Some(rc) = weak.upgrade() else { return };
                    if let Some(cb) = take_write_cb(&rc) {
                        cb(res.map_err(SocketError::Io));
                    }
                }),
            );
        }
    }

    pub fn close(self) {
        lifecycle::close(self);
    }
}

pub(crate) fn take_write_cb(rc: &Rc<RefCell<Socket>>) -> Option<WriteCallback> {
    let mut s = rc.borrow_mut();
    s.write_pending = false;
    s.write_cb.take()
}

/// Upgrades a `Weak` captured by a backend callback back into a `Handle`,
/// for the TLS pipeline and handshake driver (spec.md §9 "Cyclic
/// references").
pub(crate) fn upgrade(weak: &Weak<RefCell<Socket>>) -> Option<Handle> {
    weak.upgrade().map(Handle)
}
