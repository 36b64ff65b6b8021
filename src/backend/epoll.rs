//! Linux backend: epoll-driven, edge-triggered per socket. Grown from the
//! teacher's `runtime::r#async::reactor` `sys` module for Linux, generalized
//! from a `Future`-polling reactor into the seven-operation
//! `EventLoopBackend` the socket/TLS core expects.

use super::{Detached, EventLoopBackend, IoVec, WriteResult};
use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

const READ_SCRATCH: usize = 4096;

struct Registration {
    read_cb: Option<Box<dyn FnMut(io::Result<&[u8]>)>>,
    write_cb: Option<Box<dyn FnOnce(WriteResult)>>,
    pending_write: Vec<u8>,
    write_pos: usize,
    reading: bool,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            read_cb: None,
            write_cb: None,
            pending_write: Vec::new(),
            write_pos: 0,
            reading: false,
        }
    }
}

pub struct Epoll {
    epoll_fd: RawFd,
    regs: HashMap<RawFd, Registration>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd: fd,
            regs: HashMap::new(),
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = epoll_event { events, u64: fd as u64 };
        let rc = unsafe { epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn interest_mask(reg: &Registration) -> u32 {
        let mut mask = EPOLLERR as u32 | EPOLLHUP as u32;
        if reg.reading {
            mask |= EPOLLIN as u32;
        }
        if reg.write_cb.is_some() {
            mask |= EPOLLOUT as u32;
        }
        mask
    }

    fn sync_interest(&mut self, fd: RawFd, already_registered: bool) -> io::Result<()> {
        let mask = {
            let reg = self.regs.get(&fd).expect("socket not registered");
            Self::interest_mask(reg)
        };
        if already_registered {
            self.ctl(EPOLL_CTL_MOD, fd, mask)
        } else {
            self.ctl(EPOLL_CTL_ADD, fd, mask)
        }
    }

    /// Runs one pass of `epoll_wait` and dispatches ready callbacks. The
    /// event loop itself lives outside the socket/TLS core (spec.md §1); a
    /// real binary calls this in a loop.
    pub fn turn(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; 64.max(self.regs.len())];
        let n = unsafe {
            epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let readable = ev.events & (EPOLLIN as u32 | EPOLLERR as u32 | EPOLLHUP as u32) != 0;
            let writable = ev.events & (EPOLLOUT as u32 | EPOLLERR as u32 | EPOLLHUP as u32) != 0;
            if readable {
                self.dispatch_read(fd);
            }
            if writable {
                self.dispatch_write(fd);
            }
        }
        Ok(n as usize)
    }

    fn dispatch_read(&mut self, fd: RawFd) {
        let mut scratch = [0u8; READ_SCRATCH];
        loop {
            let n = unsafe {
                libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
            };
            let result = if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return;
                }
                Err(err)
            } else {
                Ok(n as usize)
            };
            let Some(reg) = self.regs.get_mut(&fd) else { return };
            let Some(cb) = reg.read_cb.as_mut() else { return };
            match result {
                Ok(n) => cb(Ok(&scratch[..n])),
                Err(e) => cb(Err(e)),
            }
            if n <= 0 {
                return;
            }
        }
    }

    fn dispatch_write(&mut self, fd: RawFd) {
        loop {
            let (done, err) = {
                let Some(reg) = self.regs.get_mut(&fd) else { return };
                if reg.write_cb.is_none() {
                    return;
                }
                let buf = &reg.pending_write[reg.write_pos..];
                if buf.is_empty() {
                    (true, None)
                } else {
                    let n = unsafe {
                        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
                    };
                    if n < 0 {
                        let e = io::Error::last_os_error();
                        if e.kind() == io::ErrorKind::WouldBlock {
                            return;
                        }
                        (true, Some(e))
                    } else {
                        reg.write_pos += n as usize;
                        (reg.write_pos >= reg.pending_write.len(), None)
                    }
                }
            };
            if done {
                let reg = self.regs.get_mut(&fd).unwrap();
                let cb = reg.write_cb.take().unwrap();
                reg.pending_write.clear();
                reg.write_pos = 0;
                let _ = self.sync_interest(fd, true);
                cb(err.map_or(Ok(()), Err));
                return;
            }
        }
    }
}

impl EventLoopBackend for Epoll {
    fn dispose_socket(&mut self, fd: RawFd) {
        if self.regs.remove(&fd).is_some() {
            let _ = self.ctl(EPOLL_CTL_DEL, fd, 0);
        }
        unsafe {
            libc::close(fd);
        }
    }

    fn write(&mut self, fd: RawFd, bufs: &[IoVec<'_>], cb: Box<dyn FnOnce(WriteResult)>) -> io::Result<()> {
        let already = self.regs.contains_key(&fd);
        let mut flat = Vec::with_capacity(bufs.iter().map(|b| b.len()).sum());
        for b in bufs {
            flat.extend_from_slice(b);
        }
        let reg = self.regs.entry(fd).or_default();
        reg.pending_write = flat;
        reg.write_pos = 0;
        reg.write_cb = Some(cb);
        self.sync_interest(fd, already)?;
        self.dispatch_write(fd);
        Ok(())
    }

    fn read_start(&mut self, fd: RawFd, cb: Box<dyn FnMut(io::Result<&[u8]>)>) -> io::Result<()> {
        let already = self.regs.contains_key(&fd);
        let reg = self.regs.entry(fd).or_default();
        reg.read_cb = Some(cb);
        reg.reading = true;
        self.sync_interest(fd, already)
    }

    fn read_stop(&mut self, fd: RawFd) {
        if let Some(reg) = self.regs.get_mut(&fd) {
            reg.reading = false;
            reg.read_cb = None;
            let _ = self.sync_interest(fd, true);
        }
    }

    fn export(&mut self, fd: RawFd) -> io::Result<Detached> {
        if let Some(reg) = &self.regs.get(&fd) {
            if reg.write_cb.is_some() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "write in flight"));
            }
        }
        if self.regs.remove(&fd).is_some() {
            let _ = self.ctl(EPOLL_CTL_DEL, fd, 0);
        }
        Ok(Detached { fd })
    }

    fn import(&mut self, detached: Detached) -> io::Result<RawFd> {
        self.regs.insert(detached.fd, Registration::default());
        Ok(detached.fd)
    }

    fn get_peername_uncached(&self, fd: RawFd) -> io::Result<SocketAddr> {
        super::sockaddr::getpeername(fd)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
