//! macOS/BSD backend: kqueue-driven, one-shot re-armed per socket. Grown
//! from the teacher's `runtime::r#async::reactor` `sys` module for macOS,
//! generalized into the seven-operation `EventLoopBackend`.

use super::{Detached, EventLoopBackend, IoVec, WriteResult};
use libc::{kevent, kqueue, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE, EV_ONESHOT};
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

pub struct Kqueue {
    kq: RawFd,
    regs: HashMap<RawFd, Registration>,
}

fn ev(ident: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: ident as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { kq, regs: HashMap::new() })
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        let rc = unsafe {
            kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn arm_read(&self, fd: RawFd) -> io::Result<()> {
        self.apply(&[ev(fd, EVFILT_READ, EV_ADD | EV_ENABLE | EV_ONESHOT)])
    }

    fn arm_write(&self, fd: RawFd) -> io::Result<()> {
        self.apply(&[ev(fd, EVFILT_WRITE, EV_ADD | EV_ENABLE | EV_ONESHOT)])
    }

    /// Runs one pass of `kevent` and dispatches ready callbacks; the event
    /// loop itself lives outside the socket/TLS core (spec.md §1).
    pub fn turn(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let mut events = vec![ev(0, 0, 0); 64.max(self.regs.len())];
        let ts = if timeout_ms < 0 {
            None
        } else {
            Some(libc::timespec {
                tv_sec: (timeout_ms / 1000) as i64,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as i64,
            })
        };
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const _);
        let n = unsafe {
            kevent(
                self.kq,
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as i32,
                ts_ptr,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for e in &events[..n as usize] {
            let fd = e.ident as RawFd;
            if e.filter == EVFILT_READ {
                self.dispatch_read(fd);
            } else if e.filter == EVFILT_WRITE {
                self.dispatch_write(fd);
            }
        }
        Ok(n as usize)
    }

    fn dispatch_read(&mut self, fd: RawFd) {
        let mut scratch = [0u8; READ_SCRATCH];
        let n = unsafe { libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) };
        let result = if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        };
        let still_reading = {
            let Some(reg) = self.regs.get_mut(&fd) else { return };
            let Some(cb) = reg.read_cb.as_mut() else { return };
            match result {
                Ok(n) => cb(Ok(&scratch[..n])),
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        cb(Err(e));
                    }
                }
            }
            reg.reading
        };
        if still_reading {
            let _ = self.arm_read(fd);
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
                    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                    if n < 0 {
                        let e = io::Error::last_os_error();
                        if e.kind() == io::ErrorKind::WouldBlock {
                            let _ = self.arm_write(fd);
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
                cb(err.map_or(Ok(()), Err));
                return;
            }
        }
    }
}

impl EventLoopBackend for Kqueue {
    fn dispose_socket(&mut self, fd: RawFd) {
        if self.regs.remove(&fd).is_some() {
            let _ = self.apply(&[
                ev(fd, EVFILT_READ, EV_DELETE),
                ev(fd, EVFILT_WRITE, EV_DELETE),
            ]);
        }
        unsafe {
            libc::close(fd);
        }
    }

    fn write(&mut self, fd: RawFd, bufs: &[IoVec<'_>], cb: Box<dyn FnOnce(WriteResult)>) -> io::Result<()> {
        let mut flat = Vec::with_capacity(bufs.iter().map(|b| b.len()).sum());
        for b in bufs {
            flat.extend_from_slice(b);
        }
        let reg = self.regs.entry(fd).or_default();
        reg.pending_write = flat;
        reg.write_pos = 0;
        reg.write_cb = Some(cb);
        self.arm_write(fd)?;
        self.dispatch_write(fd);
        Ok(())
    }

    fn read_start(&mut self, fd: RawFd, cb: Box<dyn FnMut(io::Result<&[u8]>)>) -> io::Result<()> {
        let reg = self.regs.entry(fd).or_default();
        reg.read_cb = Some(cb);
        reg.reading = true;
        self.arm_read(fd)
    }

    fn read_stop(&mut self, fd: RawFd) {
        if let Some(reg) = self.regs.get_mut(&fd) {
            reg.reading = false;
            reg.read_cb = None;
        }
        let _ = self.apply(&[ev(fd, EVFILT_READ, EV_DELETE)]);
    }

    fn export(&mut self, fd: RawFd) -> io::Result<Detached> {
        if let Some(reg) = self.regs.get(&fd) {
            if reg.write_cb.is_some() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "write in flight"));
            }
        }
        if self.regs.remove(&fd).is_some() {
            let _ = self.apply(&[
                ev(fd, EVFILT_READ, EV_DELETE),
                ev(fd, EVFILT_WRITE, EV_DELETE),
            ]);
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

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
