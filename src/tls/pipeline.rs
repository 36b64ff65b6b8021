//! The write and read pipelines (spec.md §4.5, §4.6): fragment outgoing
//! plaintext according to the record-size governor's hint, push ciphertext
//! to the real socket as a single contiguous write, and on the read side
//! decrypt everything available and forward cleartext to the caller's
//! `read_cb`, watching for a renegotiation attempt along the way.

use crate::error::SocketError;
use crate::socket::Handle;
use crate::tls::record_size::{CipherOverhead, NO_HINT};

/// `write(iovecs)` continuation for a TLS socket (spec.md §4.5): encrypts
/// every iovec, fragmenting at the governor's suggested ceiling, then flushes
/// the accumulated ciphertext as one backend write.
pub fn write(handle: &Handle, iovecs: Vec<Vec<u8>>) {
    let fd = handle.borrow().fd;
    encrypt_all(handle, fd, &iovecs);

    let (ciphertext, backend) = {
        let mut s = handle.borrow_mut();
        let Some(tls) = s.tls.as_mut() else {
            drop(s);
            if let Some(cb) = crate::socket::take_write_cb(handle.rc()) {
                cb(Err(SocketError::ConnectionFailure));
            }
            return;
        };
        let owned: Vec<Vec<u8>> =
            tls.queue.output_slices().iter().map(|sl| sl.as_slice().to_vec()).collect();
        tls.queue.clear_output();
        (owned, s.backend.clone())
    };
    if ciphertext.iter().all(|v| v.is_empty()) {
        if let Some(cb) = crate::socket::take_write_cb(handle.rc()) {
            cb(Ok(()));
        }
        return;
    }
    let refs: Vec<&[u8]> = ciphertext.iter().map(|v| v.as_slice()).collect();
    let weak = handle.downgrade();
    let _ = backend.borrow_mut().write(
        fd,
        &refs,
        Box::new(move |res| {
            let Some(rc) = weak.upgrade() else { return };
            if let Some(cb) = crate::socket::take_write_cb(&rc) {
                cb(res.map_err(SocketError::Io));
            }
        }),
    );
}

/// Encrypts every iovec, fragmenting at the governor's suggested ceiling. If
/// the engine accepts a different number of bytes than the exact fragment
/// offered partway through — the race spec.md §4.5/§7 calls out — whatever
/// ciphertext earlier fragments already queued is left in place rather than
/// discarded: `write`'s unconditional flush above still sends it as this
/// call's own write completion, and the failure is deferred to the *next*
/// scheduled write via `write_error_latched` instead of failing this one.
fn encrypt_all(handle: &Handle, fd: std::os::unix::io::RawFd, iovecs: &[Vec<u8>]) {
    let mut s = handle.borrow_mut();
    let Some(tls) = s.tls.as_mut() else { return };
    let cipher = tls
        .engine
        .negotiated_cipher_suite()
        .map(CipherOverhead::from_cipher_suite)
        .unwrap_or(CipherOverhead::Unknown);
    let cap = tls.governor.prepare_for_latency_optimized_write(fd, 0, cipher);

    for chunk in iovecs {
        let mut offset = 0;
        while offset < chunk.len() {
            let remaining = chunk.len() - offset;
            let want = if cap == NO_HINT { remaining } else { cap.min(remaining) };
            let piece = &chunk[offset..offset + want];
            match tls.engine.write_cleartext(piece, &mut tls.queue) {
                Ok(n) if n == piece.len() => {}
                _ => {
                    drop(tls);
                    s.write_error_latched = true;
                    return;
                }
            }
            offset += want;
        }
    }
}

/// Read pipeline entry point, dispatched from `Handle::read_start` for a TLS
/// socket (spec.md §4.6). Arms the raw backend read and decodes whatever
/// ciphertext arrives into the caller's `read_cb`.
pub fn decode_ssl_input(handle: &Handle) {
    let (fd, backend) = {
        let s = handle.borrow();
        (s.fd, s.backend.clone())
    };
    let weak = handle.downgrade();
    let _ = backend.borrow_mut().read_start(
        fd,
        Box::new(move |res| {
            let Some(handle) = crate::socket::upgrade(&weak) else { return };
            match res {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        deliver(&handle, Err(SocketError::ClosedByPeer));
                        return;
                    }
                    let appended = {
                        let mut s = handle.borrow_mut();
                        let tls = s.tls.as_mut().unwrap();
                        tls.queue.input_mut().append(bytes).is_ok()
                    };
                    if !appended {
                        deliver(&handle, Err(SocketError::OutOfMemory));
                        return;
                    }
                    pump(&handle);
                }
                Err(e) => deliver(&handle, Err(SocketError::Io(e))),
            }
        }),
    );
}

/// Decrypts everything currently buffered and forwards it to the read
/// callback. Any TLS output the engine produces while doing so other than
/// the handshake's own flight — a post-handshake key update or a second
/// ClientHello — trips the renegotiation detector (spec.md §9, §4.1).
fn pump(handle: &Handle) {
    let (result, fired) = {
        let mut s = handle.borrow_mut();
        let tls = s.tls.as_mut().unwrap();
        tls.queue.arm_renegotiation_detector();
        let result = tls.engine.feed_ciphertext(&mut tls.queue);
        let fired = tls.queue.disarm_renegotiation_detector();
        if fired {
            tls.renegotiation_observed = true;
        }
        (result, fired)
    };
    if let Err(e) = result {
        deliver(handle, Err(SocketError::Io(e)));
        return;
    }
    if fired {
        deliver(handle, Err(SocketError::SslRenegotiationNotSupported));
        return;
    }

    loop {
        let mut scratch = [0u8; 4096];
        let outcome = {
            let mut s = handle.borrow_mut();
            let tls = s.tls.as_mut().unwrap();
            tls.engine.read_cleartext(&mut scratch)
        };
        match outcome {
            Ok(0) => {
                deliver(handle, Err(SocketError::ClosedByPeer));
                return;
            }
            Ok(n) => deliver(handle, Ok(&scratch[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                deliver(handle, Err(SocketError::Io(e)));
                return;
            }
        }
    }
}

fn deliver(handle: &Handle, res: Result<&[u8], SocketError>) {
    let mut s = handle.borrow_mut();
    if let Some(cb) = s.read_cb.as_mut() {
        cb(res);
    }
}
