//! Socket teardown and migration (spec.md §4.7 "close", §4.8
//! "export/import"): graceful TLS shutdown before disposal, and re-parenting
//! buffers/session state across the pooling/non-pooling boundary when a
//! socket moves to another event-loop instance or thread.

use crate::backend::Detached;
use crate::buffer::{Buffer, Prototype};
use crate::error::SocketError;
use crate::net::Address;
use crate::socket::{Backend, Handle};
use crate::tls::engine::EngineStep;
use crate::tls::session::TlsSession;

/// `close()` (spec.md §4.7): for a TLS socket, send `close_notify` and flush
/// it before tearing the descriptor down; a plaintext socket tears down
/// immediately. Always eventually runs the close hook exactly once.
pub fn close(handle: Handle) {
    if !handle.is_tls() {
        finish(&handle);
        return;
    }

    // Step 1: a write in flight is bound to the socket that's about to go
    // away; drop its callback rather than let it fire against a
    // disposed descriptor once the backend's write eventually completes.
    {
        let mut s = handle.borrow_mut();
        s.write_pending = false;
        s.write_cb = None;
    }

    // Step 2: a session that already observed a fatal write-time failure
    // has nothing left to shut down gracefully.
    let already_failed = {
        let s = handle.borrow();
        s.tls.as_ref().map(|tls| tls.write_error_latched).unwrap_or(false)
    };
    if already_failed {
        finish(&handle);
        return;
    }

    let step = {
        let mut s = handle.borrow_mut();
        let tls = s.tls.as_mut().unwrap();
        tls.engine.shutdown(&mut tls.queue)
    };

    match step {
        // Step 3: the connection was still mid-handshake when close() ran;
        // the alert can't be sent until the driver sees the rest of that
        // handshake, so re-enter this same driver from a read.
        EngineStep::WantRead => start_shutdown_read(handle),
        // `shutdown` never actually produces `WantWrite` (it flushes
        // inline before returning), but the match must stay exhaustive.
        EngineStep::Error(_) | EngineStep::WantWrite => finish(&handle),
        EngineStep::Success | EngineStep::ZeroReturn => flush_then_finish(handle),
    }
}

/// spec.md §4.7 step 3: `shutdown` reported `WantRead`. Arms a read that
/// feeds whatever arrives back into the session and re-enters `close` so
/// the alert can be queued once the handshake's own state allows it, or
/// gives up and tears the socket down on EOF or an I/O error.
fn start_shutdown_read(handle: Handle) {
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
                Ok(bytes) if !bytes.is_empty() => {
                    {
                        let mut s = handle.borrow_mut();
                        let tls = s.tls.as_mut().unwrap();
                        let _ = tls.queue.input_mut().append(bytes);
                    }
                    close(handle);
                }
                _ => finish(&handle),
            }
        }),
    );
}

fn flush_then_finish(handle: Handle) {
    let needs_flush = {
        let s = handle.borrow();
        !s.tls.as_ref().unwrap().queue.output_is_empty()
    };
    if !needs_flush {
        finish(&handle);
        return;
    }

    handle.read_stop();
    let (ciphertext, fd, backend) = {
        let mut s = handle.borrow_mut();
        let tls = s.tls.as_mut().unwrap();
        let owned: Vec<Vec<u8>> = tls.queue.output_slices().iter().map(|sl| sl.as_slice().to_vec()).collect();
        tls.queue.clear_output();
        (owned, s.fd, s.backend.clone())
    };
    let refs: Vec<&[u8]> = ciphertext.iter().map(|v| v.as_slice()).collect();
    let for_cb = handle.clone();
    let _ = backend.borrow_mut().write(
        fd,
        &refs,
        Box::new(move |_res| {
            // The close_notify alert is best-effort: whether or not the
            // peer ever sees it, the socket still tears down.
            finish(&for_cb);
        }),
    );
}

fn finish(handle: &Handle) {
    handle.read_stop();
    let (fd, backend, hook) = {
        let mut s = handle.borrow_mut();
        let hook = s.close_hook.take();
        (s.fd, s.backend.clone(), hook)
    };
    backend.borrow_mut().dispose_socket(fd);
    if let Some(hook) = hook {
        hook();
    }
}

/// Everything a `Socket` needs to be reconstituted on another event-loop
/// instance, possibly on another thread (spec.md §3 "Export record").
pub struct ExportRecord {
    pub detached: Detached,
    pub input: Buffer,
    pub tls: Option<TlsSession>,
    pub peername: Option<Address>,
}

/// `export()` (spec.md §4.8): forbidden while a write is outstanding, since
/// the in-flight write's completion callback is bound to this backend
/// instance. Re-parents every buffer to the non-pooling prototype, since
/// pooled chunks are tied to the exporting thread's freelist.
pub fn export(handle: &Handle) -> Result<ExportRecord, SocketError> {
    let mut s = handle.borrow_mut();
    if s.write_pending {
        return Err(SocketError::ConnectionFailure);
    }
    let fd = s.fd;
    let detached = s.backend.borrow_mut().export(fd).map_err(SocketError::Io)?;

    let mut input = Buffer::new(Prototype::NonPooling);
    std::mem::swap(&mut s.input, &mut input);
    input.reparent(Prototype::NonPooling);

    let mut tls = s.tls.take();
    if let Some(tls) = tls.as_mut() {
        tls.queue.reparent(Prototype::NonPooling);
    }

    Ok(ExportRecord {
        detached,
        input,
        tls,
        peername: s.peername_cache.clone(),
    })
}

/// `import()` (spec.md §4.8): re-attaches the detached descriptor to
/// `backend` and re-parents every buffer back to pooling, since the
/// importing thread's freelist is now the right place to recycle into.
pub fn import(record: ExportRecord, backend: Backend) -> Result<Handle, SocketError> {
    let fd = backend.borrow_mut().import(record.detached).map_err(SocketError::Io)?;
    let handle = Handle::new(fd, backend);
    {
        let mut s = handle.borrow_mut();
        let mut input = record.input;
        input.reparent(Prototype::Pooling);
        s.input = input;

        s.tls = record.tls;
        if let Some(tls) = s.tls.as_mut() {
            tls.queue.reparent(Prototype::Pooling);
        }
        s.peername_cache = record.peername;
    }
    Ok(handle)
}
