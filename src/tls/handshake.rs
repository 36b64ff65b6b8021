//! The handshake driver (spec.md §4.3): the Redo/Complete state machine that
//! drives the engine through `accept()`/`connect()`, the ciphertext
//! snapshot/replay dance for out-of-band session resumption, and the
//! transition into the read pipeline once the handshake completes.

use crate::error::SocketError;
use crate::socket::Handle;
use crate::tls::context::{ClientContext, ServerContext};
use crate::tls::engine::EngineStep;
use crate::tls::session::{HandshakeRole, ResumptionSubState, TlsSession};

pub enum HandshakeContext {
    Server(ServerContext),
    Client(ClientContext, String),
}

/// `ssl_handshake` (spec.md §6): constructs the session and starts driving
/// it. Any bytes already buffered in the socket's plaintext input (read
/// before the caller decided to start TLS on this connection — e.g. to peek
/// at a protocol byte) are ciphertext with respect to the fresh session and
/// are handed to it as such (spec.md §4.2 step 2).
pub fn ssl_handshake(handle: &Handle, ctx: HandshakeContext, cb: Box<dyn FnOnce(Option<SocketError>)>) {
    let prebuffered = {
        let mut s = handle.borrow_mut();
        if s.input.is_empty() {
            None
        } else {
            let proto = s.input.prototype();
            let mut swapped = crate::buffer::Buffer::new(proto);
            std::mem::swap(&mut s.input, &mut swapped);
            Some(swapped)
        }
    };

    let built = match ctx {
        HandshakeContext::Server(sctx) => {
            TlsSession::new_server(sctx.config, sctx.resumption_signal, prebuffered)
        }
        HandshakeContext::Client(cctx, server_name) => {
            TlsSession::new_client(cctx.config, server_name, prebuffered)
        }
    };

    let mut session = match built {
        Ok(s) => s,
        Err(e) => {
            cb(Some(e));
            return;
        }
    };
    session.handshake.on_complete = Some(cb);
    handle.borrow_mut().tls = Some(session);
    drive(handle);
}

/// `ssl_resume_server_handshake` (spec.md §6): called once the application
/// has resolved the out-of-band session lookup against its own backing
/// store. The rebuilt engine re-presents the replayed ClientHello to the
/// session cache; since the application is expected to have already updated
/// whatever store the registered `get` callback reads from, the replayed
/// lookup now resolves synchronously.
pub fn resume_server_handshake(handle: &Handle) {
    {
        let mut s = handle.borrow_mut();
        let Some(tls) = s.tls.as_mut() else {
            return;
        };
        if let HandshakeRole::Server { sub_state, .. } = &mut tls.handshake.role {
            *sub_state = ResumptionSubState::Complete;
        }
    }
    drive(handle);
}

fn drive(handle: &Handle) {
    loop {
        capture_snapshot_if_recording(handle);

        let step = {
            let mut s = handle.borrow_mut();
            let tls = s.tls.as_mut().expect("drive called without a pending TLS session");
            tls.engine.drive_handshake(&mut tls.queue)
        };

        if resolve_resumption_substate(handle) {
            // Suspended for an out-of-band lookup: the engine has been
            // rebuilt and reads stopped; `resume_server_handshake` re-enters
            // this driver once the lookup resolves.
            return;
        }

        match step {
            EngineStep::Error(e) => {
                complete(handle, Some(e));
                return;
            }
            EngineStep::ZeroReturn => {
                complete(handle, Some(handshake_failure_reason(handle)));
                return;
            }
            EngineStep::Success => {
                if let Some(e) = verify_client_peer_certificate(handle) {
                    complete(handle, Some(e));
                    return;
                }
                mark_reused_if_resumed(handle);
                if flush_if_needed(handle, After::CompleteOk) {
                    return;
                }
                complete(handle, None);
                return;
            }
            EngineStep::WantWrite => {
                if flush_if_needed(handle, After::Redo) {
                    return;
                }
                // drive_handshake already drains every pending TLS record
                // before returning; falling through means it asked for more
                // write capacity than it actually queued, which shouldn't
                // happen. Loop once more defensively rather than spin.
            }
            EngineStep::WantRead => {
                if flush_if_needed(handle, After::Redo) {
                    return;
                }
                start_read_for_handshake(handle);
                return;
            }
        }
    }
}

/// While in RECORD, every Redo captures the latest ciphertext buffered ahead
/// of the call (spec.md §3 invariant 4, §4.3 step 3). In practice this only
/// ever fires once, on the very first Redo, since the call below always
/// moves the sub-state out of RECORD.
fn capture_snapshot_if_recording(handle: &Handle) {
    let mut s = handle.borrow_mut();
    let tls = s.tls.as_mut().expect("drive called without a pending TLS session");
    let snapshot = tls.queue.input().as_slice().to_vec();
    if let HandshakeRole::Server { sub_state, captured, .. } = &mut tls.handshake.role {
        if *sub_state == ResumptionSubState::Record {
            if snapshot.len() > crate::tls::session::REPLAY_CAP {
                // Too much ciphertext to safely replay; give up on
                // suspending this handshake for async resumption.
                *sub_state = ResumptionSubState::Complete;
                *captured = None;
            } else {
                *captured = Some(snapshot);
            }
        }
    }
}

/// Checks whether the just-completed Redo consulted the async resumption
/// signal while in RECORD, and if so performs the REQUEST_SENT transition:
/// destroy and rebuild the engine, clear anything it queued, replay the
/// captured ciphertext, and stop reads (spec.md §4.3 step 3). Returns `true`
/// if the driver must suspend here.
fn resolve_resumption_substate(handle: &Handle) -> bool {
    let mut s = handle.borrow_mut();
    let tls = s.tls.as_mut().expect("drive called without a pending TLS session");
    let mut went_pending = false;
    if let HandshakeRole::Server { sub_state, signal, .. } = &mut tls.handshake.role {
        if *sub_state == ResumptionSubState::Record {
            let pending = signal.as_ref().map(|sig| sig.was_pending()).unwrap_or(false);
            *sub_state = if pending {
                ResumptionSubState::RequestSent
            } else {
                ResumptionSubState::Complete
            };
            went_pending = pending;
        }
    }
    if !went_pending {
        return false;
    }

    let _ = tls.engine.rebuild();
    tls.queue.clear_output();
    let buffered = tls.queue.input().len();
    tls.queue.input_mut().consume(buffered);
    let snapshot = match &mut tls.handshake.role {
        HandshakeRole::Server { captured, .. } => captured.take(),
        HandshakeRole::Client { .. } => None,
    };
    if let Some(bytes) = snapshot {
        let _ = tls.queue.input_mut().append(&bytes);
    }
    drop(s);
    handle.read_stop();
    true
}

enum After {
    Redo,
    CompleteOk,
}

/// If the engine queued ciphertext, stops reads and flushes it to the real
/// socket, re-entering the driver (or completing the handshake) from the
/// write-completion callback. Returns `true` if a flush was started, in
/// which case the caller must return without doing anything further.
fn flush_if_needed(handle: &Handle, after: After) -> bool {
    let empty = {
        let s = handle.borrow();
        s.tls.as_ref().expect("drive called without a pending TLS session").queue.output_is_empty()
    };
    if empty {
        return false;
    }
    handle.read_stop();
    let (iovecs, fd, backend) = {
        let mut s = handle.borrow_mut();
        let tls = s.tls.as_mut().unwrap();
        let owned: Vec<Vec<u8>> = tls.queue.output_slices().iter().map(|sl| sl.as_slice().to_vec()).collect();
        tls.queue.clear_output();
        (owned, s.fd, s.backend.clone())
    };
    let refs: Vec<&[u8]> = iovecs.iter().map(|v| v.as_slice()).collect();
    let weak = handle.downgrade();
    let _ = backend.borrow_mut().write(
        fd,
        &refs,
        Box::new(move |res| {
            let Some(handle) = crate::socket::upgrade(&weak) else { return };
            match res {
                Ok(()) => match after {
                    After::Redo => drive(&handle),
                    After::CompleteOk => complete(&handle, None),
                },
                Err(e) => complete(&handle, Some(SocketError::Io(e))),
            }
        }),
    );
    true
}

fn start_read_for_handshake(handle: &Handle) {
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
                        let step = {
                            let mut s = handle.borrow_mut();
                            let tls = s.tls.as_mut().unwrap();
                            tls.engine.observe_eof()
                        };
                        match step {
                            EngineStep::ZeroReturn => {
                                complete(&handle, Some(handshake_failure_reason(&handle)));
                            }
                            _ => complete(&handle, Some(SocketError::ClosedByPeer)),
                        }
                        return;
                    }
                    {
                        let mut s = handle.borrow_mut();
                        let tls = s.tls.as_mut().unwrap();
                        let _ = tls.queue.input_mut().append(bytes);
                    }
                    handle.read_stop();
                    drive(&handle);
                }
                Err(e) => complete(&handle, Some(SocketError::Io(e))),
            }
        }),
    );
}

/// spec.md §4.3 step 6: the client role additionally requires the peer to
/// have actually presented a certificate once the handshake reports
/// success. rustls already validated the chain and hostname as part of
/// getting to `Success` at all; what's left to check is that a certificate
/// arrived in the first place (it may not have, in an anonymous cipher
/// suite configuration).
fn verify_client_peer_certificate(handle: &Handle) -> Option<SocketError> {
    let s = handle.borrow();
    let tls = s.tls.as_ref().expect("drive called without a pending TLS session");
    if tls.is_server() {
        return None;
    }
    match tls.engine.peer_certificates() {
        Some(certs) if !certs.is_empty() => None,
        _ => Some(SocketError::SslNoCertificate),
    }
}

fn mark_reused_if_resumed(handle: &Handle) {
    let mut s = handle.borrow_mut();
    if let Some(tls) = s.tls.as_mut() {
        tls.reused = matches!(tls.engine.handshake_kind(), Some(rustls::HandshakeKind::Resumed));
    }
}

/// spec.md §4.3 step 4: "the engine's X509 verification detail, if
/// present, is surfaced in place of the generic handshake failure." A
/// clean close mid-handshake after the peer already presented a
/// certificate is treated as an ordinary closed connection; one observed
/// before any certificate arrived is a handshake failure.
fn handshake_failure_reason(handle: &Handle) -> SocketError {
    let s = handle.borrow();
    let tls = s.tls.as_ref().expect("drive called without a pending TLS session");
    match tls.engine.peer_certificates() {
        Some(certs) if !certs.is_empty() => SocketError::ClosedByPeer,
        _ => SocketError::SslHandshakeFailure,
    }
}

fn complete(handle: &Handle, err: Option<SocketError>) {
    handle.read_stop();
    let cb = {
        let mut s = handle.borrow_mut();
        s.tls.as_mut().and_then(|tls| tls.handshake.on_complete.take())
    };
    if let Some(cb) = cb {
        cb(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Detached, EventLoopBackend, IoVec, WriteResult};
    use crate::tls::record_size::NO_HINT;
    use crate::tls::resumption::AsyncResumptionSignal;
    use crate::tls::session::TlsSession;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::cell::RefCell;
    use std::io;
    use std::net::SocketAddr;
    use std::os::unix::io::RawFd;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn no_hint_is_max() {
        assert_eq!(NO_HINT, usize::MAX);
    }

    /// Never actually registers anything; the driver functions under test
    /// here only touch `tls.queue`/`tls.handshake`, never the backend.
    struct NullBackend;

    impl EventLoopBackend for NullBackend {
        fn dispose_socket(&mut self, _fd: RawFd) {}
        fn write(&mut self, _fd: RawFd, _bufs: &[IoVec<'_>], _cb: Box<dyn FnOnce(WriteResult)>) -> io::Result<()> {
            Ok(())
        }
        fn read_start(&mut self, _fd: RawFd, _cb: Box<dyn FnMut(io::Result<&[u8]>)>) -> io::Result<()> {
            Ok(())
        }
        fn read_stop(&mut self, _fd: RawFd) {}
        fn export(&mut self, fd: RawFd) -> io::Result<Detached> {
            Ok(Detached { fd })
        }
        fn import(&mut self, detached: Detached) -> io::Result<RawFd> {
            Ok(detached.fd)
        }
        fn get_peername_uncached(&self, _fd: RawFd) -> io::Result<SocketAddr> {
            Err(io::Error::new(io::ErrorKind::Other, "no peer"))
        }
    }

    fn null_handle() -> Handle {
        let backend: Rc<RefCell<dyn EventLoopBackend>> = Rc::new(RefCell::new(NullBackend));
        Handle::new(-1, backend)
    }

    fn self_signed_server_config() -> Arc<rustls::ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["example.invalid".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
        let der: CertificateDer<'static> = cert.cert.der().clone();
        Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![der], key)
                .unwrap(),
        )
    }

    fn server_session_in_record(handle: &Handle, signal: Arc<AsyncResumptionSignal>) {
        let session = TlsSession::new_server(self_signed_server_config(), Some(signal), None).unwrap();
        handle.borrow_mut().tls = Some(session);
    }

    #[test]
    fn capture_snapshot_records_ciphertext_while_in_record() {
        let handle = null_handle();
        server_session_in_record(&handle, AsyncResumptionSignal::new());
        {
            let mut s = handle.borrow_mut();
            let tls = s.tls.as_mut().unwrap();
            let _ = tls.queue.input_mut().append(b"clienthello-bytes");
        }

        capture_snapshot_if_recording(&handle);

        let s = handle.borrow();
        let tls = s.tls.as_ref().unwrap();
        match &tls.handshake.role {
            HandshakeRole::Server { sub_state, captured, .. } => {
                assert_eq!(*sub_state, ResumptionSubState::Record);
                assert_eq!(captured.as_deref(), Some(&b"clienthello-bytes"[..]));
            }
            HandshakeRole::Client { .. } => panic!("expected server role"),
        }
    }

    #[test]
    fn capture_snapshot_gives_up_past_replay_cap() {
        let handle = null_handle();
        server_session_in_record(&handle, AsyncResumptionSignal::new());
        {
            let mut s = handle.borrow_mut();
            let tls = s.tls.as_mut().unwrap();
            let big = vec![0u8; crate::tls::session::REPLAY_CAP + 1];
            let _ = tls.queue.input_mut().append(&big);
        }

        capture_snapshot_if_recording(&handle);

        let s = handle.borrow();
        let tls = s.tls.as_ref().unwrap();
        match &tls.handshake.role {
            HandshakeRole::Server { sub_state, captured, .. } => {
                assert_eq!(*sub_state, ResumptionSubState::Complete);
                assert!(captured.is_none());
            }
            HandshakeRole::Client { .. } => panic!("expected server role"),
        }
    }

    /// Scenario S4 (spec.md §8): the async `get` callback reports `Pending`
    /// while RECORD is still the sub-state, so the very next Redo must move
    /// to REQUEST_SENT, rebuild the engine, and replay the captured
    /// ciphertext rather than completing the handshake normally.
    #[test]
    fn resolve_resumption_substate_suspends_and_rebuilds_on_pending_lookup() {
        let handle = null_handle();
        let signal = AsyncResumptionSignal::new();
        server_session_in_record(&handle, signal.clone());
        {
            let mut s = handle.borrow_mut();
            let tls = s.tls.as_mut().unwrap();
            let _ = tls.queue.input_mut().append(b"replay-me");
        }
        capture_snapshot_if_recording(&handle);
        signal.mark_pending();

        let suspended = resolve_resumption_substate(&handle);
        assert!(suspended, "a pending lookup must suspend the driver");

        let s = handle.borrow();
        let tls = s.tls.as_ref().unwrap();
        match &tls.handshake.role {
            HandshakeRole::Server { sub_state, captured, .. } => {
                // spec.md §8 property 4: once REQUEST_SENT, the captured
                // snapshot has been consumed (replayed) and sub_state never
                // reverts to RECORD without an intervening Complete.
                assert_eq!(*sub_state, ResumptionSubState::RequestSent);
                assert!(captured.is_none());
            }
            HandshakeRole::Client { .. } => panic!("expected server role"),
        }
        assert_eq!(tls.queue.input().as_slice(), &b"replay-me"[..]);
    }

    #[test]
    fn resolve_resumption_substate_completes_without_a_pending_lookup() {
        let handle = null_handle();
        server_session_in_record(&handle, AsyncResumptionSignal::new());

        let suspended = resolve_resumption_substate(&handle);
        assert!(!suspended);

        let s = handle.borrow();
        let tls = s.tls.as_ref().unwrap();
        match &tls.handshake.role {
            HandshakeRole::Server { sub_state, .. } => {
                assert_eq!(*sub_state, ResumptionSubState::Complete);
            }
            HandshakeRole::Client { .. } => panic!("expected server role"),
        }
    }
}
