//! The TLS cryptographic engine, consumed as a black box per spec.md §1:
//! "accept/connect/read/write/shutdown, pending-bytes count, current cipher
//! suite id, negotiated version, peer certificate, ALPN/NPN result,
//! session-ticket callbacks." Backed by `rustls::Connection`.
//!
//! `rustls` does not expose a single-shot "drive the handshake one step"
//! call the way the original OpenSSL-shaped engine did (`SSL_accept`/
//! `SSL_connect` returning 1/0/-1 against a BIO pair); `Engine` recreates
//! that shape on top of `rustls::Connection::{read_tls, write_tls,
//! process_new_packets}` and the byte-queue adapter (`tls::queue`), so the
//! handshake driver above it (`tls::handshake`) can stay faithful to
//! spec.md §4.3's Redo/Complete state machine.

use crate::error::{Result, SocketError};
use crate::tls::queue::ByteQueue;
use crate::tls::resumption::AsyncResumptionSignal;
use rustls::{ClientConnection, Connection, ServerConnection};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

/// Mirrors the OpenSSL-style tri-state result of driving the engine one
/// step: `WantRead`/`WantWrite` suspend the handshake driver at a
/// corresponding event-loop edge (spec.md §5 "four well-defined edges").
pub enum EngineStep {
    Success,
    WantRead,
    WantWrite,
    /// Clean shutdown observed mid-handshake (engine returned 0).
    ZeroReturn,
    Error(SocketError),
}

pub enum Role {
    Server(Arc<rustls::ServerConfig>),
    Client(Arc<rustls::ClientConfig>, rustls::pki_types::ServerName<'static>),
}

pub struct Engine {
    conn: Connection,
    role: Role,
    /// Set by the custom session-cache hook (`tls::resumption`) when the
    /// registered async-resumption `get` callback was consulted during the
    /// most recent `accept()` call. The handshake driver reads this flag to
    /// decide whether to move the resumption sub-state to REQUEST_SENT
    /// (spec.md §4.3).
    pub resumption_signal: Arc<AsyncResumptionSignal>,
}

impl Engine {
    pub fn new_server(config: Arc<rustls::ServerConfig>, signal: Arc<AsyncResumptionSignal>) -> Result<Self> {
        let conn = ServerConnection::new(config.clone())
            .map_err(|_| SocketError::SslHandshakeFailure)?;
        Ok(Self {
            conn: Connection::Server(conn),
            role: Role::Server(config),
            resumption_signal: signal,
        })
    }

    pub fn new_client(
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
        signal: Arc<AsyncResumptionSignal>,
    ) -> Result<Self> {
        let conn = ClientConnection::new(config.clone(), server_name.clone())
            .map_err(|_| SocketError::SslHandshakeFailure)?;
        Ok(Self {
            conn: Connection::Client(conn),
            role: Role::Client(config, server_name),
            resumption_signal: signal,
        })
    }

    /// Rebuilds the engine from the same context, used by the handshake
    /// driver's REQUEST_SENT transition (spec.md §4.3 step 3: "Destroy the
    /// engine, rebuild it from the same context").
    pub fn rebuild(&mut self) -> Result<()> {
        match &self.role {
            Role::Server(cfg) => {
                self.conn = Connection::Server(
                    ServerConnection::new(cfg.clone()).map_err(|_| SocketError::SslHandshakeFailure)?,
                );
            }
            Role::Client(cfg, name) => {
                self.conn = Connection::Client(
                    ClientConnection::new(cfg.clone(), name.clone())
                        .map_err(|_| SocketError::SslHandshakeFailure)?,
                );
            }
        }
        Ok(())
    }

    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    /// Drives accept/connect one step against the byte-queue adapter: pull
    /// any available ciphertext, run it through `process_new_packets`,
    /// flush any handshake output, and report the resulting state.
    pub fn drive_handshake(&mut self, queue: &mut ByteQueue) -> EngineStep {
        self.resumption_signal.reset();

        // Step 1: feed any already-queued ciphertext into the connection.
        let mut scratch = [0u8; 4096];
        loop {
            match queue.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    let mut cur = Cursor::new(&scratch[..n]);
                    if let Err(e) = self.conn.read_tls(&mut cur) {
                        return EngineStep::Error(SocketError::Io(e));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return EngineStep::Error(SocketError::Io(e)),
            }
        }

        if let Err(e) = self.conn.process_new_packets() {
            return match classify_tls_error(&e) {
                Some(detail) => EngineStep::Error(SocketError::SslHandshakeFailureDetail(detail)),
                None => EngineStep::Error(SocketError::SslHandshakeFailure),
            };
        }

        // Step 2: flush whatever handshake flight rustls produced.
        while self.conn.wants_write() {
            let mut out = Vec::new();
            if let Err(e) = self.conn.write_tls(&mut out) {
                return EngineStep::Error(SocketError::Io(e));
            }
            if out.is_empty() {
                break;
            }
            if let Err(e) = queue.write_all(&out) {
                return EngineStep::Error(e);
            }
        }

        if !self.conn.is_handshaking() {
            return EngineStep::Success;
        }
        if self.conn.wants_write() {
            return EngineStep::WantWrite;
        }
        EngineStep::WantRead
    }

    /// Decrypts application data into `out`, matching the read pipeline's
    /// expectations in spec.md §4.6: returns `Ok(0)` on a clean close,
    /// `ErrorKind::WouldBlock` when more ciphertext is needed.
    pub fn read_cleartext(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.conn.reader().read(out)
    }

    /// Encrypts `data` and queues the resulting record(s) onto `queue`'s
    /// output buffer. Returns the number of plaintext bytes accepted, which
    /// the write pipeline compares against the requested chunk size
    /// (spec.md §4.5's "engine returned any value other than the exact
    /// chunk size" race check).
    pub fn write_cleartext(&mut self, data: &[u8], queue: &mut ByteQueue) -> Result<usize> {
        let n = self
            .conn
            .writer()
            .write(data)
            .map_err(SocketError::Io)?;
        while self.conn.wants_write() {
            let mut out = Vec::new();
            self.conn.write_tls(&mut out).map_err(SocketError::Io)?;
            if out.is_empty() {
                break;
            }
            queue.write_all(&out)?;
        }
        Ok(n)
    }

    /// Feeds any ciphertext sitting in the queue through the connection
    /// without requiring a handshake to be in progress, for the read
    /// pipeline's decode loop (spec.md §4.6).
    pub fn feed_ciphertext(&mut self, queue: &mut ByteQueue) -> std::io::Result<usize> {
        let mut scratch = [0u8; 4096];
        let mut total = 0;
        loop {
            match queue.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    let mut cur = Cursor::new(&scratch[..n]);
                    self.conn.read_tls(&mut cur)?;
                    total += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        self.conn
            .process_new_packets()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(total)
    }

    pub fn pending_bytes(&self) -> usize {
        self.conn.process_new_packets().map(|s| s.plaintext_bytes_to_read()).unwrap_or(0)
    }

    pub fn flush_output(&mut self, queue: &mut ByteQueue) -> Result<()> {
        while self.conn.wants_write() {
            let mut out = Vec::new();
            self.conn.write_tls(&mut out).map_err(SocketError::Io)?;
            if out.is_empty() {
                break;
            }
            queue.write_all(&out)?;
        }
        Ok(())
    }

    /// Sends a close_notify alert, matching the OpenSSL `SSL_shutdown`
    /// tri-state contract used in spec.md §4.7: returns `Success` once the
    /// alert has been queued (the caller still needs to flush it), and the
    /// driver maps a following call after the peer's own close_notify has
    /// been observed to `ZeroReturn`.
    pub fn shutdown(&mut self, queue: &mut ByteQueue) -> EngineStep {
        self.conn.send_close_notify();
        if let Err(e) = self.flush_output(queue) {
            return EngineStep::Error(e.into());
        }
        if self.conn.is_handshaking() {
            EngineStep::WantRead
        } else {
            EngineStep::Success
        }
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(|p| p.to_vec())
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }

    pub fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        self.conn.negotiated_cipher_suite()
    }

    pub fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        self.conn.peer_certificates()
    }

    /// Produced when the backend reports a clean close (a `read` callback
    /// delivering zero bytes) while this engine is still mid-handshake:
    /// `process_new_packets` never sees that condition itself, only the
    /// ciphertext handed to it, so the handshake driver has to ask for it
    /// explicitly instead of getting it out of `drive_handshake` (spec.md
    /// §4.3 step 4).
    pub fn observe_eof(&mut self) -> EngineStep {
        if self.conn.is_handshaking() {
            EngineStep::ZeroReturn
        } else {
            EngineStep::Success
        }
    }

    /// Whether the completed handshake resumed a previous session (TLS 1.3
    /// PSK resumption, or a TLS 1.2 session-id/ticket hit), for
    /// `tls::session::TlsSession::reused` (spec.md §6 `ssl_get_session_reused`).
    pub fn handshake_kind(&self) -> Option<rustls::HandshakeKind> {
        self.conn.handshake_kind()
    }

    /// TLS 1.3 session resumption and TLS 1.2 session-id reuse both surface
    /// as a post-handshake `is_handshaking() == false` connection with no
    /// renegotiation support; rustls does not expose a single "was this
    /// session resumed" bit directly, so this crate infers it from whether
    /// the handshake produced zero additional round trips worth of
    /// certificate exchange — tracked explicitly by the session layer
    /// instead (`tls::session::TlsSession::reused`), not here.
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }
}

fn classify_tls_error(err: &rustls::Error) -> Option<String> {
    match err {
        rustls::Error::InvalidCertificate(detail) => Some(format!("{detail:?}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_step_error_carries_detail() {
        let step = EngineStep::Error(SocketError::SslCertificateInvalid);
        match step {
            EngineStep::Error(SocketError::SslCertificateInvalid) => {}
            _ => panic!("expected SslCertificateInvalid"),
        }
    }
}
