//! TLS session state (spec.md §3 "TLS session", §4.2 "TLS session
//! lifecycle"): owns the engine instance, the handshake block, the
//! encrypted-input/output byte-queue, and the record-size governor.

use crate::buffer::{Buffer, Prototype};
use crate::error::SocketError;
use crate::tls::engine::Engine;
use crate::tls::queue::ByteQueue;
use crate::tls::record_size::Governor;
use crate::tls::resumption::AsyncResumptionSignal;
use std::sync::Arc;

/// Async-resumption sub-state for the server role (spec.md §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumptionSubState {
    Complete,
    Record,
    RequestSent,
}

/// The ≤1024-byte ciphertext snapshot captured while in RECORD, replayed
/// into the rebuilt engine's encrypted input if the handshake suspends for
/// an out-of-band lookup (spec.md §3 invariant 4, §4.3 step 3).
pub const REPLAY_CAP: usize = 1024;

pub enum HandshakeRole {
    Server {
        sub_state: ResumptionSubState,
        captured: Option<Vec<u8>>,
        signal: Option<Arc<AsyncResumptionSignal>>,
    },
    Client {
        server_name: String,
    },
}

/// Completion callback plus the role-tagged union from spec.md §3.
pub struct HandshakeBlock {
    pub on_complete: Option<Box<dyn FnOnce(Option<SocketError>)>>,
    pub role: HandshakeRole,
}

pub struct TlsSession {
    pub engine: Engine,
    pub queue: ByteQueue,
    pub handshake: HandshakeBlock,
    pub governor: Governor,
    /// spec.md §3: "a one-bit flag 'writes-while-reading were observed'".
    /// Mirrors `ByteQueue`'s own token state for callers that only hold a
    /// `&TlsSession`.
    pub renegotiation_observed: bool,
    /// Write-time engine failure latch (spec.md §4.5, §7): the next
    /// scheduled event reports an I/O error instead of a normal completion.
    pub write_error_latched: bool,
    pub reused: bool,
}

impl TlsSession {
    /// `ssl_handshake` construction, spec.md §4.2 steps 1-4.
    ///
    /// `prebuffered` is the socket's plaintext input buffer at the moment
    /// of construction; if non-empty it is swapped into the session's
    /// encrypted input, since those bytes are ciphertext with respect to
    /// the fresh session (spec.md §4.2 step 2).
    pub fn new_server(
        config: Arc<rustls::ServerConfig>,
        resumption_signal: Option<Arc<AsyncResumptionSignal>>,
        prebuffered: Option<Buffer>,
    ) -> Result<Self, SocketError> {
        // spec.md §4.2 step 4 (server): RECORD only if the context has an
        // async session-lookup callback registered, i.e. a signal was
        // wired up by `async_resumption_setup_ctx`.
        let sub_state = if resumption_signal.is_some() {
            ResumptionSubState::Record
        } else {
            ResumptionSubState::Complete
        };
        let engine_signal = resumption_signal.clone().unwrap_or_else(AsyncResumptionSignal::new);
        let engine = Engine::new_server(config, engine_signal)?;
        let mut queue = ByteQueue::new(Prototype::Pooling);
        if let Some(buf) = prebuffered {
            *queue.input_mut() = buf;
        }
        Ok(Self {
            engine,
            queue,
            handshake: HandshakeBlock {
                on_complete: None,
                role: HandshakeRole::Server {
                    sub_state,
                    captured: None,
                    signal: resumption_signal,
                },
            },
            governor: Governor::new(),
            renegotiation_observed: false,
            write_error_latched: false,
            reused: false,
        })
    }

    pub fn new_client(
        config: Arc<rustls::ClientConfig>,
        server_name: String,
        prebuffered: Option<Buffer>,
    ) -> Result<Self, SocketError> {
        let name: rustls::pki_types::ServerName<'static> = server_name
            .clone()
            .try_into()
            .map_err(|_| SocketError::ConnectionFailure)?;
        let signal = AsyncResumptionSignal::new();
        let engine = Engine::new_client(config, name, signal)?;
        let mut queue = ByteQueue::new(Prototype::Pooling);
        if let Some(buf) = prebuffered {
            *queue.input_mut() = buf;
        }
        Ok(Self {
            engine,
            queue,
            handshake: HandshakeBlock {
                on_complete: None,
                role: HandshakeRole::Client { server_name },
            },
            governor: Governor::new(),
            renegotiation_observed: false,
            write_error_latched: false,
            reused: false,
        })
    }

    pub fn is_server(&self) -> bool {
        matches!(self.handshake.role, HandshakeRole::Server { .. })
    }
}

