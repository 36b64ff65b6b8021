//! A non-blocking TCP socket core with an integrated TLS session bridge
//! (spec.md §1 PURPOSE & SCOPE). See DESIGN.md for how each module grounds
//! back to the teacher repo and the rest of the example pack.
//!
//! Module layout mirrors the spec's own breakdown: `error` and `buffer` are
//! the foundation every other module builds on; `backend` is the
//! event-loop abstraction with its two platform implementations; `net` is
//! the address leaf utilities; `socket` is the `Handle`/`Socket` entity and
//! its lifecycle; `tls` is everything that turns a plaintext `Socket` into
//! an encrypted one.

pub mod backend;
pub mod buffer;
pub mod error;
pub mod net;
pub mod socket;
pub mod tls;

pub use backend::{Detached, EventLoopBackend, Interest, IoVec, WriteResult};
#[cfg(target_os = "linux")]
pub use backend::epoll::Epoll;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
pub use backend::kqueue::Kqueue;

pub use error::{Result, SocketError};

pub use net::{compare_address, getnumerichost, getport, Address};

pub use socket::lifecycle::{export, import, ExportRecord};
pub use socket::{Handle, ReadCallback, WriteCallback};

pub use tls::alpn::{parse_wire_list, select_protocol};
pub use tls::context::{ClientContext, ServerContext};
pub use tls::handshake::{
    resume_server_handshake as ssl_resume_server_handshake, ssl_handshake, HandshakeContext,
};
pub use tls::info::{
    ssl_get_cipher, ssl_get_cipher_bits, ssl_get_protocol_version, ssl_get_selected_protocol,
    ssl_get_session_reused,
};
pub use tls::record_size::{CipherOverhead, Mode as RecordSizeMode, NO_HINT};
pub use tls::resumption::{
    async_resumption_init, AsyncResumptionCallbacks, AsyncResumptionSignal, Lookup,
};
