//! Stable error sentinels shared by every layer of the socket/TLS core.
//!
//! The names mirror spec.md §6 verbatim; callers match on the variant, not
//! on the `Display` string, but the string is kept stable anyway since some
//! tests assert on it directly (scenario S3, S5 in spec.md §8).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("closed by peer")]
    ClosedByPeer,

    #[error("connection failure")]
    ConnectionFailure,

    #[error("ssl no certificate")]
    SslNoCertificate,

    #[error("ssl certificate invalid")]
    SslCertificateInvalid,

    #[error("ssl certificate name mismatch")]
    SslCertificateNameMismatch,

    #[error("ssl decode error")]
    SslDecodeError,

    #[error("ssl renegotiation not supported")]
    SslRenegotiationNotSupported,

    #[error("ssl handshake failure")]
    SslHandshakeFailure,

    /// Carries the engine's own X.509 verification detail (spec.md §4.3
    /// step 4, §7: "the engine's X509 verification detail, if present, is
    /// surfaced in place of the generic handshake failure").
    #[error("ssl handshake failure: {0}")]
    SslHandshakeFailureDetail(String),
}

pub type Result<T> = std::result::Result<T, SocketError>;
