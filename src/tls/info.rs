//! Post-handshake session accessors (spec.md §6 `ssl_get_*` family): ALPN
//! result, negotiated protocol version, cipher, and whether the session was
//! resumed. Each is a thin read-through to `Engine`/`TlsSession` state, for
//! callers that only hold a `Handle` once the handshake has completed.

use crate::socket::Handle;

/// `ssl_get_selected_protocol`: the ALPN protocol the handshake settled on,
/// if any.
pub fn ssl_get_selected_protocol(handle: &Handle) -> Option<Vec<u8>> {
    let s = handle.borrow();
    s.tls.as_ref()?.engine.alpn_protocol()
}

/// `ssl_get_protocol_version`: the negotiated TLS version, as a string in
/// the usual `"TLSv1.2"`/`"TLSv1.3"` form.
pub fn ssl_get_protocol_version(handle: &Handle) -> Option<String> {
    let s = handle.borrow();
    let version = s.tls.as_ref()?.engine.protocol_version()?;
    Some(match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{other:?}"),
    })
}

/// `ssl_get_cipher`: the negotiated cipher suite's name.
pub fn ssl_get_cipher(handle: &Handle) -> Option<String> {
    let s = handle.borrow();
    let suite = s.tls.as_ref()?.engine.negotiated_cipher_suite()?;
    Some(format!("{:?}", suite.suite()))
}

/// `ssl_get_cipher_bits`: the negotiated cipher's symmetric key size.
pub fn ssl_get_cipher_bits(handle: &Handle) -> Option<u16> {
    let s = handle.borrow();
    let suite = s.tls.as_ref()?.engine.negotiated_cipher_suite()?;
    crate::tls::record_size::cipher_suite_bits(suite)
}

/// `ssl_get_session_reused`: whether the handshake resumed a previous
/// session rather than performing a full one. `false` for a socket with no
/// TLS session at all.
pub fn ssl_get_session_reused(handle: &Handle) -> bool {
    let s = handle.borrow();
    s.tls.as_ref().map(|tls| tls.reused).unwrap_or(false)
}
