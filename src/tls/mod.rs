//! The TLS layer (spec.md §4): a long-lived context (`context`), the
//! black-box cryptographic engine (`engine`), the byte-queue adapter that is
//! the only place raw bytes cross the TLS boundary (`queue`), per-session
//! state (`session`), the handshake driver (`handshake`), the write/read
//! pipelines (`pipeline`), ALPN selection (`alpn`), the record-size governor
//! (`record_size`), async session resumption (`resumption`), and the
//! post-handshake session accessors (`info`).

pub mod alpn;
pub mod context;
pub mod engine;
pub mod handshake;
pub mod info;
pub mod pipeline;
pub mod queue;
pub mod record_size;
pub mod resumption;
pub mod session;
