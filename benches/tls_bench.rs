//! Micro-benchmarks for the hot paths of the socket/TLS core: ALPN
//! selection and the record-size governor's per-write decision, both called
//! on every application write once a session is established.
//!
//! Run with: cargo bench

use std::hint::black_box;
use std::time::Instant;

use tls_socket_core::tls::alpn::select_protocol;
use tls_socket_core::tls::record_size::{CipherOverhead, Governor};

macro_rules! bench {
    ($name:expr, $iterations:expr, $code:block) => {{
        let start = Instant::now();
        for _ in 0..$iterations {
            black_box($code);
        }
        let elapsed = start.elapsed();
        println!(
            "{}: {} iterations in {:?} ({:?}/iter, {:.0} ops/sec)",
            $name,
            $iterations,
            elapsed,
            elapsed / $iterations,
            $iterations as f64 / elapsed.as_secs_f64()
        );
    }};
}

fn main() {
    println!("==============================================");
    println!("  tls-socket-core micro-benchmarks");
    println!("==============================================\n");

    let server: Vec<&[u8]> = vec![b"h2", b"http/1.1"];
    let client_wire = b"\x08http/1.1\x02h2";
    bench!("alpn::select_protocol", 100_000u32, {
        select_protocol(&server, client_wire)
    });

    bench!("CipherOverhead::AesGcm.bytes()", 1_000_000u32, {
        CipherOverhead::AesGcm.bytes()
    });

    // Governor::decide is only exercised indirectly (it needs a live fd for
    // TCP_INFO), so this benchmarks the pure state-machine transition cost
    // via record_size_for_write on a pre-seeded governor instead.
    bench!("Governor::record_size_for_write", 1_000_000u32, {
        let mut g = Governor::new();
        g.record_size_for_write()
    });
}
