//! Drives a client `Engine` and a server `Engine` against each other purely
//! in memory, pumping ciphertext between their two byte-queues by hand. This
//! exercises the engine/byte-queue/ALPN path end to end (spec.md §8
//! scenarios S2/S3) without needing a live socket or event-loop backend.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tls_socket_core::tls::engine::{Engine, EngineStep};
use tls_socket_core::tls::queue::ByteQueue;
use tls_socket_core::tls::resumption::AsyncResumptionSignal;

use tls_socket_core::buffer::Prototype;

fn self_signed(name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    (cert.cert.der().clone(), key)
}

fn server_config(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Arc<rustls::ServerConfig> {
    let mut cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(cfg)
}

fn client_config(root_cert: CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root_cert).unwrap();
    let mut cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    cfg.alpn_protocols = vec![b"http/1.1".to_vec(), b"h2".to_vec()];
    Arc::new(cfg)
}

/// Pumps ciphertext back and forth between two byte-queues until both
/// engines report `Success`, or bails out after a generous round-trip cap to
/// avoid hanging the test suite if something regresses.
fn run_handshake_to_completion(
    client: &mut Engine,
    client_q: &mut ByteQueue,
    server: &mut Engine,
    server_q: &mut ByteQueue,
) {
    let mut client_done = false;
    let mut server_done = false;
    for _ in 0..20 {
        if !client_done {
            match client.drive_handshake(client_q) {
                EngineStep::Success => client_done = true,
                EngineStep::WantRead | EngineStep::WantWrite => {}
                EngineStep::ZeroReturn => panic!("client saw unexpected close during handshake"),
                EngineStep::Error(e) => panic!("client handshake error: {e}"),
            }
        }
        if !server_done {
            match server.drive_handshake(server_q) {
                EngineStep::Success => server_done = true,
                EngineStep::WantRead | EngineStep::WantWrite => {}
                EngineStep::ZeroReturn => panic!("server saw unexpected close during handshake"),
                EngineStep::Error(e) => panic!("server handshake error: {e}"),
            }
        }

        // Ferry each side's queued ciphertext to the other's encrypted
        // input, standing in for the socket in a real deployment.
        for slice in client_q.output_slices() {
            let _ = server_q.input_mut().append(slice.as_slice());
        }
        client_q.clear_output();
        for slice in server_q.output_slices() {
            let _ = client_q.input_mut().append(slice.as_slice());
        }
        server_q.clear_output();

        if client_done && server_done {
            return;
        }
    }
    panic!("handshake did not complete within the round-trip cap");
}

#[test]
fn handshake_completes_and_negotiates_alpn() {
    let (cert, key) = self_signed("example.invalid");
    let server_cfg = server_config(cert.clone(), key);
    let client_cfg = client_config(cert);

    let name: ServerName<'static> = "example.invalid".to_string().try_into().unwrap();
    let signal = AsyncResumptionSignal::new();
    let mut server = Engine::new_server(server_cfg, signal.clone()).unwrap();
    let mut client = Engine::new_client(client_cfg, name, signal).unwrap();

    let mut server_q = ByteQueue::new(Prototype::Pooling);
    let mut client_q = ByteQueue::new(Prototype::Pooling);

    run_handshake_to_completion(&mut client, &mut client_q, &mut server, &mut server_q);

    assert!(!client.is_handshaking());
    assert!(!server.is_handshaking());
    assert_eq!(server.alpn_protocol(), Some(b"http/1.1".to_vec()));
    assert_eq!(client.alpn_protocol(), Some(b"http/1.1".to_vec()));
}

#[test]
fn application_data_round_trips_after_handshake() {
    let (cert, key) = self_signed("example.invalid");
    let server_cfg = server_config(cert.clone(), key);
    let client_cfg = client_config(cert);

    let name: ServerName<'static> = "example.invalid".to_string().try_into().unwrap();
    let signal = AsyncResumptionSignal::new();
    let mut server = Engine::new_server(server_cfg, signal.clone()).unwrap();
    let mut client = Engine::new_client(client_cfg, name, signal).unwrap();

    let mut server_q = ByteQueue::new(Prototype::Pooling);
    let mut client_q = ByteQueue::new(Prototype::Pooling);
    run_handshake_to_completion(&mut client, &mut client_q, &mut server, &mut server_q);

    client.write_cleartext(b"ping", &mut client_q).unwrap();
    for slice in client_q.output_slices() {
        let _ = server_q.input_mut().append(slice.as_slice());
    }
    client_q.clear_output();
    server.feed_ciphertext(&mut server_q).unwrap();

    let mut out = [0u8; 16];
    let n = server.read_cleartext(&mut out).unwrap();
    assert_eq!(&out[..n], b"ping");
}
