//! Integration coverage for the address/ALPN/record-size building blocks
//! that don't need a live socket, a plaintext-echo smoke test over a real
//! `tokio` loopback connection standing in for an application-level event
//! loop driving raw `read`/`write` syscalls (spec.md §8 scenario S1), and a
//! round trip through the crate's own `Handle`/`Epoll` backend pumped by a
//! real `turn()` loop.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tls_socket_core::{compare_address, select_protocol, Address};

#[tokio::test]
async fn plaintext_echo_round_trips_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        sock.read_exact(&mut buf).await.unwrap();
        sock.write_all(&buf).await.unwrap();
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    server.await.unwrap();
}

#[test]
fn alpn_negotiation_prefers_server_order() {
    let server: Vec<&[u8]> = vec![b"h2", b"http/1.1"];
    let client_wire = b"\x08http/1.1\x02h2";
    assert_eq!(select_protocol(&server, client_wire), Some(&b"h2"[..]));
}

#[test]
fn compare_address_orders_families_then_value() {
    let v4: Address = Address::Ip("127.0.0.1:80".parse().unwrap());
    let v6: Address = Address::Ip("[::1]:80".parse().unwrap());
    assert_eq!(compare_address(&v4, &v6), std::cmp::Ordering::Less);
}

/// Drives a real `Handle` pair over a loopback socket through the crate's
/// own `Epoll` backend, pumping `turn()` by hand rather than handing the
/// descriptors to `tokio` (spec.md §6 `write`/`read_start`, §1 "two
/// interchangeable backends").
#[cfg(target_os = "linux")]
#[test]
fn handle_round_trips_bytes_through_epoll_backend() {
    use std::cell::RefCell;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::os::unix::io::IntoRawFd;
    use std::rc::Rc;

    use tls_socket_core::{EventLoopBackend, Handle};

    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client_std = StdStream::connect(addr).unwrap();
    let (server_std, _peer) = listener.accept().unwrap();
    client_std.set_nonblocking(true).unwrap();
    server_std.set_nonblocking(true).unwrap();

    let epoll = Rc::new(RefCell::new(tls_socket_core::Epoll::new().unwrap()));
    let backend: Rc<RefCell<dyn EventLoopBackend>> = epoll.clone();

    let client = Handle::new(client_std.into_raw_fd(), backend.clone());
    let server = Handle::new(server_std.into_raw_fd(), backend);

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_cb = received.clone();
    server.read_start(Box::new(move |res| {
        if let Ok(bytes) = res {
            received_cb.borrow_mut().extend_from_slice(bytes);
        }
    }));

    let write_ok = Rc::new(RefCell::new(false));
    let write_ok_cb = write_ok.clone();
    client.write(
        vec![b"hello".to_vec()],
        Box::new(move |res| {
            *write_ok_cb.borrow_mut() = res.is_ok();
        }),
    );

    for _ in 0..200 {
        let _ = epoll.borrow_mut().turn(5);
        if received.borrow().len() >= 5 {
            break;
        }
    }

    assert!(*write_ok.borrow(), "write callback never reported success");
    assert_eq!(&received.borrow()[..], b"hello");

    client.close();
    server.close();
}
