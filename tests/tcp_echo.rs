//! End-to-end TCP echo over a real loopback socket: a [`Reactor`] driving
//! a [`TcpAcceptor`] whose factory wires each accepted stream straight
//! back to the client via a trivial echoing [`SocketDelegate`].

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use poseidon::reactor::{Reactor, ReactorSocket};
use poseidon::socket::tcp::{TcpAcceptor, TcpSocket};
use poseidon::socket::SocketDelegate;
use poseidon::util::RingBuffer;

struct EchoBack(Mutex<Option<Arc<TcpSocket>>>);

impl SocketDelegate for EchoBack {
    fn on_receive(&self, buffer: &mut RingBuffer) {
        let data = buffer.take(buffer.len());
        if let Some(socket) = &*self.0.lock().unwrap() {
            socket.write(&data);
        }
    }
}

#[test]
fn tcp_echo_round_trip() {
    let reactor = Arc::new(Reactor::new(32, 1 << 20).unwrap());
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let reactor_for_factory = reactor.clone();
    let acceptor = TcpAcceptor::bind(addr, reactor_for_factory, move |stream, _peer| {
        let delegate = Arc::new(EchoBack(Mutex::new(None)));
        let socket = TcpSocket::from_accepted(stream, delegate.clone());
        *delegate.0.lock().unwrap() = Some(socket.clone());
        Some(socket as Arc<dyn ReactorSocket>)
    })
    .unwrap();

    let bound_addr = acceptor.local_addr().unwrap();
    reactor.insert(&(acceptor as Arc<dyn ReactorSocket>)).unwrap();

    let mut client = std::net::TcpStream::connect(bound_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(b"hello, poseidon").unwrap();

    for _ in 0..50 {
        reactor.thread_loop(Some(Duration::from_millis(50))).unwrap();
    }

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello, poseidon");
}
