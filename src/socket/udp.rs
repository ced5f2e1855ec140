//! UDP sockets.
//!
//! Datagrams have no connection phase and no ordering guarantee, so the
//! spec §3 socket state machine collapses to `established`/`closed`
//! here; there is no `read_buffer` either, since each `recv_from` already
//! yields one complete unit.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use super::{SocketState, StateCell};
use crate::error::{Error, Result};
use crate::reactor::{Desire, ReactorSocket};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Receives each datagram together with its sender's address.
pub trait DatagramDelegate: Send + Sync {
    fn on_datagram(&self, data: &[u8], from: SocketAddr);
    fn on_closed(&self) {}
}

pub struct UdpSocket {
    socket: Mutex<mio::net::UdpSocket>,
    state: StateCell,
    write_queue: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    delegate: Arc<dyn DatagramDelegate>,
}

impl UdpSocket {
    pub fn bind(addr: SocketAddr, delegate: Arc<dyn DatagramDelegate>) -> Result<Arc<UdpSocket>> {
        let socket = mio::net::UdpSocket::bind(addr).map_err(Error::System)?;
        Ok(Arc::new(UdpSocket {
            socket: Mutex::new(socket),
            state: StateCell::new(SocketState::Established),
            write_queue: Mutex::new(Vec::new()),
            delegate,
        }))
    }

    /// Enqueues `data` to `to`, flushing as much of the queue as possible
    /// without blocking.
    pub fn send_to(&self, data: &[u8], to: SocketAddr) {
        self.write_queue.lock().unwrap().push((data.to_vec(), to));
        self.flush_locked();
    }

    fn flush_locked(&self) {
        let socket = self.socket.lock().unwrap();
        let mut queue = self.write_queue.lock().unwrap();
        while let Some((data, to)) = queue.first().cloned() {
            match socket.send_to(&data, to) {
                Ok(_) => {
                    queue.remove(0);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    queue.remove(0);
                }
            }
        }
    }
}

impl ReactorSocket for UdpSocket {
    fn raw_fd(&self) -> RawFd {
        self.socket.lock().unwrap().as_raw_fd()
    }

    fn on_readable(&self) {
        let socket = self.socket.lock().unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => self.delegate.on_datagram(&buf[..n], from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn on_writable(&self) {
        self.flush_locked();
    }

    fn on_closed(&self) {
        self.state.set(SocketState::Closed);
        self.delegate.on_closed();
    }

    fn read_buffered_len(&self) -> usize {
        0
    }

    fn desired_interest(&self) -> Desire {
        Desire {
            read: true,
            write: !self.write_queue.lock().unwrap().is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder(mpsc::Sender<Vec<u8>>);
    impl DatagramDelegate for Recorder {
        fn on_datagram(&self, data: &[u8], _from: SocketAddr) {
            self.0.send(data.to_vec()).unwrap();
        }
    }

    #[test]
    fn roundtrips_a_datagram_through_the_reactor() {
        use crate::reactor::Reactor;

        let reactor = Reactor::new(32, 1 << 20).unwrap();
        let (tx, rx) = mpsc::channel();
        let server = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Recorder(tx))).unwrap();
        let server_addr = server.socket.lock().unwrap().local_addr().unwrap();
        reactor.insert(&(server.clone() as Arc<dyn ReactorSocket>)).unwrap();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", server_addr).unwrap();

        for _ in 0..20 {
            reactor.thread_loop(Some(Duration::from_millis(50))).unwrap();
        }

        assert_eq!(rx.recv_timeout(Duration::from_millis(200)).unwrap(), b"ping");
    }
}
