//! TCP data sockets and listening sockets.
//!
//! Grounded on `original_source/poseidon/socket/tcp_acceptor.cpp` (the
//! accept-until-`EAGAIN` loop, errors on an individual `accept()` are
//! logged and ignored rather than propagated) and the general socket
//! lifecycle of `original_source/poseidon/socket/*`.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use super::{SocketDelegate, SocketState, StateCell, WriteSink};
use crate::error::{Error, Result};
use crate::reactor::{Desire, Reactor, ReactorSocket};
use crate::util::RingBuffer;

const READ_CHUNK: usize = 16 * 1024;

/// A connected TCP stream driven by the [`Reactor`].
pub struct TcpSocket {
    stream: Mutex<mio::net::TcpStream>,
    state: StateCell,
    read_buffer: Mutex<RingBuffer>,
    write_queue: Mutex<RingBuffer>,
    delegate: Arc<dyn SocketDelegate>,
}

impl TcpSocket {
    /// Begins a non-blocking connect. The socket starts in `establishing`;
    /// [`ReactorSocket::on_writable`] completes the handshake once the fd
    /// reports writable and `SO_ERROR` is clear.
    pub fn connect(addr: SocketAddr, delegate: Arc<dyn SocketDelegate>) -> Result<Arc<TcpSocket>> {
        let stream = mio::net::TcpStream::connect(addr).map_err(Error::System)?;
        Ok(Arc::new(TcpSocket {
            stream: Mutex::new(stream),
            state: StateCell::new(SocketState::Establishing),
            read_buffer: Mutex::new(RingBuffer::new()),
            write_queue: Mutex::new(RingBuffer::new()),
            delegate,
        }))
    }

    /// Wraps an already-connected stream, e.g. one handed out by
    /// [`TcpAcceptor`]. Starts `established` immediately: `accept()` only
    /// ever returns fully formed connections.
    pub fn from_accepted(stream: mio::net::TcpStream, delegate: Arc<dyn SocketDelegate>) -> Arc<TcpSocket> {
        Arc::new(TcpSocket {
            stream: Mutex::new(stream),
            state: StateCell::new(SocketState::Established),
            read_buffer: Mutex::new(RingBuffer::new()),
            write_queue: Mutex::new(RingBuffer::new()),
            delegate,
        })
    }

    pub fn state(&self) -> SocketState {
        self.state.get()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.lock().unwrap().peer_addr()
    }

    /// Enqueues `data` for writing, flushing as much as can go immediately
    /// without blocking.
    pub fn write(&self, data: &[u8]) {
        self.write_queue.lock().unwrap().push_slice(data);
        self.flush_locked(&mut self.stream.lock().unwrap());
    }

    /// Half-closes for writing and marks the socket for closure once the
    /// write queue drains. The reactor observes hang-up / drained-queue and
    /// finishes the transition to `closed`.
    pub fn close(&self) {
        self.state.set(SocketState::Closing);
    }

    fn flush_locked(&self, stream: &mut mio::net::TcpStream) {
        if self.state.get() == SocketState::Establishing {
            return;
        }
        let mut queue = self.write_queue.lock().unwrap();
        loop {
            let (a, b) = queue.as_contiguous_slices();
            if a.is_empty() {
                break;
            }
            match stream.write(a) {
                Ok(0) => break,
                Ok(n) => queue.drop_front(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    drop(queue);
                    self.state.set(SocketState::Closing);
                    return;
                }
            }
            let _ = b;
        }
    }
}

impl ReactorSocket for TcpSocket {
    fn raw_fd(&self) -> RawFd {
        self.stream.lock().unwrap().as_raw_fd()
    }

    fn on_readable(&self) {
        if self.state.get() == SocketState::Establishing {
            return;
        }
        let mut stream = self.stream.lock().unwrap();
        let mut buf = [0u8; READ_CHUNK];
        let mut any = false;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    drop(stream);
                    self.on_closed();
                    return;
                }
                Ok(n) => {
                    self.read_buffer.lock().unwrap().push_slice(&buf[..n]);
                    any = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    drop(stream);
                    self.on_closed();
                    return;
                }
            }
        }
        drop(stream);
        if any {
            let mut buffer = self.read_buffer.lock().unwrap();
            self.delegate.on_receive(&mut buffer);
        }
    }

    fn on_writable(&self) {
        let mut stream = self.stream.lock().unwrap();
        if self.state.get() == SocketState::Establishing {
            match stream.take_error() {
                Ok(None) => {
                    self.state.set(SocketState::Established);
                    drop(stream);
                    self.delegate.on_established();
                    return;
                }
                _ => {
                    drop(stream);
                    self.state.set(SocketState::Closing);
                    self.on_closed();
                    return;
                }
            }
        }
        self.flush_locked(&mut stream);
    }

    fn on_closed(&self) {
        self.state.set(SocketState::Closed);
        self.delegate.on_closed();
    }

    fn read_buffered_len(&self) -> usize {
        self.read_buffer.lock().unwrap().len()
    }

    fn desired_interest(&self) -> Desire {
        match self.state.get() {
            SocketState::Establishing => Desire::BOTH,
            SocketState::Closed => Desire { read: false, write: false },
            _ => Desire {
                read: true,
                write: !self.write_queue.lock().unwrap().is_empty(),
            },
        }
    }
}

impl WriteSink for TcpSocket {
    fn write(&self, data: &[u8]) {
        TcpSocket::write(self, data)
    }
    fn close(&self) {
        TcpSocket::close(self)
    }
}

/// Accepts inbound TCP connections, handing each accepted stream to a
/// user-supplied factory (mirrors `TCP_Acceptor::do_accept_socket_opt`'s
/// "return null to discard" contract).
pub struct TcpAcceptor {
    listener: Mutex<mio::net::TcpListener>,
    reactor: Arc<Reactor>,
    factory: Box<dyn Fn(mio::net::TcpStream, SocketAddr) -> Option<Arc<dyn ReactorSocket>> + Send + Sync>,
}

impl TcpAcceptor {
    pub fn bind(
        addr: SocketAddr,
        reactor: Arc<Reactor>,
        factory: impl Fn(mio::net::TcpStream, SocketAddr) -> Option<Arc<dyn ReactorSocket>> + Send + Sync + 'static,
    ) -> Result<Arc<TcpAcceptor>> {
        let listener = mio::net::TcpListener::bind(addr).map_err(Error::System)?;
        log::info!("TCP acceptor listening on {addr}");
        Ok(Arc::new(TcpAcceptor {
            listener: Mutex::new(listener),
            reactor,
            factory: Box::new(factory),
        }))
    }
}

impl TcpAcceptor {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.lock().unwrap().local_addr()
    }
}

impl ReactorSocket for TcpAcceptor {
    fn raw_fd(&self) -> RawFd {
        self.listener.lock().unwrap().as_raw_fd()
    }

    fn on_readable(&self) {
        let listener = self.listener.lock().unwrap();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    match (self.factory)(stream, peer) {
                        Some(socket) => {
                            log::info!("accepted connection from {peer}");
                            if let Err(e) = self.reactor.insert(&socket) {
                                log::error!("failed to register accepted socket: {e}");
                            }
                        }
                        None => continue,
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // For accept sockets, individual errors are ignored.
                    log::debug!("accept() error: {e}");
                    continue;
                }
            }
        }
    }

    fn on_writable(&self) {}

    fn on_closed(&self) {
        log::info!("TCP acceptor stopped listening");
    }

    fn read_buffered_len(&self) -> usize {
        0
    }

    fn desired_interest(&self) -> Desire {
        Desire::READ_ONLY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo {
        received: Mutex<Vec<u8>>,
        count: AtomicUsize,
    }

    impl SocketDelegate for Echo {
        fn on_receive(&self, buffer: &mut RingBuffer) {
            let data = buffer.take(buffer.len());
            self.received.lock().unwrap().extend_from_slice(&data);
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn accepted_socket_starts_established_and_receives() {
        let reactor = Arc::new(Reactor::new(32, 1 << 20).unwrap());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let echo = Arc::new(Echo {
            received: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let echo_for_factory = echo.clone();
        let acceptor = TcpAcceptor::bind(addr, reactor.clone(), move |stream, _peer| {
            Some(TcpSocket::from_accepted(stream, echo_for_factory.clone()) as Arc<dyn ReactorSocket>)
        })
        .unwrap();
        let bound_addr = acceptor.listener.lock().unwrap().local_addr().unwrap();
        reactor.insert(&(acceptor.clone() as Arc<dyn ReactorSocket>)).unwrap();

        let mut client = std::net::TcpStream::connect(bound_addr).unwrap();
        client.write_all(b"hello").unwrap();

        for _ in 0..20 {
            reactor.thread_loop(Some(Duration::from_millis(50))).unwrap();
        }

        assert_eq!(&*echo.received.lock().unwrap(), b"hello");
    }
}
