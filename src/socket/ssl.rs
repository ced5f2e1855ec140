//! TLS sockets.
//!
//! Grounded on `original_source/poseidon/socket/ssl_ptr.hpp` /
//! `ssl_ctx_ptr.hpp`'s intent (an owned, ref-counted `SSL`/`SSL_CTX`) --
//! the `openssl` crate's [`SslStream`]/[`SslAcceptor`] already give us
//! that RAII wrapper, so there is nothing to reimplement there. What
//! does need reproducing is spec §4.4's "SSL specifics": OpenSSL's
//! want-read/want-write is inverted interest relative to the application
//! operation in progress, tracked here as a live [`Desire`] updated on
//! every I/O attempt.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use openssl::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, SslAcceptor, SslStream};

use super::{SocketDelegate, SocketState, StateCell, WriteSink};
use crate::error::{Error, Result};
use crate::reactor::{Desire, ReactorSocket};
use crate::util::RingBuffer;

const READ_CHUNK: usize = 16 * 1024;

enum Inner {
    Handshaking(MidHandshakeSslStream<mio::net::TcpStream>),
    Ready(SslStream<mio::net::TcpStream>),
    /// Only observed transiently inside `drive`, between taking the
    /// handshake state by value and installing its successor.
    Empty,
}

/// A TLS-wrapped TCP socket, server-side.
pub struct SslSocket {
    inner: Mutex<Inner>,
    state: StateCell,
    desire: Mutex<Desire>,
    read_buffer: Mutex<RingBuffer>,
    write_queue: Mutex<RingBuffer>,
    delegate: Arc<dyn SocketDelegate>,
}

impl SslSocket {
    /// Starts a server-side handshake on an already-accepted stream.
    pub fn accept(
        stream: mio::net::TcpStream,
        acceptor: &SslAcceptor,
        delegate: Arc<dyn SocketDelegate>,
    ) -> Result<Arc<SslSocket>> {
        let (inner, state) = match acceptor.accept(stream) {
            Ok(s) => (Inner::Ready(s), SocketState::Established),
            Err(HandshakeError::WouldBlock(mid)) => (Inner::Handshaking(mid), SocketState::Establishing),
            Err(e) => return Err(Error::Resource(format!("TLS accept failed: {e}"))),
        };
        Ok(Arc::new(SslSocket {
            inner: Mutex::new(inner),
            state: StateCell::new(state),
            desire: Mutex::new(Desire::BOTH),
            read_buffer: Mutex::new(RingBuffer::new()),
            write_queue: Mutex::new(RingBuffer::new()),
            delegate,
        }))
    }

    pub fn state(&self) -> SocketState {
        self.state.get()
    }

    pub fn write(&self, data: &[u8]) {
        self.write_queue.lock().unwrap().push_slice(data);
        self.drive(false);
    }

    pub fn close(&self) {
        self.state.set(SocketState::Closing);
    }

    fn raw_fd_of(inner: &Inner) -> RawFd {
        match inner {
            Inner::Handshaking(mid) => mid.get_ref().as_raw_fd(),
            Inner::Ready(s) => s.get_ref().as_raw_fd(),
            Inner::Empty => -1,
        }
    }

    /// Advances an in-progress handshake, or (once established) flushes
    /// the write queue and, on a readable-triggered call, drains the
    /// socket until `WANT_READ`. Updates `desire` from whichever
    /// direction OpenSSL actually asked for next, inverted relative to
    /// the operation that hit it (spec §4.4 "SSL specifics").
    fn drive(&self, is_read: bool) {
        let mut inner = self.inner.lock().unwrap();

        if matches!(&*inner, Inner::Handshaking(_)) {
            let mid = match std::mem::replace(&mut *inner, Inner::Empty) {
                Inner::Handshaking(m) => m,
                _ => unreachable!(),
            };
            match mid.handshake() {
                Ok(s) => {
                    *inner = Inner::Ready(s);
                    self.state.set(SocketState::Established);
                    *self.desire.lock().unwrap() = Desire::BOTH;
                    drop(inner);
                    self.delegate.on_established();
                    return;
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    let want_write = mid.error().code() == ErrorCode::WANT_WRITE;
                    *self.desire.lock().unwrap() = Desire {
                        read: !want_write,
                        write: want_write,
                    };
                    *inner = Inner::Handshaking(mid);
                    return;
                }
                Err(e) => {
                    log::debug!("TLS handshake failed: {e}");
                    drop(inner);
                    self.on_closed();
                    return;
                }
            }
        }

        let stream = match &mut *inner {
            Inner::Ready(s) => s,
            _ => return,
        };

        {
            let mut queue = self.write_queue.lock().unwrap();
            loop {
                let (a, _) = queue.as_contiguous_slices();
                if a.is_empty() {
                    break;
                }
                match stream.ssl_write(a) {
                    Ok(n) => queue.drop_front(n),
                    Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => break,
                    Err(_) => {
                        drop(queue);
                        drop(inner);
                        self.on_closed();
                        return;
                    }
                }
            }
        }

        if !is_read {
            *self.desire.lock().unwrap() = Desire {
                read: true,
                write: !self.write_queue.lock().unwrap().is_empty(),
            };
            return;
        }

        let mut buf = [0u8; READ_CHUNK];
        let mut any = false;
        loop {
            match stream.ssl_read(&mut buf) {
                Ok(0) => {
                    drop(inner);
                    self.on_closed();
                    return;
                }
                Ok(n) => {
                    self.read_buffer.lock().unwrap().push_slice(&buf[..n]);
                    any = true;
                }
                Err(e) if e.code() == ErrorCode::WANT_READ => {
                    *self.desire.lock().unwrap() = Desire::READ_ONLY;
                    break;
                }
                Err(e) if e.code() == ErrorCode::WANT_WRITE => {
                    *self.desire.lock().unwrap() = Desire { read: false, write: true };
                    break;
                }
                Err(_) => {
                    drop(inner);
                    self.on_closed();
                    return;
                }
            }
        }
        drop(inner);
        if any {
            let mut buffer = self.read_buffer.lock().unwrap();
            self.delegate.on_receive(&mut buffer);
        }
    }
}

impl WriteSink for SslSocket {
    fn write(&self, data: &[u8]) {
        SslSocket::write(self, data)
    }
    fn close(&self) {
        SslSocket::close(self)
    }
}

impl ReactorSocket for SslSocket {
    fn raw_fd(&self) -> RawFd {
        Self::raw_fd_of(&self.inner.lock().unwrap())
    }

    fn on_readable(&self) {
        self.drive(true);
    }

    fn on_writable(&self) {
        self.drive(false);
    }

    fn on_closed(&self) {
        self.state.set(SocketState::Closed);
        self.delegate.on_closed();
    }

    fn read_buffered_len(&self) -> usize {
        self.read_buffer.lock().unwrap().len()
    }

    fn desired_interest(&self) -> Desire {
        if self.state.get() == SocketState::Closed {
            return Desire { read: false, write: false };
        }
        *self.desire.lock().unwrap()
    }
}
