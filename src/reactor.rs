//! The network reactor: one `epoll` wait loop multiplexing every socket
//! in the process.
//!
//! Grounded on `mio::{Poll, Events, Token, Interest}` the way the pack's
//! `int08h-roughenough` and `r3bl-open-core` examples use it, and on
//! `original_source/poseidon/static/network_driver.hpp`'s weak slot-table
//! shape (spec §4.4): sockets are registered by raw fd via
//! [`mio::unix::SourceFd`] and held only weakly, so the reactor never
//! keeps a socket alive past its owner's last strong reference.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};

/// Which direction(s) a socket currently wants polled. SSL sockets flip
/// this when OpenSSL reports `want_read`/`want_write` against the grain
/// of the application-level operation in progress (spec §4.4 "SSL
/// specifics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desire {
    pub read: bool,
    pub write: bool,
}

impl Desire {
    pub const BOTH: Desire = Desire { read: true, write: true };
    pub const READ_ONLY: Desire = Desire { read: true, write: false };

    fn interest(self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// A socket registerable with the [`Reactor`]. Implementations are
/// expected to hold their own lock internally (spec §5 "Socket writes
/// are serialised by a per-socket write mutex") -- the reactor never
/// holds any lock of its own while calling these.
pub trait ReactorSocket: Send + Sync {
    fn raw_fd(&self) -> RawFd;
    fn on_readable(&self);
    fn on_writable(&self);
    fn on_closed(&self);
    /// Bytes currently buffered and not yet consumed by the session.
    /// Once this exceeds the configured `throttle_size`, the reactor
    /// disarms read interest until it drops back below the threshold.
    fn read_buffered_len(&self) -> usize;
    /// Which directions the reactor should currently poll for. Re-read
    /// on every iteration the socket is touched, so an SSL socket can
    /// invert it on the fly.
    fn desired_interest(&self) -> Desire;
}

struct Slot {
    socket: Weak<dyn ReactorSocket>,
    throttled: bool,
}

/// The process-wide `epoll` wait loop.
pub struct Reactor {
    poll: Mutex<Poll>,
    slots: Mutex<HashMap<Token, Slot>>,
    next_token: AtomicUsize,
    event_buffer_size: usize,
    throttle_size: usize,
}

impl Reactor {
    pub fn new(event_buffer_size: usize, throttle_size: usize) -> Result<Reactor> {
        let poll = Poll::new().map_err(Error::System)?;
        Ok(Reactor {
            poll: Mutex::new(poll),
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            event_buffer_size,
            throttle_size,
        })
    }

    /// Weakly registers `socket` for readiness events. Thread-safe.
    pub fn insert(&self, socket: &Arc<dyn ReactorSocket>) -> Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let interest = socket.desired_interest().interest().unwrap_or(Interest::READABLE);
        let fd = socket.raw_fd();
        self.poll
            .lock()
            .unwrap()
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(Error::System)?;
        self.slots.lock().unwrap().insert(
            token,
            Slot {
                socket: Arc::downgrade(socket),
                throttled: false,
            },
        );
        Ok(token)
    }

    fn deregister(&self, fd: RawFd) {
        let _ = self.poll.lock().unwrap().registry().deregister(&mut SourceFd(&fd));
    }

    fn rearm(&self, token: Token, socket: &Arc<dyn ReactorSocket>, throttled: bool) {
        let mut desire = socket.desired_interest();
        if throttled {
            desire.read = false;
        }
        let fd = socket.raw_fd();
        if let Some(interest) = desire.interest() {
            let _ = self
                .poll
                .lock()
                .unwrap()
                .registry()
                .reregister(&mut SourceFd(&fd), token, interest);
        } else {
            self.deregister(fd);
        }
    }

    /// One reactor iteration: waits up to `event_buffer_size` events, no
    /// longer than `timeout`, then dispatches each.
    pub fn thread_loop(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = Events::with_capacity(self.event_buffer_size);
        {
            let mut poll = self.poll.lock().unwrap();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
                Err(e) => return Err(Error::System(e)),
            }
        }

        for event in events.iter() {
            let token = event.token();
            let socket = {
                let mut slots = self.slots.lock().unwrap();
                match slots.get(&token).and_then(|s| s.socket.upgrade()) {
                    Some(s) => s,
                    None => {
                        slots.remove(&token);
                        continue;
                    }
                }
            };

            if event.is_error() || event.is_read_closed() && event.is_write_closed() {
                socket.on_closed();
                self.deregister(socket.raw_fd());
                self.slots.lock().unwrap().remove(&token);
                continue;
            }

            if event.is_readable() {
                socket.on_readable();
            }
            if event.is_writable() {
                socket.on_writable();
            }

            let throttled = socket.read_buffered_len() >= self.throttle_size;
            {
                let mut slots = self.slots.lock().unwrap();
                if let Some(slot) = slots.get_mut(&token) {
                    if slot.throttled != throttled {
                        slot.throttled = throttled;
                        self.rearm(token, &socket, throttled);
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs [`thread_loop`](Self::thread_loop) until `shutdown` returns
    /// true, waking at least every 200ms to re-check it.
    pub fn run_forever(&self, mut shutdown: impl FnMut() -> bool) -> Result<()> {
        while !shutdown() {
            self.thread_loop(Some(Duration::from_millis(200)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct EchoSocket {
        stream: StdMutex<TcpStream>,
        got_readable: AtomicBool,
    }

    impl ReactorSocket for EchoSocket {
        fn raw_fd(&self) -> RawFd {
            self.stream.lock().unwrap().as_raw_fd()
        }
        fn on_readable(&self) {
            let mut buf = [0u8; 64];
            let mut stream = self.stream.lock().unwrap();
            if let Ok(n) = stream.read(&mut buf) {
                if n > 0 {
                    self.got_readable.store(true, Ordering::SeqCst);
                    let _ = stream.write_all(&buf[..n]);
                }
            }
        }
        fn on_writable(&self) {}
        fn on_closed(&self) {}
        fn read_buffered_len(&self) -> usize {
            0
        }
        fn desired_interest(&self) -> Desire {
            Desire::BOTH
        }
    }

    #[test]
    fn dispatches_readable_event() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let reactor = Reactor::new(32, 1 << 20).unwrap();
        let socket: Arc<dyn ReactorSocket> = Arc::new(EchoSocket {
            stream: StdMutex::new(server),
            got_readable: AtomicBool::new(false),
        });
        reactor.insert(&socket).unwrap();

        let mut client = client;
        client.write_all(b"ping").unwrap();

        for _ in 0..20 {
            reactor.thread_loop(Some(Duration::from_millis(50))).unwrap();
        }

        let mut buf = [0u8; 64];
        client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
