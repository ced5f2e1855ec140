//! Sockets: the spec's `(fd, state, read_buffer, write_queue,
//! protocol_state)` state machine, realised per transport.
//!
//! Grounded on `original_source/poseidon/socket/*.cpp` for the state
//! transitions and on `tarantool::network::client::tcp` for the
//! Rust-idiomatic shape (a small `Error` enum, an inner fd guard). Built
//! on `mio::net` rather than raw `libc::socket`/`connect` calls, since
//! `mio` already gives us non-blocking sockets that plug directly into
//! [`crate::reactor::Reactor`] via [`mio::unix::SourceFd`].

pub mod ssl;
pub mod tcp;
pub mod udp;

use std::sync::Mutex;

/// Lifecycle of a socket, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Pending,
    Establishing,
    Established,
    Closing,
    Closed,
}

/// The protocol-level hook a socket drives once bytes arrive or the
/// connection's lifecycle changes. Implementations are the "protocol_state"
/// of spec §3 -- an HTTP parser, a WebSocket session, or a session queue
/// producer pushing raw chunks upward.
///
/// All three methods run under the socket's own lock (spec §4.4 rule 4);
/// they must not block or suspend (spec §5 "a reactor callback never
/// suspends").
pub trait SocketDelegate: Send + Sync {
    fn on_established(&self) {}
    /// Called with the socket's accumulated, not-yet-consumed read buffer.
    /// Implementations drain whatever complete protocol units they can by
    /// calling [`crate::util::RingBuffer::take`]/`drop_front`, leaving any
    /// partial unit in place for the next call.
    fn on_receive(&self, buffer: &mut crate::util::RingBuffer);
    fn on_closed(&self) {}
}

/// A write/close sink a protocol layer can hold onto without caring which
/// transport it rides on (spec §4.4's "protocol_state writes back through
/// the same socket" contract, generalised over TCP/TLS).
pub trait WriteSink: Send + Sync {
    fn write(&self, data: &[u8]);
    fn close(&self);
}

pub(crate) struct StateCell(Mutex<SocketState>);

impl StateCell {
    fn new(initial: SocketState) -> Self {
        StateCell(Mutex::new(initial))
    }

    fn get(&self) -> SocketState {
        *self.0.lock().unwrap()
    }

    fn set(&self, state: SocketState) {
        *self.0.lock().unwrap() = state;
    }
}
