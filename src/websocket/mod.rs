//! WebSocket sessions (RFC 6455 + RFC 7692), built on top of [`crate::http`]
//! for the opening handshake and [`crate::socket`] for the transport.
//!
//! Grounded on `original_source/poseidon/socket/wss_server_session.cpp`'s
//! overall shape: an HTTP session that, once it sees a valid upgrade
//! request, stops feeding the HTTP parser and starts feeding a frame
//! parser instead, dispatching complete messages (after undoing PMCE)
//! to the application and framing outbound messages (after applying it)
//! back onto the same socket.

pub mod frame;
pub mod handshake;
pub mod pmce;

use std::sync::{Arc, Mutex};

use rand::RngCore;

use crate::error::Error;
use crate::http::{BodyAction, Request, RequestHandler};
use crate::socket::{SocketDelegate, WriteSink};
use crate::util::RingBuffer;
use frame::{encode_frame, FrameParser, Opcode, RawFrame};
use pmce::{Deflator, Inflator, PmceParams};

/// The WebSocket close status codes spec §4.7 names. 1005/1006 are
/// synthetic: they describe a closure to the application but are never
/// put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    GoingAway,
    ProtocolError,
    NotAcceptable,
    MessageDataError,
    PolicyViolation,
    MessageTooLarge,
    UnexpectedError,
    TlsError,
    NoStatusReceived,
    AbnormalClosure,
}

impl CloseStatus {
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::GoingAway => 1001,
            CloseStatus::ProtocolError => 1002,
            CloseStatus::NotAcceptable => 1003,
            CloseStatus::MessageDataError => 1007,
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::MessageTooLarge => 1009,
            CloseStatus::UnexpectedError => 1011,
            CloseStatus::TlsError => 1015,
            CloseStatus::NoStatusReceived => 1005,
            CloseStatus::AbnormalClosure => 1006,
        }
    }

    pub fn from_code(code: u16) -> Option<CloseStatus> {
        Some(match code {
            1000 => CloseStatus::Normal,
            1001 => CloseStatus::GoingAway,
            1002 => CloseStatus::ProtocolError,
            1003 => CloseStatus::NotAcceptable,
            1007 => CloseStatus::MessageDataError,
            1008 => CloseStatus::PolicyViolation,
            1009 => CloseStatus::MessageTooLarge,
            1011 => CloseStatus::UnexpectedError,
            1015 => CloseStatus::TlsError,
            _ => return None,
        })
    }

    /// Never sent on the wire; synthesised locally when the peer hung up
    /// without a close frame, or the TCP connection reset outright.
    fn is_synthetic(self) -> bool {
        matches!(self, CloseStatus::NoStatusReceived | CloseStatus::AbnormalClosure)
    }
}

/// The application-facing half of a WebSocket session (spec §4.7's
/// message/close delivery).
pub trait WebSocketHandler: Send + Sync {
    fn on_open(&self) {}
    fn on_text(&self, text: &str);
    fn on_binary(&self, data: &[u8]);
    fn on_closed(&self, status: CloseStatus, reason: &str) {
        let _ = (status, reason);
    }
}

enum Phase {
    AwaitingHandshake,
    Active { compressed_in: Option<Inflator>, compressed_out: Option<Deflator>, pmce_active: bool },
    Closed,
}

/// One WebSocket connection, server-side. Implements [`RequestHandler`]
/// so it can sit behind [`crate::http::ServerParser`] until the upgrade
/// completes, then drives its own frame parser over
/// [`RequestHandler::on_upgraded_data`].
pub struct WebSocketSession {
    handler: Arc<dyn WebSocketHandler>,
    max_message_length: usize,
    socket: Mutex<Option<Arc<dyn WriteSink>>>,
    frames: Mutex<FrameParser>,
    inbound: Mutex<RingBuffer>,
    phase: Mutex<Phase>,
    message_buffer: Mutex<Vec<u8>>,
    message_opcode: Mutex<Opcode>,
    message_compressed: Mutex<bool>,
}

impl WebSocketSession {
    pub fn new(handler: Arc<dyn WebSocketHandler>, max_message_length: usize) -> Arc<WebSocketSession> {
        Arc::new(WebSocketSession {
            handler,
            max_message_length,
            socket: Mutex::new(None),
            frames: Mutex::new(FrameParser::new(true, max_message_length)),
            inbound: Mutex::new(RingBuffer::new()),
            phase: Mutex::new(Phase::AwaitingHandshake),
            message_buffer: Mutex::new(Vec::new()),
            message_opcode: Mutex::new(Opcode::Text),
            message_compressed: Mutex::new(false),
        })
    }

    /// Wires the session to the transport it will write responses and
    /// frames back through. Must be called before the socket is
    /// registered with the reactor (the factory closure that builds both
    /// typically does this in one step).
    pub fn attach(&self, socket: Arc<dyn WriteSink>) {
        *self.socket.lock().unwrap() = Some(socket);
    }

    /// Sends a text message, compressing it first if PMCE was negotiated
    /// and the payload clears the compression threshold.
    pub fn send_text(&self, text: &str) {
        self.send_message(Opcode::Text, text.as_bytes());
    }

    pub fn send_binary(&self, data: &[u8]) {
        self.send_message(Opcode::Binary, data);
    }

    fn send_message(&self, opcode: Opcode, payload: &[u8]) {
        let mut phase = self.phase.lock().unwrap();
        let Phase::Active { compressed_out, .. } = &mut *phase else { return };

        let (rsv1, bytes) = match compressed_out {
            Some(deflator) if payload.len() >= pmce::compression_threshold(deflator.no_context_takeover()) => {
                match deflator.deflate_message(payload) {
                    Ok(compressed) => (true, compressed),
                    Err(_) => (false, payload.to_vec()),
                }
            }
            _ => (false, payload.to_vec()),
        };
        drop(phase);
        self.write_frame(true, rsv1, opcode, &bytes);
    }

    pub fn close(&self, status: CloseStatus, reason: &str) {
        if !status.is_synthetic() {
            let mut payload = status.code().to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            self.write_frame(true, false, Opcode::Close, &payload);
        }
        self.finish(status, reason);
    }

    fn write_frame(&self, fin: bool, rsv1: bool, opcode: Opcode, payload: &[u8]) {
        if let Some(socket) = &*self.socket.lock().unwrap() {
            socket.write(&encode_frame(fin, rsv1, opcode, payload, None));
        }
    }

    fn finish(&self, status: CloseStatus, reason: &str) {
        let mut phase = self.phase.lock().unwrap();
        if matches!(&*phase, Phase::Closed) {
            return;
        }
        *phase = Phase::Closed;
        drop(phase);
        self.handler.on_closed(status, reason);
        if let Some(socket) = &*self.socket.lock().unwrap() {
            socket.close();
        }
    }

    fn dispatch(&self, raw_frame: RawFrame) {
        match raw_frame.header.opcode {
            Opcode::Close => {
                let (status, reason) = parse_close_payload(&raw_frame.payload);
                self.write_frame(true, false, Opcode::Close, &raw_frame.payload);
                self.finish(status, &reason);
            }
            Opcode::Ping => self.write_frame(true, false, Opcode::Pong, &raw_frame.payload),
            Opcode::Pong => {}
            Opcode::Continuation | Opcode::Text | Opcode::Binary => self.on_data_frame(raw_frame),
        }
    }

    fn on_data_frame(&self, raw_frame: RawFrame) {
        let fin = raw_frame.header.fin;
        let opcode = raw_frame.header.opcode;
        let is_start = opcode != Opcode::Continuation;

        if is_start {
            *self.message_opcode.lock().unwrap() = opcode;
            *self.message_compressed.lock().unwrap() = raw_frame.header.rsv1;
        }

        let mut buffer = self.message_buffer.lock().unwrap();
        if is_start {
            buffer.clear();
        }
        buffer.extend_from_slice(&raw_frame.payload);
        if buffer.len() > self.max_message_length {
            drop(buffer);
            self.finish(CloseStatus::MessageTooLarge, "message exceeds max_message_length");
            return;
        }
        if !fin {
            return;
        }
        let data = std::mem::take(&mut *buffer);
        drop(buffer);

        let message_opcode = *self.message_opcode.lock().unwrap();
        let compressed = *self.message_compressed.lock().unwrap();

        let plain = if compressed {
            let mut phase = self.phase.lock().unwrap();
            let Phase::Active { compressed_in, .. } = &mut *phase else { return };
            match compressed_in {
                Some(inflator) => match inflator.inflate_message(&data, self.max_message_length) {
                    Ok(plain) => plain,
                    Err(e) => {
                        drop(phase);
                        self.finish(CloseStatus::MessageDataError, &e.to_string());
                        return;
                    }
                },
                None => data,
            }
        } else {
            data
        };

        match message_opcode {
            Opcode::Text => match std::str::from_utf8(&plain) {
                Ok(text) => self.handler.on_text(text),
                Err(_) => self.finish(CloseStatus::MessageDataError, "invalid UTF-8 in text message"),
            },
            _ => self.handler.on_binary(&plain),
        }
    }

    fn begin_active(&self, pmce: Option<PmceParams>) {
        let pmce_active = pmce.is_some();
        let (compressed_in, compressed_out) = match &pmce {
            Some(params) => (Some(Inflator::new(params, true)), Some(Deflator::new(params, true))),
            None => (None, None),
        };
        self.frames.lock().unwrap().set_pmce_active(pmce_active);
        *self.phase.lock().unwrap() = Phase::Active {
            compressed_in,
            compressed_out,
            pmce_active,
        };
        self.handler.on_open();
    }
}

fn parse_close_payload(payload: &[u8]) -> (CloseStatus, String) {
    if payload.len() < 2 {
        return (CloseStatus::NoStatusReceived, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let status = CloseStatus::from_code(code).unwrap_or(CloseStatus::ProtocolError);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (status, reason)
}

impl RequestHandler for WebSocketSession {
    fn on_headers(&self, request: &Request) -> BodyAction {
        match handshake::accept_server_request(request) {
            Ok(result) => {
                self.write_frame_response(&handshake::build_server_response(&result));
                self.begin_active(result.pmce);
                BodyAction::Upgrade
            }
            Err(e) => {
                log::debug!("rejected WebSocket upgrade: {e}");
                self.write_frame_response("HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n");
                self.finish(CloseStatus::ProtocolError, "invalid upgrade request");
                BodyAction::NoBody
            }
        }
    }

    fn on_body_chunk(&self, _chunk: &[u8]) {}
    fn on_request_finished(&self, _close_after: bool) {}

    fn on_upgraded_data(&self, data: &[u8]) {
        let mut buffer = self.inbound.lock().unwrap();
        buffer.push_slice(data);
        loop {
            let next = self.frames.lock().unwrap().feed(&mut buffer);
            match next {
                Ok(Some(raw_frame)) => self.dispatch(raw_frame),
                Ok(None) => break,
                Err(e) => {
                    let status = match &e {
                        Error::Protocol { status, .. } => *status,
                        _ => CloseStatus::UnexpectedError,
                    };
                    self.finish(status, &e.to_string());
                    break;
                }
            }
        }
    }
}

impl WebSocketSession {
    fn write_frame_response(&self, text: &str) {
        if let Some(socket) = &*self.socket.lock().unwrap() {
            socket.write(text.as_bytes());
        }
    }
}

/// Delegate adapting a raw, non-HTTP socket straight into a
/// [`WebSocketSession`], for protocols that skip the HTTP upgrade dance
/// entirely (used by tests and by pure-WebSocket listeners).
pub struct DirectSocketDelegate {
    session: Arc<WebSocketSession>,
}

impl DirectSocketDelegate {
    pub fn new(session: Arc<WebSocketSession>) -> DirectSocketDelegate {
        DirectSocketDelegate { session }
    }
}

impl SocketDelegate for DirectSocketDelegate {
    fn on_receive(&self, buffer: &mut RingBuffer) {
        let data = buffer.take(buffer.len());
        self.session.on_upgraded_data(&data);
    }

    fn on_closed(&self) {
        self.session.finish(CloseStatus::AbnormalClosure, "connection reset");
    }
}

/// Generates a fresh 16-byte client handshake key via the process RNG.
pub fn random_handshake_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
