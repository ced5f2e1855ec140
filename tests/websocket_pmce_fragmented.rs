//! A client opens a WebSocket connection offering `permessage-deflate`,
//! then sends one TEXT message compressed and split across two frames.
//! Exercises the full handshake-negotiate-inflate path together, which
//! none of `websocket`'s own unit tests do in one pass (those cover
//! fragmentation and PMCE separately, uncompressed).

use std::sync::mpsc;
use std::sync::{Arc, Mutex as StdMutex};

use poseidon::http::{BodyAction, RequestHandler};
use poseidon::socket::WriteSink;
use poseidon::websocket::frame::{encode_frame, Opcode};
use poseidon::websocket::pmce::{Deflator, PmceParams};
use poseidon::websocket::{CloseStatus, WebSocketHandler, WebSocketSession};

struct Recorder {
    texts: mpsc::Sender<String>,
}

impl WebSocketHandler for Recorder {
    fn on_text(&self, text: &str) {
        self.texts.send(text.to_string()).unwrap();
    }
    fn on_binary(&self, _data: &[u8]) {}
    fn on_closed(&self, _status: CloseStatus, _reason: &str) {}
}

struct Capture(StdMutex<Vec<u8>>);

impl WriteSink for Capture {
    fn write(&self, data: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(data);
    }
    fn close(&self) {}
}

fn handshake_request_with_pmce() -> poseidon::http::Request {
    poseidon::http::Request {
        method: "GET".into(),
        path: "/ws".into(),
        version: 1,
        headers: vec![
            ("Upgrade".into(), "websocket".into()),
            ("Connection".into(), "Upgrade".into()),
            ("Sec-WebSocket-Version".into(), "13".into()),
            ("Sec-WebSocket-Key".into(), "dGhlIHNhbXBsZSBub25jZQ==".into()),
            ("Sec-WebSocket-Extensions".into(), "permessage-deflate".into()),
        ],
    }
}

#[test]
fn fragmented_compressed_text_message_round_trips() {
    let (ttx, trx) = mpsc::channel();
    let session = WebSocketSession::new(Arc::new(Recorder { texts: ttx }), 1 << 20);
    let capture = Arc::new(Capture(StdMutex::new(Vec::new())));
    session.attach(capture.clone());

    let action = session.on_headers(&handshake_request_with_pmce());
    assert!(matches!(action, BodyAction::Upgrade));
    let response = String::from_utf8_lossy(&capture.0.lock().unwrap()).into_owned();
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains("permessage-deflate"));

    let message = b"the quick brown fox jumps over the lazy dog, repeated for compressibility, repeated again";
    let mut deflator = Deflator::new(&PmceParams::default(), false);
    let compressed = deflator.deflate_message(message).unwrap();

    // Split the compressed payload across two frames: first carries RSV1
    // (the message is compressed) and fin=false; the continuation frame
    // carries the rest with fin=true and no RSV1 of its own.
    let split = compressed.len() / 2;
    let (first_half, second_half) = compressed.split_at(split.max(1));

    let first_frame = encode_frame(false, true, Opcode::Text, first_half, Some([1, 2, 3, 4]));
    let second_frame = encode_frame(true, false, Opcode::Continuation, second_half, Some([5, 6, 7, 8]));

    session.on_upgraded_data(&first_frame);
    session.on_upgraded_data(&second_frame);

    let text = trx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert_eq!(text.as_bytes(), message);
}
