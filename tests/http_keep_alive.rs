//! Two pipelined HTTP/1.1 requests fed to one [`ServerParser`], confirming
//! the keep-alive request/response cycle spec.md §4.6 describes: the
//! parser returns to `Headers` mode after a non-closing request finishes,
//! ready for the next one on the same connection.

use std::sync::mpsc;

use poseidon::http::{BodyAction, Request, RequestHandler, ServerParser};
use poseidon::util::RingBuffer;

struct Recording {
    paths: mpsc::Sender<String>,
    finished: mpsc::Sender<bool>,
}

impl RequestHandler for Recording {
    fn on_headers(&self, request: &Request) -> BodyAction {
        self.paths.send(request.path.clone()).unwrap();
        BodyAction::NoBody
    }
    fn on_body_chunk(&self, _chunk: &[u8]) {}
    fn on_request_finished(&self, close_after: bool) {
        self.finished.send(close_after).unwrap();
    }
    fn on_upgraded_data(&self, _data: &[u8]) {}
}

#[test]
fn two_requests_on_one_connection_both_complete() {
    let (ptx, prx) = mpsc::channel();
    let (ftx, frx) = mpsc::channel();
    let parser = ServerParser::new(Recording { paths: ptx, finished: ftx });

    let mut buffer = RingBuffer::new();
    buffer.push_slice(b"GET /first HTTP/1.1\r\nHost: example\r\n\r\n");
    parser.feed(&mut buffer).unwrap();

    assert_eq!(prx.recv().unwrap(), "/first");
    assert_eq!(frx.recv().unwrap(), false);

    buffer.push_slice(b"GET /second HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n");
    parser.feed(&mut buffer).unwrap();

    assert_eq!(prx.recv().unwrap(), "/second");
    assert_eq!(frx.recv().unwrap(), true);
}
