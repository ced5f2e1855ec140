//! The standalone Poseidon daemon: loads a config file, starts the fiber
//! scheduler, timer scheduler, task pool, and network reactor each on
//! their own thread, and (if `network.listen_address` is configured)
//! accepts WebSocket-over-HTTP connections that echo text/binary
//! messages back to the sender.
//!
//! Grounded on `original_source/example/hws_server.cpp`'s
//! `poseidon_module_main`/callback shape for the default echo behaviour,
//! and on the teacher's own `log::Log` implementation
//! (`tarantool/src/log.rs`'s `TarantoolLogger`) for wiring a logger
//! without pulling in a formatting crate the teacher doesn't carry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{Level, LevelFilter, Log, Metadata, Record};

use poseidon::config::{Config, SharedConfig};
use poseidon::http::ServerParser;
use poseidon::process::PidFile;
use poseidon::reactor::{Reactor, ReactorSocket};
use poseidon::signal;
use poseidon::socket::tcp::{TcpAcceptor, TcpSocket};
use poseidon::socket::{SocketDelegate, WriteSink};
use poseidon::task_pool::TaskPool;
use poseidon::timer::TimerScheduler;
use poseidon::util::RingBuffer;
use poseidon::websocket::{CloseStatus, WebSocketHandler, WebSocketSession};
use poseidon::{fiber, http};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(LevelFilter::Info);

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "poseidon.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("failed to load config {config_path}: {e}");
            std::process::exit(1);
        }
    };

    signal::install();
    let _pid_file = config.pid_file.as_ref().map(|path| {
        PidFile::create(path).unwrap_or_else(|e| {
            log::error!("failed to create pid file {}: {e}", path.display());
            std::process::exit(1);
        })
    });

    let shared_config = Arc::new(SharedConfig::new(config));
    let network = shared_config.load().network.clone();

    let (mut fiber_scheduler, fiber_spawner) = fiber::FiberScheduler::new(&shared_config.load().fiber);
    let timer_scheduler = Arc::new(TimerScheduler::new());
    let task_pool = Arc::new(TaskPool::new());
    let reactor = Arc::new(Reactor::new(network.event_buffer_size, network.throttle_size).expect("failed to create reactor"));

    let _task_pool_threads = task_pool.spawn_workers(4, signal::shutdown_requested);

    if let Some(addr) = network.listen_address {
        match start_listener(addr, &reactor, network.http.max_websocket_message_length) {
            Ok(()) => log::info!("listening on {addr}"),
            Err(e) => {
                log::error!("failed to bind {addr}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        log::info!("no network.listen_address configured; running schedulers only");
    }

    let timer_thread = {
        let timer_scheduler = timer_scheduler.clone();
        thread::spawn(move || timer_scheduler.run_forever(signal::shutdown_requested))
    };
    let reactor_thread = {
        let reactor = reactor.clone();
        thread::spawn(move || {
            reactor
                .run_forever(signal::shutdown_requested)
                .unwrap_or_else(|e| log::error!("reactor loop exited with error: {e}"))
        })
    };

    fiber_scheduler.run_forever(signal::shutdown_requested);
    drop(fiber_spawner);

    let _ = timer_thread.join();
    let _ = reactor_thread.join();
    log::info!("poseidon shutting down");
}

fn start_listener(addr: SocketAddr, reactor: &Arc<Reactor>, max_message_length: usize) -> poseidon::Result<()> {
    let reactor_for_factory = reactor.clone();
    let acceptor = TcpAcceptor::bind(addr, reactor_for_factory, move |stream, peer| {
        log::info!("accepted connection from {peer}");
        let handler = Arc::new(EchoHandler::new());
        let session = WebSocketSession::new(handler.clone() as Arc<dyn WebSocketHandler>, max_message_length);
        handler.attach(&session);
        let http_parser = ServerParser::new(SessionRequestHandler(session.clone()));
        let delegate: Arc<dyn SocketDelegate> = Arc::new(HttpSocketDelegate { parser: http_parser });
        let socket = TcpSocket::from_accepted(stream, delegate);
        session.attach(socket.clone() as Arc<dyn WriteSink>);
        Some(socket as Arc<dyn ReactorSocket>)
    })?;
    reactor.insert(&(acceptor as Arc<dyn ReactorSocket>))?;
    Ok(())
}

/// Forwards the HTTP layer's callbacks into a shared [`WebSocketSession`]
/// without requiring `ServerParser` to know about reference counting.
struct SessionRequestHandler(Arc<WebSocketSession>);

impl http::RequestHandler for SessionRequestHandler {
    fn on_headers(&self, request: &http::Request) -> http::BodyAction {
        self.0.on_headers(request)
    }
    fn on_body_chunk(&self, chunk: &[u8]) {
        self.0.on_body_chunk(chunk)
    }
    fn on_request_finished(&self, close_after: bool) {
        self.0.on_request_finished(close_after)
    }
    fn on_upgraded_data(&self, data: &[u8]) {
        self.0.on_upgraded_data(data)
    }
}

struct HttpSocketDelegate {
    parser: ServerParser,
}

impl SocketDelegate for HttpSocketDelegate {
    fn on_receive(&self, buffer: &mut RingBuffer) {
        if let Err(e) = self.parser.feed(buffer) {
            log::debug!("HTTP/WebSocket session error: {e}");
        }
    }
}

/// Echoes TEXT/BINARY messages back to the sender, matching
/// `hws_server.cpp`'s example callback. Holds only a weak back-pointer to
/// its session (spec §9's cyclic-reference rule: the session owns the
/// handler strongly, so the handler must never own the session back).
struct EchoHandler {
    session: Mutex<Option<Weak<WebSocketSession>>>,
}

impl EchoHandler {
    fn new() -> EchoHandler {
        EchoHandler { session: Mutex::new(None) }
    }

    fn attach(&self, session: &Arc<WebSocketSession>) {
        *self.session.lock().unwrap() = Some(Arc::downgrade(session));
    }

    fn session(&self) -> Option<Arc<WebSocketSession>> {
        self.session.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

impl WebSocketHandler for EchoHandler {
    fn on_open(&self) {
        log::info!("WebSocket session established");
    }
    fn on_text(&self, text: &str) {
        log::info!("received TEXT: {text}");
        if let Some(session) = self.session() {
            session.send_text(text);
        }
    }
    fn on_binary(&self, data: &[u8]) {
        log::info!("received BINARY: {} bytes", data.len());
        if let Some(session) = self.session() {
            session.send_binary(data);
        }
    }
    fn on_closed(&self, status: CloseStatus, reason: &str) {
        log::info!("WebSocket session closed: {status:?} {reason}");
    }
}

