//! Poseidon: a server-side application host.
//!
//! A single process loads user modules and runs a long-lived, multi-threaded
//! runtime that multiplexes timers, background tasks, network I/O, and
//! cooperative user-space fibers. Four independent schedulers — the
//! [`fiber`] scheduler, the [`timer`] scheduler, the [`task_pool`], and the
//! [`reactor`] — exchange work only through thread-safe handoffs; none holds
//! a lock while invoking user code.
//!
//! See also:
//! - [Fiber scheduling](fiber/index.html)
//! - [Session event queues](session/index.html)
//! - [WebSocket framing and permessage-deflate](websocket/index.html)

pub mod config;
pub mod error;
pub mod fiber;
pub mod http;
pub mod process;
pub mod reactor;
pub mod session;
pub mod signal;
pub mod socket;
pub mod task_pool;
pub mod time;
pub mod timer;
pub mod util;
pub mod websocket;

pub use error::{Error, Result};
