//! Session event queues: the bridge between reactor callbacks (producer)
//! and a single draining fiber (consumer), per session.
//!
//! Grounded on spec §4.5 and its §9 re-architecting note on the cyclic
//! reference between a session and its queue: here the
//! [`SessionTable`] owns the [`SessionQueue`], which owns the session
//! strongly; the socket carries only a [`SessionKey`], never a strong
//! back-pointer, so there is no cycle to break.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::fiber::FiberSpawner;

/// Opaque, stable identity for a session's table entry. Sockets keep one
/// of these instead of an `Arc<Session>` to avoid the ownership cycle
/// spec §9 calls out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(u64);

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// One occurrence delivered to a session's user callback, in arrival
/// order.
pub enum Event<M> {
    Open,
    Message(M),
    Error(crate::error::Error),
    Close,
}

impl<M> Event<M> {
    /// The terminal event (close or error) is always the last one ever
    /// enqueued for a session (spec §3 "Session Event Queue" invariant).
    fn is_terminal(&self) -> bool {
        matches!(self, Event::Error(_) | Event::Close)
    }
}

/// The user callback for a session, invoked once per event by whichever
/// fiber is currently draining the queue. Registered once, at session
/// creation -- never per-event -- so every event for a session reaches
/// the same callback in order.
pub trait Handler<S, M>: Send + Sync {
    fn on_event(&self, session: &Arc<S>, event: Event<M>);
}

impl<S, M, F: Fn(&Arc<S>, Event<M>) + Send + Sync> Handler<S, M> for F {
    fn on_event(&self, session: &Arc<S>, event: Event<M>) {
        self(session, event)
    }
}

struct Inner<S, M> {
    events: VecDeque<Event<M>>,
    fiber_active: bool,
    session: Arc<S>,
}

/// A per-session FIFO of [`Event`]s, drained by at most one fiber at a
/// time.
pub struct SessionQueue<S, M> {
    inner: Mutex<Inner<S, M>>,
    handler: Arc<dyn Handler<S, M>>,
}

impl<S: Send + Sync + 'static, M: Send + 'static> SessionQueue<S, M> {
    fn new(session: Arc<S>, handler: Arc<dyn Handler<S, M>>) -> Arc<SessionQueue<S, M>> {
        Arc::new(SessionQueue {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                fiber_active: false,
                session,
            }),
            handler,
        })
    }

    /// Producer rule (spec §4.5, network thread): lock, launch a
    /// draining fiber if none is active, push, unlock.
    pub fn push(
        self: &Arc<Self>,
        event: Event<M>,
        spawner: &FiberSpawner,
        table: &SessionTable<S, M>,
        key: SessionKey,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let needs_fiber = !inner.fiber_active;
        if needs_fiber {
            inner.fiber_active = true;
        }
        inner.events.push_back(event);
        drop(inner);

        if needs_fiber {
            let queue = self.clone();
            let table = table.clone();
            spawner.launch(move || queue.drain_loop(key, &table));
        }
    }

    /// Consumer rule (spec §4.5, fiber): loop popping one event at a
    /// time, invoking the session's handler, until the queue runs dry.
    fn drain_loop(self: Arc<Self>, key: SessionKey, table: &SessionTable<S, M>) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            let event = match inner.events.pop_front() {
                Some(e) => e,
                None => {
                    inner.fiber_active = false;
                    return;
                }
            };
            let terminal = event.is_terminal();
            if terminal {
                table.remove(key);
            }
            let session = inner.session.clone();
            drop(inner);

            self.handler.on_event(&session, event);

            if terminal {
                return;
            }
        }
    }
}

/// Maps a session's stable [`SessionKey`] to its queue. The table is the
/// sole strong owner of the queue (which strongly owns the session).
#[derive(Clone)]
pub struct SessionTable<S, M> {
    entries: Arc<Mutex<HashMap<SessionKey, Arc<SessionQueue<S, M>>>>>,
}

impl<S: Send + Sync + 'static, M: Send + 'static> SessionTable<S, M> {
    pub fn new() -> SessionTable<S, M> {
        SessionTable {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a new session with its event handler, returning its key
    /// and queue.
    pub fn insert(
        &self,
        session: Arc<S>,
        handler: Arc<dyn Handler<S, M>>,
    ) -> (SessionKey, Arc<SessionQueue<S, M>>) {
        let key = SessionKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed));
        let queue = SessionQueue::new(session, handler);
        self.entries.lock().unwrap().insert(key, queue.clone());
        (key, queue)
    }

    pub fn get(&self, key: SessionKey) -> Option<Arc<SessionQueue<S, M>>> {
        self.entries.lock().unwrap().get(&key).cloned()
    }

    /// Removes a session's entry. Called by the draining fiber exactly
    /// once, the moment it pops the terminal event -- never by the
    /// reactor thread directly.
    pub fn remove(&self, key: SessionKey) {
        self.entries.lock().unwrap().remove(&key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Send + Sync + 'static, M: Send + 'static> Default for SessionTable<S, M> {
    fn default() -> Self {
        Self::new()
    }
}
