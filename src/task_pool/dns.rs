//! Parallel DNS resolution, offloaded onto a [`TaskPool`](super::TaskPool).
//!
//! Grounded on `original_source/poseidon/fiber/dns_future.cpp`: there, a
//! `DNS_Future` is simultaneously an `Abstract_Async_Task` (so the task
//! pool can execute it) and an `Abstract_Future` (so a fiber can await
//! it). We keep the same two-role split but as composition rather than
//! multiple inheritance: [`DnsTask`] implements [`Task`] and, on
//! execution, resolves a [`fiber::future::Resolver`] that was handed to
//! it up front.

use std::net::{SocketAddr, ToSocketAddrs};

use super::Task;
use crate::fiber::future::{self, Future, FutureFailure};
use crate::time::SteadyTime;

struct DnsTask {
    host: String,
    port: u16,
    resolver: std::sync::Mutex<Option<future::Resolver<Vec<SocketAddr>>>>,
}

impl Task for DnsTask {
    fn execute(&self) {
        let resolver = match self.resolver.lock().unwrap().take() {
            Some(r) => r,
            None => return,
        };
        // Blocking: this runs on a task-pool worker thread, never on a
        // fiber scheduler thread (spec §9 "No blocking syscalls on
        // scheduler threads").
        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(iter) => {
                let addrs: Vec<SocketAddr> = iter.collect();
                resolver.resolve_success(addrs, SteadyTime::now());
            }
            Err(e) => {
                resolver.resolve_failure(
                    FutureFailure(format!("DNS query failed for `{}`: {e}", self.host)),
                    SteadyTime::now(),
                );
            }
        }
    }
}

/// Resolves `host:port` on `pool`, returning a future a fiber can
/// [`suspend_on`](crate::fiber::suspend_on). Resolution for multiple
/// hosts submitted to the same pool runs in parallel across its worker
/// threads (spec §8 scenario 6, "Parallel DNS").
pub fn resolve(pool: &super::TaskPool, host: impl Into<String>, port: u16) -> Future<Vec<SocketAddr>> {
    let (future, resolver) = future::channel();
    let task = DnsTask {
        host: host.into(),
        port,
        resolver: std::sync::Mutex::new(Some(resolver)),
    };
    let _handle = pool.launch(task);
    future
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{suspend_on, FiberScheduler, FiberSpawner};
    use crate::task_pool::TaskPool;
    use std::sync::mpsc;

    #[test]
    fn resolve_localhost_via_fiber() {
        let config = crate::config::FiberConfig::default();
        let (mut sched, spawner): (FiberScheduler, FiberSpawner) = FiberScheduler::new(&config);
        let pool = TaskPool::new();
        let worker = pool.clone();
        std::thread::spawn(move || worker.thread_loop());

        let (tx, rx) = mpsc::channel();
        let pool_for_fiber = pool.clone();
        spawner.launch(move || {
            let future = resolve(&pool_for_fiber, "localhost", 80);
            let result = suspend_on(Some(future));
            tx.send(result.is_some()).unwrap();
        });

        for _ in 0..2000 {
            sched.tick(false);
            if let Ok(got) = rx.try_recv() {
                assert!(got);
                return;
            }
        }
        panic!("DNS fiber never resumed");
    }
}
