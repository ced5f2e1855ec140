//! Two DNS lookups submitted to the same [`TaskPool`] resolve
//! independently and in parallel across its worker threads (spec.md §8
//! scenario 6), each awaited from its own fiber.

use std::sync::mpsc;
use std::time::Duration;

use poseidon::config::FiberConfig;
use poseidon::fiber::{suspend_on, FiberScheduler};
use poseidon::task_pool::{dns, TaskPool};

#[test]
fn two_hosts_resolve_concurrently() {
    let (mut scheduler, spawner) = FiberScheduler::new(&FiberConfig::default());
    let pool = TaskPool::new();
    let _workers = pool.spawn_workers(2, || false);

    let (tx, rx) = mpsc::channel();

    for host in ["localhost", "127.0.0.1"] {
        let pool = pool.clone();
        let tx = tx.clone();
        spawner.launch(move || {
            let future = dns::resolve(&pool, host, 80);
            let result = suspend_on(Some(future));
            let resolved = result.map(|r| r.is_ok()).unwrap_or(false);
            tx.send(resolved).unwrap();
        });
    }
    drop(tx);

    let mut seen = 0;
    for _ in 0..5000 {
        scheduler.tick(false);
        while let Ok(resolved) = rx.try_recv() {
            assert!(resolved, "DNS lookup should succeed for a loopback-resolvable host");
            seen += 1;
        }
        if seen == 2 {
            return;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    panic!("not all DNS lookups completed in time");
}
