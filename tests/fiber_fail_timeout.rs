//! A fiber suspended on a future that is never resolved is forcibly
//! resumed once `fail_timeout` elapses, per spec.md §4.1's `should_fail`
//! rule (`fiber/mod.rs`'s `FiberScheduler::tick`). `suspend_on` returns
//! `None` in that case since the future never became ready.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use poseidon::config::FiberConfig;
use poseidon::fiber::{future, suspend_on, FiberScheduler};

#[test]
fn forced_resume_after_fail_timeout_yields_none() {
    let config = FiberConfig {
        stack_vm_size: None,
        warn_timeout_secs: 0,
        fail_timeout_secs: 1,
    };
    let (mut scheduler, spawner) = FiberScheduler::new(&config);

    let (tx, rx) = mpsc::channel();
    spawner.launch(move || {
        let (never_resolved, _resolver) = future::channel::<()>();
        let result = suspend_on(Some(never_resolved));
        tx.send(result.is_none()).unwrap();
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        scheduler.tick(false);
        if let Ok(was_forced) = rx.try_recv() {
            assert!(was_forced, "fiber should resume with None after fail_timeout");
            return;
        }
        if Instant::now() > deadline {
            panic!("fiber was never forcibly resumed within the test deadline");
        }
    }
}
