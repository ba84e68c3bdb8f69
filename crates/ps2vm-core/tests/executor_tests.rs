//! Command Executor Integration Tests
//!
//! Validates the serialized executor from several controller threads:
//! - Exactly-once execution of concurrent posts
//! - Per-thread FIFO order within the global interleaving
//! - Blocking sends mixed with fire-and-forget posts
//! - Shutdown semantics for critical work
//!
//! # Running Tests
//! ```bash
//! cargo test --test executor_tests
//! ```

use parking_lot::Mutex;
use ps2vm_core::{CommandExecutor, EventSink, SyncAction, VmError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn executor() -> Arc<CommandExecutor> {
    Arc::new(CommandExecutor::start("it-executor", EventSink::disconnected()).unwrap())
}

// ===== Concurrent Posting =====

#[test]
fn test_hundred_posts_from_ten_threads() {
    const THREADS: usize = 10;
    const PER_THREAD: usize = 10;

    let exec = executor();
    let log = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let exec = exec.clone();
            let log = log.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for seq in 0..PER_THREAD {
                    let log = log.clone();
                    assert!(exec.post(SyncAction::new("record", move || {
                        log.lock().push((t, seq));
                        Ok(())
                    })));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    exec.drain().unwrap();

    let log = log.lock();
    assert_eq!(log.len(), THREADS * PER_THREAD);

    // Every action ran exactly once, and each thread's actions ran in the
    // order that thread posted them.
    let mut next: HashMap<usize, usize> = HashMap::new();
    for &(t, seq) in log.iter() {
        let expected = next.entry(t).or_insert(0);
        assert_eq!(seq, *expected, "thread {} ran out of order", t);
        *expected += 1;
    }
    assert!(next.values().all(|&n| n == PER_THREAD));
    assert_eq!(exec.invoked_count(), (THREADS * PER_THREAD + 1) as u64);
}

#[test]
fn test_sends_interleave_with_posts() {
    let exec = executor();
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let exec = exec.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    let c = counter.clone();
                    exec.post(SyncAction::new("bump", move || {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }));
                    // A send observes every post made before it by this thread.
                    let seen = {
                        let c = counter.clone();
                        exec.send("read", move || Ok(c.load(Ordering::SeqCst)))
                            .unwrap()
                    };
                    assert!(seen >= 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

// ===== Re-entrancy =====

#[test]
fn test_send_inside_action_does_not_deadlock() {
    let exec = executor();
    let inner = exec.clone();
    let depth = exec
        .send("level-1", move || {
            let deeper = inner.clone();
            inner.send("level-2", move || deeper.send("level-3", || Ok(3)))
        })
        .unwrap();
    assert_eq!(depth, 3);
}

// ===== Shutdown =====

#[test]
fn test_critical_send_survives_shutdown() {
    let exec = executor();
    exec.shutdown_queue();

    let result: Result<u32, VmError> = exec.send("late", || Ok(1));
    assert!(matches!(result, Err(VmError::NotExecuted)));
    assert_eq!(exec.send_critical("teardown", || Ok(2)).unwrap(), 2);

    exec.join();
    assert_eq!(exec.send_critical("after-join", || Ok(3)).unwrap(), 3);
}
