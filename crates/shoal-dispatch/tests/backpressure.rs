// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 23 February 2024

use shoal_dispatch::{DispatchError, DispatchMode, PoolConfig, ThreadPool};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

#[path = "./helpers.rs"]
mod helpers;

use helpers::{output, request, Gate, Probe, Stub};

fn blocked_pool(mode: DispatchMode, timeout: Option<Duration>) -> (Arc<ThreadPool>, Arc<Probe>, Arc<Gate>) {
    let probe = Probe::new();
    let gate = Gate::closed();
    let pool = ThreadPool::new(
        Arc::new(Stub::new(&probe).gated(&gate)),
        PoolConfig::default()
            .with_workers(1)
            .with_batch_limit(1)
            .with_queue_limit(1)
            .with_mode(mode)
            .with_enqueue_timeout(timeout),
    )
    .unwrap();

    (Arc::new(pool), probe, gate)
}

#[test]
fn test_full_queue_blocks_producer() {
    for mode in [DispatchMode::Sequential, DispatchMode::Batched] {
        let (pool, probe, gate) = blocked_pool(mode, None);

        let running = pool.submit(request(0.0));
        probe.wait_entered(1);
        let queued = pool.submit(request(1.0));
        assert_eq!(pool.queued_batches(), 1);

        let producer = {
            let pool = pool.clone();
            thread::spawn(move || output(&pool.infer(request(2.0)).unwrap()))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(pool.queued_batches(), 1);

        gate.open();
        assert_eq!(output(&running.wait().unwrap()), 1.0);
        assert_eq!(output(&queued.wait().unwrap()), 2.0);
        assert_eq!(producer.join().unwrap(), 3.0);
    }
}

#[test]
fn test_enqueue_timeout_reports_queue_full() {
    let timeout = Duration::from_millis(30);
    let (pool, probe, gate) = blocked_pool(DispatchMode::Sequential, Some(timeout));

    let running = pool.submit(request(0.0));
    probe.wait_entered(1);
    let queued = pool.submit(request(1.0));

    let start = Instant::now();
    let refused = pool.infer(request(2.0));
    assert!(start.elapsed() >= timeout);
    assert!(matches!(refused, Err(DispatchError::QueueFull(waited)) if waited == timeout));

    gate.open();
    running.wait().unwrap();
    queued.wait().unwrap();

    // Space frees up once the worker catches up.
    assert_eq!(output(&pool.infer(request(4.0)).unwrap()), 5.0);
}
