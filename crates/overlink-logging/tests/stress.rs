//! Stress tests for overlink-logging node context
//!
//! Many threads creating and dropping guards must never see each other's
//! context.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use overlink_core::{InstanceNodeId, NodeIdentifier};
use overlink_logging::NodeContextGuard;

/// Concurrent guard creation and switching across many threads
#[test]
fn test_concurrent_node_contexts() {
    const NUM_THREADS: usize = 50;
    const ITERATIONS: usize = 100;

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let start = Instant::now();

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = InstanceNodeId::generate().new_session();
                barrier.wait();

                for _ in 0..ITERATIONS {
                    let _guard = NodeContextGuard::new(&session);
                    assert_eq!(NodeContextGuard::current_node_id(), Some(session.short_id()));
                }
                assert!(NodeContextGuard::current().is_none());
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    println!(
        "Completed {} node context operations across {} threads in {:?}",
        NUM_THREADS * ITERATIONS,
        NUM_THREADS,
        start.elapsed()
    );
}

/// Rapid switching between two nodes on one thread
#[test]
fn test_rapid_context_switching() {
    const NUM_SWITCHES: usize = 10_000;

    let a = InstanceNodeId::generate().new_session();
    let b = InstanceNodeId::generate().new_session();
    let start = Instant::now();

    for i in 0..NUM_SWITCHES {
        let node = if i % 2 == 0 { &a } else { &b };
        let _guard = NodeContextGuard::new(node);
        assert_eq!(NodeContextGuard::current_node_id(), Some(node.short_id()));
    }

    println!("Completed {} context switches in {:?}", NUM_SWITCHES, start.elapsed());
    assert!(NodeContextGuard::current().is_none());
}

/// Deeply nested guards unwind in order
#[test]
fn test_deep_nesting() {
    let sessions: Vec<_> = (0..200)
        .map(|_| InstanceNodeId::generate().new_session())
        .collect();

    let mut guards = Vec::with_capacity(sessions.len());
    for session in &sessions {
        guards.push(NodeContextGuard::new(session));
    }
    for session in sessions.iter().rev() {
        assert_eq!(NodeContextGuard::current_node_id(), Some(session.short_id()));
        guards.pop();
    }
    assert!(NodeContextGuard::current().is_none());
}
