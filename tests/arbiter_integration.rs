//! Integration tests for exclusive resource arbitration across threads

mod common;

use common::settle_timeout;
use frame_coordinator::arbiter::{ArbiterError, ClientHandle, ResourceArbiter};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_handles_are_bounded_and_reused() {
    let arbiter = ResourceArbiter::create("p2a", Duration::from_millis(50));

    let a = arbiter.request_client().unwrap();
    let b = arbiter.request_client().unwrap();
    assert_ne!(a, b);
    assert_eq!(arbiter.request_client(), None);

    arbiter.return_client(a).unwrap();
    assert_eq!(arbiter.request_client(), Some(a));
    assert_eq!(
        arbiter.return_client(ClientHandle(7)),
        Err(ArbiterError::UnknownClient(ClientHandle(7)))
    );
}

#[test]
#[serial]
fn test_second_client_waits_for_release() {
    let arbiter = ResourceArbiter::create("p2a", Duration::from_secs(2));
    let first = arbiter.request_client().unwrap();
    let second = arbiter.request_client().unwrap();
    arbiter.acquire_resource(first).unwrap();

    let waiter = {
        let arbiter = Arc::clone(&arbiter);
        thread::spawn(move || {
            let start = Instant::now();
            arbiter.acquire_resource(second).map(|_| start.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert_eq!(arbiter.holder(), Some(first));
    arbiter.release_resource(first).unwrap();

    let waited = waiter.join().unwrap().unwrap();
    assert!(waited >= Duration::from_millis(20));
    assert_eq!(arbiter.holder(), Some(second));
}

#[test]
#[serial]
fn test_acquire_times_out() {
    let arbiter = ResourceArbiter::create("p2a", Duration::from_millis(40));
    let first = arbiter.request_client().unwrap();
    let second = arbiter.request_client().unwrap();
    arbiter.acquire_resource(first).unwrap();

    let start = Instant::now();
    let err = arbiter.acquire_resource(second).unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert!(matches!(err, ArbiterError::Timeout { client, .. } if client == second));
    assert_eq!(arbiter.holder(), Some(first));
}

#[test]
fn test_release_by_non_holder_fails() {
    let arbiter = ResourceArbiter::create("p2a", Duration::from_millis(50));
    let first = arbiter.request_client().unwrap();
    let second = arbiter.request_client().unwrap();
    arbiter.acquire_resource(first).unwrap();

    assert_eq!(
        arbiter.release_resource(second),
        Err(ArbiterError::NotHolder {
            client: second,
            holder: Some(first)
        })
    );

    // Returning the holder's handle frees the resource as well.
    arbiter.return_client(first).unwrap();
    assert_eq!(arbiter.holder(), None);
    arbiter.acquire_resource(second).unwrap();
}

#[test]
#[serial]
fn test_leases_give_mutual_exclusion() {
    let arbiter = ResourceArbiter::with_capacity("p2a", settle_timeout(), 4);
    let inside = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let arbiter = Arc::clone(&arbiter);
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            thread::spawn(move || {
                for _ in 0..10 {
                    let lease = arbiter.lease().unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst));
                    entries.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(200));
                    inside.store(false, Ordering::SeqCst);
                    drop(lease);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(entries.load(Ordering::SeqCst), 40);
    assert_eq!(arbiter.holder(), None);
    assert!(arbiter.request_client().is_some());
}

#[test]
fn test_lease_without_free_handle() {
    let arbiter = ResourceArbiter::with_capacity("p2a", Duration::from_millis(10), 1);
    let _lease = arbiter.lease().unwrap();
    assert!(matches!(
        arbiter.lease(),
        Err(ArbiterError::NoClientAvailable { max_clients: 1, .. })
    ));
}
