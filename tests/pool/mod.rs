use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bson::{bson, doc};

use mongodb_cluster::apm::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason};
use mongodb_cluster::common::ServerSelector;
use mongodb_cluster::error::{ErrorKind, PoolError};
use mongodb_cluster::operation::Find;
use mongodb_cluster::pool::{ConnectionPool, PoolState};
use mongodb_cluster::{ClientOptions, Cluster};

use crate::mock::{self, Deployment, EventRecorder};

fn start(uri: &str) -> (Deployment, Cluster, Arc<EventRecorder>, ConnectionPool) {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::standalone());
    let (cluster, events) = deployment.cluster_with_events(ClientOptions::parse(uri).unwrap());
    let pool = cluster
        .select_server(&ServerSelector::Writable)
        .unwrap()
        .pool()
        .clone();

    // The ready event goes out once the monitor has released the topology lock.
    assert!(mock::wait_until(Duration::from_secs(5), || {
        count(&events, |event| match *event {
            CmapEvent::PoolReady { .. } => true,
            _ => false,
        }) == 1
    }));
    (deployment, cluster, events, pool)
}

fn count<F: Fn(&CmapEvent) -> bool>(events: &EventRecorder, matches: F) -> usize {
    events.cmap_events().iter().filter(|event| matches(event)).count()
}

fn is_cleared(event: &CmapEvent) -> bool {
    match *event {
        CmapEvent::PoolCleared { .. } => true,
        _ => false,
    }
}

#[test]
fn populates_to_min_pool_size() {
    let (_deployment, cluster, events, pool) = start("mongodb://a/?minPoolSize=3");

    assert!(mock::wait_until(Duration::from_secs(5), || pool.available_count() == 3));
    assert_eq!(3, pool.size());
    assert_eq!(0, pool.checked_out_count());
    assert_eq!(
        3,
        count(&events, |event| match *event {
            CmapEvent::ConnectionReady { .. } => true,
            _ => false,
        })
    );

    cluster.close();
}

#[test]
fn pool_never_exceeds_max_size() {
    let (_deployment, cluster, events, pool) = start("mongodb://a/?maxPoolSize=5");

    let done = Arc::new(AtomicBool::new(false));
    let largest = Arc::new(AtomicU32::new(0));
    let sampling = {
        let pool = pool.clone();
        let done = done.clone();
        let largest = largest.clone();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                largest.fetch_max(pool.size(), Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let workers: Vec<_> = (0..7)
        .map(|_| {
            let cluster = cluster.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    cluster
                        .execute(&mut Find::new("test", "people", doc! {}))
                        .unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    sampling.join().unwrap();

    assert!(largest.load(Ordering::SeqCst) <= 5);
    assert!(pool.size() <= 5);
    assert!(
        count(&events, |event| match *event {
            CmapEvent::ConnectionCreated { .. } => true,
            _ => false,
        }) <= 5
    );

    cluster.close();
}

#[test]
fn checkout_times_out_when_pool_is_exhausted() {
    let (_deployment, cluster, events, pool) =
        start("mongodb://a/?maxPoolSize=1&waitQueueTimeoutMS=100");

    let held = pool.check_out().unwrap();
    let err = pool.check_out().unwrap_err();
    assert!(err.is_checkout_timeout());
    assert_eq!(Some(pool.address()), err.address());
    assert_eq!(
        1,
        count(&events, |event| match *event {
            CmapEvent::ConnectionCheckoutFailed { reason, .. } => {
                reason == ConnectionCheckoutFailedReason::Timeout
            }
            _ => false,
        })
    );

    drop(held);
    assert!(pool.check_out().is_ok());

    cluster.close();
}

#[test]
fn zero_wait_queue_timeout_fails_full_pool_checkout_at_once() {
    let (_deployment, cluster, events, pool) =
        start("mongodb://a/?maxPoolSize=1&waitQueueTimeoutMS=0");

    let held = pool.check_out().unwrap();
    let started = Instant::now();
    let err = pool.check_out().unwrap_err();

    assert!(err.is_checkout_timeout());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        1,
        count(&events, |event| match *event {
            CmapEvent::ConnectionCheckoutFailed { reason, .. } => {
                reason == ConnectionCheckoutFailedReason::Timeout
            }
            _ => false,
        })
    );

    drop(held);
    assert!(pool.check_out().is_ok());

    cluster.close();
}

#[test]
fn waiting_checkout_gets_returned_connection() {
    let (_deployment, cluster, _events, pool) = start("mongodb://a/?maxPoolSize=1");

    let held = pool.check_out().unwrap();
    let id = held.id();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.check_out().map(|connection| connection.id()))
    };
    thread::sleep(Duration::from_millis(50));
    drop(held);

    assert_eq!(id, waiter.join().unwrap().unwrap());
    assert_eq!(1, pool.size());

    cluster.close();
}

#[test]
fn clear_discards_connections_checked_in_afterwards() {
    let (_deployment, cluster, events, pool) = start("mongodb://a");

    let connection = pool.check_out().unwrap();
    let generation = pool.generation(None);

    pool.clear(None, None);
    assert_eq!(generation + 1, pool.generation(None));
    assert_eq!(PoolState::Paused, pool.state());
    assert!(pool.is_stale(connection.generation(), None));
    assert!(pool.check_out().unwrap_err().is_pool_cleared());

    drop(connection);
    assert_eq!(0, pool.available_count());
    assert_eq!(0, pool.size());
    assert_eq!(
        1,
        count(&events, |event| match *event {
            CmapEvent::ConnectionClosed { reason, .. } => reason == ConnectionClosedReason::Stale,
            _ => false,
        })
    );

    pool.ready();
    let connection = pool.check_out().unwrap();
    assert_eq!(generation + 1, connection.generation());

    cluster.close();
}

#[test]
fn clearing_a_paused_pool_emits_no_event() {
    let (_deployment, cluster, events, pool) = start("mongodb://a");

    pool.clear(None, None);
    pool.clear(None, None);
    assert_eq!(1, count(&events, is_cleared));

    cluster.close();
}

#[test]
fn paused_pool_keeps_its_connections() {
    let (_deployment, cluster, _events, pool) = start("mongodb://a");

    let connection = pool.check_out().unwrap();
    let id = connection.id();
    let generation = pool.generation(None);

    pool.pause();
    assert_eq!(PoolState::Paused, pool.state());
    assert_eq!(generation, pool.generation(None));
    assert!(pool.check_out().unwrap_err().is_pool_cleared());

    drop(connection);
    assert_eq!(1, pool.available_count());

    pool.ready();
    assert_eq!(id, pool.check_out().unwrap().id());
    assert_eq!(1, pool.size());

    cluster.close();
}

#[test]
fn populator_retries_failed_connects_without_clearing() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::standalone());
    // The monitor's connection goes through, then the populator's next three attempts fail.
    deployment.refuse_connections(1, 3);
    let (cluster, events) = deployment
        .cluster_with_events(ClientOptions::parse("mongodb://a/?minPoolSize=2").unwrap());
    let pool = cluster
        .select_server(&ServerSelector::Writable)
        .unwrap()
        .pool()
        .clone();

    assert!(mock::wait_until(Duration::from_secs(5), || pool.available_count() == 2));
    assert_eq!(PoolState::Ready, pool.state());
    assert_eq!(0, pool.generation(None));
    assert_eq!(3, deployment.connections_opened());
    assert_eq!(0, count(&events, is_cleared));
    assert!(!cluster.is_server_unknown(&mock::address("a")));

    cluster.close();
}

#[test]
fn load_balanced_clear_during_handshake_discards_the_connection() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::load_balancer());
    let cluster =
        deployment.cluster(ClientOptions::parse("mongodb://a/?loadBalanced=true").unwrap());
    let pool = cluster
        .select_server(&ServerSelector::Writable)
        .unwrap()
        .pool()
        .clone();

    let held = pool.check_out().unwrap();
    let service_id = *held.service_id().unwrap();
    assert_eq!(0, pool.generation(Some(&service_id)));

    deployment.delay_handshakes(Some(Duration::from_millis(300)));
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.check_out().map(|connection| connection.id()))
    };
    thread::sleep(Duration::from_millis(100));
    pool.clear(Some(&service_id), None);

    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.is_pool_cleared());
    assert_eq!(1, pool.generation(Some(&service_id)));
    assert_eq!(PoolState::Ready, pool.state());

    deployment.delay_handshakes(None);
    drop(held);
    assert_eq!(0, pool.available_count());
    assert_eq!(1, pool.check_out().unwrap().generation());

    cluster.close();
}

#[test]
fn idle_connections_are_pruned() {
    let (_deployment, cluster, events, pool) = start("mongodb://a/?maxIdleTimeMS=50");

    drop(pool.check_out().unwrap());
    assert_eq!(1, pool.available_count());

    thread::sleep(Duration::from_millis(100));
    pool.close_idle_connections();
    assert_eq!(0, pool.available_count());
    assert_eq!(
        1,
        count(&events, |event| match *event {
            CmapEvent::ConnectionClosed { reason, .. } => reason == ConnectionClosedReason::Idle,
            _ => false,
        })
    );

    cluster.close();
}

#[test]
fn closed_pool_rejects_checkouts() {
    let (_deployment, cluster, events, pool) = start("mongodb://a");

    let connection = pool.check_out().unwrap();
    cluster.close();
    assert_eq!(PoolState::Closed, pool.state());

    match *pool.check_out().unwrap_err().kind() {
        ErrorKind::Pool(PoolError::PoolClosed) => {}
        ref other => panic!("expected a closed pool, got {:?}", other),
    }

    drop(connection);
    assert_eq!(0, pool.size());
    assert!(events.cmap_events().iter().any(|event| match *event {
        CmapEvent::PoolClosed { .. } => true,
        _ => false,
    }));
}

#[test]
fn checkout_events_are_emitted_in_order() {
    let (_deployment, cluster, events, pool) = start("mongodb://a");

    drop(pool.check_out().unwrap());

    let names: Vec<&str> = events
        .cmap_events()
        .iter()
        .map(|event| match *event {
            CmapEvent::PoolCreated { .. } => "PoolCreated",
            CmapEvent::PoolReady { .. } => "PoolReady",
            CmapEvent::ConnectionCheckoutStarted { .. } => "CheckoutStarted",
            CmapEvent::ConnectionCreated { .. } => "Created",
            CmapEvent::ConnectionReady { .. } => "Ready",
            CmapEvent::ConnectionCheckedOut { .. } => "CheckedOut",
            CmapEvent::ConnectionCheckedIn { .. } => "CheckedIn",
            _ => "Other",
        })
        .collect();

    assert_eq!(
        vec![
            "PoolCreated",
            "PoolReady",
            "CheckoutStarted",
            "Created",
            "Ready",
            "CheckedOut",
            "CheckedIn"
        ],
        names
    );

    cluster.close();
}
