use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::{bson, doc, Bson, Document};

use mongodb_cluster::apm::{CmapEvent, EventHandler};
use mongodb_cluster::common::ServerSelector;
use mongodb_cluster::error::ErrorKind;
use mongodb_cluster::operation::Find;
use mongodb_cluster::pool::ConnectionPool;
use mongodb_cluster::{ClientOptions, Cluster};

use crate::mock::{self, address, Deployment, EventRecorder, Failure};

fn replica_set(uri: &str) -> (Deployment, Cluster) {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::primary("rs", &["a:27017"]));
    let cluster = deployment.cluster(ClientOptions::parse(uri).unwrap());
    (deployment, cluster)
}

fn checkout_failures(events: &EventRecorder) -> usize {
    events
        .cmap_events()
        .iter()
        .filter(|event| match **event {
            CmapEvent::ConnectionCheckoutFailed { .. } => true,
            _ => false,
        })
        .count()
}

// Clears a pool the next time a connection is checked into it.
#[derive(Default)]
struct ClearOnCheckIn {
    pool: Mutex<Option<ConnectionPool>>,
}

impl EventHandler for ClearOnCheckIn {
    fn handle_cmap_event(&self, event: &CmapEvent) {
        if let CmapEvent::ConnectionCheckedIn { .. } = *event {
            let pool = self.pool.lock().unwrap().take();
            if let Some(pool) = pool {
                pool.clear(None, None);
            }
        }
    }
}

fn people(count: usize) -> Vec<Document> {
    (0..count).map(|i| doc! { "i": i as i32 }).collect()
}

#[test]
fn write_is_retried_once_after_network_error() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs");
    deployment.fail_command("insert", 1, Failure::Network);

    cluster.insert_one("test", "people", doc! { "name": "Kevin" }).unwrap();

    let inserts = deployment.commands("insert");
    assert_eq!(2, inserts.len());
    assert!(inserts[0].txn_number.is_some());
    assert_eq!(inserts[0].txn_number, inserts[1].txn_number);
    assert_eq!(1, deployment.documents("people").len());

    cluster.close();
}

#[test]
fn retried_write_is_not_applied_twice() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs");
    deployment.fail_command("insert", 1, Failure::NetworkAfterApply);

    let id = cluster.insert_one("test", "people", doc! { "name": "Kevin" }).unwrap();

    assert_eq!(2, deployment.commands("insert").len());
    let stored = deployment.documents("people");
    assert_eq!(1, stored.len());
    assert_eq!(Some(&id), stored[0].get("_id"));

    cluster.close();
}

#[test]
fn batches_are_retried_independently() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::primary("rs", &["a:27017"]));
    let mut options = ClientOptions::parse("mongodb://a/?replicaSet=rs").unwrap();
    options.max_write_batch_size = Some(2);
    let cluster = deployment.cluster(options);

    deployment.fail_command("insert", 1, Failure::Network);
    let result = cluster.insert_many("test", "people", people(4), true).unwrap();

    assert_eq!(4, result.inserted_count);
    assert_eq!(2, result.batches);
    assert_eq!(4, result.inserted_ids.len());

    // The failed first batch is resent; the second batch is sent once.
    let inserts = deployment.commands("insert");
    assert_eq!(3, inserts.len());
    assert!(inserts.iter().all(|insert| insert.documents == 2));
    assert_eq!(inserts[0].txn_number, inserts[1].txn_number);
    assert_ne!(inserts[1].txn_number, inserts[2].txn_number);
    assert_eq!(4, deployment.documents("people").len());

    cluster.close();
}

#[test]
fn no_writes_performed_returns_first_error() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs");
    deployment.fail_command("insert", 1, mock::command_error(91, &["RetryableWriteError"]));
    deployment.fail_command(
        "insert",
        1,
        mock::command_error(10107, &["RetryableWriteError", "NoWritesPerformed"]),
    );

    let err = cluster.insert_one("test", "people", doc! {}).unwrap_err();

    assert_eq!(Some(91), err.code());
    assert_eq!(2, deployment.commands("insert").len());
    assert!(deployment.documents("people").is_empty());

    cluster.close();
}

#[test]
fn failed_retry_returns_its_own_error() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs");
    deployment.fail_command("insert", 1, mock::command_error(262, &["RetryableWriteError"]));
    deployment.fail_command("insert", 1, mock::command_error(8, &[]));

    let err = cluster.insert_one("test", "people", doc! {}).unwrap_err();

    assert_eq!(Some(8), err.code());
    assert_eq!(2, deployment.commands("insert").len());

    cluster.close();
}

#[test]
fn writes_are_not_retried_when_disabled() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs&retryWrites=false");
    deployment.fail_command("insert", 1, Failure::Network);

    let err = cluster.insert_one("test", "people", doc! {}).unwrap_err();

    assert!(err.is_network_error());
    let inserts = deployment.commands("insert");
    assert_eq!(1, inserts.len());
    assert_eq!(None, inserts[0].txn_number);

    cluster.close();
}

#[test]
fn writes_to_standalones_are_not_retried() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::standalone());
    let cluster = deployment.cluster(ClientOptions::parse("mongodb://a").unwrap());
    deployment.fail_command("insert", 1, Failure::Network);

    assert!(cluster.insert_one("test", "people", doc! {}).is_err());

    let inserts = deployment.commands("insert");
    assert_eq!(1, inserts.len());
    assert_eq!(None, inserts[0].txn_number);

    cluster.close();
}

#[test]
fn write_errors_are_not_retried() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs");
    deployment.fail_command(
        "insert",
        1,
        Failure::Reply(doc! {
            "ok": 1,
            "n": 0,
            "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "duplicate key" }],
        }),
    );

    let err = cluster.insert_one("test", "people", doc! {}).unwrap_err();

    match *err.kind() {
        ErrorKind::Write(ref failure) => {
            assert_eq!(11000, failure.code);
            assert_eq!(0, failure.index);
        }
        ref other => panic!("expected a write error, got {:?}", other),
    }
    assert_eq!(1, deployment.commands("insert").len());

    cluster.close();
}

#[test]
fn read_is_retried_once() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs");
    cluster.insert_one("test", "people", doc! { "name": "Kevin" }).unwrap();

    deployment.fail_command("find", 1, Failure::Network);
    let found = cluster
        .execute(&mut Find::new("test", "people", doc! {}))
        .unwrap();
    assert_eq!(1, found.len());
    assert_eq!(Some(&Bson::String("Kevin".to_string())), found[0].get("name"));
    assert_eq!(2, deployment.commands("find").len());

    deployment.fail_command("find", 2, Failure::Network);
    let err = cluster
        .execute(&mut Find::new("test", "people", doc! {}))
        .unwrap_err();
    assert!(err.is_network_error());
    assert_eq!(4, deployment.commands("find").len());

    cluster.close();
}

#[test]
fn sharded_retry_prefers_another_mongos() {
    let deployment = Deployment::new();
    let mongos = doc! {
        "ismaster": true,
        "msg": "isdbgrid",
        "minWireVersion": 0,
        "maxWireVersion": 13,
        "logicalSessionTimeoutMinutes": 30,
    };
    deployment.set_server("a", mongos.clone());
    deployment.set_server("b", mongos);
    let cluster = deployment.cluster(ClientOptions::parse("mongodb://a,b").unwrap());

    assert!(mock::wait_until(Duration::from_secs(5), || {
        !cluster.is_server_unknown(&address("a")) && !cluster.is_server_unknown(&address("b"))
    }));

    deployment.fail_command("insert", 1, mock::command_error(262, &["RetryableWriteError"]));
    cluster.insert_one("test", "people", doc! {}).unwrap();

    let inserts = deployment.commands("insert");
    assert_eq!(2, inserts.len());
    assert_ne!(inserts[0].address, inserts[1].address);

    cluster.close();
}

#[test]
fn retry_reselects_once_when_its_pool_is_cleared() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::primary("rs", &["a:27017"]));
    let events = Arc::new(EventRecorder::default());
    let clearer = Arc::new(ClearOnCheckIn::default());
    let cluster = Cluster::builder(ClientOptions::parse("mongodb://a/?replicaSet=rs").unwrap())
        .transport(deployment.transport())
        .event_handler(events.clone())
        .event_handler(clearer.clone())
        .build()
        .unwrap();
    let server = cluster.select_server(&ServerSelector::Writable).unwrap();

    *clearer.pool.lock().unwrap() = Some(server.pool().clone());
    deployment.fail_command("insert", 1, mock::command_error(262, &["RetryableWriteError"]));
    let err = cluster.insert_one("test", "people", doc! {}).unwrap_err();

    // Both of the retry's checkouts hit the paused pool; the first error is returned.
    assert_eq!(Some(262), err.code());
    assert_eq!(1, deployment.commands("insert").len());
    assert_eq!(2, checkout_failures(&events));

    cluster.close();
}

#[test]
fn checkout_timeouts_are_only_retried_for_writes() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::primary("rs", &["a:27017"]));
    let (cluster, events) = deployment.cluster_with_events(
        ClientOptions::parse("mongodb://a/?replicaSet=rs&maxPoolSize=1&waitQueueTimeoutMS=100")
            .unwrap(),
    );
    let server = cluster.select_server(&ServerSelector::Writable).unwrap();
    let held = cluster.check_out(&server).unwrap();

    let err = cluster
        .execute(&mut Find::new("test", "people", doc! {}))
        .unwrap_err();
    assert!(err.is_checkout_timeout());
    assert!(!err.contains_label("RetryableWriteError"));
    assert_eq!(1, checkout_failures(&events));

    let err = cluster.insert_one("test", "people", doc! {}).unwrap_err();
    assert!(err.is_checkout_timeout());
    assert!(err.contains_label("RetryableWriteError"));
    assert_eq!(3, checkout_failures(&events));
    assert!(deployment.commands("insert").is_empty());

    drop(held);
    cluster.close();
}

#[test]
fn retry_without_retryable_write_support_returns_first_error() {
    let (deployment, cluster) = replica_set("mongodb://a/?replicaSet=rs");
    cluster.insert_one("test", "people", doc! {}).unwrap();

    // The network error clears the pool, so the retry handshakes with a server that has
    // dropped session support.
    let mut no_sessions = mock::primary("rs", &["a:27017"]);
    no_sessions.remove("logicalSessionTimeoutMinutes");
    deployment.set_server("a", no_sessions);
    deployment.fail_command("insert", 1, Failure::Network);

    let err = cluster.insert_one("test", "people", doc! {}).unwrap_err();

    assert!(err.is_network_error());
    assert_eq!(2, deployment.commands("insert").len());
    assert_eq!(1, deployment.documents("people").len());

    cluster.close();
}
