mod framework;

use std::time::Duration;

use approx::assert_relative_eq;
use bson::oid::ObjectId;
use bson::{bson, doc};

use mongodb_cluster::connstring::Address;
use mongodb_cluster::topology::monitor::average_round_trip_time;
use mongodb_cluster::topology::server::{ServerDescription, ServerType};
use mongodb_cluster::topology::{TopologyDescription, TopologyType};
use mongodb_cluster::ClientOptions;

use self::framework::run_dir;

#[test]
fn sdam_rs() {
    run_dir("rs");
}

#[test]
fn sdam_single() {
    run_dir("single");
}

#[test]
fn sdam_sharded() {
    run_dir("sharded");
}

#[test]
fn sdam_unknown() {
    run_dir("unknown");
}

fn address(host: &str) -> Address {
    Address::parse(host).unwrap()
}

fn topology(uri: &str) -> TopologyDescription {
    TopologyDescription::new(&ClientOptions::parse(uri).unwrap())
}

#[test]
fn stale_topology_version_is_ignored() {
    let mut topology = topology("mongodb://a/?replicaSet=rs");
    let process_id = ObjectId::with_string("000000000000000000000001").unwrap();

    let newer = doc! {
        "ok": 1,
        "ismaster": true,
        "setName": "rs",
        "hosts": ["a:27017"],
        "maxWireVersion": 13,
        "topologyVersion": { "processId": process_id.clone(), "counter": 2i64 },
    };
    let older = doc! {
        "ok": 1,
        "ismaster": false,
        "secondary": true,
        "setName": "rs",
        "hosts": ["a:27017"],
        "maxWireVersion": 13,
        "topologyVersion": { "processId": process_id, "counter": 1i64 },
    };

    assert!(topology.apply(ServerDescription::from_hello_document(address("a"), newer, None).unwrap()));
    assert!(!topology.apply(ServerDescription::from_hello_document(address("a"), older, None).unwrap()));

    let server = topology.server(&address("a")).unwrap();
    assert_eq!(ServerType::RSPrimary, server.server_type());
    assert_eq!(TopologyType::ReplicaSetWithPrimary, topology.topology_type());
}

#[test]
fn descriptions_from_unknown_hosts_are_dropped() {
    let mut topology = topology("mongodb://a/?replicaSet=rs");
    let reply = doc! { "ok": 1, "ismaster": true, "setName": "rs", "hosts": ["z:27017"] };

    assert!(!topology.apply(ServerDescription::from_hello_document(address("z"), reply, None).unwrap()));
    assert!(!topology.contains(&address("z")));
}

#[test]
fn diff_reports_added_removed_and_changed_servers() {
    let before = topology("mongodb://a,b/?replicaSet=rs");
    let mut after = before.clone();
    let reply = doc! {
        "ok": 1,
        "ismaster": true,
        "setName": "rs",
        "hosts": ["a:27017", "c:27017"],
        "maxWireVersion": 13,
    };
    assert!(after.apply(ServerDescription::from_hello_document(address("a"), reply, None).unwrap()));

    let diff = before.diff(&after);
    assert_eq!(vec![address("c")], diff.added);
    assert_eq!(vec![address("b")], diff.removed);
    assert_eq!(1, diff.changed.len());
    assert_eq!(ServerType::RSPrimary, diff.changed[0].1.server_type());
    assert!(after.diff(&after).is_empty());
}

#[test]
fn round_trip_times_are_averaged() {
    let first = average_round_trip_time(None, Duration::from_millis(100));
    assert_eq!(Duration::from_millis(100), first);

    let second = average_round_trip_time(Some(first), Duration::from_millis(200));
    assert_relative_eq!(0.12, second.as_secs_f64(), epsilon = 1e-9);

    let third = average_round_trip_time(Some(second), Duration::from_millis(20));
    assert_relative_eq!(0.1, third.as_secs_f64(), epsilon = 1e-9);
}
