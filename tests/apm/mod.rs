use std::time::Duration;

use mongodb_cluster::apm::{CmapEvent, SdamEvent};
use mongodb_cluster::common::ServerSelector;
use mongodb_cluster::topology::server::ServerType;
use mongodb_cluster::topology::TopologyType;
use mongodb_cluster::ClientOptions;

use crate::mock::{self, Deployment};

fn position<F: Fn(&SdamEvent) -> bool>(events: &[SdamEvent], matches: F) -> Option<usize> {
    events.iter().position(|event| matches(event))
}

#[test]
fn heartbeats_precede_description_changes() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::standalone());
    let (cluster, events) =
        deployment.cluster_with_events(ClientOptions::parse("mongodb://a").unwrap());
    cluster.select_server(&ServerSelector::Writable).unwrap();
    cluster.close();

    let events = events.sdam_events();
    let opening = position(&events, |event| match *event {
        SdamEvent::ServerOpening { .. } => true,
        _ => false,
    });
    let started = position(&events, |event| match *event {
        SdamEvent::ServerHeartbeatStarted { awaited, .. } => !awaited,
        _ => false,
    });
    let succeeded = position(&events, |event| match *event {
        SdamEvent::ServerHeartbeatSucceeded { .. } => true,
        _ => false,
    });
    let changed = position(&events, |event| match *event {
        SdamEvent::ServerDescriptionChanged {
            ref previous,
            ref new,
            ..
        } => {
            previous.server_type() == ServerType::Unknown
                && new.server_type() == ServerType::Standalone
        }
        _ => false,
    });
    let topology_changed = position(&events, |event| match *event {
        SdamEvent::TopologyDescriptionChanged { ref new, .. } => {
            new.topology_type() == TopologyType::Single && new.has_available_servers()
        }
        _ => false,
    });

    assert!(opening.is_some());
    assert!(started.unwrap() < succeeded.unwrap());
    assert!(succeeded.unwrap() < changed.unwrap());
    assert!(changed.unwrap() < topology_changed.unwrap());
    assert!(match events.last() {
        Some(SdamEvent::ServerClosed { .. }) => true,
        _ => false,
    });
}

#[test]
fn failed_heartbeats_are_reported() {
    let deployment = Deployment::new();
    let options = ClientOptions::parse("mongodb://a/?serverSelectionTimeoutMS=100").unwrap();
    let (cluster, events) = deployment.cluster_with_events(options);

    assert!(cluster.select_server(&ServerSelector::Writable).is_err());
    assert!(mock::wait_until(Duration::from_secs(5), || {
        events.sdam_events().iter().any(|event| match *event {
            SdamEvent::ServerHeartbeatFailed { ref error, .. } => error.is_network_error(),
            _ => false,
        })
    }));

    cluster.close();
}

#[test]
fn events_display_their_subject() {
    let deployment = Deployment::new();
    deployment.set_server("a", mock::standalone());
    let (cluster, events) =
        deployment.cluster_with_events(ClientOptions::parse("mongodb://a").unwrap());
    cluster.select_server(&ServerSelector::Writable).unwrap();
    // Joins the monitor, which delivers the ready event after releasing the topology lock.
    cluster.close();

    let ready = events
        .cmap_events()
        .into_iter()
        .find(|event| match *event {
            CmapEvent::PoolReady { .. } => true,
            _ => false,
        })
        .unwrap();
    assert_eq!("POOL a:27017 READY", ready.to_string());

    let opening = events
        .sdam_events()
        .into_iter()
        .find(|event| match *event {
            SdamEvent::ServerOpening { .. } => true,
            _ => false,
        })
        .unwrap();
    assert_eq!("SERVER a:27017 OPENING", opening.to_string());
}
