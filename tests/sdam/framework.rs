use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde_json::{Map, Value};

use mongodb_cluster::connstring::Address;
use mongodb_cluster::error::{Error, ErrorKind, TransportErrorKind};
use mongodb_cluster::topology::server::{ServerDescription, ServerType};
use mongodb_cluster::topology::{TopologyDescription, TopologyType};
use mongodb_cluster::ClientOptions;

struct ServerOutcome {
    set_name: Option<String>,
    server_type: ServerType,
}

struct Outcome {
    servers: HashMap<Address, ServerOutcome>,
    set_name: Option<String>,
    topology_type: TopologyType,
    logical_session_timeout_minutes: Option<u64>,
    compatible: Option<bool>,
}

struct Phase {
    responses: Vec<(Address, Document)>,
    outcome: Outcome,
}

/// Converts JSON into BSON, reading `{"$oid": ...}` as an object id. Integers become `I32` when
/// they fit.
pub fn to_bson(value: &Value) -> Bson {
    match *value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(b),
        Value::Number(ref n) => match n.as_i64() {
            Some(i) if i >= i64::from(i32::min_value()) && i <= i64::from(i32::max_value()) => {
                Bson::I32(i as i32)
            }
            Some(i) => Bson::I64(i),
            None => Bson::FloatingPoint(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(ref s) => Bson::String(s.clone()),
        Value::Array(ref values) => Bson::Array(values.iter().map(to_bson).collect()),
        Value::Object(ref map) => {
            if let (1, Some(&Value::String(ref oid))) = (map.len(), map.get("$oid")) {
                return Bson::ObjectId(ObjectId::with_string(oid).unwrap());
            }
            Bson::Document(to_document(map))
        }
    }
}

pub fn to_document(map: &Map<String, Value>) -> Document {
    let mut doc = Document::new();
    for (key, value) in map {
        doc.insert(key.clone(), to_bson(value));
    }
    doc
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        Some(&Value::String(ref s)) => Some(s.clone()),
        _ => None,
    }
}

fn parse_outcome(object: &Map<String, Value>) -> Outcome {
    let mut servers = HashMap::new();
    if let Some(&Value::Object(ref map)) = object.get("servers") {
        for (host, server) in map {
            let server = server.as_object().expect("servers must be objects");
            let server_type = optional_string(server, "type").expect("server type is required");
            servers.insert(
                Address::parse(host).unwrap(),
                ServerOutcome {
                    set_name: optional_string(server, "setName"),
                    server_type: ServerType::from_str(&server_type).unwrap(),
                },
            );
        }
    }

    let topology_type = optional_string(object, "topologyType").expect("topologyType is required");

    Outcome {
        servers,
        set_name: optional_string(object, "setName"),
        topology_type: TopologyType::from_str(&topology_type).unwrap(),
        logical_session_timeout_minutes: object
            .get("logicalSessionTimeoutMinutes")
            .and_then(Value::as_u64),
        compatible: object.get("compatible").and_then(Value::as_bool),
    }
}

fn parse_phases(suite: &Map<String, Value>) -> Vec<Phase> {
    let phases = suite
        .get("phases")
        .and_then(Value::as_array)
        .expect("phases must be an array");

    phases
        .iter()
        .map(|phase| {
            let phase = phase.as_object().expect("phase must be an object");
            let responses = phase
                .get("responses")
                .and_then(Value::as_array)
                .map(|responses| {
                    responses
                        .iter()
                        .map(|response| {
                            let pair = response.as_array().expect("response must be a pair");
                            let host = pair[0].as_str().expect("host must be a string");
                            let reply = pair[1].as_object().expect("reply must be an object");
                            (Address::parse(host).unwrap(), to_document(reply))
                        })
                        .collect()
                })
                .unwrap_or_default();

            let outcome = phase
                .get("outcome")
                .and_then(Value::as_object)
                .expect("outcome must be an object");

            Phase {
                responses,
                outcome: parse_outcome(outcome),
            }
        })
        .collect()
}

fn simulated_network_error() -> Error {
    ErrorKind::Transport {
        kind: TransportErrorKind::Io,
        message: "simulated network error".to_string(),
    }
    .into()
}

/// Runs one fixture: applies each phase's responses to a fresh topology in order and checks the
/// outcome after every phase. An empty response stands for a failed check.
pub fn run_suite(file: &Path) {
    let json: Value = serde_json::from_reader(File::open(file).unwrap()).unwrap();
    let suite = json.as_object().expect("suite must be an object");
    let name = suite
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let uri = suite.get("uri").and_then(Value::as_str).expect("uri is required");
    let options = ClientOptions::parse(uri).unwrap();
    let mut topology = TopologyDescription::new(&options);

    for (i, phase) in parse_phases(suite).into_iter().enumerate() {
        for (address, reply) in phase.responses {
            let description = if reply.is_empty() {
                ServerDescription::new_from_error(address, simulated_network_error())
            } else {
                ServerDescription::from_hello_document(address, reply, None).unwrap()
            };
            topology.apply(description);
        }

        let context = format!("{} (phase {})", name, i);
        let outcome = phase.outcome;

        assert_eq!(
            outcome.servers.len(),
            topology.servers().len(),
            "{}: server count",
            context
        );
        for (address, expected) in outcome.servers.iter() {
            let actual = topology
                .server(address)
                .unwrap_or_else(|| panic!("{}: missing server {}", context, address));
            assert_eq!(expected.server_type, actual.server_type(), "{}: {}", context, address);
            assert_eq!(
                expected.set_name.as_ref().map(String::as_str),
                actual.set_name(),
                "{}: {}",
                context,
                address
            );
        }

        assert_eq!(
            outcome.set_name.as_ref().map(String::as_str),
            topology.set_name(),
            "{}: set name",
            context
        );
        assert_eq!(outcome.topology_type, topology.topology_type(), "{}: topology type", context);

        if let Some(minutes) = outcome.logical_session_timeout_minutes {
            assert_eq!(
                Some(std::time::Duration::from_secs(minutes * 60)),
                topology.logical_session_timeout(),
                "{}: session timeout",
                context
            );
        }
        if let Some(compatible) = outcome.compatible {
            assert_eq!(
                compatible,
                topology.compatibility_error().is_none(),
                "{}: compatibility",
                context
            );
        }
    }
}

/// Runs every fixture in a directory under `tests/data/sdam`.
pub fn run_dir(dir: &str) {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data/sdam")
        .join(dir);

    let mut ran = 0;
    for entry in fs::read_dir(&path).unwrap() {
        let file = entry.unwrap().path();
        if file.extension().map_or(false, |ext| ext == "json") {
            run_suite(&file);
            ran += 1;
        }
    }
    assert!(ran > 0, "no fixtures in {}", path.display());
}
