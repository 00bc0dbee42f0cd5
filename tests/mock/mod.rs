//! An in-memory deployment standing in for real servers.
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use bson::{bson, doc, Bson, Document};

use mongodb_cluster::apm::{CmapEvent, EventHandler, SdamEvent};
use mongodb_cluster::connstring::Address;
use mongodb_cluster::stream::{Channel, ConnectOptions, Transport};
use mongodb_cluster::{ClientOptions, Cluster, Error, Result};

pub fn address(host: &str) -> Address {
    Address::parse(host).unwrap()
}

pub fn standalone() -> Document {
    doc! {
        "ismaster": true,
        "minWireVersion": 0,
        "maxWireVersion": 13,
        "logicalSessionTimeoutMinutes": 30,
    }
}

pub fn primary(set_name: &str, hosts: &[&str]) -> Document {
    let hosts: Vec<Bson> = hosts.iter().map(|host| Bson::String(host.to_string())).collect();
    doc! {
        "ismaster": true,
        "setName": set_name,
        "hosts": hosts,
        "minWireVersion": 0,
        "maxWireVersion": 13,
        "logicalSessionTimeoutMinutes": 30,
    }
}

pub fn secondary(set_name: &str, hosts: &[&str]) -> Document {
    let mut reply = primary(set_name, hosts);
    reply.insert("ismaster", false);
    reply.insert("secondary", true);
    reply
}

pub fn load_balancer() -> Document {
    let mut reply = standalone();
    reply.insert("serviceId", ObjectId::new().unwrap());
    reply
}

pub fn with_wire_version(mut reply: Document, max_wire_version: i32) -> Document {
    reply.insert("maxWireVersion", max_wire_version);
    reply
}

/// What a fail point does to the command it catches.
#[derive(Clone, Debug)]
pub enum Failure {
    Network,
    Timeout,
    /// Replies with this document instead of running the command.
    Reply(Document),
    /// Runs the command, then drops the reply on the floor.
    NetworkAfterApply,
}

pub fn command_error(code: i32, labels: &[&str]) -> Failure {
    let labels: Vec<Bson> = labels.iter().map(|label| Bson::String(label.to_string())).collect();
    Failure::Reply(doc! {
        "ok": 0,
        "code": code,
        "errmsg": format!("simulated error {}", code),
        "errorLabels": labels,
    })
}

struct FailPoint {
    command: String,
    remaining: usize,
    failure: Failure,
}

/// A command a mock server received, minus the handshakes.
#[derive(Clone, Debug)]
pub struct CommandRecord {
    pub address: Address,
    pub name: String,
    pub txn_number: Option<i64>,
    pub documents: usize,
}

#[derive(Default)]
struct DeploymentState {
    servers: HashMap<Address, Document>,
    fail_points: Vec<FailPoint>,
    collections: HashMap<String, Vec<Document>>,
    applied_writes: HashMap<i64, Document>,
    commands: Vec<CommandRecord>,
    connections: usize,
    connect_attempts: usize,
    // Connection attempts after the first `refuse_after` are refused while this is non-zero.
    refuse_after: usize,
    refusals: usize,
    handshake_delay: Option<Duration>,
}

impl DeploymentState {
    fn take_failure(&mut self, command: &str) -> Option<Failure> {
        let index = self
            .fail_points
            .iter()
            .position(|point| point.command == command && point.remaining > 0)?;
        let point = &mut self.fail_points[index];
        point.remaining -= 1;
        Some(point.failure.clone())
    }

    fn run(&mut self, name: &str, command: &Document) -> Document {
        match name {
            "insert" => {
                let txn_number = command.get_i64("txnNumber").ok();
                if let Some(reply) = txn_number.and_then(|txn| self.applied_writes.get(&txn)) {
                    return reply.clone();
                }

                let collection = command.get_str("insert").unwrap_or_default().to_string();
                let documents: Vec<Document> = command
                    .get_array("documents")
                    .map(|docs| {
                        docs.iter()
                            .filter_map(|doc| match *doc {
                                Bson::Document(ref doc) => Some(doc.clone()),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let inserted = documents.len() as i32;
                let reply = doc! { "ok": 1, "n": inserted };
                self.collections
                    .entry(collection)
                    .or_insert_with(Vec::new)
                    .extend(documents);
                if let Some(txn_number) = txn_number {
                    self.applied_writes.insert(txn_number, reply.clone());
                }
                reply
            }
            "find" => {
                let collection = command.get_str("find").unwrap_or_default();
                let batch: Vec<Bson> = self
                    .collections
                    .get(collection)
                    .map(|docs| docs.iter().cloned().map(Bson::Document).collect())
                    .unwrap_or_default();
                doc! {
                    "ok": 1,
                    "cursor": { "id": 0i64, "ns": collection, "firstBatch": batch },
                }
            }
            _ => doc! { "ok": 1 },
        }
    }
}

/// A set of fake servers sharing one data store.
#[derive(Clone, Default)]
pub struct Deployment {
    state: Arc<Mutex<DeploymentState>>,
}

impl Deployment {
    pub fn new() -> Deployment {
        Deployment::default()
    }

    /// Starts (or reconfigures) the server at `host` to answer handshakes with `hello`.
    pub fn set_server(&self, host: &str, hello: Document) {
        let mut state = self.state.lock().unwrap();
        state.servers.insert(address(host), hello);
    }

    /// Makes `host` unreachable. Open channels fail on their next command.
    pub fn stop_server(&self, host: &str) {
        self.state.lock().unwrap().servers.remove(&address(host));
    }

    pub fn fail_command(&self, command: &str, times: usize, failure: Failure) {
        self.state.lock().unwrap().fail_points.push(FailPoint {
            command: command.to_string(),
            remaining: times,
            failure,
        });
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn commands(&self, name: &str) -> Vec<CommandRecord> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|record| record.name == name)
            .cloned()
            .collect()
    }

    /// Lets the next `after` connection attempts through, then refuses `count` of them.
    pub fn refuse_connections(&self, after: usize, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.refuse_after = state.connect_attempts + after;
        state.refusals = count;
    }

    /// Holds every handshake reply back for `delay`.
    pub fn delay_handshakes(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().handshake_delay = delay;
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn cluster(&self, options: ClientOptions) -> Cluster {
        Cluster::builder(options)
            .transport(self.transport())
            .build()
            .unwrap()
    }

    pub fn cluster_with_events(&self, options: ClientOptions) -> (Cluster, Arc<EventRecorder>) {
        let recorder = Arc::new(EventRecorder::default());
        let cluster = Cluster::builder(options)
            .transport(self.transport())
            .event_handler(recorder.clone())
            .build()
            .unwrap();
        (cluster, recorder)
    }
}

impl Transport for Deployment {
    fn connect(&self, address: &Address, _options: &ConnectOptions) -> Result<Box<dyn Channel>> {
        let mut state = self.state.lock().unwrap();
        if !state.servers.contains_key(address) {
            return Err(network_error(io::ErrorKind::ConnectionRefused));
        }
        state.connect_attempts += 1;
        if state.connect_attempts > state.refuse_after && state.refusals > 0 {
            state.refusals -= 1;
            return Err(network_error(io::ErrorKind::ConnectionRefused));
        }
        state.connections += 1;
        Ok(Box::new(MockChannel {
            state: self.state.clone(),
            address: address.clone(),
        }))
    }
}

struct MockChannel {
    state: Arc<Mutex<DeploymentState>>,
    address: Address,
}

impl Channel for MockChannel {
    fn send_command(&mut self, command: &Document, _timeout: Option<Duration>) -> Result<Document> {
        let name = command.keys().next().cloned().unwrap_or_default();
        let mut state = self.state.lock().unwrap();

        let hello = match state.servers.get(&self.address) {
            Some(hello) => hello.clone(),
            None => return Err(network_error(io::ErrorKind::ConnectionReset)),
        };

        if name == "isMaster" || name == "hello" {
            let delay = state.handshake_delay;
            drop(state);
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            let mut reply = hello;
            reply.insert("ok", 1);
            return Ok(reply);
        }

        state.commands.push(CommandRecord {
            address: self.address.clone(),
            name: name.clone(),
            txn_number: command.get_i64("txnNumber").ok(),
            documents: command.get_array("documents").map(Vec::len).unwrap_or(0),
        });

        match state.take_failure(&name) {
            Some(Failure::Network) => Err(network_error(io::ErrorKind::ConnectionReset)),
            Some(Failure::Timeout) => Err(network_error(io::ErrorKind::TimedOut)),
            Some(Failure::Reply(reply)) => Ok(reply),
            Some(Failure::NetworkAfterApply) => {
                state.run(&name, command);
                Err(network_error(io::ErrorKind::ConnectionReset))
            }
            None => Ok(state.run(&name, command)),
        }
    }
}

fn network_error(kind: io::ErrorKind) -> Error {
    io::Error::new(kind, "simulated network failure").into()
}

/// Collects every event a cluster emits.
#[derive(Default)]
pub struct EventRecorder {
    sdam: Mutex<Vec<SdamEvent>>,
    cmap: Mutex<Vec<CmapEvent>>,
}

impl EventRecorder {
    pub fn sdam_events(&self) -> Vec<SdamEvent> {
        self.sdam.lock().unwrap().clone()
    }

    pub fn cmap_events(&self) -> Vec<CmapEvent> {
        self.cmap.lock().unwrap().clone()
    }
}

impl EventHandler for EventRecorder {
    fn handle_sdam_event(&self, event: &SdamEvent) {
        self.sdam.lock().unwrap().push(event.clone());
    }

    fn handle_cmap_event(&self, event: &CmapEvent) {
        self.cmap.lock().unwrap().push(event.clone());
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
