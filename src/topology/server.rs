use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{bson, doc, Bson, Document};
use chrono::{DateTime, Utc};

use crate::connstring::Address;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;

use super::monitor::{HelloReply, Monitor, MonitorHandle};

/// Describes the server role within a deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerType {
    /// Standalone server.
    Standalone,
    /// Shard router.
    Mongos,
    /// Replica set primary.
    RSPrimary,
    /// Replica set secondary.
    RSSecondary,
    /// Replica set arbiter.
    RSArbiter,
    /// Replica set member of some other type.
    RSOther,
    /// Replica set ghost member.
    RSGhost,
    /// A load balancer fronting a sharded cluster.
    LoadBalancer,
    /// Server type is currently unknown.
    Unknown,
}

impl ServerType {
    pub fn is_data_bearing(self) -> bool {
        match self {
            ServerType::Standalone
            | ServerType::Mongos
            | ServerType::RSPrimary
            | ServerType::RSSecondary
            | ServerType::LoadBalancer => true,
            _ => false,
        }
    }

    pub fn is_available(self) -> bool {
        self != ServerType::Unknown
    }

    pub fn is_writable(self) -> bool {
        match self {
            ServerType::Standalone
            | ServerType::Mongos
            | ServerType::RSPrimary
            | ServerType::LoadBalancer => true,
            _ => false,
        }
    }
}

impl FromStr for ServerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Standalone" => ServerType::Standalone,
            "Mongos" => ServerType::Mongos,
            "RSPrimary" => ServerType::RSPrimary,
            "RSSecondary" => ServerType::RSSecondary,
            "RSArbiter" => ServerType::RSArbiter,
            "RSOther" => ServerType::RSOther,
            "RSGhost" => ServerType::RSGhost,
            "LoadBalancer" => ServerType::LoadBalancer,
            "Unknown" => ServerType::Unknown,
            other => return Err(Error::invalid_argument(format!("unknown server type {}", other))),
        })
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

/// The `topologyVersion` a server reports: a process id plus a counter that increases with every
/// state change of that process.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyVersion {
    pub process_id: ObjectId,
    pub counter: i64,
}

impl TopologyVersion {
    pub(crate) fn from_document(doc: &Document) -> Option<TopologyVersion> {
        let process_id = match doc.get("processId") {
            Some(&Bson::ObjectId(ref oid)) => oid.clone(),
            _ => return None,
        };
        let counter = match doc.get("counter") {
            Some(&Bson::I64(counter)) => counter,
            Some(&Bson::I32(counter)) => i64::from(counter),
            _ => return None,
        };
        Some(TopologyVersion {
            process_id,
            counter,
        })
    }

    pub(crate) fn to_document(&self) -> Document {
        doc! {
            "processId": self.process_id.clone(),
            "counter": self.counter,
        }
    }

    /// Whether `self` is older than `other`. Versions from different processes are never stale
    /// relative to each other.
    pub fn is_stale_compared_to(&self, other: &TopologyVersion) -> bool {
        self.process_id == other.process_id && self.counter < other.counter
    }
}

/// Server information gathered from server monitoring.
///
/// Descriptions are immutable; every check produces a new one. Round trip and update times are
/// informational and are ignored when comparing two descriptions.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub(crate) address: Address,
    pub(crate) server_type: ServerType,
    pub(crate) round_trip_time: Option<Duration>,
    pub(crate) last_update_time: Option<DateTime<Utc>>,
    pub(crate) min_wire_version: i32,
    pub(crate) max_wire_version: i32,
    pub(crate) me: Option<Address>,
    pub(crate) hosts: Vec<Address>,
    pub(crate) passives: Vec<Address>,
    pub(crate) arbiters: Vec<Address>,
    pub(crate) tags: BTreeMap<String, String>,
    pub(crate) set_name: Option<String>,
    pub(crate) set_version: Option<i32>,
    pub(crate) election_id: Option<ObjectId>,
    pub(crate) primary: Option<Address>,
    pub(crate) last_write_date: Option<DateTime<Utc>>,
    pub(crate) logical_session_timeout: Option<Duration>,
    pub(crate) topology_version: Option<TopologyVersion>,
    pub(crate) max_write_batch_size: Option<i64>,
    pub(crate) error: Option<Error>,
}

impl ServerDescription {
    /// Returns an unknown server description for an address that hasn't been checked yet.
    pub fn new(address: Address) -> ServerDescription {
        ServerDescription {
            address,
            server_type: ServerType::Unknown,
            round_trip_time: None,
            last_update_time: None,
            min_wire_version: 0,
            max_wire_version: 0,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            last_write_date: None,
            logical_session_timeout: None,
            topology_version: None,
            max_write_batch_size: None,
            error: None,
        }
    }

    /// An unknown description recording why the server could not be reached.
    pub fn new_from_error(address: Address, error: Error) -> ServerDescription {
        let mut description = ServerDescription::new(address);
        description.topology_version = error.topology_version().cloned();
        description.last_update_time = Some(Utc::now());
        description.error = Some(error);
        description
    }

    pub(crate) fn new_load_balancer(address: Address) -> ServerDescription {
        let mut description = ServerDescription::new(address);
        description.server_type = ServerType::LoadBalancer;
        description
    }

    /// Classifies a server from its handshake reply.
    pub fn from_hello(
        address: Address,
        reply: &HelloReply,
        round_trip_time: Option<Duration>,
    ) -> ServerDescription {
        let server_type = if reply.msg.as_ref().map(String::as_str) == Some("isdbgrid") {
            ServerType::Mongos
        } else if reply.set_name.is_some() {
            if reply.hidden {
                ServerType::RSOther
            } else if reply.is_writable_primary {
                ServerType::RSPrimary
            } else if reply.secondary {
                ServerType::RSSecondary
            } else if reply.arbiter_only {
                ServerType::RSArbiter
            } else {
                ServerType::RSOther
            }
        } else if reply.is_replica_set {
            ServerType::RSGhost
        } else {
            ServerType::Standalone
        };

        ServerDescription {
            address,
            server_type,
            round_trip_time,
            last_update_time: Some(Utc::now()),
            min_wire_version: reply.min_wire_version,
            max_wire_version: reply.max_wire_version,
            me: reply.me.clone(),
            hosts: reply.hosts.clone(),
            passives: reply.passives.clone(),
            arbiters: reply.arbiters.clone(),
            tags: reply.tags.clone(),
            set_name: reply.set_name.clone(),
            set_version: reply.set_version,
            election_id: reply.election_id.clone(),
            primary: reply.primary.clone(),
            last_write_date: reply.last_write_date,
            logical_session_timeout: reply.logical_session_timeout,
            topology_version: reply.topology_version.clone(),
            max_write_batch_size: reply.max_write_batch_size,
            error: None,
        }
    }

    /// Parses a raw handshake reply document and classifies the server from it.
    pub fn from_hello_document(
        address: Address,
        reply: Document,
        round_trip_time: Option<Duration>,
    ) -> Result<ServerDescription> {
        let reply = HelloReply::parse(&address, reply)?;
        Ok(ServerDescription::from_hello(address, &reply, round_trip_time))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.last_update_time
    }

    pub fn min_wire_version(&self) -> i32 {
        self.min_wire_version
    }

    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_ref().map(String::as_str)
    }

    pub fn set_version(&self) -> Option<i32> {
        self.set_version
    }

    pub fn election_id(&self) -> Option<&ObjectId> {
        self.election_id.as_ref()
    }

    pub fn primary(&self) -> Option<&Address> {
        self.primary.as_ref()
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn last_write_date(&self) -> Option<DateTime<Utc>> {
        self.last_write_date
    }

    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        self.topology_version.as_ref()
    }

    pub fn max_write_batch_size(&self) -> Option<i64> {
        self.max_write_batch_size
    }

    /// The error from the most recent failed check, if that check failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Every member this server reports for its replica set.
    pub fn known_hosts(&self) -> HashSet<&Address> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
            .collect()
    }

    /// Whether the server reports a `me` different from the address it was reached at.
    pub(crate) fn invalid_me(&self) -> bool {
        match self.me {
            Some(ref me) => me != &self.address,
            None => false,
        }
    }

    pub(crate) fn supports_retryable_writes(&self) -> bool {
        match self.server_type {
            ServerType::LoadBalancer => true,
            ServerType::Standalone | ServerType::Unknown => false,
            _ => self.logical_session_timeout.is_some() && self.max_wire_version >= 6,
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &BTreeMap<String, String>) -> bool {
        tag_set
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        let error_message = |desc: &ServerDescription| desc.error.as_ref().map(|e| e.to_string());

        self.address == other.address
            && self.server_type == other.server_type
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
            && self.me == other.me
            && self.hosts == other.hosts
            && self.passives == other.passives
            && self.arbiters == other.arbiters
            && self.tags == other.tags
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.primary == other.primary
            && self.logical_session_timeout == other.logical_session_timeout
            && self.topology_version == other.topology_version
            && error_message(self) == error_message(other)
    }
}

/// Holds the connection pool and monitor of a single server in the topology.
///
/// A server's description lives in the topology description, not here, so that every
/// description change goes through the same state machine.
pub struct Server {
    address: Address,
    pool: ConnectionPool,
    monitor: Option<MonitorHandle>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("monitored", &self.monitor.is_some())
            .finish()
    }
}

impl Server {
    pub(crate) fn new(
        address: Address,
        pool: ConnectionPool,
        monitor: Option<MonitorHandle>,
    ) -> Arc<Server> {
        Arc::new(Server {
            address,
            pool,
            monitor,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// What this server's monitor saw on its latest check. `None` before the first check
    /// completes, and always in load balanced mode where servers are not monitored.
    pub fn last_checked_description(&self) -> Option<ServerDescription> {
        self.monitor
            .as_ref()
            .and_then(|monitor| monitor.current_description())
    }

    /// Wakes this server's monitor for an immediate check.
    pub(crate) fn request_check(&self) {
        if let Some(ref monitor) = self.monitor {
            monitor.request_check();
        }
    }

    pub(crate) fn start_monitor(&self, monitor: Monitor) {
        if let Some(ref handle) = self.monitor {
            handle.spawn(monitor);
        }
    }

    /// Stops the monitor and closes the pool without waiting for the monitor thread.
    pub(crate) fn close(&self) {
        if let Some(ref monitor) = self.monitor {
            monitor.stop();
        }
        self.pool.close();
    }

    /// Waits for the monitor thread to exit. A no-op when called from that thread.
    pub(crate) fn join(&self) {
        if let Some(ref monitor) = self.monitor {
            monitor.join();
        }
    }
}
