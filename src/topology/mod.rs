//! Server discovery: the topology description and the state machine that updates it.
//!
//! A `TopologyDescription` is a plain value. Monitors and application errors produce new server
//! descriptions, `apply` folds each one into the topology, and the cluster compares the old and
//! new topology to decide which servers to start or stop.
pub mod monitor;
pub mod selection;
pub mod server;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bson::oid::ObjectId;
use log::debug;

use crate::connstring::Address;
use crate::error::{Error, Result};
use crate::options::ClientOptions;

use self::server::{ServerDescription, ServerType};

/// Oldest wire version this crate can talk to (MongoDB 3.6).
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
/// Newest wire version this crate knows about.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

// From 6.0 on, replica sets order primaries by election id before set version.
const ELECTION_ID_PRIORITY_WIRE_VERSION: i32 = 17;

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    LoadBalanced,
    Unknown,
}

impl TopologyType {
    pub fn is_replica_set(self) -> bool {
        match self {
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => true,
            _ => false,
        }
    }
}

impl FromStr for TopologyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Single" => TopologyType::Single,
            "ReplicaSetNoPrimary" => TopologyType::ReplicaSetNoPrimary,
            "ReplicaSetWithPrimary" => TopologyType::ReplicaSetWithPrimary,
            "Sharded" => TopologyType::Sharded,
            "LoadBalanced" => TopologyType::LoadBalanced,
            "Unknown" => TopologyType::Unknown,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown topology type {}",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for TopologyType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

/// Servers that appeared in, left, or changed within a topology between two descriptions.
#[derive(Debug, Default)]
pub struct TopologyDiff {
    pub added: Vec<Address>,
    pub removed: Vec<Address>,
    pub changed: Vec<(Arc<ServerDescription>, Arc<ServerDescription>)>,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Topology information gathered from server set monitoring.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyDescription {
    topology_type: TopologyType,
    /// The replica set name, once configured or discovered.
    set_name: Option<String>,
    // The largest set version and election id seen from a primary.
    max_set_version: Option<i32>,
    max_election_id: Option<ObjectId>,
    servers: HashMap<Address, Arc<ServerDescription>>,
    compatibility_error: Option<String>,
    logical_session_timeout: Option<Duration>,
    local_threshold: Duration,
    heartbeat_frequency: Duration,
}

fn election_key(election_id: Option<&ObjectId>) -> Option<[u8; 12]> {
    election_id.map(ObjectId::bytes)
}

impl TopologyDescription {
    /// The initial description for a set of options, before any server has been checked.
    pub fn new(options: &ClientOptions) -> TopologyDescription {
        let topology_type = if options.load_balanced {
            TopologyType::LoadBalanced
        } else if options.is_direct() {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers = options
            .hosts
            .iter()
            .map(|address| {
                let description = if options.load_balanced {
                    ServerDescription::new_load_balancer(address.clone())
                } else {
                    ServerDescription::new(address.clone())
                };
                (address.clone(), Arc::new(description))
            })
            .collect();

        TopologyDescription {
            topology_type,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            servers,
            compatibility_error: None,
            logical_session_timeout: None,
            local_threshold: options.local_threshold,
            heartbeat_frequency: options.heartbeat_frequency,
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_ref().map(String::as_str)
    }

    pub fn max_set_version(&self) -> Option<i32> {
        self.max_set_version
    }

    pub fn max_election_id(&self) -> Option<&ObjectId> {
        self.max_election_id.as_ref()
    }

    pub fn servers(&self) -> &HashMap<Address, Arc<ServerDescription>> {
        &self.servers
    }

    pub fn server(&self, address: &Address) -> Option<&Arc<ServerDescription>> {
        self.servers.get(address)
    }

    pub fn server_addresses(&self) -> impl Iterator<Item = &Address> {
        self.servers.keys()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.servers.contains_key(address)
    }

    /// Why the deployment can't be used by this crate, if some server's wire versions fall
    /// outside the supported range.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_ref().map(String::as_str)
    }

    /// The minimum session timeout across data-bearing servers, or `None` if any of them
    /// doesn't support sessions.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    pub fn local_threshold(&self) -> Duration {
        self.local_threshold
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_frequency
    }

    pub fn has_primary(&self) -> bool {
        self.servers
            .values()
            .any(|server| server.server_type == ServerType::RSPrimary)
    }

    pub fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    /// Whether an error reported by a server predates the description we already have of it,
    /// in which case it says nothing about the server's current state.
    pub fn is_stale_error(&self, address: &Address, error: &Error) -> bool {
        match (
            self.servers.get(address).and_then(|s| s.topology_version()),
            error.topology_version(),
        ) {
            (Some(current), Some(reported)) => {
                reported.process_id == current.process_id && reported.counter <= current.counter
            }
            _ => false,
        }
    }

    /// Whether the servers in this topology support retryable writes.
    pub fn supports_retryable_writes(&self) -> bool {
        match self.topology_type {
            TopologyType::Single => self
                .servers
                .values()
                .all(|server| server.supports_retryable_writes()),
            TopologyType::LoadBalanced => true,
            _ => self.logical_session_timeout.is_some(),
        }
    }

    /// Folds a new server description into the topology. Returns `false` if the description
    /// was discarded: its server isn't part of the topology, it is older than the description
    /// already recorded, or it comes from a primary that has since been superseded.
    pub fn apply(&mut self, description: ServerDescription) -> bool {
        let address = description.address.clone();

        if self.topology_type == TopologyType::LoadBalanced {
            return false;
        }

        match self.servers.get(&address) {
            None => return false,
            Some(current) => {
                if let (Some(current), Some(incoming)) =
                    (current.topology_version(), description.topology_version())
                {
                    if incoming.is_stale_compared_to(current) {
                        debug!(
                            "ignoring description of {} with stale topology version",
                            address
                        );
                        return false;
                    }
                }
            }
        }

        if description.server_type == ServerType::RSPrimary
            && self.topology_type != TopologyType::Single
            && self.is_stale_primary(&description)
        {
            debug!(
                "ignoring stale primary {} (set version {:?}, election id {:?})",
                address, description.set_version, description.election_id
            );
            return false;
        }

        let description = Arc::new(description);
        self.servers.insert(address, description.clone());

        match self.topology_type {
            TopologyType::Single => self.update_single(&description),
            TopologyType::Unknown => self.update_unknown_topology(&description),
            TopologyType::Sharded => self.update_sharded_topology(&description),
            TopologyType::ReplicaSetNoPrimary => self.update_replica_set_no_primary(&description),
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary(&description)
            }
            TopologyType::LoadBalanced => {}
        }

        self.update_logical_session_timeout();
        self.check_compatibility();
        true
    }

    /// Compares `self`, the older description, with `other`.
    pub fn diff(&self, other: &TopologyDescription) -> TopologyDiff {
        let mut diff = TopologyDiff::default();

        for (address, previous) in &self.servers {
            match other.servers.get(address) {
                None => diff.removed.push(address.clone()),
                Some(new) if new != previous => diff.changed.push((previous.clone(), new.clone())),
                Some(_) => {}
            }
        }

        for address in other.servers.keys() {
            if !self.servers.contains_key(address) {
                diff.added.push(address.clone());
            }
        }

        diff
    }

    fn remove(&mut self, address: &Address) {
        self.servers.remove(address);
    }

    // Sets the correct replica set topology type.
    fn check_if_has_primary(&mut self) {
        self.topology_type = if self.has_primary() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn update_single(&mut self, description: &ServerDescription) {
        if let Some(ref set_name) = self.set_name {
            if description.is_available() && description.set_name() != Some(set_name.as_str()) {
                let error = Error::configuration(format!(
                    "server {} reports replica set name {:?}, expected {}",
                    description.address,
                    description.set_name(),
                    set_name
                ));
                self.servers.insert(
                    description.address.clone(),
                    Arc::new(ServerDescription::new_from_error(
                        description.address.clone(),
                        error,
                    )),
                );
            }
        }
    }

    fn update_unknown_topology(&mut self, description: &ServerDescription) {
        match description.server_type {
            ServerType::Standalone => self.update_unknown_with_standalone(description),
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RSPrimary => self.update_rs_from_primary(description),
            ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary(description);
            }
            ServerType::Unknown | ServerType::RSGhost | ServerType::LoadBalancer => {}
        }
    }

    // A standalone in a multi-seed topology is a misconfiguration; drop it.
    fn update_unknown_with_standalone(&mut self, description: &ServerDescription) {
        if self.servers.len() == 1 {
            self.topology_type = TopologyType::Single;
        } else {
            self.remove(&description.address);
        }
    }

    // Mongos nodes are independent; nothing reported by one affects the others.
    fn update_sharded_topology(&mut self, description: &ServerDescription) {
        match description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => self.remove(&description.address),
        }
    }

    fn update_replica_set_no_primary(&mut self, description: &ServerDescription) {
        match description.server_type {
            ServerType::Standalone | ServerType::Mongos => self.remove(&description.address),
            ServerType::RSPrimary => self.update_rs_from_primary(description),
            ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                self.update_rs_without_primary(description)
            }
            ServerType::Unknown | ServerType::RSGhost | ServerType::LoadBalancer => {}
        }
    }

    fn update_replica_set_with_primary(&mut self, description: &ServerDescription) {
        match description.server_type {
            ServerType::Standalone | ServerType::Mongos => {
                self.remove(&description.address);
                self.check_if_has_primary();
            }
            ServerType::RSPrimary => self.update_rs_from_primary(description),
            ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                self.update_rs_with_primary_from_member(description)
            }
            ServerType::Unknown | ServerType::RSGhost | ServerType::LoadBalancer => {
                self.check_if_has_primary()
            }
        }
    }

    // Adopts the reported set name, or reports whether it conflicts with the known one.
    fn set_name_matches(&mut self, description: &ServerDescription) -> bool {
        match self.set_name {
            None => {
                self.set_name = description.set_name.clone();
                true
            }
            Some(ref set_name) => description.set_name() == Some(set_name.as_str()),
        }
    }

    fn update_rs_without_primary(&mut self, description: &ServerDescription) {
        if !self.set_name_matches(description) {
            self.remove(&description.address);
            return;
        }

        self.add_new_servers(description.known_hosts());

        if description.invalid_me() {
            self.remove(&description.address);
        }
    }

    fn update_rs_with_primary_from_member(&mut self, description: &ServerDescription) {
        if !self.set_name_matches(description) || description.invalid_me() {
            self.remove(&description.address);
        }
        self.check_if_has_primary();
    }

    // Whether a primary reports an older (set version, election id) than one already seen.
    fn is_stale_primary(&self, description: &ServerDescription) -> bool {
        let election_id = election_key(description.election_id.as_ref());
        let max_election_id = election_key(self.max_election_id.as_ref());

        if description.max_wire_version >= ELECTION_ID_PRIORITY_WIRE_VERSION {
            (election_id, description.set_version) < (max_election_id, self.max_set_version)
        } else {
            match (description.set_version, election_id) {
                (Some(set_version), Some(election_id)) => match self.max_set_version {
                    Some(max_set_version) if max_set_version > set_version => true,
                    Some(max_set_version) if max_set_version == set_version => {
                        max_election_id.map_or(false, |max| max > election_id)
                    }
                    _ => false,
                },
                _ => false,
            }
        }
    }

    fn record_primary_versions(&mut self, description: &ServerDescription) {
        if description.max_wire_version >= ELECTION_ID_PRIORITY_WIRE_VERSION {
            self.max_election_id = description.election_id.clone();
            self.max_set_version = description.set_version;
            return;
        }

        if description.election_id.is_some() {
            self.max_election_id = description.election_id.clone();
        }
        if let Some(set_version) = description.set_version {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }
    }

    // Updates a replica set topology with a new primary server description. The primary's
    // member list is authoritative: missing members are added and unlisted ones removed.
    fn update_rs_from_primary(&mut self, description: &ServerDescription) {
        if !self.set_name_matches(description) {
            self.remove(&description.address);
            self.check_if_has_primary();
            return;
        }

        self.record_primary_versions(description);

        // Invalidate any old primaries.
        let deposed: Vec<Address> = self
            .servers
            .iter()
            .filter(|&(address, server)| {
                address != &description.address && server.server_type == ServerType::RSPrimary
            })
            .map(|(address, _)| address.clone())
            .collect();
        for address in deposed {
            debug!("{} superseded by new primary {}", address, description.address);
            self.servers.insert(
                address.clone(),
                Arc::new(ServerDescription::new(address)),
            );
        }

        let known_hosts = description.known_hosts();
        self.add_new_servers(known_hosts.iter().cloned());

        let unlisted: Vec<Address> = self
            .servers
            .keys()
            .filter(|address| !known_hosts.contains(address))
            .cloned()
            .collect();
        for address in unlisted {
            self.remove(&address);
        }

        self.check_if_has_primary();
    }

    fn add_new_servers<'a, I>(&mut self, addresses: I)
    where
        I: IntoIterator<Item = &'a Address>,
    {
        for address in addresses {
            if !self.servers.contains_key(address) {
                self.servers.insert(
                    address.clone(),
                    Arc::new(ServerDescription::new(address.clone())),
                );
            }
        }
    }

    fn update_logical_session_timeout(&mut self) {
        let mut timeout: Option<Duration> = None;
        for server in self.servers.values() {
            if !server.is_available() || !server.server_type.is_data_bearing() {
                continue;
            }
            match server.logical_session_timeout {
                None => {
                    self.logical_session_timeout = None;
                    return;
                }
                Some(server_timeout) => {
                    timeout = Some(timeout.map_or(server_timeout, |t| t.min(server_timeout)))
                }
            }
        }
        self.logical_session_timeout = timeout;
    }

    fn check_compatibility(&mut self) {
        self.compatibility_error = None;
        for server in self.servers.values() {
            if !server.is_available() {
                continue;
            }

            if server.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
                self.compatibility_error = Some(format!(
                    "server at {} requires wire version {}, but this driver only supports up to {}",
                    server.address, server.min_wire_version, MAX_SUPPORTED_WIRE_VERSION
                ));
                return;
            }

            if server.max_wire_version < MIN_SUPPORTED_WIRE_VERSION {
                self.compatibility_error = Some(format!(
                    "server at {} reports wire version {}, but this driver requires at least {}",
                    server.address, server.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
                ));
                return;
            }
        }
    }
}
