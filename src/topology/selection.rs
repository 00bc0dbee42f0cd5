//! Server selection over a topology description.
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::common::{ReadMode, ReadPreference, ServerSelector};
use crate::connstring::Address;
use crate::error::{Error, Result};

use super::server::{ServerDescription, ServerType};
use super::{TopologyDescription, TopologyType};

impl TopologyDescription {
    /// Every server the selector accepts, before the latency window is applied.
    pub fn suitable_servers(&self, selector: &ServerSelector) -> Result<Vec<&Arc<ServerDescription>>> {
        if let Some(message) = self.compatibility_error() {
            return Err(Error::server_selection(message));
        }

        let available = self.servers().values().filter(|server| server.is_available());

        let suitable = match self.topology_type() {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => available.collect(),
            TopologyType::Sharded => available
                .filter(|server| server.server_type() == ServerType::Mongos)
                .collect(),
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                return Ok(self.suitable_replica_set_members(selector));
            }
        };

        Ok(match *selector {
            ServerSelector::Predicate(ref predicate) => suitable
                .into_iter()
                .filter(|server| predicate(server))
                .collect(),
            _ => suitable,
        })
    }

    fn servers_of_type(&self, server_type: ServerType) -> Vec<&Arc<ServerDescription>> {
        self.servers()
            .values()
            .filter(|server| server.server_type() == server_type)
            .collect()
    }

    fn suitable_replica_set_members(&self, selector: &ServerSelector) -> Vec<&Arc<ServerDescription>> {
        match *selector {
            ServerSelector::Writable => self.servers_of_type(ServerType::RSPrimary),
            ServerSelector::Predicate(ref predicate) => self
                .servers()
                .values()
                .filter(|server| server.server_type().is_data_bearing() && predicate(server))
                .collect(),
            ServerSelector::Read(ref read_preference) => self.suitable_for_read(read_preference),
        }
    }

    fn suitable_for_read(&self, read_preference: &ReadPreference) -> Vec<&Arc<ServerDescription>> {
        let primaries = self.servers_of_type(ServerType::RSPrimary);
        let secondaries = || {
            filter_by_tags(
                self.servers_of_type(ServerType::RSSecondary),
                &read_preference.tag_sets,
            )
        };

        match read_preference.mode {
            ReadMode::Primary => primaries,
            ReadMode::PrimaryPreferred => {
                if primaries.is_empty() {
                    secondaries()
                } else {
                    primaries
                }
            }
            ReadMode::Secondary => secondaries(),
            ReadMode::SecondaryPreferred => {
                let secondaries = secondaries();
                if secondaries.is_empty() {
                    primaries
                } else {
                    secondaries
                }
            }
            ReadMode::Nearest => {
                let mut members = primaries;
                members.extend(self.servers_of_type(ServerType::RSSecondary));
                filter_by_tags(members, &read_preference.tag_sets)
            }
        }
    }

    /// Picks one server for the selector at random from within the latency window.
    ///
    /// Servers in `deprioritized` are only chosen in a sharded topology when no other mongos is
    /// suitable. Returns `Ok(None)` when nothing is currently suitable, and an error when the
    /// topology can never satisfy the selector as it stands.
    pub fn select_server(
        &self,
        selector: &ServerSelector,
        deprioritized: &[Address],
    ) -> Result<Option<Arc<ServerDescription>>> {
        let mut suitable = self.suitable_servers(selector)?;

        if self.topology_type() == TopologyType::Sharded && !deprioritized.is_empty() {
            let preferred: Vec<_> = suitable
                .iter()
                .cloned()
                .filter(|server| !deprioritized.contains(server.address()))
                .collect();
            if !preferred.is_empty() {
                suitable = preferred;
            }
        }

        let in_window = latency_window(suitable, self.local_threshold());
        Ok(in_window
            .choose(&mut rand::thread_rng())
            .map(|server| Arc::clone(server)))
    }
}

// Applies the first tag set that matches at least one server.
fn filter_by_tags<'a>(
    servers: Vec<&'a Arc<ServerDescription>>,
    tag_sets: &[crate::common::TagSet],
) -> Vec<&'a Arc<ServerDescription>> {
    if tag_sets.is_empty() {
        return servers;
    }

    for tag_set in tag_sets {
        let matching: Vec<_> = servers
            .iter()
            .cloned()
            .filter(|server| server.matches_tag_set(tag_set))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }

    Vec::new()
}

/// Keeps the servers whose round trip time is within `local_threshold` of the fastest one.
/// Servers without a measured round trip time are always kept.
pub fn latency_window(
    servers: Vec<&Arc<ServerDescription>>,
    local_threshold: Duration,
) -> Vec<&Arc<ServerDescription>> {
    let fastest = match servers.iter().filter_map(|s| s.round_trip_time()).min() {
        Some(fastest) => fastest,
        None => return servers,
    };
    let limit = fastest + local_threshold;

    servers
        .into_iter()
        .filter(|server| server.round_trip_time().map_or(true, |rtt| rtt <= limit))
        .collect()
}
