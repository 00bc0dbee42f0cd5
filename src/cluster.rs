//! The cluster: every known server, its pool and monitor, and the topology they feed.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Instant;

use bson::spec::BinarySubtype;
use bson::{bson, doc, Bson, Document};
use log::{debug, info, warn};

use crate::apm::{EventHandler, Listener, SdamEvent};
use crate::auth::Authenticator;
use crate::common::ServerSelector;
use crate::connection::ConnectionEstablisher;
use crate::connstring::{Address, ServiceId};
use crate::error::{Error, Result};
use crate::options::ClientOptions;
use crate::pool::{ConnectionPool, PoolOptions, PoolTransition, PooledConnection};
use crate::stream::{Transport, WireTransport};
use crate::topology::monitor::{Monitor, MonitorOptions};
use crate::topology::server::{Server, ServerDescription};
use crate::topology::{TopologyDescription, TopologyType};

/// How far an application connection got when an error happened on it. Decides how the error
/// affects the server's description and pool.
#[derive(Clone, Debug, PartialEq)]
pub enum HandshakePhase {
    /// Before the handshake reply arrived. `generation` is the pool generation when the
    /// connection was requested.
    PreHello { generation: u32 },
    /// The handshake succeeded but authentication did not.
    PostHello { generation: u32 },
    /// On an established connection.
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
        service_id: Option<ServiceId>,
    },
}

impl HandshakePhase {
    fn generation(&self) -> u32 {
        match *self {
            HandshakePhase::PreHello { generation }
            | HandshakePhase::PostHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => generation,
        }
    }

    fn service_id(&self) -> Option<&ServiceId> {
        match *self {
            HandshakePhase::AfterCompletion { ref service_id, .. } => service_id.as_ref(),
            _ => None,
        }
    }

    fn max_wire_version(&self) -> Option<i32> {
        match *self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(max_wire_version),
            _ => None,
        }
    }
}

struct ClusterState {
    description: TopologyDescription,
    servers: HashMap<Address, Arc<Server>>,
}

// Work from a topology change that runs once the lock is released, so that event handlers
// may call back into the cluster.
#[derive(Default)]
struct TopologyUpdate {
    // SDAM and pool events in the order they happened.
    events: Vec<Deferred>,
    monitors: Vec<(Arc<Server>, Monitor)>,
    removed: Vec<Arc<Server>>,
}

enum Deferred {
    Sdam(SdamEvent),
    Pool(PoolTransition),
}

impl TopologyUpdate {
    fn sdam(&mut self, event: SdamEvent) {
        self.events.push(Deferred::Sdam(event));
    }

    fn pool(&mut self, transition: PoolTransition) {
        self.events.push(Deferred::Pool(transition));
    }
}

pub(crate) struct ClusterInner {
    options: ClientOptions,
    establisher: Arc<ConnectionEstablisher>,
    listener: Arc<Listener>,
    state: Mutex<ClusterState>,
    // Signalled on every topology change so that server selection can re-run.
    topology_changed: Condvar,
    closed: AtomicBool,
    session_id: Document,
    txn_number: AtomicI64,
}

/// Pushes monitor results into the cluster. Holds a weak reference so monitor threads never
/// keep a closed cluster alive.
#[derive(Clone)]
pub(crate) struct TopologyUpdater {
    inner: Weak<ClusterInner>,
}

impl TopologyUpdater {
    /// Applies a successful check. Returns whether the topology accepted the description.
    pub(crate) fn update(&self, description: ServerDescription) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.update(description),
            None => false,
        }
    }

    /// A failed check marks the server unknown and clears its pool.
    pub(crate) fn handle_monitor_error(&self, address: &Address, error: Error) {
        if let Some(inner) = self.inner.upgrade() {
            inner.mark_server_unknown(address, &error, true);
        }
    }
}

/// Builds a cluster with a custom transport, authenticator or event handlers.
pub struct ClusterBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn Transport>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl ClusterBuilder {
    pub fn new(options: ClientOptions) -> ClusterBuilder {
        ClusterBuilder {
            options,
            transport: None,
            authenticator: None,
            handlers: Vec::new(),
        }
    }

    /// Replaces the default TCP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> ClusterBuilder {
        self.transport = Some(transport);
        self
    }

    /// Authenticates every pooled connection when the options carry a credential.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> ClusterBuilder {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> ClusterBuilder {
        self.handlers.push(handler);
        self
    }

    /// Validates the options and starts monitoring every seed.
    pub fn build(self) -> Result<Cluster> {
        self.options.validate()?;
        if self.options.credential.is_some() && self.authenticator.is_none() {
            return Err(Error::configuration(
                "a credential was supplied but no authenticator is configured",
            ));
        }

        let listener = Arc::new(Listener::new());
        for handler in self.handlers {
            listener.add_handler(handler)?;
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WireTransport::default()));
        let establisher = Arc::new(ConnectionEstablisher::new(
            transport,
            &self.options,
            self.authenticator,
        ));

        let description = TopologyDescription::new(&self.options);
        let inner = Arc::new(ClusterInner {
            options: self.options,
            establisher,
            listener,
            state: Mutex::new(ClusterState {
                description: description.clone(),
                servers: HashMap::new(),
            }),
            topology_changed: Condvar::new(),
            closed: AtomicBool::new(false),
            session_id: new_session_id(),
            txn_number: AtomicI64::new(0),
        });

        let mut update = TopologyUpdate::default();
        {
            let mut state = inner.lock()?;
            for address in description.server_addresses() {
                let server = inner.start_server(address, &mut update);
                state.servers.insert(address.clone(), server);
            }
        }
        inner.finish(update);

        info!(
            "started cluster of type {} with seeds {:?}",
            description.topology_type(),
            description.server_addresses().collect::<Vec<_>>()
        );

        Ok(Cluster { inner })
    }
}

// A random version 4 UUID identifying the cluster's implicit session.
fn new_session_id() -> Document {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    doc! { "id": Bson::Binary(BinarySubtype::Uuid, bytes.to_vec()) }
}

impl ClusterInner {
    fn lock(&self) -> Result<MutexGuard<ClusterState>> {
        Ok(self.state.lock()?)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // The server's monitor only starts in `finish`, after the pool created event is out.
    fn start_server(self: &Arc<Self>, address: &Address, update: &mut TopologyUpdate) -> Arc<Server> {
        update.sdam(SdamEvent::ServerOpening {
            address: address.clone(),
        });

        let (pool, created) = ConnectionPool::new(
            address.clone(),
            PoolOptions::from_client_options(&self.options),
            self.establisher.clone(),
            self.listener.clone(),
        );
        update.pool(created);

        if self.options.load_balanced {
            update.pool(pool.mark_ready());
            debug!("started server {}", address);
            return Server::new(address.clone(), pool, None);
        }

        let (handle, monitor) = Monitor::new(
            address.clone(),
            self.establisher.clone(),
            TopologyUpdater {
                inner: Arc::downgrade(self),
            },
            self.listener.clone(),
            MonitorOptions {
                heartbeat_frequency: self.options.heartbeat_frequency,
                connect_timeout: self.options.connect_timeout,
                mode: self.options.server_monitoring_mode,
            },
        );
        let server = Server::new(address.clone(), pool, Some(handle));
        update.monitors.push((server.clone(), monitor));
        debug!("started server {}", address);
        server
    }

    // Applies a description under the cluster lock. Servers the topology gained are started,
    // servers it lost are detached for closing, and pools of servers that became available are
    // marked ready.
    fn apply_locked(
        self: &Arc<Self>,
        state: &mut ClusterState,
        description: ServerDescription,
        update: &mut TopologyUpdate,
    ) -> bool {
        let previous = state.description.clone();
        if !state.description.apply(description) {
            return false;
        }

        let diff = previous.diff(&state.description);
        for address in &diff.added {
            let server = self.start_server(address, update);
            state.servers.insert(address.clone(), server);
        }

        for address in &diff.removed {
            if let Some(server) = state.servers.remove(address) {
                update.removed.push(server);
            }
        }

        for (old, new) in &diff.changed {
            if new.is_available() {
                if let Some(server) = state.servers.get(new.address()) {
                    update.pool(server.pool().mark_ready());
                }
            }
            update.sdam(SdamEvent::ServerDescriptionChanged {
                address: new.address().clone(),
                previous: old.clone(),
                new: new.clone(),
            });
        }

        if previous != state.description {
            if previous.topology_type() != state.description.topology_type() {
                info!(
                    "topology changed from {} to {}",
                    previous.topology_type(),
                    state.description.topology_type()
                );
            }
            update.sdam(SdamEvent::TopologyDescriptionChanged {
                previous,
                new: state.description.clone(),
            });
            self.topology_changed.notify_all();
        }
        true
    }

    // Emits events, starts new monitors and closes removed servers. Never called with the lock
    // held.
    fn finish(&self, update: TopologyUpdate) {
        for event in update.events {
            match event {
                Deferred::Sdam(event) => self.listener.emit_sdam(event),
                Deferred::Pool(transition) => transition.deliver(),
            }
        }
        for (server, monitor) in update.monitors {
            server.start_monitor(monitor);
        }
        for server in update.removed {
            debug!("removing server {}", server.address());
            server.close();
            self.listener.emit_sdam(SdamEvent::ServerClosed {
                address: server.address().clone(),
            });
        }
    }

    fn update(self: &Arc<Self>, description: ServerDescription) -> bool {
        let mut update = TopologyUpdate::default();
        let applied = match self.state.lock() {
            Ok(mut state) => {
                if self.is_closed() {
                    return false;
                }
                self.apply_locked(&mut state, description, &mut update)
            }
            Err(_) => false,
        };
        self.finish(update);
        applied
    }

    // Records `error` as the server's state. Pools are cleared after the description changes,
    // so no checkout can see a ready pool for an unknown server.
    fn mark_server_unknown(self: &Arc<Self>, address: &Address, error: &Error, clear_pool: bool) {
        let mut update = TopologyUpdate::default();
        if let Ok(mut state) = self.state.lock() {
            if self.is_closed() {
                return;
            }
            let description = ServerDescription::new_from_error(address.clone(), error.clone());
            if self.apply_locked(&mut state, description, &mut update) && clear_pool {
                if let Some(server) = state.servers.get(address) {
                    update.pool(server.pool().mark_cleared(None, Some(error)));
                }
            }
        }
        self.finish(update);
    }

    fn handle_application_error(
        self: &Arc<Self>,
        address: &Address,
        error: &Error,
        phase: &HandshakePhase,
    ) {
        let server = match self.state.lock() {
            Ok(state) => match state.servers.get(address) {
                Some(server) => server.clone(),
                None => return,
            },
            Err(_) => return,
        };

        let pool = server.pool();
        if pool.is_stale(phase.generation(), phase.service_id()) {
            debug!("ignoring error from stale connection to {}: {}", address, error);
            return;
        }

        if self.options.load_balanced {
            // Load balancers have no description to update; only the affected backend's
            // connections are dropped.
            let affects_pool = match *phase {
                HandshakePhase::AfterCompletion { .. } => error.is_non_timeout_network_error(),
                _ => error.is_network_error() || error.is_authentication_error(),
            };
            if affects_pool {
                pool.clear(phase.service_id(), Some(error));
            }
            return;
        }

        if error.is_state_change_error() {
            let stale = match self.state.lock() {
                Ok(state) => state.description.is_stale_error(address, error),
                Err(_) => true,
            };
            if stale {
                return;
            }

            let clear = self
                .options
                .state_change_policy
                .should_clear_pool(phase.max_wire_version(), error);
            warn!(
                "{} reported a state change ({}), marking it unknown{}",
                address,
                error,
                if clear { " and clearing its pool" } else { "" }
            );
            self.mark_server_unknown(address, error, clear);
            server.request_check();
            return;
        }

        let marks_unknown = match *phase {
            HandshakePhase::PreHello { .. } => error.is_network_error(),
            HandshakePhase::PostHello { .. } => {
                error.is_network_error() || error.is_authentication_error()
            }
            HandshakePhase::AfterCompletion { .. } => error.is_non_timeout_network_error(),
        };

        if marks_unknown {
            warn!("marking {} unknown after error: {}", address, error);
            self.mark_server_unknown(address, error, true);
        }
    }
}

// Stops monitors and pools of a cluster dropped without being closed.
impl Drop for ClusterInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(state) = self.state.get_mut() {
            for server in state.servers.values() {
                server.close();
            }
        }
    }
}

/// Client-side view of a MongoDB deployment.
///
/// Cloning is cheap and every clone shares the same servers. The cluster stops monitoring and
/// closes its pools when `close` is called.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("topology", &self.topology_description().topology_type())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Cluster {
    /// Starts a cluster with the default transport and no event handlers.
    pub fn new(options: ClientOptions) -> Result<Cluster> {
        ClusterBuilder::new(options).build()
    }

    pub fn builder(options: ClientOptions) -> ClusterBuilder {
        ClusterBuilder::new(options)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// A snapshot of the current topology.
    pub fn topology_description(&self) -> TopologyDescription {
        match self.inner.state.lock() {
            Ok(state) => state.description.clone(),
            Err(poisoned) => poisoned.into_inner().description.clone(),
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_description().topology_type()
    }

    pub fn server(&self, address: &Address) -> Option<Arc<Server>> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.servers.get(address).cloned())
    }

    pub fn server_description(&self, address: &Address) -> Option<Arc<ServerDescription>> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.description.server(address).cloned())
    }

    /// Whether the server is absent from the topology or its last known state is unknown.
    pub fn is_server_unknown(&self, address: &Address) -> bool {
        self.server_description(address)
            .map_or(true, |description| !description.is_available())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Applies a server description as if a monitor had produced it.
    pub fn update(&self, description: ServerDescription) -> bool {
        self.inner.update(description)
    }

    /// Marks a server unknown with the given error and clears its pool.
    pub fn mark_server_unknown(&self, address: &Address, error: &Error) {
        self.inner.mark_server_unknown(address, error, true);
    }

    /// Wakes every monitor for an immediate check.
    pub fn request_immediate_check(&self) {
        if let Ok(state) = self.inner.state.lock() {
            for server in state.servers.values() {
                server.request_check();
            }
        }
    }

    /// Updates the topology in response to an error on an application connection.
    ///
    /// Pure timeouts on established connections leave the server alone, as the operation may
    /// still complete. Other network errors mark the server unknown and clear its pool. State
    /// change errors also request an immediate check, and clear the pool according to the
    /// configured `StateChangePolicy`. Errors from connections older than the pool's current
    /// generation are ignored.
    pub fn handle_application_error(&self, address: &Address, error: &Error, phase: HandshakePhase) {
        self.inner.handle_application_error(address, error, &phase);
    }

    /// Selects a server matching `selector`, waiting up to the server selection timeout for
    /// one to become available.
    pub fn select_server(&self, selector: &ServerSelector) -> Result<Arc<Server>> {
        self.select_server_with_deprioritized(selector, &[])
    }

    /// Like `select_server`, avoiding the given servers in sharded deployments when others are
    /// suitable.
    pub fn select_server_with_deprioritized(
        &self,
        selector: &ServerSelector,
        deprioritized: &[Address],
    ) -> Result<Arc<Server>> {
        let inner = &self.inner;
        let timeout = inner.options.server_selection_timeout;
        let start = Instant::now();
        let mut state = inner.lock()?;

        loop {
            if inner.is_closed() {
                return Err(Error::server_selection("the cluster has been closed"));
            }

            if let Some(description) = state.description.select_server(selector, deprioritized)? {
                if let Some(server) = state.servers.get(description.address()) {
                    return Ok(server.clone());
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::server_selection(format!(
                    "no server available for {} after {:?}; topology: {}",
                    selector,
                    timeout,
                    describe_topology(&state.description)
                )));
            }

            for server in state.servers.values() {
                server.request_check();
            }

            state = inner
                .topology_changed
                .wait_timeout(state, timeout - elapsed)?
                .0;
        }
    }

    /// Checks out a connection from `server`'s pool. Failures to establish a new connection
    /// are reported to the topology before being returned.
    pub fn check_out(&self, server: &Server) -> Result<PooledConnection> {
        let pool = server.pool();
        let generation = pool.generation(None);

        match pool.check_out() {
            Ok(connection) => Ok(connection),
            Err(err) => {
                if err.is_network_error() {
                    self.handle_application_error(
                        server.address(),
                        &err,
                        HandshakePhase::PreHello { generation },
                    );
                } else if err.is_authentication_error() {
                    self.handle_application_error(
                        server.address(),
                        &err,
                        HandshakePhase::PostHello { generation },
                    );
                }
                Err(err)
            }
        }
    }

    /// The implicit session identifier attached to retryable writes.
    pub fn session_id(&self) -> &Document {
        &self.inner.session_id
    }

    /// Allocates the transaction number for the next retryable write.
    pub fn next_txn_number(&self) -> i64 {
        self.inner.txn_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stops every monitor, closes every pool and waits for the monitor threads. Operations
    /// blocked in checkout fail with a pool closed error. Closing twice is a no-op.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let servers: Vec<Arc<Server>> = match inner.state.lock() {
            Ok(mut state) => {
                inner.topology_changed.notify_all();
                state.servers.drain().map(|(_, server)| server).collect()
            }
            Err(_) => Vec::new(),
        };

        for server in &servers {
            server.close();
        }
        for server in &servers {
            server.join();
            inner.listener.emit_sdam(SdamEvent::ServerClosed {
                address: server.address().clone(),
            });
        }
        info!("closed cluster");
    }
}

fn describe_topology(description: &TopologyDescription) -> String {
    let mut servers: Vec<String> = description
        .servers()
        .values()
        .map(|server| match server.error() {
            Some(error) => format!("{} ({}: {})", server.address(), server.server_type(), error),
            None => format!("{} ({})", server.address(), server.server_type()),
        })
        .collect();
    servers.sort();
    format!("{} [{}]", description.topology_type(), servers.join(", "))
}
