//! Connection pooling for a single MongoDB server.
use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::apm::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason, Listener};
use crate::connection::{Connection, ConnectionEstablisher};
use crate::connstring::{Address, ServiceId};
use crate::error::{Error, ErrorKind, PoolError, Result};
use crate::options::ClientOptions;

/// How often the background worker wakes to prune and populate even without a signal.
pub const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

const INITIAL_POPULATE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_POPULATE_BACKOFF: Duration = Duration::from_secs(5);

/// Settings that govern a single server's pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolOptions {
    /// Connections the background worker keeps open while the pool is ready.
    pub min_pool_size: u32,
    /// Upper bound on open connections, including ones being established. Zero is unbounded.
    pub max_pool_size: u32,
    pub max_idle_time: Option<Duration>,
    /// How long a checkout waits for capacity. Zero fails a checkout from a full pool at once.
    pub wait_queue_timeout: Duration,
    pub load_balanced: bool,
}

impl PoolOptions {
    pub fn from_client_options(options: &ClientOptions) -> PoolOptions {
        PoolOptions {
            min_pool_size: options.min_pool_size,
            max_pool_size: options.max_pool_size,
            max_idle_time: options.max_idle_time,
            wait_queue_timeout: options.wait_queue_timeout,
            load_balanced: options.load_balanced,
        }
    }
}

/// The lifecycle state of a pool.
///
/// Pools start paused and only hand out connections once their server is known to be
/// available. Clearing a pool pauses it again; closing is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    Ready,
    Paused,
    Closed,
}

// The pool generation. Clearing the pool increments it, and connections created in an older
// generation are discarded instead of reused. Behind a load balancer each backend service has
// its own generation.
#[derive(Clone, Debug)]
enum PoolGeneration {
    Normal(u32),
    LoadBalanced(HashMap<ServiceId, u32>),
}

impl PoolGeneration {
    fn current(&self, service_id: Option<&ServiceId>) -> u32 {
        match *self {
            PoolGeneration::Normal(generation) => generation,
            PoolGeneration::LoadBalanced(ref generations) => service_id
                .and_then(|id| generations.get(id))
                .cloned()
                .unwrap_or(0),
        }
    }

    fn increment(&mut self, service_id: Option<&ServiceId>) {
        match *self {
            PoolGeneration::Normal(ref mut generation) => *generation = generation.wrapping_add(1),
            PoolGeneration::LoadBalanced(ref mut generations) => match service_id {
                Some(id) => {
                    let generation = generations.entry(*id).or_insert(0);
                    *generation = generation.wrapping_add(1);
                }
                None => {
                    for generation in generations.values_mut() {
                        *generation = generation.wrapping_add(1);
                    }
                }
            },
        }
    }

    fn is_stale(&self, connection: &Connection) -> bool {
        connection.generation() != self.current(connection.service_id())
    }
}

struct PoolData {
    state: PoolState,
    clear_cause: Option<String>,
    generation: PoolGeneration,
    available: VecDeque<Connection>,
    checked_out: u32,
    // Connections being established, counted against the max size.
    pending: u32,
    next_connection_id: u32,
}

impl PoolData {
    fn total(&self) -> u32 {
        self.available.len() as u32 + self.checked_out + self.pending
    }

    fn has_capacity(&self, max_pool_size: u32) -> bool {
        max_pool_size == 0 || self.total() < max_pool_size
    }

    // Reserves a slot for a new connection, returning its id and the generation it was
    // requested in.
    fn reserve(&mut self) -> (u32, PoolGeneration) {
        self.pending += 1;
        self.next_connection_id += 1;
        (self.next_connection_id, self.generation.clone())
    }
}

enum MaintenanceTask {
    Exit,
    Idle,
    Populate { id: u32, generation: PoolGeneration },
}

struct PoolInner {
    address: Address,
    options: PoolOptions,
    data: Mutex<PoolData>,
    // Threads waiting for the pool to be repopulated with available connections.
    checkout_wait: Condvar,
    // Wakes the background worker.
    maintenance_wait: Condvar,
    establisher: Arc<ConnectionEstablisher>,
    listener: Arc<Listener>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handles threaded connections to a MongoDB server.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

/// The events and perished connections of a pool state change. The state changes right away;
/// `deliver` emits the events and closes the connections, so the caller can do that once it
/// has released its own locks.
#[must_use = "the pool's events are only emitted by `deliver`"]
pub(crate) struct PoolTransition {
    inner: Arc<PoolInner>,
    perished: Vec<(Connection, ConnectionClosedReason)>,
    events: Vec<CmapEvent>,
}

impl PoolTransition {
    fn new(inner: &Arc<PoolInner>) -> PoolTransition {
        PoolTransition {
            inner: inner.clone(),
            perished: Vec::new(),
            events: Vec::new(),
        }
    }

    pub(crate) fn deliver(self) {
        let PoolTransition {
            inner,
            perished,
            events,
        } = self;
        inner.close_all(perished);
        for event in events {
            inner.emit(event);
        }
    }
}

/// Holds a checked out connection, with logic to return the connection
/// to the connection pool when dropped.
pub struct PooledConnection {
    // Always Some(connection) until it is returned to the pool on drop.
    connection: Option<Connection>,
    pool: Weak<PoolInner>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
            .as_ref()
            .expect("pooled connection is present until dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .expect("pooled connection is present until dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            match self.pool.upgrade() {
                Some(pool) => pool.check_in(connection),
                None => connection.close(),
            }
        }
    }
}

impl PoolInner {
    fn lock(&self) -> Result<MutexGuard<PoolData>> {
        Ok(self.data.lock()?)
    }

    fn emit(&self, event: CmapEvent) {
        self.listener.emit_cmap(event);
    }

    fn perish_reason(
        &self,
        state: PoolState,
        generation: &PoolGeneration,
        connection: &Connection,
    ) -> Option<ConnectionClosedReason> {
        if state == PoolState::Closed {
            Some(ConnectionClosedReason::PoolClosed)
        } else if generation.is_stale(connection) {
            Some(ConnectionClosedReason::Stale)
        } else if connection.has_errored() {
            Some(ConnectionClosedReason::Error)
        } else if connection.is_idle(self.options.max_idle_time) {
            Some(ConnectionClosedReason::Idle)
        } else {
            None
        }
    }

    // Removes every available connection that should no longer be handed out.
    fn take_perished(&self, data: &mut PoolData) -> Vec<(Connection, ConnectionClosedReason)> {
        let state = data.state;
        let mut perished = Vec::new();
        let mut kept = VecDeque::with_capacity(data.available.len());

        for connection in data.available.drain(..) {
            match self.perish_reason(state, &data.generation, &connection) {
                Some(reason) => perished.push((connection, reason)),
                None => kept.push_back(connection),
            }
        }

        data.available = kept;
        perished
    }

    fn close_connection(&self, connection: Connection, reason: ConnectionClosedReason) {
        self.emit(CmapEvent::ConnectionClosed {
            address: self.address.clone(),
            connection_id: connection.id(),
            reason,
        });
        connection.close();
    }

    fn close_all(&self, perished: Vec<(Connection, ConnectionClosedReason)>) {
        for (connection, reason) in perished {
            self.close_connection(connection, reason);
        }
    }

    fn check_in(&self, mut connection: Connection) {
        let connection_id = connection.id();
        let rejected = match self.data.lock() {
            Ok(mut data) => {
                data.checked_out = data.checked_out.saturating_sub(1);
                let reason = self.perish_reason(data.state, &data.generation, &connection);
                self.checkout_wait.notify_one();
                match reason {
                    Some(reason) => {
                        self.maintenance_wait.notify_one();
                        Some((connection, reason))
                    }
                    None => {
                        connection.mark_checked_in();
                        data.available.push_back(connection);
                        None
                    }
                }
            }
            Err(_) => Some((connection, ConnectionClosedReason::PoolClosed)),
        };

        self.emit(CmapEvent::ConnectionCheckedIn {
            address: self.address.clone(),
            connection_id,
        });

        if let Some((connection, reason)) = rejected {
            self.close_connection(connection, reason);
        }
    }

    // Establishes a connection in a slot reserved with `PoolData::reserve`. A connection that
    // comes up after the pool was cleared or closed is discarded. Behind a load balancer the
    // backend is only known after the handshake, so the connection takes that backend's
    // generation from the snapshot taken at reservation.
    fn establish(
        &self,
        id: u32,
        generation: PoolGeneration,
        for_checkout: bool,
    ) -> Result<Option<Connection>> {
        self.emit(CmapEvent::ConnectionCreated {
            address: self.address.clone(),
            connection_id: id,
        });

        let start = Instant::now();
        let result = self
            .establisher
            .establish_connection(&self.address, id, generation.current(None));

        let mut data = self.lock()?;
        data.pending = data.pending.saturating_sub(1);

        let mut connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                self.checkout_wait.notify_one();
                return Err(err);
            }
        };

        if self.options.load_balanced {
            connection.generation = generation.current(connection.service_id());
        }

        let rejection = if data.state == PoolState::Closed {
            Some((ConnectionClosedReason::PoolClosed, Error::pool_closed()))
        } else if data.generation.is_stale(&connection) {
            Some((
                ConnectionClosedReason::Stale,
                Error::pool_cleared(data.clear_cause.clone()),
            ))
        } else {
            None
        };

        if let Some((reason, err)) = rejection {
            self.checkout_wait.notify_one();
            drop(data);
            self.close_connection(connection, reason);
            return Err(err);
        }

        let connection = if for_checkout {
            data.checked_out += 1;
            Some(connection)
        } else {
            connection.mark_checked_in();
            data.available.push_back(connection);
            self.checkout_wait.notify_one();
            None
        };
        drop(data);

        self.emit(CmapEvent::ConnectionReady {
            address: self.address.clone(),
            connection_id: id,
            duration: start.elapsed(),
        });

        Ok(connection)
    }

    fn next_maintenance_task(&self) -> MaintenanceTask {
        let mut data = match self.data.lock() {
            Ok(data) => data,
            Err(_) => return MaintenanceTask::Exit,
        };

        if data.state == PoolState::Closed {
            return MaintenanceTask::Exit;
        }

        let perished = self.take_perished(&mut data);
        if !perished.is_empty() {
            drop(data);
            self.close_all(perished);
            return MaintenanceTask::Idle;
        }

        if data.state == PoolState::Ready
            && data.total() < self.options.min_pool_size
            && data.has_capacity(self.options.max_pool_size)
        {
            let (id, generation) = data.reserve();
            return MaintenanceTask::Populate { id, generation };
        }

        let _ = self.maintenance_wait.wait_timeout(data, MAINTENANCE_FREQUENCY);
        MaintenanceTask::Idle
    }

    fn sleep_unless_closed(&self, duration: Duration) {
        if let Ok(data) = self.data.lock() {
            if data.state != PoolState::Closed {
                let _ = self.maintenance_wait.wait_timeout(data, duration);
            }
        }
    }
}

// Keeps the pool at its minimum size and prunes perished connections. The worker only holds a
// weak reference between iterations, so it exits once the pool is closed or dropped.
fn run_worker(pool: Weak<PoolInner>) {
    let mut backoff: Option<Duration> = None;

    loop {
        let inner = match pool.upgrade() {
            Some(inner) => inner,
            None => return,
        };

        match inner.next_maintenance_task() {
            MaintenanceTask::Exit => return,
            MaintenanceTask::Idle => {}
            MaintenanceTask::Populate { id, generation } => {
                match inner.establish(id, generation, false) {
                    Ok(_) => backoff = None,
                    Err(ref err) if is_pool_rejection(err) => {}
                    Err(err) => {
                        let delay = backoff.map_or(INITIAL_POPULATE_BACKOFF, |delay| {
                            cmp::min(delay * 2, MAX_POPULATE_BACKOFF)
                        });
                        backoff = Some(delay);
                        warn!(
                            "failed to populate connection pool for {}, retrying in {:?}: {}",
                            inner.address, delay, err
                        );
                        inner.sleep_unless_closed(delay);
                    }
                }
            }
        }
    }
}

fn is_pool_rejection(err: &Error) -> bool {
    match *err.kind() {
        ErrorKind::Pool(_) => true,
        _ => false,
    }
}

impl ConnectionPool {
    /// Creates a paused pool and starts its worker. The returned transition carries the
    /// pool created event.
    pub(crate) fn new(
        address: Address,
        options: PoolOptions,
        establisher: Arc<ConnectionEstablisher>,
        listener: Arc<Listener>,
    ) -> (ConnectionPool, PoolTransition) {
        let generation = if options.load_balanced {
            PoolGeneration::LoadBalanced(HashMap::new())
        } else {
            PoolGeneration::Normal(0)
        };

        let inner = Arc::new(PoolInner {
            address: address.clone(),
            options: options.clone(),
            data: Mutex::new(PoolData {
                state: PoolState::Paused,
                clear_cause: None,
                generation,
                available: VecDeque::new(),
                checked_out: 0,
                pending: 0,
                next_connection_id: 0,
            }),
            checkout_wait: Condvar::new(),
            maintenance_wait: Condvar::new(),
            establisher,
            listener,
            worker: Mutex::new(None),
        });

        let mut created = PoolTransition::new(&inner);
        created.events.push(CmapEvent::PoolCreated {
            address: address.clone(),
            options,
        });

        let weak = Arc::downgrade(&inner);
        match thread::Builder::new()
            .name(format!("pool-{}", address))
            .spawn(move || run_worker(weak))
        {
            Ok(handle) => {
                if let Ok(mut worker) = inner.worker.lock() {
                    *worker = Some(handle);
                }
            }
            Err(e) => error!("failed to spawn pool worker for {}: {}", address, e),
        }

        (ConnectionPool { inner }, created)
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn state(&self) -> PoolState {
        self.inner
            .data
            .lock()
            .map(|data| data.state)
            .unwrap_or(PoolState::Closed)
    }

    /// The current generation, or the generation of one load balancer backend.
    pub fn generation(&self, service_id: Option<&ServiceId>) -> u32 {
        self.inner
            .data
            .lock()
            .map(|data| data.generation.current(service_id))
            .unwrap_or(0)
    }

    /// Open connections, including checked out ones and ones being established.
    pub fn size(&self) -> u32 {
        self.inner.data.lock().map(|data| data.total()).unwrap_or(0)
    }

    pub fn available_count(&self) -> u32 {
        self.inner
            .data
            .lock()
            .map(|data| data.available.len() as u32)
            .unwrap_or(0)
    }

    pub fn checked_out_count(&self) -> u32 {
        self.inner
            .data
            .lock()
            .map(|data| data.checked_out)
            .unwrap_or(0)
    }

    /// Whether a connection created in `generation` has been invalidated by a clear.
    pub fn is_stale(&self, generation: u32, service_id: Option<&ServiceId>) -> bool {
        self.generation(service_id) != generation
    }

    /// Checks out a connection, waiting at most the configured wait queue timeout.
    pub fn check_out(&self) -> Result<PooledConnection> {
        self.check_out_with_timeout(self.inner.options.wait_queue_timeout)
    }

    /// Checks out an available connection, or creates one if the pool has room. Otherwise
    /// blocks until a connection is returned or `timeout` elapses.
    pub fn check_out_with_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let start = Instant::now();
        self.inner.emit(CmapEvent::ConnectionCheckoutStarted {
            address: self.inner.address.clone(),
        });

        match self.acquire(start, timeout) {
            Ok(connection) => {
                self.inner.emit(CmapEvent::ConnectionCheckedOut {
                    address: self.inner.address.clone(),
                    connection_id: connection.id(),
                    duration: start.elapsed(),
                });
                Ok(PooledConnection {
                    connection: Some(connection),
                    pool: Arc::downgrade(&self.inner),
                })
            }
            Err(err) => {
                let reason = match *err.kind() {
                    ErrorKind::Pool(PoolError::CheckOutTimeout { .. }) => {
                        ConnectionCheckoutFailedReason::Timeout
                    }
                    ErrorKind::Pool(PoolError::PoolClosed) => {
                        ConnectionCheckoutFailedReason::PoolClosed
                    }
                    _ => ConnectionCheckoutFailedReason::ConnectionError,
                };
                self.inner.emit(CmapEvent::ConnectionCheckoutFailed {
                    address: self.inner.address.clone(),
                    reason,
                    duration: start.elapsed(),
                });
                Err(err.with_address(&self.inner.address))
            }
        }
    }

    /// Returns a connection to the pool. Equivalent to dropping it.
    pub fn check_in(&self, connection: PooledConnection) {
        drop(connection);
    }

    fn acquire(&self, start: Instant, timeout: Duration) -> Result<Connection> {
        let inner = &self.inner;
        let deadline = start + timeout;
        let mut perished = Vec::new();
        let mut data = inner.lock()?;

        loop {
            match data.state {
                PoolState::Closed => {
                    drop(data);
                    inner.close_all(perished);
                    return Err(Error::pool_closed());
                }
                PoolState::Paused => {
                    let cause = data.clear_cause.clone();
                    drop(data);
                    inner.close_all(perished);
                    return Err(Error::pool_cleared(cause));
                }
                PoolState::Ready => {}
            }

            while let Some(connection) = data.available.pop_back() {
                match inner.perish_reason(data.state, &data.generation, &connection) {
                    Some(reason) => perished.push((connection, reason)),
                    None => {
                        data.checked_out += 1;
                        drop(data);
                        inner.close_all(perished);
                        return Ok(connection);
                    }
                }
            }

            if data.has_capacity(inner.options.max_pool_size) {
                let (id, generation) = data.reserve();
                drop(data);
                inner.close_all(perished);
                return match inner.establish(id, generation, true)? {
                    Some(connection) => Ok(connection),
                    None => Err(Error::internal("checkout did not receive its connection")),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                drop(data);
                inner.close_all(perished);
                return Err(Error::checkout_timeout(timeout));
            }
            data = inner.checkout_wait.wait_timeout(data, deadline - now)?.0;
        }
    }

    /// Marks the pool ready to hand out connections. A no-op unless the pool is paused.
    pub fn ready(&self) {
        self.mark_ready().deliver();
    }

    pub(crate) fn mark_ready(&self) -> PoolTransition {
        let mut transition = PoolTransition::new(&self.inner);
        if let Ok(mut data) = self.inner.data.lock() {
            if data.state == PoolState::Paused {
                data.state = PoolState::Ready;
                data.clear_cause = None;
                self.inner.maintenance_wait.notify_all();
                debug!("connection pool for {} is ready", self.inner.address);
                transition.events.push(CmapEvent::PoolReady {
                    address: self.inner.address.clone(),
                });
            }
        }
        transition
    }

    /// Stops handing out connections without invalidating existing ones. Waiting and future
    /// checkouts fail until the pool is marked ready again, and the worker stops populating.
    pub fn pause(&self) {
        if let Ok(mut data) = self.inner.data.lock() {
            if data.state != PoolState::Ready {
                return;
            }
            data.state = PoolState::Paused;
            self.inner.checkout_wait.notify_all();
        }
        debug!("paused connection pool for {}", self.inner.address);
    }

    /// Invalidates every existing connection (or, behind a load balancer, every connection to
    /// one backend service). Outside load balanced mode the pool is also paused, failing
    /// pending and future checkouts until it is marked ready again.
    pub fn clear(&self, service_id: Option<&ServiceId>, cause: Option<&Error>) {
        self.mark_cleared(service_id, cause).deliver();
    }

    pub(crate) fn mark_cleared(
        &self,
        service_id: Option<&ServiceId>,
        cause: Option<&Error>,
    ) -> PoolTransition {
        let inner = &self.inner;
        let mut transition = PoolTransition::new(inner);
        let mut data = match inner.data.lock() {
            Ok(data) => data,
            Err(_) => return transition,
        };
        if data.state == PoolState::Closed {
            return transition;
        }
        data.generation.increment(service_id);

        let emit = if inner.options.load_balanced {
            true
        } else {
            let was_ready = data.state == PoolState::Ready;
            data.state = PoolState::Paused;
            data.clear_cause = cause.map(|err| err.to_string());
            was_ready
        };

        transition.perished = inner.take_perished(&mut data);
        inner.checkout_wait.notify_all();
        drop(data);

        if emit {
            match cause {
                Some(cause) => debug!("cleared connection pool for {}: {}", inner.address, cause),
                None => debug!("cleared connection pool for {}", inner.address),
            }
            transition.events.push(CmapEvent::PoolCleared {
                address: inner.address.clone(),
                service_id: service_id.cloned(),
            });
        }
        transition
    }

    /// Closes every idle connection past the max idle time. The worker refills the pool to its
    /// minimum size afterwards.
    pub fn close_idle_connections(&self) {
        let perished = match self.inner.data.lock() {
            Ok(mut data) => {
                let perished = self.inner.take_perished(&mut data);
                self.inner.maintenance_wait.notify_all();
                perished
            }
            Err(_) => return,
        };
        self.inner.close_all(perished);
    }

    /// Closes the pool. Available connections are closed immediately, checked out ones when
    /// they are returned, and waiting checkouts fail. Closing twice is a no-op.
    pub fn close(&self) {
        let inner = &self.inner;
        let perished = match inner.data.lock() {
            Ok(mut data) => {
                if data.state == PoolState::Closed {
                    return;
                }
                data.state = PoolState::Closed;
                let perished = inner.take_perished(&mut data);
                inner.checkout_wait.notify_all();
                inner.maintenance_wait.notify_all();
                perished
            }
            Err(_) => return,
        };

        inner.close_all(perished);

        let worker = match inner.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!("pool worker for {} panicked", inner.address);
            }
        }

        inner.emit(CmapEvent::PoolClosed {
            address: inner.address.clone(),
        });
    }
}
