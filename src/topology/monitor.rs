//! Server monitoring: one background thread per server that runs `isMaster`/`hello` checks and
//! feeds the results into the topology.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use bson::{bson, doc, Bson, Document};
use chrono::{DateTime, Utc};
use log::{debug, error, trace, warn};

use crate::apm::{Listener, SdamEvent};
use crate::auth;
use crate::cluster::TopologyUpdater;
use crate::connection::{Connection, ConnectionEstablisher};
use crate::connstring::{Address, ServiceId};
use crate::error::{Error, Result};
use crate::options::{ServerMonitoringMode, MIN_HEARTBEAT_FREQUENCY};

use super::server::{ServerDescription, TopologyVersion};

const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;
const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i64 = 48_000_000;
const RTT_ALPHA: f64 = 0.2;

/// The parsed reply to an `isMaster` or `hello` command.
#[derive(Clone, Debug, PartialEq)]
pub struct HelloReply {
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    pub is_replica_set: bool,

    /// Shard-specific. mongos instances will add this field to the
    /// reply, and it will contain the value "isdbgrid".
    pub msg: Option<String>,

    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub max_write_batch_size: Option<i64>,
    pub logical_session_timeout: Option<Duration>,
    pub local_time: Option<DateTime<Utc>>,

    // Replica set specific
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub me: Option<Address>,
    pub primary: Option<Address>,
    pub hosts: Vec<Address>,
    pub passives: Vec<Address>,
    pub arbiters: Vec<Address>,
    pub tags: BTreeMap<String, String>,
    pub last_write_date: Option<DateTime<Utc>>,

    pub topology_version: Option<TopologyVersion>,
    pub service_id: Option<ServiceId>,
    pub hello_ok: bool,
    pub sasl_supported_mechs: Option<Vec<String>>,
}

fn get_int(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key) {
        Some(&Bson::I32(v)) => Some(i64::from(v)),
        Some(&Bson::I64(v)) => Some(v),
        Some(&Bson::FloatingPoint(v)) => Some(v as i64),
        _ => None,
    }
}

fn get_bool(doc: &Document, key: &str) -> bool {
    match doc.get(key) {
        Some(&Bson::Boolean(b)) => b,
        _ => false,
    }
}

fn get_string(doc: &Document, key: &str) -> Option<String> {
    match doc.get(key) {
        Some(&Bson::String(ref s)) => Some(s.to_owned()),
        _ => None,
    }
}

fn get_address(doc: &Document, key: &str) -> Option<Address> {
    get_string(doc, key).and_then(|s| Address::parse(&s).ok())
}

fn get_addresses(doc: &Document, key: &str) -> Vec<Address> {
    match doc.get(key) {
        Some(&Bson::Array(ref arr)) => arr
            .iter()
            .filter_map(|bson| match *bson {
                Bson::String(ref s) => Address::parse(s).ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn get_object_id(doc: &Document, key: &str) -> Option<ObjectId> {
    match doc.get(key) {
        Some(&Bson::ObjectId(ref id)) => Some(id.clone()),
        Some(&Bson::Document(ref inner)) => match inner.get("$oid") {
            Some(&Bson::String(ref s)) => ObjectId::with_string(s).ok(),
            _ => None,
        },
        _ => None,
    }
}

impl HelloReply {
    /// Parses a handshake reply from the server at `address`.
    pub fn parse(address: &Address, doc: Document) -> Result<HelloReply> {
        if let Some(err) = Error::from_reply(&doc) {
            return Err(err.with_address(address));
        }

        let mut tags = BTreeMap::new();
        if let Ok(tag_doc) = doc.get_document("tags") {
            for (k, v) in tag_doc.iter() {
                if let Bson::String(ref tag) = *v {
                    tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        let last_write_date = match doc.get_document("lastWrite") {
            Ok(last_write) => match last_write.get("lastWriteDate") {
                Some(&Bson::UtcDatetime(ref date)) => Some(*date),
                _ => None,
            },
            Err(_) => None,
        };

        let local_time = match doc.get("localTime") {
            Some(&Bson::UtcDatetime(ref date)) => Some(*date),
            _ => None,
        };

        let is_writable_primary = get_bool(&doc, "isWritablePrimary") || get_bool(&doc, "ismaster");

        Ok(HelloReply {
            is_writable_primary,
            secondary: get_bool(&doc, "secondary"),
            arbiter_only: get_bool(&doc, "arbiterOnly"),
            hidden: get_bool(&doc, "hidden"),
            is_replica_set: get_bool(&doc, "isreplicaset"),
            msg: get_string(&doc, "msg"),
            min_wire_version: get_int(&doc, "minWireVersion").unwrap_or(0) as i32,
            max_wire_version: get_int(&doc, "maxWireVersion").unwrap_or(0) as i32,
            max_bson_object_size: get_int(&doc, "maxBsonObjectSize")
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_message_size_bytes: get_int(&doc, "maxMessageSizeBytes")
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            max_write_batch_size: get_int(&doc, "maxWriteBatchSize").filter(|size| *size > 0),
            logical_session_timeout: get_int(&doc, "logicalSessionTimeoutMinutes")
                .filter(|minutes| *minutes >= 0)
                .map(|minutes| Duration::from_secs(minutes as u64 * 60)),
            local_time,
            set_name: get_string(&doc, "setName"),
            set_version: get_int(&doc, "setVersion").map(|v| v as i32),
            election_id: get_object_id(&doc, "electionId"),
            me: get_address(&doc, "me"),
            primary: get_address(&doc, "primary"),
            hosts: get_addresses(&doc, "hosts"),
            passives: get_addresses(&doc, "passives"),
            arbiters: get_addresses(&doc, "arbiters"),
            tags,
            last_write_date,
            topology_version: doc
                .get_document("topologyVersion")
                .ok()
                .and_then(TopologyVersion::from_document),
            service_id: get_object_id(&doc, "serviceId").map(|oid| ServiceId::from(&oid)),
            hello_ok: get_bool(&doc, "helloOk"),
            sasl_supported_mechs: auth::sasl_supported_mechs(&doc),
        })
    }
}

/// Computes the exponentially weighted moving average of round trip times.
pub fn average_round_trip_time(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        None => sample,
        Some(previous) => {
            let average =
                RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * previous.as_secs_f64();
            Duration::from_secs_f64(average)
        }
    }
}

#[derive(Debug, Default)]
struct RttInfo {
    average: Option<Duration>,
}

impl RttInfo {
    fn add_sample(&mut self, sample: Duration) {
        self.average = Some(average_round_trip_time(self.average, sample));
    }

    fn reset(&mut self) {
        self.average = None;
    }
}

/// A collapsing wake-up signal: any number of requests made while the monitor is busy result in
/// a single early check.
#[derive(Clone, Debug, Default)]
pub(crate) struct CheckRequester {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CheckRequester {
    pub(crate) fn request(&self) {
        let (ref lock, ref condvar) = *self.inner;
        if let Ok(mut requested) = lock.lock() {
            *requested = true;
            condvar.notify_all();
        }
    }

    /// Waits until a check is requested or `timeout` elapses. Returns whether a request was
    /// consumed.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let (ref lock, ref condvar) = *self.inner;
        let deadline = Instant::now() + timeout;
        let mut requested = match lock.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        while !*requested {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            requested = match condvar.wait_timeout(requested, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }

        let was_requested = *requested;
        *requested = false;
        was_requested
    }
}

#[derive(Clone, Debug)]
pub(crate) struct MonitorOptions {
    pub(crate) heartbeat_frequency: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) mode: ServerMonitoringMode,
}

/// The cluster's handle on a running monitor thread.
pub(crate) struct MonitorHandle {
    address: Address,
    running: Arc<AtomicBool>,
    requester: CheckRequester,
    latest: Arc<Mutex<Option<ServerDescription>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    pub(crate) fn request_check(&self) {
        self.requester.request();
    }

    /// The description produced by the most recent check, if one has completed.
    pub(crate) fn current_description(&self) -> Option<ServerDescription> {
        self.latest.lock().ok().and_then(|latest| latest.clone())
    }

    /// Signals the monitor to exit after its current check.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.requester.request();
    }

    /// Starts the monitor's thread. Its first check runs immediately. A monitor stopped before
    /// it was spawned never runs.
    pub(crate) fn spawn(&self, monitor: Monitor) {
        let mut slot = match self.thread.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if !self.running.load(Ordering::SeqCst) || slot.is_some() {
            return;
        }

        match thread::Builder::new()
            .name(format!("monitor-{}", self.address))
            .spawn(move || monitor.run())
        {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!("failed to spawn monitor thread for {}: {}", self.address, e),
        }
    }

    pub(crate) fn join(&self) {
        let handle = match self.thread.lock() {
            Ok(mut thread) => thread.take(),
            Err(_) => None,
        };

        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("monitor thread for {} panicked", self.address);
            }
        }
    }
}

/// Monitors and updates the description of one server.
pub(crate) struct Monitor {
    address: Address,
    connection: Option<Connection>,
    establisher: Arc<ConnectionEstablisher>,
    updater: TopologyUpdater,
    listener: Arc<Listener>,
    options: MonitorOptions,
    requester: CheckRequester,
    running: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<ServerDescription>>>,
    rtt: Arc<Mutex<RttInfo>>,
    rtt_monitor: Option<RttMonitorHandle>,
    topology_version: Option<TopologyVersion>,
    hello_ok: bool,
}

impl Monitor {
    /// Creates a monitor and the handle that controls it. Nothing runs until the monitor is
    /// passed to `MonitorHandle::spawn`.
    pub(crate) fn new(
        address: Address,
        establisher: Arc<ConnectionEstablisher>,
        updater: TopologyUpdater,
        listener: Arc<Listener>,
        options: MonitorOptions,
    ) -> (MonitorHandle, Monitor) {
        let running = Arc::new(AtomicBool::new(true));
        let requester = CheckRequester::default();
        let latest = Arc::new(Mutex::new(None));

        let monitor = Monitor {
            address: address.clone(),
            connection: None,
            establisher,
            updater,
            listener,
            options,
            requester: requester.clone(),
            running: running.clone(),
            latest: latest.clone(),
            rtt: Arc::new(Mutex::new(RttInfo::default())),
            rtt_monitor: None,
            topology_version: None,
            hello_ok: false,
        };

        let handle = MonitorHandle {
            address,
            running,
            requester,
            latest,
            thread: Mutex::new(None),
        };
        (handle, monitor)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        debug!("starting monitor for {}", self.address);

        while self.is_running() {
            let check_started = Instant::now();
            let description = self.check_server();

            if !self.is_running() {
                break;
            }

            if let Ok(mut latest) = self.latest.lock() {
                *latest = Some(description.clone());
            }

            let streaming = self.is_streaming();
            match description.error.clone() {
                Some(error) => self.updater.handle_monitor_error(&self.address, error),
                None => {
                    self.updater.update(description);
                }
            }

            if streaming && self.topology_version.is_some() {
                // The next awaitable check blocks on the server instead of on a timer.
                self.wait_for_min_interval(check_started);
            } else {
                self.wait_for_next_check(check_started);
            }
        }

        if let Some(rtt_monitor) = self.rtt_monitor.take() {
            rtt_monitor.stop_and_join();
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        debug!("stopped monitor for {}", self.address);
    }

    fn is_streaming(&self) -> bool {
        match self.options.mode {
            ServerMonitoringMode::Poll => false,
            ServerMonitoringMode::Stream | ServerMonitoringMode::Auto => true,
        }
    }

    // Sleeps until the heartbeat interval has passed or a check is requested, but never checks
    // more often than the minimum heartbeat frequency.
    fn wait_for_next_check(&self, check_started: Instant) {
        let remaining = self
            .options
            .heartbeat_frequency
            .checked_sub(check_started.elapsed())
            .unwrap_or_default();
        if !self.requester.wait(remaining) {
            return;
        }
        self.wait_for_min_interval(check_started);
    }

    fn wait_for_min_interval(&self, check_started: Instant) {
        while self.is_running() {
            let elapsed = check_started.elapsed();
            if elapsed >= MIN_HEARTBEAT_FREQUENCY {
                return;
            }
            self.requester.wait(MIN_HEARTBEAT_FREQUENCY - elapsed);
        }
    }

    fn hello_command(&self, awaited: bool) -> Document {
        let mut command = if self.hello_ok {
            doc! { "hello": 1 }
        } else {
            doc! { "isMaster": 1 }
        };

        if awaited {
            if let Some(ref topology_version) = self.topology_version {
                command.insert("topologyVersion", topology_version.to_document());
                command.insert(
                    "maxAwaitTimeMS",
                    self.options.heartbeat_frequency.as_millis() as i64,
                );
            }
        }
        command
    }

    fn emit(&self, event: SdamEvent) {
        self.listener.emit_sdam(event);
    }

    fn check_server(&mut self) -> ServerDescription {
        let awaited = self.connection.is_some()
            && self.is_streaming()
            && self.topology_version.is_some();

        self.emit(SdamEvent::ServerHeartbeatStarted {
            address: self.address.clone(),
            awaited,
        });

        let start = Instant::now();
        let result = match self.connection.take() {
            Some(mut connection) => {
                let timeout = if awaited {
                    self.options.connect_timeout + self.options.heartbeat_frequency
                } else {
                    self.options.connect_timeout
                };
                let command = self.hello_command(awaited);
                connection
                    .send_command_with_timeout(command, Some(timeout))
                    .and_then(|reply| HelloReply::parse(&self.address, reply))
                    .map(|reply| (connection, reply))
            }
            None => self.establisher.establish_monitoring_connection(&self.address),
        };
        let duration = start.elapsed();

        match result {
            Ok((connection, reply)) => {
                self.connection = Some(connection);
                self.hello_ok = reply.hello_ok;
                self.topology_version = reply.topology_version.clone();

                let average = match self.rtt.lock() {
                    Ok(mut rtt) => {
                        if !awaited {
                            rtt.add_sample(duration);
                        }
                        rtt.average
                    }
                    Err(_) => Some(duration),
                };

                if self.is_streaming() && self.topology_version.is_some() {
                    self.ensure_rtt_monitor();
                }

                trace!("heartbeat to {} succeeded in {:?}", self.address, duration);
                self.emit(SdamEvent::ServerHeartbeatSucceeded {
                    address: self.address.clone(),
                    awaited,
                    duration,
                });

                ServerDescription::from_hello(self.address.clone(), &reply, average)
            }
            Err(error) => {
                self.topology_version = None;
                if let Ok(mut rtt) = self.rtt.lock() {
                    rtt.reset();
                }
                if let Some(rtt_monitor) = self.rtt_monitor.take() {
                    rtt_monitor.stop_and_join();
                }

                warn!("heartbeat to {} failed: {}", self.address, error);
                self.emit(SdamEvent::ServerHeartbeatFailed {
                    address: self.address.clone(),
                    awaited,
                    duration,
                    error: error.clone(),
                });

                ServerDescription::new_from_error(self.address.clone(), error)
            }
        }
    }

    fn ensure_rtt_monitor(&mut self) {
        if self.rtt_monitor.is_none() {
            self.rtt_monitor = RttMonitor::start(
                self.address.clone(),
                self.establisher.clone(),
                self.rtt.clone(),
                self.options.heartbeat_frequency,
            );
        }
    }
}

struct RttMonitorHandle {
    address: Address,
    running: Arc<AtomicBool>,
    requester: CheckRequester,
    thread: JoinHandle<()>,
}

impl RttMonitorHandle {
    // Waits out an in-flight check, which is bounded by the connect timeout.
    fn stop_and_join(self) {
        self.running.store(false, Ordering::SeqCst);
        self.requester.request();
        if self.thread.join().is_err() {
            error!("RTT monitor thread for {} panicked", self.address);
        }
    }
}

/// Measures round trip times on a dedicated connection while the main monitor is blocked on
/// awaitable checks.
struct RttMonitor {
    address: Address,
    connection: Option<Connection>,
    establisher: Arc<ConnectionEstablisher>,
    rtt: Arc<Mutex<RttInfo>>,
    frequency: Duration,
    running: Arc<AtomicBool>,
    requester: CheckRequester,
}

impl RttMonitor {
    fn start(
        address: Address,
        establisher: Arc<ConnectionEstablisher>,
        rtt: Arc<Mutex<RttInfo>>,
        frequency: Duration,
    ) -> Option<RttMonitorHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let requester = CheckRequester::default();
        let monitor = RttMonitor {
            address: address.clone(),
            connection: None,
            establisher,
            rtt,
            frequency,
            running: running.clone(),
            requester: requester.clone(),
        };

        match thread::Builder::new()
            .name(format!("rtt-monitor-{}", address))
            .spawn(move || monitor.run())
        {
            Ok(thread) => Some(RttMonitorHandle {
                address,
                running,
                requester,
                thread,
            }),
            Err(e) => {
                error!("failed to spawn RTT monitor thread for {}: {}", address, e);
                None
            }
        }
    }

    fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            let start = Instant::now();
            let result = match self.connection.take() {
                Some(mut connection) => {
                    let command = if connection
                        .stream_description()
                        .map(|d| d.hello_ok)
                        .unwrap_or(false)
                    {
                        doc! { "hello": 1 }
                    } else {
                        doc! { "isMaster": 1 }
                    };
                    let timeout = self.establisher.connect_timeout();
                    connection
                        .send_command_with_timeout(command, timeout)
                        .map(|_| connection)
                }
                None => self
                    .establisher
                    .establish_monitoring_connection(&self.address)
                    .map(|(connection, _)| connection),
            };

            match result {
                Ok(connection) => {
                    if let Ok(mut rtt) = self.rtt.lock() {
                        rtt.add_sample(start.elapsed());
                    }
                    self.connection = Some(connection);
                }
                Err(e) => debug!("RTT check to {} failed: {}", self.address, e),
            }

            self.requester.wait(self.frequency);
        }

        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}
