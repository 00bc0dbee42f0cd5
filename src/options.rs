//! Client configuration: defaults, connection string options and validation.
use std::fmt;
use std::time::Duration;

use log::warn;
use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde_derive::Deserialize;

use crate::auth::{AuthMechanism, Credential};
use crate::common::{ReadMode, ReadPreference};
use crate::connstring::{self, Address};
use crate::error::{Error, Result};

pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;
pub const DEFAULT_WAIT_QUEUE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether monitors poll with `isMaster`/`hello` or stream awaitable replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMonitoringMode {
    /// Stream when the server reports a topology version, otherwise poll.
    Auto,
    Stream,
    Poll,
}

impl Default for ServerMonitoringMode {
    fn default() -> Self {
        ServerMonitoringMode::Auto
    }
}

/// Decides whether a "not writable primary" or "node is recovering" error observed on an
/// application connection clears that server's pool.
///
/// Pools are cleared when the server's max wire version is at or below
/// `legacy_max_wire_version`, or when the error is a shutdown error and `clear_on_shutdown` is
/// set. Newer servers keep their connections open across state changes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StateChangePolicy {
    pub legacy_max_wire_version: i32,
    pub clear_on_shutdown: bool,
}

impl Default for StateChangePolicy {
    fn default() -> Self {
        StateChangePolicy {
            legacy_max_wire_version: 7,
            clear_on_shutdown: true,
        }
    }
}

impl StateChangePolicy {
    pub fn should_clear_pool(&self, max_wire_version: Option<i32>, error: &Error) -> bool {
        if self.clear_on_shutdown && error.is_shutting_down() {
            return true;
        }
        max_wire_version.map_or(true, |version| version <= self.legacy_max_wire_version)
    }
}

/// Everything needed to discover, monitor and pool connections to a deployment.
///
/// Durations deserialize from floating point seconds under `*_seconds` keys, matching the
/// option names accepted by the connection string.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    #[serde(deserialize_with = "deserialize_addresses")]
    pub hosts: Vec<Address>,
    #[serde(rename = "replica_set")]
    pub repl_set_name: Option<String>,
    pub direct_connection: Option<bool>,
    pub load_balanced: bool,
    pub min_pool_size: u32,
    /// Zero means unbounded.
    pub max_pool_size: u32,
    #[serde(rename = "max_idle_time_seconds", deserialize_with = "deserialize_opt_secs")]
    pub max_idle_time: Option<Duration>,
    /// How long a checkout waits for capacity in a full pool. Zero fails it right away.
    #[serde(
        rename = "wait_queue_timeout_seconds",
        deserialize_with = "deserialize_wait_queue_timeout"
    )]
    pub wait_queue_timeout: Duration,
    #[serde(rename = "heartbeat_frequency_seconds", deserialize_with = "deserialize_secs")]
    pub heartbeat_frequency: Duration,
    #[serde(rename = "server_selection_timeout_seconds", deserialize_with = "deserialize_secs")]
    pub server_selection_timeout: Duration,
    #[serde(rename = "local_threshold_seconds", deserialize_with = "deserialize_secs")]
    pub local_threshold: Duration,
    pub retry_writes: bool,
    pub retry_reads: bool,
    #[serde(rename = "connect_timeout_seconds", deserialize_with = "deserialize_secs")]
    pub connect_timeout: Duration,
    #[serde(rename = "socket_timeout_seconds", deserialize_with = "deserialize_opt_secs")]
    pub socket_timeout: Option<Duration>,
    pub app_name: Option<String>,
    pub credential: Option<Credential>,
    pub server_monitoring_mode: ServerMonitoringMode,
    pub state_change_policy: StateChangePolicy,
    /// Overrides the batch size servers advertise for multi-document inserts.
    pub max_write_batch_size: Option<u32>,
    #[serde(skip)]
    pub read_preference: Option<ReadPreference>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            hosts: vec![Address::new("localhost", connstring::DEFAULT_PORT)],
            repl_set_name: None,
            direct_connection: None,
            load_balanced: false,
            min_pool_size: 0,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_idle_time: None,
            wait_queue_timeout: DEFAULT_WAIT_QUEUE_TIMEOUT,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            retry_writes: true,
            retry_reads: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: None,
            app_name: None,
            credential: None,
            server_monitoring_mode: ServerMonitoringMode::Auto,
            state_change_policy: StateChangePolicy::default(),
            max_write_batch_size: None,
            read_preference: None,
        }
    }
}

impl ClientOptions {
    /// Options with every default and the given seed list.
    pub fn new(hosts: Vec<Address>) -> ClientOptions {
        ClientOptions {
            hosts,
            ..Default::default()
        }
    }

    /// Parses a `mongodb://` connection string into options.
    pub fn parse(uri: &str) -> Result<ClientOptions> {
        let cs = connstring::parse(uri)?;
        let mut options = ClientOptions::new(cs.hosts.clone());

        for (key, value) in cs.options.iter() {
            match key.as_str() {
                "replicaset" => options.repl_set_name = Some(value.clone()),
                "directconnection" => options.direct_connection = Some(parse_bool(key, value)?),
                "loadbalanced" => options.load_balanced = parse_bool(key, value)?,
                "minpoolsize" => options.min_pool_size = parse_u32(key, value)?,
                "maxpoolsize" => options.max_pool_size = parse_u32(key, value)?,
                "maxidletimems" => options.max_idle_time = non_zero(parse_millis(key, value)?),
                "waitqueuetimeoutms" => options.wait_queue_timeout = parse_millis(key, value)?,
                "heartbeatfrequencyms" => options.heartbeat_frequency = parse_millis(key, value)?,
                "serverselectiontimeoutms" => {
                    options.server_selection_timeout = parse_millis(key, value)?
                }
                "localthresholdms" => options.local_threshold = parse_millis(key, value)?,
                "connecttimeoutms" => options.connect_timeout = parse_millis(key, value)?,
                "sockettimeoutms" => options.socket_timeout = non_zero(parse_millis(key, value)?),
                "retrywrites" => options.retry_writes = parse_bool(key, value)?,
                "retryreads" => options.retry_reads = parse_bool(key, value)?,
                "appname" => options.app_name = Some(value.clone()),
                "servermonitoringmode" => {
                    options.server_monitoring_mode = match value.to_ascii_lowercase().as_str() {
                        "auto" => ServerMonitoringMode::Auto,
                        "stream" => ServerMonitoringMode::Stream,
                        "poll" => ServerMonitoringMode::Poll,
                        _ => return Err(invalid_option(key, value)),
                    }
                }
                "readpreference" => {
                    let mode = match value.to_ascii_lowercase().as_str() {
                        "primary" => ReadMode::Primary,
                        "primarypreferred" => ReadMode::PrimaryPreferred,
                        "secondary" => ReadMode::Secondary,
                        "secondarypreferred" => ReadMode::SecondaryPreferred,
                        "nearest" => ReadMode::Nearest,
                        _ => return Err(invalid_option(key, value)),
                    };
                    options.read_preference = Some(ReadPreference::new(mode, None));
                }
                "authsource" | "authmechanism" => {}
                _ => warn!("ignoring unsupported connection string option \"{}\"", key),
            }
        }

        if !cs.read_pref_tags.is_empty() {
            let read_pref = options
                .read_preference
                .get_or_insert_with(|| ReadPreference::new(ReadMode::Primary, None));
            for tags in cs.read_pref_tags.iter() {
                read_pref.tag_sets.push(ReadPreference::parse_tag_set(tags)?);
            }
        }

        let mechanism = match cs.get("authmechanism") {
            Some(mechanism) => Some(mechanism.parse::<AuthMechanism>()?),
            None => None,
        };
        if cs.user.is_some() || mechanism.is_some() {
            options.credential = Some(Credential {
                username: cs.user.clone(),
                password: cs.password.clone(),
                source: cs
                    .get("authsource")
                    .map(str::to_string)
                    .or_else(|| cs.database.clone()),
                mechanism,
            });
        }

        options.validate()?;
        Ok(options)
    }

    /// Rejects option combinations that can never describe a working deployment.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::configuration("at least one host is required"));
        }

        if self.load_balanced {
            if self.hosts.len() > 1 {
                return Err(Error::configuration(
                    "a load balanced deployment must be given exactly one host",
                ));
            }
            if self.repl_set_name.is_some() {
                return Err(Error::configuration(
                    "a replica set name cannot be used with a load balanced deployment",
                ));
            }
            if self.direct_connection == Some(true) {
                return Err(Error::configuration(
                    "direct connections cannot be used with a load balanced deployment",
                ));
            }
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::configuration(
                "a direct connection must be given exactly one host",
            ));
        }

        if self.max_pool_size != 0 && self.min_pool_size > self.max_pool_size {
            return Err(Error::configuration(format!(
                "min pool size ({}) exceeds max pool size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }

        if self.heartbeat_frequency < MIN_HEARTBEAT_FREQUENCY {
            return Err(Error::configuration(format!(
                "heartbeat frequency must be at least {:?}",
                MIN_HEARTBEAT_FREQUENCY
            )));
        }

        if self.max_write_batch_size == Some(0) {
            return Err(Error::configuration("max write batch size must be positive"));
        }

        if let Some(ref credential) = self.credential {
            credential.validate()?;
        }

        Ok(())
    }

    /// Whether the deployment is a single server connected to directly.
    pub(crate) fn is_direct(&self) -> bool {
        match self.direct_connection {
            Some(direct) => direct,
            None => self.hosts.len() == 1 && self.repl_set_name.is_none() && !self.load_balanced,
        }
    }
}

fn invalid_option(key: &str, value: &str) -> Error {
    Error::configuration(format!("invalid value \"{}\" for option \"{}\"", value, key))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid_option(key, value)),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| invalid_option(key, value))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid_option(key, value))
}

fn non_zero(duration: Duration) -> Option<Duration> {
    if duration == Duration::from_secs(0) {
        None
    } else {
        Some(duration)
    }
}

fn secs_to_duration<E: DeError>(secs: f64) -> std::result::Result<Duration, E> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(E::custom(format!("invalid duration of {} seconds", secs)));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    secs_to_duration(f64::deserialize(deserializer)?)
}

fn deserialize_opt_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        Some(secs) => secs_to_duration(secs).map(Some),
        None => Ok(None),
    }
}

// A missing or null wait queue timeout keeps the default; checkouts always have a deadline.
fn deserialize_wait_queue_timeout<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_opt_secs(deserializer)?.unwrap_or(DEFAULT_WAIT_QUEUE_TIMEOUT))
}

fn deserialize_addresses<'de, D>(deserializer: D) -> std::result::Result<Vec<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|host| Address::parse(host).map_err(D::Error::custom))
        .collect()
}

impl fmt::Display for ServerMonitoringMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ServerMonitoringMode::Auto => fmt.write_str("auto"),
            ServerMonitoringMode::Stream => fmt.write_str("stream"),
            ServerMonitoringMode::Poll => fmt.write_str("poll"),
        }
    }
}
