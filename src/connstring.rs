//! Server addresses and `mongodb://` connection string parsing.
use std::collections::BTreeMap;
use std::fmt;

use bson::oid::ObjectId;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 27017;
pub const URI_SCHEME: &str = "mongodb://";

/// Identifies the backend service behind a load balancer that a connection was routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId([u8; 12]);

impl ServiceId {
    pub fn new(bytes: [u8; 12]) -> ServiceId {
        ServiceId(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }
}

impl From<&ObjectId> for ServiceId {
    fn from(oid: &ObjectId) -> ServiceId {
        ServiceId(oid.bytes())
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(fmt, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Encapsulates the hostname and port of a server, plus the load balancer service it was
/// routed to when running behind one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub service_id: Option<ServiceId>,
}

impl Address {
    pub fn new(host: &str, port: u16) -> Address {
        Address {
            host: host.to_ascii_lowercase(),
            port,
            service_id: None,
        }
    }

    /// Parses a host entity of the form `host`, `host:port`, `[ipv6]` or `[ipv6]:port`.
    /// Host names are lowercased.
    pub fn parse(entity: &str) -> Result<Address> {
        if entity.is_empty() {
            return Err(Error::configuration("empty host"));
        }

        if entity.starts_with('[') {
            return parse_ipv6_literal_host(entity);
        }

        if entity.contains(':') {
            let (host, port) = partition(entity, ":");
            if port.contains(':') {
                return Err(Error::configuration(format!(
                    "invalid host \"{}\": an IPv6 address literal must be enclosed in '[' and ']'",
                    entity
                )));
            }
            if host.is_empty() {
                return Err(Error::configuration(format!("invalid host \"{}\"", entity)));
            }
            return Ok(Address::new(host, parse_port(entity, port)?));
        }

        Ok(Address::new(entity, DEFAULT_PORT))
    }

    /// Returns a copy of this address scoped to a single load balancer backend.
    pub fn with_service_id(&self, service_id: Option<ServiceId>) -> Address {
        Address {
            host: self.host.clone(),
            port: self.port,
            service_id,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(fmt, "[{}]:{}", self.host, self.port)
        } else {
            write!(fmt, "{}:{}", self.host, self.port)
        }
    }
}

/// The raw pieces of a parsed connection string.
///
/// Option keys are lowercased; values are kept as written. Read preference tags are kept in
/// the order they were given since that order is the tag set priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub hosts: Vec<Address>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub options: BTreeMap<String, String>,
    pub read_pref_tags: Vec<String>,
}

impl ConnectionString {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Parses a MongoDB connection string URI.
pub fn parse(address: &str) -> Result<ConnectionString> {
    if !address.starts_with(URI_SCHEME) {
        return Err(Error::configuration(
            "connection string must start with 'mongodb://'",
        ));
    }

    let addr = &address[URI_SCHEME.len()..];
    let (host_str, path_str) = partition(addr, "/");

    if path_str.is_empty() && host_str.contains('?') {
        return Err(Error::configuration(
            "a '/' is required between the host list and any options",
        ));
    }

    let mut user = None;
    let mut password = None;
    let hosts = if host_str.contains('@') {
        let (user_info, host_string) = rpartition(host_str, "@");
        let (u, p) = parse_user_info(user_info)?;
        user = Some(u.to_string());
        password = if p.is_empty() { None } else { Some(p.to_string()) };
        split_hosts(host_string)?
    } else {
        split_hosts(host_str)?
    };

    let (database, opts) = partition(path_str, "?");
    let database = if database.is_empty() {
        None
    } else {
        Some(database.to_string())
    };

    let (options, read_pref_tags) = if opts.is_empty() {
        (BTreeMap::new(), Vec::new())
    } else {
        split_options(opts)?
    };

    Ok(ConnectionString {
        hosts,
        user,
        password,
        database,
        options,
        read_pref_tags,
    })
}

// Parse user information of the form user:password
fn parse_user_info(user_info: &str) -> Result<(&str, &str)> {
    let (user, password) = partition(user_info, ":");
    if user_info.contains('@') || password.contains(':') {
        return Err(Error::configuration(
            "':' or '@' characters in a username or password must be escaped",
        ));
    }
    if user.is_empty() {
        return Err(Error::configuration("the empty string is not a valid username"));
    }
    Ok((user, password))
}

// Parses a literal IPv6 host entity of the form [host] or [host]:port
fn parse_ipv6_literal_host(entity: &str) -> Result<Address> {
    match entity.find(']') {
        Some(idx) => {
            let rest = &entity[idx + 1..];
            if rest.is_empty() {
                Ok(Address::new(&entity[1..idx], DEFAULT_PORT))
            } else if rest.starts_with(':') {
                Ok(Address::new(&entity[1..idx], parse_port(entity, &rest[1..])?))
            } else {
                Err(Error::configuration(format!("invalid host \"{}\"", entity)))
            }
        }
        None => Err(Error::configuration(
            "an IPv6 address must be enclosed in '[' and ']'",
        )),
    }
}

fn parse_port(entity: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::configuration(format!(
            "invalid port in host \"{}\"",
            entity
        ))),
        Ok(val) => Ok(val),
    }
}

// Splits and parses comma-separated hosts.
fn split_hosts(host_str: &str) -> Result<Vec<Address>> {
    let mut hosts = Vec::new();
    for entity in host_str.split(',') {
        if entity.is_empty() {
            return Err(Error::configuration("empty host, or extra comma in host list"));
        }
        hosts.push(Address::parse(entity)?);
    }
    Ok(hosts)
}

// Splits options on '&' or ';' and separates out read preference tags.
fn split_options(opts: &str) -> Result<(BTreeMap<String, String>, Vec<String>)> {
    let delim = match (opts.find('&'), opts.find(';')) {
        (Some(_), Some(_)) => {
            return Err(Error::configuration(
                "cannot mix '&' and ';' for option separators",
            ))
        }
        (None, Some(_)) => ';',
        _ => '&',
    };

    let mut options = BTreeMap::new();
    let mut read_pref_tags = Vec::new();

    for opt in opts.split(delim).filter(|opt| !opt.is_empty()) {
        if !opt.contains('=') {
            return Err(Error::configuration(format!(
                "URI options are key=value pairs, found \"{}\"",
                opt
            )));
        }
        let (key, val) = partition(opt, "=");
        let key = key.to_ascii_lowercase();
        if key == "readpreferencetags" {
            read_pref_tags.push(val.to_string());
        } else {
            options.insert(key, val.to_string());
        }
    }

    Ok((options, read_pref_tags))
}

// Partitions a string around the left-most occurrence of the separator, if it exists.
fn partition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.find(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}

// Partitions a string around the right-most occurrence of the separator, if it exists.
fn rpartition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.rfind(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}
