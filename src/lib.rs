//! Server discovery and monitoring, connection pooling and retry policy for MongoDB
//! deployments.
//!
//! A [`Cluster`](cluster/struct.Cluster.html) starts one monitor thread per server it knows
//! about and folds what the monitors learn into a
//! [`TopologyDescription`](topology/struct.TopologyDescription.html). Each server owns a
//! [`ConnectionPool`](pool/struct.ConnectionPool.html) that is kept at its minimum size by a
//! background worker, paused when the server is found to be unavailable and marked ready again
//! once the server is seen healthy.
//!
//! Operations select a server, check out a connection and run; the executor classifies
//! failures, updates the topology accordingly and retries reads and writes at most once.
//!
//! ```no_run
//! use bson::{bson, doc};
//! use mongodb_cluster::operation::Find;
//! use mongodb_cluster::{ClientOptions, Cluster};
//!
//! let options = ClientOptions::parse("mongodb://localhost:27017/?replicaSet=rs0").unwrap();
//! let cluster = Cluster::new(options).unwrap();
//!
//! cluster.insert_one("test", "people", doc! { "name": "Kevin" }).unwrap();
//! let people = cluster.execute(&mut Find::new("test", "people", doc! {})).unwrap();
//! assert_eq!(people.len(), 1);
//!
//! cluster.close();
//! ```
pub mod apm;
pub mod auth;
pub mod cluster;
pub mod common;
pub mod connection;
pub mod connstring;
pub mod error;
mod executor;
pub mod operation;
pub mod options;
pub mod pool;
pub mod stream;
pub mod topology;
pub mod wire_protocol;

pub use crate::cluster::{Cluster, ClusterBuilder, HandshakePhase};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::options::ClientOptions;

/// The driver name reported in connection handshakes.
pub const DRIVER_NAME: &str = "mongodb-cluster";
