use std::fmt::{Display, Error, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::connstring::{Address, ServiceId};
use crate::error::Error as ClusterError;
use crate::pool::PoolOptions;
use crate::topology::server::ServerDescription;
use crate::topology::TopologyDescription;

/// Server discovery and monitoring events.
#[derive(Clone, Debug)]
pub enum SdamEvent {
    ServerOpening {
        address: Address,
    },
    ServerClosed {
        address: Address,
    },
    ServerDescriptionChanged {
        address: Address,
        previous: Arc<ServerDescription>,
        new: Arc<ServerDescription>,
    },
    TopologyDescriptionChanged {
        previous: TopologyDescription,
        new: TopologyDescription,
    },
    ServerHeartbeatStarted {
        address: Address,
        awaited: bool,
    },
    ServerHeartbeatSucceeded {
        address: Address,
        awaited: bool,
        duration: Duration,
    },
    ServerHeartbeatFailed {
        address: Address,
        awaited: bool,
        duration: Duration,
        error: ClusterError,
    },
}

/// Why a pooled connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionClosedReason {
    /// The pool was cleared after the connection was created.
    Stale,
    /// The connection sat unused for longer than the max idle time.
    Idle,
    /// A network error left the connection unusable.
    Error,
    /// The pool was closed.
    PoolClosed,
}

/// Why a checkout failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionCheckoutFailedReason {
    Timeout,
    ConnectionError,
    PoolClosed,
}

/// Connection pool events.
#[derive(Clone, Debug)]
pub enum CmapEvent {
    PoolCreated {
        address: Address,
        options: PoolOptions,
    },
    PoolReady {
        address: Address,
    },
    PoolCleared {
        address: Address,
        service_id: Option<ServiceId>,
    },
    PoolClosed {
        address: Address,
    },
    ConnectionCreated {
        address: Address,
        connection_id: u32,
    },
    ConnectionReady {
        address: Address,
        connection_id: u32,
        duration: Duration,
    },
    ConnectionClosed {
        address: Address,
        connection_id: u32,
        reason: ConnectionClosedReason,
    },
    ConnectionCheckoutStarted {
        address: Address,
    },
    ConnectionCheckoutFailed {
        address: Address,
        reason: ConnectionCheckoutFailedReason,
        duration: Duration,
    },
    ConnectionCheckedOut {
        address: Address,
        connection_id: u32,
        duration: Duration,
    },
    ConnectionCheckedIn {
        address: Address,
        connection_id: u32,
    },
}

impl Display for SdamEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match *self {
            SdamEvent::ServerOpening { ref address } => write!(fmt, "SERVER {} OPENING", address),
            SdamEvent::ServerClosed { ref address } => write!(fmt, "SERVER {} CLOSED", address),
            SdamEvent::ServerDescriptionChanged {
                ref address,
                ref previous,
                ref new,
            } => write!(
                fmt,
                "SERVER {} CHANGED: {} -> {}",
                address,
                previous.server_type(),
                new.server_type()
            ),
            SdamEvent::TopologyDescriptionChanged {
                ref previous,
                ref new,
            } => write!(
                fmt,
                "TOPOLOGY CHANGED: {:?} -> {:?} ({} servers)",
                previous.topology_type(),
                new.topology_type(),
                new.server_addresses().count()
            ),
            SdamEvent::ServerHeartbeatStarted {
                ref address,
                awaited,
            } => write!(fmt, "HEARTBEAT {} STARTED (awaited: {})", address, awaited),
            SdamEvent::ServerHeartbeatSucceeded {
                ref address,
                duration,
                ..
            } => write!(fmt, "HEARTBEAT {} SUCCEEDED ({:?})", address, duration),
            SdamEvent::ServerHeartbeatFailed {
                ref address,
                duration,
                ref error,
                ..
            } => write!(fmt, "HEARTBEAT {} FAILED: {} ({:?})", address, error, duration),
        }
    }
}

impl Display for CmapEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match *self {
            CmapEvent::PoolCreated { ref address, .. } => write!(fmt, "POOL {} CREATED", address),
            CmapEvent::PoolReady { ref address } => write!(fmt, "POOL {} READY", address),
            CmapEvent::PoolCleared {
                ref address,
                service_id: Some(ref service_id),
            } => write!(fmt, "POOL {} CLEARED (service {})", address, service_id),
            CmapEvent::PoolCleared { ref address, .. } => write!(fmt, "POOL {} CLEARED", address),
            CmapEvent::PoolClosed { ref address } => write!(fmt, "POOL {} CLOSED", address),
            CmapEvent::ConnectionCreated {
                ref address,
                connection_id,
            } => write!(fmt, "CONNECTION {}#{} CREATED", address, connection_id),
            CmapEvent::ConnectionReady {
                ref address,
                connection_id,
                duration,
            } => write!(
                fmt,
                "CONNECTION {}#{} READY ({:?})",
                address, connection_id, duration
            ),
            CmapEvent::ConnectionClosed {
                ref address,
                connection_id,
                reason,
            } => write!(
                fmt,
                "CONNECTION {}#{} CLOSED: {:?}",
                address, connection_id, reason
            ),
            CmapEvent::ConnectionCheckoutStarted { ref address } => {
                write!(fmt, "CHECKOUT {} STARTED", address)
            }
            CmapEvent::ConnectionCheckoutFailed {
                ref address,
                reason,
                duration,
            } => write!(
                fmt,
                "CHECKOUT {} FAILED: {:?} ({:?})",
                address, reason, duration
            ),
            CmapEvent::ConnectionCheckedOut {
                ref address,
                connection_id,
                duration,
            } => write!(
                fmt,
                "CONNECTION {}#{} CHECKED OUT ({:?})",
                address, connection_id, duration
            ),
            CmapEvent::ConnectionCheckedIn {
                ref address,
                connection_id,
            } => write!(fmt, "CONNECTION {}#{} CHECKED IN", address, connection_id),
        }
    }
}
