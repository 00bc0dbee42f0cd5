//! A single established, handshaken connection to a server.
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{bson, doc, Document};
use log::debug;

use crate::auth::{self, Authenticator, Credential};
use crate::connstring::{Address, ServiceId};
use crate::error::{Error, Result};
use crate::options::ClientOptions;
use crate::stream::{Channel, ConnectOptions, Transport};
use crate::topology::monitor::HelloReply;
use crate::topology::server::{ServerDescription, ServerType};

pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 100_000;

/// What the handshake told us about the server on the other end of a connection.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescription {
    pub address: Address,
    pub server_type: ServerType,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub max_write_batch_size: i64,
    pub logical_session_timeout: Option<Duration>,
    pub service_id: Option<ServiceId>,
    pub hello_ok: bool,
}

impl StreamDescription {
    pub(crate) fn from_hello(address: &Address, reply: &HelloReply, load_balanced: bool) -> Self {
        let server_type = if load_balanced {
            ServerType::LoadBalancer
        } else {
            ServerDescription::from_hello(address.clone(), reply, None).server_type()
        };

        StreamDescription {
            address: address.clone(),
            server_type,
            min_wire_version: reply.min_wire_version,
            max_wire_version: reply.max_wire_version,
            max_bson_object_size: reply.max_bson_object_size,
            max_message_size_bytes: reply.max_message_size_bytes,
            max_write_batch_size: reply
                .max_write_batch_size
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            logical_session_timeout: reply.logical_session_timeout,
            service_id: reply.service_id,
            hello_ok: reply.hello_ok,
        }
    }

    /// Whether writes sent over this connection may carry a transaction number and be retried.
    pub fn supports_retryable_writes(&self) -> bool {
        match self.server_type {
            ServerType::LoadBalancer => true,
            ServerType::Standalone | ServerType::Unknown => false,
            _ => self.logical_session_timeout.is_some() && self.max_wire_version >= 6,
        }
    }
}

/// An open connection to a server that has completed its handshake.
pub struct Connection {
    id: u32,
    address: Address,
    pub(crate) generation: u32,
    service_id: Option<ServiceId>,
    channel: Box<dyn Channel>,
    stream_description: Option<StreamDescription>,
    socket_timeout: Option<Duration>,
    errored: bool,
    last_checked_in: Option<Instant>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("service_id", &self.service_id)
            .finish()
    }
}

impl Connection {
    fn new(
        id: u32,
        address: Address,
        generation: u32,
        channel: Box<dyn Channel>,
        socket_timeout: Option<Duration>,
    ) -> Connection {
        Connection {
            id,
            address,
            generation,
            service_id: None,
            channel,
            stream_description: None,
            socket_timeout,
            errored: false,
            last_checked_in: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The pool generation this connection was created in.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The load balancer backend this connection is routed to.
    pub fn service_id(&self) -> Option<&ServiceId> {
        self.service_id.as_ref()
    }

    pub fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            Error::internal(format!(
                "connection {} to {} has not completed its handshake",
                self.id, self.address
            ))
        })
    }

    /// Sends a command using the configured socket timeout. Replies with `ok: 0` or a write
    /// concern error are returned as errors.
    pub fn send_command(&mut self, command: Document) -> Result<Document> {
        let timeout = self.socket_timeout;
        self.send_command_with_timeout(command, timeout)
    }

    pub(crate) fn send_command_with_timeout(
        &mut self,
        command: Document,
        timeout: Option<Duration>,
    ) -> Result<Document> {
        let result = match self.channel.send_command(&command, timeout) {
            Ok(reply) => match Error::from_reply(&reply) {
                Some(err) => Err(err),
                None => Ok(reply),
            },
            Err(err) => {
                if err.is_network_error() {
                    self.errored = true;
                }
                Err(err)
            }
        };

        result.map_err(|mut err| {
            if let Some(ref description) = self.stream_description {
                err.wire_version = Some(description.max_wire_version);
            }
            err.with_address(&self.address)
        })
    }

    /// Whether a network error has made this connection unusable.
    pub fn has_errored(&self) -> bool {
        self.errored
    }

    pub(crate) fn mark_checked_in(&mut self) {
        self.last_checked_in = Some(Instant::now());
    }

    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (max_idle_time, self.last_checked_in) {
            (Some(max_idle_time), Some(checked_in)) => checked_in.elapsed() >= max_idle_time,
            _ => false,
        }
    }

    pub(crate) fn close(mut self) {
        self.channel.close();
    }
}

/// Opens channels and runs the handshake (and, for pooled connections, authentication).
pub(crate) struct ConnectionEstablisher {
    transport: Arc<dyn Transport>,
    connect_options: ConnectOptions,
    app_name: Option<String>,
    load_balanced: bool,
    credential: Option<Credential>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl ConnectionEstablisher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        options: &ClientOptions,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> ConnectionEstablisher {
        ConnectionEstablisher {
            transport,
            connect_options: ConnectOptions {
                connect_timeout: Some(options.connect_timeout),
                socket_timeout: options.socket_timeout,
            },
            app_name: options.app_name.clone(),
            load_balanced: options.load_balanced,
            credential: options.credential.clone(),
            authenticator,
        }
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.connect_options.connect_timeout
    }

    // Sends the client metadata the server logs for each incoming connection.
    //
    // See https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
    pub(crate) fn handshake_command(&self, negotiate_auth: bool) -> Document {
        let mut client = doc! {
            "driver": {
                "name": crate::DRIVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        };
        if let Some(ref app_name) = self.app_name {
            client.insert("application", doc! { "name": app_name.clone() });
        }

        let mut command = doc! {
            "isMaster": 1,
            "helloOk": true,
            "client": client,
        };
        if self.load_balanced {
            command.insert("loadBalanced", true);
        }
        if negotiate_auth {
            if let Some(ref credential) = self.credential {
                credential.append_needed_mechanism_negotiation(&mut command);
            }
        }
        command
    }

    /// Opens a connection for a monitor. Monitoring connections never authenticate.
    pub(crate) fn establish_monitoring_connection(
        &self,
        address: &Address,
    ) -> Result<(Connection, HelloReply)> {
        let channel = self.transport.connect(address, &self.connect_options)?;
        let mut connection = Connection::new(0, address.clone(), 0, channel, None);
        let reply = self.handshake(&mut connection, self.handshake_command(false))?;
        Ok((connection, reply))
    }

    /// Opens, handshakes and authenticates a connection for a pool.
    pub(crate) fn establish_connection(
        &self,
        address: &Address,
        id: u32,
        generation: u32,
    ) -> Result<Connection> {
        let channel = self
            .transport
            .connect(address, &self.connect_options)
            .map_err(|e| e.with_address(address))?;
        let mut connection = Connection::new(
            id,
            address.clone(),
            generation,
            channel,
            self.connect_options.socket_timeout,
        );

        let reply = self.handshake(&mut connection, self.handshake_command(true))?;

        if self.load_balanced {
            match reply.service_id {
                Some(service_id) => connection.service_id = Some(service_id),
                None => {
                    return Err(Error::invalid_response(
                        "connected in load balanced mode but the server did not report a serviceId",
                    )
                    .with_address(address))
                }
            }
        }

        if let (Some(credential), Some(authenticator)) =
            (self.credential.as_ref(), self.authenticator.as_ref())
        {
            auth::authenticate_connection(authenticator.as_ref(), &mut connection, credential, &reply)?;
        }

        debug!("established connection {} to {}", id, address);
        Ok(connection)
    }

    fn handshake(&self, connection: &mut Connection, command: Document) -> Result<HelloReply> {
        let timeout = self.connect_options.connect_timeout;
        let reply = connection.send_command_with_timeout(command, timeout)?;
        let reply = HelloReply::parse(&connection.address, reply)?;
        connection.stream_description = Some(StreamDescription::from_hello(
            &connection.address,
            &reply,
            self.load_balanced,
        ));
        Ok(reply)
    }
}
