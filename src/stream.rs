//! Byte streams to servers and the transport seam the rest of the crate sends commands through.
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use bufstream::BufStream;
use log::trace;

#[cfg(feature = "ssl")]
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslOptions, SslStream, SslVerifyMode};

use crate::connstring::Address;
use crate::error::{Error, Result};
use crate::wire_protocol::Message;

/// Socket level settings for opening a channel.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    pub socket_timeout: Option<Duration>,
}

/// An open, exclusively owned command channel to one server.
pub trait Channel: Send {
    /// Sends a command and waits for its reply. `timeout` bounds the round trip; `None` waits
    /// indefinitely.
    fn send_command(&mut self, command: &Document, timeout: Option<Duration>) -> Result<Document>;

    /// Releases the underlying resources. Called once, when the owning connection is closed.
    fn close(&mut self) {}
}

/// Opens channels to servers.
///
/// [`WireTransport`] speaks OP_MSG over TCP (or TLS with the `ssl` feature). Other
/// implementations can stand in for real servers.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Box<dyn Channel>>;
}

/// Encapsulates the functionality for how to connect to the server.
#[derive(Clone, Debug)]
pub enum StreamConnector {
    /// Connect to the server through a regular TCP stream.
    Tcp,
    #[cfg(feature = "ssl")]
    /// Connect to the server through a TCP stream encrypted with TLS.
    Ssl {
        ca_file: String,
        certificate_file: String,
        key_file: String,
        verify_peer: bool,
    },
}

impl Default for StreamConnector {
    fn default() -> Self {
        StreamConnector::Tcp
    }
}

impl StreamConnector {
    #[cfg(feature = "ssl")]
    /// Creates a StreamConnector that will connect with TLS.
    ///
    /// SSLv2, SSLv3 and TLS compression are disabled, as are export-strength and
    /// unauthenticated ciphers.
    ///
    /// # Arguments
    ///
    /// `ca_file` - Path to the file containing trusted CA certificates.
    /// `certificate_file` - Path to the file containing the client certificate.
    /// `key_file` - Path to the file containing the client private key.
    /// `verify_peer` - Whether or not to verify that the server's certificate is trusted.
    pub fn with_ssl(
        ca_file: &str,
        certificate_file: &str,
        key_file: &str,
        verify_peer: bool,
    ) -> Self {
        StreamConnector::Ssl {
            ca_file: String::from(ca_file),
            certificate_file: String::from(certificate_file),
            key_file: String::from(key_file),
            verify_peer,
        }
    }

    pub fn connect(
        &self,
        hostname: &str,
        port: u16,
        connect_timeout: Option<Duration>,
    ) -> io::Result<Stream> {
        let inner_stream = connect_tcp(hostname, port, connect_timeout)?;

        match *self {
            StreamConnector::Tcp => Ok(Stream::Tcp(inner_stream)),
            #[cfg(feature = "ssl")]
            StreamConnector::Ssl {
                ref ca_file,
                ref certificate_file,
                ref key_file,
                verify_peer,
            } => {
                let mut builder = SslConnector::builder(SslMethod::tls())?;
                builder.set_cipher_list("ALL:!EXPORT:!eNULL:!aNULL:HIGH:@STRENGTH")?;
                builder.set_options(
                    SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3 | SslOptions::NO_COMPRESSION,
                );
                builder.set_ca_file(ca_file)?;
                builder.set_certificate_file(certificate_file, SslFiletype::PEM)?;
                builder.set_private_key_file(key_file, SslFiletype::PEM)?;
                builder.set_verify(if verify_peer {
                    SslVerifyMode::PEER
                } else {
                    SslVerifyMode::NONE
                });

                // The handshake shares the connect timeout.
                inner_stream.set_read_timeout(connect_timeout)?;
                inner_stream.set_write_timeout(connect_timeout)?;

                builder
                    .build()
                    .connect(hostname, inner_stream)
                    .map(Stream::Ssl)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
            }
        }
    }
}

fn connect_tcp(hostname: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let timeout = match timeout {
        Some(timeout) if timeout > Duration::from_secs(0) => timeout,
        _ => return TcpStream::connect((hostname, port)).and_then(configure),
    };

    let mut last_error = None;
    for addr in (hostname, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return configure(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{}:{} did not resolve to any address", hostname, port),
        )
    }))
}

fn configure(stream: TcpStream) -> io::Result<TcpStream> {
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "ssl")]
    Ssl(SslStream<TcpStream>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match *self {
            Stream::Tcp(ref s) => s,
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref s) => s.get_ref(),
        }
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)?;
        self.tcp().set_write_timeout(timeout)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.tcp().shutdown(Shutdown::Both)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.read(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.write(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Tcp(ref mut s) => s.flush(),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.flush(),
        }
    }
}

/// Sends OP_MSG commands over sockets opened by a [`StreamConnector`].
pub struct WireTransport {
    connector: StreamConnector,
    request_id: Arc<AtomicI32>,
}

impl WireTransport {
    pub fn new(connector: StreamConnector) -> WireTransport {
        WireTransport {
            connector,
            request_id: Arc::new(AtomicI32::new(1)),
        }
    }
}

impl Default for WireTransport {
    fn default() -> Self {
        WireTransport::new(StreamConnector::default())
    }
}

impl Transport for WireTransport {
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Box<dyn Channel>> {
        let stream = self
            .connector
            .connect(&address.host, address.port, options.connect_timeout)
            .map_err(|e| Error::from(e).with_address(address))?;

        Ok(Box::new(WireChannel {
            address: address.clone(),
            stream: BufStream::new(stream),
            request_id: self.request_id.clone(),
        }))
    }
}

struct WireChannel {
    address: Address,
    stream: BufStream<Stream>,
    request_id: Arc<AtomicI32>,
}

impl Channel for WireChannel {
    fn send_command(&mut self, command: &Document, timeout: Option<Duration>) -> Result<Document> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        self.stream.get_ref().set_timeout(timeout)?;

        Message::with_command(request_id, command.clone()).write(&mut self.stream)?;
        let reply = Message::read(&mut self.stream)?;

        if reply.header.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "reply from {} answers request {} but {} was sent",
                self.address, reply.header.response_to, request_id
            )));
        }

        trace!("received reply to request {} from {}", request_id, self.address);
        Ok(reply.body)
    }

    fn close(&mut self) {
        let _ = self.stream.get_ref().shutdown();
    }
}
