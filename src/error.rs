//! Error types and failure classification for discovery, pooling and retries.
use std::collections::BTreeSet;
use std::time::Duration;
use std::{error, fmt, io, sync};

use bson::{self, Bson, Document};

use crate::connstring::Address;
use crate::topology::server::TopologyVersion;

pub type Result<T> = std::result::Result<T, Error>;

/// Label attached to errors after which a write may be safely retried.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Label attached by servers when a failed retry did not perform any writes.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

const NOT_WRITABLE_PRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const SHUTDOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262, 134,
];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];

/// The error type returned by every fallible operation in this crate.
///
/// An error pairs an [`ErrorKind`] with the labels the server (or the retry layer) attached to
/// it, plus the context needed to classify it later: the wire version of the connection it
/// happened on and the server address / operation name it happened during.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    labels: BTreeSet<String>,
    pub(crate) wire_version: Option<i32>,
    address: Option<Address>,
    operation: Option<String>,
}

/// The category of an [`Error`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("network error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("{0}")]
    Command(CommandError),

    #[error("{0}")]
    Write(WriteFailure),

    #[error("{0}")]
    Pool(PoolError),

    #[error("server selection failed: {message}")]
    ServerSelection { message: String },

    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("{mechanism} authentication against \"{auth_source}\" failed: {message}")]
    Authentication {
        mechanism: String,
        auth_source: String,
        message: String,
    },

    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Distinguishes pure timeouts from every other transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransportErrorKind::Timeout => fmt.write_str("timed out"),
            TransportErrorKind::Io => fmt.write_str("I/O"),
        }
    }
}

/// A command the server answered with `ok: 0`, or a write concern failure.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub topology_version: Option<TopologyVersion>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "command failed with code {}", self.code)?;
        if !self.code_name.is_empty() {
            write!(fmt, " ({})", self.code_name)?;
        }
        write!(fmt, ": {}", self.message)
    }
}

/// The first entry of a `writeErrors` reply array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteFailure {
    pub index: i32,
    pub code: i32,
    pub message: String,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "write error at index {} with code {}: {}",
            self.index, self.code, self.message
        )
    }
}

/// Failures raised by a connection pool rather than a server.
#[derive(Clone, Debug, PartialEq)]
pub enum PoolError {
    CheckOutTimeout { timeout: Duration },
    PoolCleared { cause: Option<String> },
    PoolClosed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PoolError::CheckOutTimeout { timeout } => write!(
                fmt,
                "timed out after {:?} waiting to check out a connection",
                timeout
            ),
            PoolError::PoolCleared { cause: Some(ref cause) } => {
                write!(fmt, "connection pool was cleared because of: {}", cause)
            }
            PoolError::PoolCleared { cause: None } => fmt.write_str("connection pool was cleared"),
            PoolError::PoolClosed => fmt.write_str("connection pool is closed"),
        }
    }
}

impl error::Error for PoolError {}

impl Error {
    pub fn new<L>(kind: ErrorKind, labels: L) -> Error
    where
        L: IntoIterator<Item = String>,
    {
        Error {
            kind,
            labels: labels.into_iter().collect(),
            wire_version: None,
            address: None,
            operation: None,
        }
    }

    pub(crate) fn network_timeout(message: impl Into<String>) -> Error {
        ErrorKind::Transport {
            kind: TransportErrorKind::Timeout,
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Error {
        ErrorKind::Configuration {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn server_selection(message: impl Into<String>) -> Error {
        ErrorKind::ServerSelection {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn pool_cleared(cause: Option<String>) -> Error {
        ErrorKind::Pool(PoolError::PoolCleared { cause }).into()
    }

    pub(crate) fn pool_closed() -> Error {
        ErrorKind::Pool(PoolError::PoolClosed).into()
    }

    pub(crate) fn checkout_timeout(timeout: Duration) -> Error {
        ErrorKind::Pool(PoolError::CheckOutTimeout { timeout }).into()
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub(crate) fn add_label(&mut self, label: &str) {
        self.labels.insert(label.to_string());
    }

    /// The server this error was observed on, if known.
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// The name of the operation that failed, if known.
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_ref().map(String::as_str)
    }

    /// The max wire version of the connection that produced this error, if known.
    pub fn wire_version(&self) -> Option<i32> {
        self.wire_version
    }

    pub(crate) fn with_address(mut self, address: &Address) -> Error {
        if self.address.is_none() {
            self.address = Some(address.clone());
        }
        self
    }

    pub(crate) fn with_operation(mut self, operation: &str) -> Error {
        if self.operation.is_none() {
            self.operation = Some(operation.to_string());
        }
        self
    }

    /// The server error code, if this error came from a server reply.
    pub fn code(&self) -> Option<i32> {
        match self.kind {
            ErrorKind::Command(ref err) => Some(err.code),
            ErrorKind::Write(ref err) => Some(err.code),
            _ => None,
        }
    }

    fn server_message(&self) -> Option<&str> {
        match self.kind {
            ErrorKind::Command(ref err) => Some(&err.message),
            ErrorKind::Write(ref err) => Some(&err.message),
            _ => None,
        }
    }

    pub(crate) fn topology_version(&self) -> Option<&TopologyVersion> {
        match self.kind {
            ErrorKind::Command(ref err) => err.topology_version.as_ref(),
            _ => None,
        }
    }

    pub fn is_network_error(&self) -> bool {
        match self.kind {
            ErrorKind::Transport { .. } => true,
            _ => false,
        }
    }

    pub fn is_network_timeout(&self) -> bool {
        match self.kind {
            ErrorKind::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            } => true,
            _ => false,
        }
    }

    pub fn is_non_timeout_network_error(&self) -> bool {
        self.is_network_error() && !self.is_network_timeout()
    }

    pub fn is_server_selection_error(&self) -> bool {
        match self.kind {
            ErrorKind::ServerSelection { .. } => true,
            _ => false,
        }
    }

    pub fn is_authentication_error(&self) -> bool {
        match self.kind {
            ErrorKind::Authentication { .. } => true,
            _ => false,
        }
    }

    pub fn is_pool_cleared(&self) -> bool {
        match self.kind {
            ErrorKind::Pool(PoolError::PoolCleared { .. }) => true,
            _ => false,
        }
    }

    pub fn is_checkout_timeout(&self) -> bool {
        match self.kind {
            ErrorKind::Pool(PoolError::CheckOutTimeout { .. }) => true,
            _ => false,
        }
    }

    /// Whether the server replied at all, as opposed to a client-side failure.
    pub fn is_server_error(&self) -> bool {
        match self.kind {
            ErrorKind::Command(_) | ErrorKind::Write(_) | ErrorKind::Transport { .. } => true,
            _ => false,
        }
    }

    /// The server is not (or is no longer) a writable primary.
    pub fn is_not_writable_primary(&self) -> bool {
        if self.is_recovering() {
            return false;
        }
        match self.code() {
            Some(code) if NOT_WRITABLE_PRIMARY_CODES.contains(&code) => true,
            // Older servers only identify these through their message text.
            Some(0) | None => self
                .server_message()
                .map_or(false, |message| message.contains("not master")),
            Some(_) => false,
        }
    }

    /// The server is starting up, shutting down or otherwise recovering.
    pub fn is_recovering(&self) -> bool {
        match self.code() {
            Some(code) if RECOVERING_CODES.contains(&code) => true,
            Some(0) | None => self.server_message().map_or(false, |message| {
                message.contains("not master or secondary") || message.contains("node is recovering")
            }),
            Some(_) => false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.code().map_or(false, |code| SHUTDOWN_CODES.contains(&code))
    }

    /// A "not writable primary" or "node is recovering" error.
    pub fn is_state_change_error(&self) -> bool {
        self.is_not_writable_primary() || self.is_recovering()
    }

    pub fn is_read_retryable(&self) -> bool {
        if self.is_network_error() || self.is_pool_cleared() {
            return true;
        }
        match self.code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code),
            None => false,
        }
    }

    pub fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the retry layer should attach the `RetryableWriteError` label to this error
    /// itself. Servers from wire version 9 on label their own errors.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if self.is_network_error() || self.is_pool_cleared() {
            return true;
        }
        if max_wire_version >= 9 {
            return false;
        }
        match self.code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Converts a command reply into an error if it reports a failure.
    pub(crate) fn from_reply(reply: &Document) -> Option<Error> {
        let labels = reply
            .get_array("errorLabels")
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|label| match *label {
                        Bson::String(ref s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if !reply_ok(reply) {
            return Some(Error::new(
                ErrorKind::Command(command_error_from(reply)),
                labels,
            ));
        }

        if let Ok(wc_error) = reply.get_document("writeConcernError") {
            return Some(Error::new(
                ErrorKind::Command(command_error_from(wc_error)),
                labels,
            ));
        }

        None
    }
}

/// Reads the `ok` field of a reply, accepting every numeric encoding servers use.
pub(crate) fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(&Bson::FloatingPoint(ok)) => ok == 1.0,
        Some(&Bson::I32(ok)) => ok == 1,
        Some(&Bson::I64(ok)) => ok == 1,
        Some(&Bson::Boolean(ok)) => ok,
        _ => false,
    }
}

fn command_error_from(doc: &Document) -> CommandError {
    let code = match doc.get("code") {
        Some(&Bson::I32(code)) => code,
        Some(&Bson::I64(code)) => code as i32,
        Some(&Bson::FloatingPoint(code)) => code as i32,
        _ => 0,
    };

    CommandError {
        code,
        code_name: doc.get_str("codeName").unwrap_or_default().to_string(),
        message: doc.get_str("errmsg").unwrap_or_default().to_string(),
        topology_version: doc
            .get_document("topologyVersion")
            .ok()
            .and_then(TopologyVersion::from_document),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.kind)?;
        if let Some(ref operation) = self.operation {
            write!(fmt, " during {}", operation)?;
        }
        if let Some(ref address) = self.address {
            write!(fmt, " on {}", address)?;
        }
        if !self.labels.is_empty() {
            write!(fmt, " (labels: {:?})", self.labels)?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind, None)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Io,
        };

        ErrorKind::Transport {
            kind,
            message: err.to_string(),
        }
        .into()
    }
}

impl From<bson::EncoderError> for Error {
    fn from(err: bson::EncoderError) -> Error {
        Error::internal(format!("failed to encode BSON: {}", err))
    }
}

impl From<bson::DecoderError> for Error {
    fn from(err: bson::DecoderError) -> Error {
        Error::invalid_response(format!("failed to decode BSON: {}", err))
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::internal("lock poisoned")
    }
}
