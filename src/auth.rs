//! Credentials, mechanism negotiation and the hook through which a connection is authenticated.
//!
//! This crate does not implement any SASL conversation itself. It negotiates which mechanism a
//! connection should use and hands the freshly established connection to an [`Authenticator`]
//! supplied by the caller.
use std::fmt;
use std::str::FromStr;

use bson::{Bson, Document};
use serde_derive::Deserialize;

use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::topology::monitor::HelloReply;

/// The authentication mechanisms a credential may request.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum AuthMechanism {
    #[serde(rename = "SCRAM-SHA-1")]
    ScramSha1,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "MONGODB-X509")]
    MongoDbX509,
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "MONGODB-AWS")]
    MongoDbAws,
    #[serde(rename = "GSSAPI")]
    Gssapi,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match *self {
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::MongoDbX509 => "MONGODB-X509",
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::MongoDbAws => "MONGODB-AWS",
            AuthMechanism::Gssapi => "GSSAPI",
        }
    }

    /// The database credentials for this mechanism live in when no source is given.
    pub fn default_source(&self) -> &'static str {
        match *self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => "admin",
            _ => "$external",
        }
    }

    fn requires_password(&self) -> bool {
        match *self {
            AuthMechanism::MongoDbX509 | AuthMechanism::MongoDbAws | AuthMechanism::Gssapi => {
                false
            }
            _ => true,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SCRAM-SHA-1" => Ok(AuthMechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
            "MONGODB-X509" => Ok(AuthMechanism::MongoDbX509),
            "PLAIN" => Ok(AuthMechanism::Plain),
            "MONGODB-AWS" => Ok(AuthMechanism::MongoDbAws),
            "GSSAPI" => Ok(AuthMechanism::Gssapi),
            other => Err(Error::configuration(format!(
                "unsupported authentication mechanism \"{}\"",
                other
            ))),
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// The user identity every pooled connection authenticates as.
#[derive(Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Credential {
    pub username: Option<String>,
    pub password: Option<String>,
    pub source: Option<String>,
    pub mechanism: Option<AuthMechanism>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("source", &self.source)
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

impl Credential {
    /// The database to authenticate against.
    pub fn resolved_source(&self) -> &str {
        match (self.source.as_ref(), self.mechanism.as_ref()) {
            (Some(source), _) => source.as_str(),
            (None, Some(mechanism)) => mechanism.default_source(),
            (None, None) => "admin",
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let mechanism = self.mechanism.clone().unwrap_or(AuthMechanism::ScramSha256);
        if self.username.is_none() && mechanism.requires_password() {
            return Err(Error::configuration(format!(
                "{} requires a username",
                mechanism
            )));
        }
        if self.password.is_none() && mechanism.requires_password() {
            return Err(Error::configuration(format!(
                "{} requires a password",
                mechanism
            )));
        }
        Ok(())
    }

    /// Asks the server which SASL mechanisms the user supports when none was configured.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Picks the mechanism to authenticate with: the configured one, else SCRAM-SHA-256 when
    /// the server advertised it for this user, else SCRAM-SHA-1.
    pub(crate) fn negotiate_mechanism(&self, reply: &HelloReply) -> AuthMechanism {
        if let Some(ref mechanism) = self.mechanism {
            return mechanism.clone();
        }

        let supports_sha256 = reply
            .sasl_supported_mechs
            .as_ref()
            .map_or(false, |mechs| {
                mechs.iter().any(|mech| mech == AuthMechanism::ScramSha256.as_str())
            });

        if supports_sha256 {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }
}

/// Runs an authentication conversation over an established connection.
///
/// Implementations send their commands with [`Connection::send_command`]. Returned errors are
/// wrapped with the mechanism and source by the caller; network errors are passed through so
/// they are classified like any other connection failure.
pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        connection: &mut Connection,
        credential: &Credential,
        mechanism: &AuthMechanism,
    ) -> Result<()>;
}

pub(crate) fn authenticate_connection(
    authenticator: &dyn Authenticator,
    connection: &mut Connection,
    credential: &Credential,
    reply: &HelloReply,
) -> Result<()> {
    let mechanism = credential.negotiate_mechanism(reply);
    let address = connection.address().clone();

    authenticator
        .authenticate(connection, credential, &mechanism)
        .map_err(|err| {
            if err.is_network_error() {
                return err.with_address(&address);
            }
            Error::from(ErrorKind::Authentication {
                mechanism: mechanism.to_string(),
                auth_source: credential.resolved_source().to_string(),
                message: err.to_string(),
            })
            .with_address(&address)
        })
}

/// Reads the `saslSupportedMechs` array out of a handshake reply.
pub(crate) fn sasl_supported_mechs(reply: &Document) -> Option<Vec<String>> {
    reply.get_array("saslSupportedMechs").ok().map(|mechs| {
        mechs
            .iter()
            .filter_map(|mech| match *mech {
                Bson::String(ref s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    })
}
