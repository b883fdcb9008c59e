//! Errors raised while establishing a tunneled connection.
//!
//! Every failure is reported through [`Error`], which separates argument
//! validation (raised before any network I/O), transport connection failures,
//! handshake protocol failures, and response timeouts.

use std::fmt;
use std::io;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Boxed error type used when a source error is type-erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when a connection could not be established.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument or setting was invalid. No network I/O was performed.
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    /// The transport connection could not be opened.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The proxy handshake failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No response bytes arrived from the proxy before the deadline.
    #[error("timed out after {}ms waiting for data from the proxy", .0.as_millis())]
    Timeout(Duration),
}

impl Error {
    /// The proxy status code, if the tunnel was rejected by the proxy.
    pub fn rejected_status(&self) -> Option<StatusCode> {
        match self {
            Error::Protocol(ProtocolError::TunnelRejected(code)) => Some(*code),
            _ => None,
        }
    }

    /// Whether this error was raised by validation, before any I/O.
    pub fn is_argument(&self) -> bool {
        matches!(self, Error::Argument(_))
    }
}

/// Invalid destination, proxy endpoint, or credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ArgumentError {
    /// The destination host was empty.
    #[error("destination host must not be empty")]
    EmptyHost,

    /// The destination host contained whitespace or control characters.
    #[error("destination host {0:?} contains whitespace or control characters")]
    InvalidHost(String),

    /// The destination port was outside `1..=65535`.
    #[error("destination port {0} is out of range (1-65535)")]
    PortOutOfRange(u32),

    /// The proxy host in the settings was empty.
    #[error("proxy host must not be empty")]
    EmptyProxyHost,

    /// The proxy port in the settings was zero.
    #[error("proxy port must be in range (1-65535)")]
    InvalidProxyPort,

    /// A credential field exceeded the maximum length.
    #[error("proxy {field} is {length} characters long, the limit is {limit}")]
    CredentialTooLong {
        /// Which credential field was too long.
        field: CredentialField,
        /// Length of the rejected value, in characters.
        length: usize,
        /// The maximum permitted length.
        limit: usize,
    },

    /// A URI did not carry a usable host or port.
    #[error("invalid destination uri: {0}")]
    InvalidUri(&'static str),
}

/// Names a field of the proxy credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    /// The username.
    Username,
    /// The password.
    Password,
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialField::Username => f.write_str("username"),
            CredentialField::Password => f.write_str("password"),
        }
    }
}

/// Which endpoint the transport connection was opened to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// The intermediary proxy server.
    Proxy,
    /// The destination server itself, when no proxy is in use.
    Server,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Proxy => f.write_str("proxy-server"),
            Endpoint::Server => f.write_str("server"),
        }
    }
}

/// Failure to open the transport connection.
#[derive(Debug, Error)]
#[error("failed to connect to {endpoint}: {kind}")]
pub struct ConnectError {
    endpoint: Endpoint,
    #[source]
    kind: ConnectErrorKind,
}

impl ConnectError {
    pub(crate) fn new(endpoint: Endpoint, kind: ConnectErrorKind) -> Self {
        Self { endpoint, kind }
    }

    pub(crate) fn not_connected(endpoint: Endpoint) -> Self {
        Self::new(endpoint, ConnectErrorKind::NotConnected)
    }

    /// The endpoint that could not be reached.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// What went wrong.
    pub fn kind(&self) -> &ConnectErrorKind {
        &self.kind
    }

    /// Whether the connect deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ConnectErrorKind::Timeout(_))
    }
}

/// The cause of a [`ConnectError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectErrorKind {
    /// The connect deadline elapsed.
    #[error("connection timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Name resolution failed.
    #[error("dns resolution")]
    Resolve(#[source] io::Error),

    /// Name resolution returned no addresses.
    #[error("no addresses resolved")]
    NoAddresses,

    /// The socket reported an error while connecting.
    #[error("tcp connect error")]
    Io(#[source] io::Error),

    /// A socket handed to a tunnel strategy was not connected.
    #[error("socket is not connected")]
    NotConnected,
}

/// Failure interpreting the proxy's handshake response.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The proxy closed the connection without sending any data.
    #[error("received empty response")]
    Empty,

    /// The response did not contain an HTTP status line.
    #[error("received wrong response from proxy")]
    Malformed,

    /// The status line carried digits which are not a status code.
    #[error("invalid status code: {0}")]
    InvalidStatus(String),

    /// The proxy answered with a status other than 200.
    #[error("the proxy didn't reply with 200 OK (got {0})")]
    TunnelRejected(StatusCode),

    /// The socket failed while talking to the proxy.
    #[error("error while working with proxy")]
    Io(#[source] io::Error),
}
