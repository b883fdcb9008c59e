//! Proxy settings and credentials.
//!
//! [`Settings`] is a plain configuration value, in the same spirit as a
//! transport config: public fields, sensible defaults, and `with_*` helpers
//! for building one up. It is validated once, before any network I/O, by
//! [`Settings::validate`].

use std::fmt;
use std::time::Duration;

use crate::error::{ArgumentError, CredentialField};

/// Maximum length, in characters, of the username and of the password.
pub const MAX_CREDENTIAL_LENGTH: usize = 255;

/// Username and password used to authenticate with the proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create a new set of credentials.
    ///
    /// Each field may be at most [`MAX_CREDENTIAL_LENGTH`] characters long.
    pub fn new<U, P>(username: U, password: P) -> Result<Self, ArgumentError>
    where
        U: Into<String>,
        P: Into<String>,
    {
        let credentials = Self {
            username: username.into(),
            password: password.into(),
        };
        credentials.validate()?;
        Ok(credentials)
    }

    /// The username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// True when both username and password are empty.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    fn validate(&self) -> Result<(), ArgumentError> {
        check_length(CredentialField::Username, &self.username)?;
        check_length(CredentialField::Password, &self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn check_length(field: CredentialField, value: &str) -> Result<(), ArgumentError> {
    let length = value.chars().count();
    if length > MAX_CREDENTIAL_LENGTH {
        return Err(ArgumentError::CredentialTooLong {
            field,
            length,
            limit: MAX_CREDENTIAL_LENGTH,
        });
    }
    Ok(())
}

/// Settings for one connection attempt.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Host name or address of the proxy.
    pub host: String,

    /// Port of the proxy.
    pub port: u16,

    /// Upper bound on resolving and connecting to the transport endpoint.
    pub connect_timeout: Duration,

    /// Timeout applied to every read and write on the socket.
    pub read_write_timeout: Duration,

    /// Credentials for the proxy, if it requires authentication.
    pub credentials: Option<Credentials>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Idle time before TCP keep-alive probes are sent.
    pub keep_alive: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            connect_timeout: Duration::from_secs(10),
            read_write_timeout: Duration::from_secs(10),
            credentials: None,
            nodelay: true,
            keep_alive: Some(Duration::from_secs(90)),
        }
    }
}

impl Settings {
    /// Settings for a proxy at `host:port`, with default timeouts.
    pub fn new<H>(host: H, port: u16) -> Self
    where
        H: Into<String>,
    {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read/write timeout.
    pub fn with_read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout = timeout;
        self
    }

    /// Set the proxy credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// The timeout for individual socket reads and writes.
    ///
    /// A zero `read_write_timeout` means reads and writes never time out.
    pub fn io_timeout(&self) -> Option<Duration> {
        if self.read_write_timeout.is_zero() {
            None
        } else {
            Some(self.read_write_timeout)
        }
    }

    /// Check the proxy endpoint and credentials.
    ///
    /// The proxy endpoint is only required when `needs_proxy` is set; in
    /// direct mode it is never used.
    pub fn validate(&self, needs_proxy: bool) -> Result<(), ArgumentError> {
        if needs_proxy {
            if self.host.is_empty() {
                return Err(ArgumentError::EmptyProxyHost);
            }
            if self.port == 0 {
                return Err(ArgumentError::InvalidProxyPort);
            }
        }

        if let Some(credentials) = &self.credentials {
            credentials.validate()?;
        }

        Ok(())
    }
}
