//! Hypertunnel
//!
//! Bounded-time connections to a destination, optionally tunneled through an
//! HTTP `CONNECT` proxy.
//!
//! A [`ConnectionEstablisher`] is built from a [`TunnelStrategy`] and
//! [`Settings`]. Each call to [`ConnectionEstablisher::establish`] opens a new
//! socket, negotiates the tunnel, and returns a [`TunnelStream`] ready for an
//! application protocol.
//!
//! ```no_run
//! # use hypertunnel::{Credentials, ConnectionEstablisher, HttpTunnel, Settings};
//! # use tokio::io::AsyncWriteExt as _;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::new("127.0.0.1", 8888)
//!     .with_credentials(Credentials::new("user", "secret")?);
//! let establisher = ConnectionEstablisher::new(HttpTunnel::new(), settings);
//!
//! let mut stream = establisher.establish("example.com", 80).await?;
//! stream.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod dns;
pub mod error;
mod establish;
pub mod header;
pub mod info;
pub mod settings;
pub mod stream;
pub mod tunnel;

pub use self::error::{BoxError, Error};
pub use self::establish::ConnectionEstablisher;
pub use self::settings::{Credentials, Settings};
pub use self::stream::TunnelStream;
pub use self::tunnel::{DirectTunnel, HttpTunnel, TunnelStrategy};
