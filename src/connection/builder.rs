//! Builder for configuring and establishing a [`Connection`] (§4.G).

use std::time::Duration;

use tokio::net::UnixStream;

use crate::address::Address;
use crate::error::{Error, ErrorKind};
use crate::protocol::Endianness;
use crate::sasl::Mechanism;

use super::Connection;

/// The default deadline for opening the underlying socket.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

enum Target {
    Session,
    System,
    Address(String),
}

/// Configures and establishes a [`Connection`].
pub struct ConnectionBuilder {
    target: Target,
    mechanism: Option<Mechanism>,
    endianness: Endianness,
    connect_timeout: Duration,
}

impl ConnectionBuilder {
    /// Start building a connection, defaulting to the session bus.
    pub fn new() -> ConnectionBuilder {
        ConnectionBuilder {
            target: Target::Session,
            mechanism: None,
            endianness: Endianness::NATIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Target the session bus (`DBUS_SESSION_BUS_ADDRESS`).
    pub fn session(mut self) -> ConnectionBuilder {
        self.target = Target::Session;
        self
    }

    /// Target the system bus (`DBUS_SYSTEM_BUS_ADDRESS`, or the well
    /// known fallback path).
    pub fn system(mut self) -> ConnectionBuilder {
        self.target = Target::System;
        self
    }

    /// Target an explicit address string.
    pub fn address(mut self, address: impl Into<String>) -> ConnectionBuilder {
        self.target = Target::Address(address.into());
        self
    }

    /// Override the SASL mechanism. Defaults to `EXTERNAL` using the
    /// current process's user id where available, `ANONYMOUS` otherwise.
    pub fn mechanism(mut self, mechanism: Mechanism) -> ConnectionBuilder {
        self.mechanism = Some(mechanism);
        self
    }

    /// Override the deadline for opening the underlying socket. Defaults
    /// to 30 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> ConnectionBuilder {
        self.connect_timeout = timeout;
        self
    }

    /// Override the endianness outgoing messages are encoded with.
    /// Defaults to the host's native endianness.
    pub fn endianness(mut self, endianness: Endianness) -> ConnectionBuilder {
        self.endianness = endianness;
        self
    }

    /// Resolve the address, open the socket, authenticate and complete
    /// the `Hello` handshake.
    pub async fn connect(self) -> Result<Connection, Error> {
        let address = match &self.target {
            Target::Session => Address::session()?,
            Target::System => Address::system()?,
            Target::Address(raw) => Address::parse(raw)?,
        };

        let path = address.unix_path()?;

        log::debug!("connecting to {}", path.display());

        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| Error::from(ErrorKind::Timeout))
            .inspect_err(|_| log::warn!("timed out connecting to {}", path.display()))?
            .map_err(|e| Error::from(ErrorKind::ConnectionFailed(e.to_string())))
            .inspect_err(|error| log::warn!("failed to connect to {}: {error}", path.display()))?;

        let mechanism = self.mechanism.unwrap_or_else(default_mechanism);

        Connection::connect(stream, mechanism, self.endianness).await
    }
}

impl Default for ConnectionBuilder {
    fn default() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }
}

#[cfg(all(unix, feature = "libc"))]
fn default_mechanism() -> Mechanism {
    Mechanism::external_current_user()
}

#[cfg(not(all(unix, feature = "libc")))]
fn default_mechanism() -> Mechanism {
    Mechanism::Anonymous
}
