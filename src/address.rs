//! D-Bus address strings: `transport:key=value,key=value` (§6).

use std::env;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind};

/// The default system bus socket path, used when
/// `DBUS_SYSTEM_BUS_ADDRESS` is not set.
const SYSTEM_BUS_DEFAULT_PATH: &str = "/var/run/dbus/system_bus_socket";

/// A resolved D-Bus address: a transport and its key/value parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    transport: String,
    params: Vec<(String, String)>,
}

impl Address {
    /// Parse a single `transport:key=value,key=value` address.
    ///
    /// Only the first address in a semicolon-separated list is
    /// considered; this implementation does not attempt a fallback list.
    pub fn parse(input: &str) -> Result<Address, Error> {
        let input = input.split(';').next().unwrap_or(input);

        let Some((transport, rest)) = input.split_once(':') else {
            return Err(ErrorKind::InvalidAddress(input.to_string()).into());
        };

        if transport.is_empty() {
            return Err(ErrorKind::InvalidAddress(input.to_string()).into());
        }

        let mut params = Vec::new();

        if !rest.is_empty() {
            for pair in rest.split(',') {
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(ErrorKind::InvalidAddress(input.to_string()).into());
                };

                params.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Address {
            transport: transport.to_string(),
            params,
        })
    }

    /// The transport name, e.g. `unix`.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Look up a parameter by key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Resolve this address to a filesystem path for the `unix` transport.
    pub fn unix_path(&self) -> Result<PathBuf, Error> {
        if self.transport != "unix" {
            return Err(ErrorKind::UnsupportedTransport(self.transport.clone()).into());
        }

        let path = self
            .param("path")
            .ok_or_else(|| Error::from(ErrorKind::InvalidAddress("missing `path` parameter".into())))?;

        Ok(PathBuf::from(path))
    }

    /// Resolve the session bus address from `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session() -> Result<Address, Error> {
        let value = env::var("DBUS_SESSION_BUS_ADDRESS").map_err(|_| {
            Error::from(ErrorKind::EnvironmentVariableNotSet(
                "DBUS_SESSION_BUS_ADDRESS",
            ))
        })?;

        Address::parse(&value)
    }

    /// Resolve the system bus address, honoring `DBUS_SYSTEM_BUS_ADDRESS`
    /// with a well-known fallback path.
    pub fn system() -> Result<Address, Error> {
        if let Ok(value) = env::var("DBUS_SYSTEM_BUS_ADDRESS") {
            return Address::parse(&value);
        }

        Address::parse(&format!("unix:path={SYSTEM_BUS_DEFAULT_PATH}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_parameter() {
        let address = Address::parse("unix:path=/tmp/foo").unwrap();
        assert_eq!(address.transport(), "unix");
        assert_eq!(address.param("path"), Some("/tmp/foo"));
    }

    #[test]
    fn parses_multiple_parameters() {
        let address = Address::parse("unix:path=/tmp/foo,guid=abc123").unwrap();
        assert_eq!(address.param("path"), Some("/tmp/foo"));
        assert_eq!(address.param("guid"), Some("abc123"));
    }

    #[test]
    fn unknown_transport_is_rejected_when_resolving_a_path() {
        let address = Address::parse("tcp:host=localhost,port=1234").unwrap();
        assert!(address.unix_path().is_err());
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(Address::parse("not-an-address").is_err());
    }

    #[test]
    fn system_bus_falls_back_to_default_path() {
        env::remove_var("DBUS_SYSTEM_BUS_ADDRESS");
        let address = Address::system().unwrap();
        assert_eq!(address.unix_path().unwrap(), PathBuf::from(SYSTEM_BUS_DEFAULT_PATH));
    }
}
