//! Constants and types associated with the bus daemon's own
//! `org.freedesktop.DBus` interface, and the standard interfaces every
//! exported object implicitly carries.

/// Well known destination name of the bus daemon itself.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// Well known interface name of the bus daemon.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// Well known D-Bus object path of the bus daemon.
pub const PATH: &str = "/org/freedesktop/DBus";

/// The method used to obtain an assigned unique bus name on connect.
pub const HELLO: &str = "Hello";

/// The method used to install a signal match rule.
pub const ADD_MATCH: &str = "AddMatch";

/// The method used to remove a previously installed match rule.
pub const REMOVE_MATCH: &str = "RemoveMatch";

/// The method used to list the currently registered bus names.
pub const LIST_NAMES: &str = "ListNames";

/// The interface every exported object implicitly carries for liveness
/// checks.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// The interface every exported object implicitly carries for
/// introspection.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// The interface every exported object implicitly carries for property
/// access.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Build the match-rule string used by `AddMatch`/`RemoveMatch` for a
/// signal subscription, per §4.H.
pub fn signal_match_rule(path: &str, interface: &str, member: &str) -> String {
    format!("type='signal',path='{path}',interface='{interface}',member='{member}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_match_rule() {
        assert_eq!(
            signal_match_rule("/a", "com.x", "M"),
            "type='signal',path='/a',interface='com.x',member='M'"
        );
    }
}
