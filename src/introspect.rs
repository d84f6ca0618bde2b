//! Introspection XML rendering (§6): the `<node>` document returned by
//! `org.freedesktop.DBus.Introspectable.Introspect`, covering an object's
//! declared interfaces plus the three standard ones every object answers
//! to.

use std::fmt::Write as _;

use crate::export::{Direction, Interface, PropertyAccess};
use crate::object_path::ObjectPathBuf;
use crate::org_freedesktop_dbus as bus;

const DOCTYPE: &str = concat!(
    "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n",
    "\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">"
);

/// Render the full introspection document for `path`.
pub fn write_document(path: &ObjectPathBuf, interfaces: &[Interface]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\"?>\n");
    out.push_str(DOCTYPE);
    out.push('\n');
    let _ = writeln!(out, "<node name=\"{}\">", path.as_str());

    write_standard_interfaces(&mut out);

    for interface in interfaces {
        write_interface(&mut out, interface);
    }

    out.push_str("</node>\n");
    out
}

fn write_standard_interfaces(out: &mut String) {
    let _ = writeln!(out, "  <interface name=\"{}\">", bus::PEER_INTERFACE);
    out.push_str("    <method name=\"Ping\"/>\n");
    out.push_str("    <method name=\"GetMachineId\">\n");
    out.push_str("      <arg name=\"machine_uuid\" type=\"s\" direction=\"out\"/>\n");
    out.push_str("    </method>\n");
    out.push_str("  </interface>\n");

    let _ = writeln!(out, "  <interface name=\"{}\">", bus::INTROSPECTABLE_INTERFACE);
    out.push_str("    <method name=\"Introspect\">\n");
    out.push_str("      <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n");
    out.push_str("    </method>\n");
    out.push_str("  </interface>\n");

    let _ = writeln!(out, "  <interface name=\"{}\">", bus::PROPERTIES_INTERFACE);
    out.push_str("    <method name=\"Get\">\n");
    out.push_str("      <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("      <arg name=\"property_name\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("      <arg name=\"value\" type=\"v\" direction=\"out\"/>\n");
    out.push_str("    </method>\n");
    out.push_str("    <method name=\"Set\">\n");
    out.push_str("      <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("      <arg name=\"property_name\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("      <arg name=\"value\" type=\"v\" direction=\"in\"/>\n");
    out.push_str("    </method>\n");
    out.push_str("    <method name=\"GetAll\">\n");
    out.push_str("      <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n");
    out.push_str("      <arg name=\"values\" type=\"a{sv}\" direction=\"out\"/>\n");
    out.push_str("    </method>\n");
    out.push_str("    <signal name=\"PropertiesChanged\">\n");
    out.push_str("      <arg name=\"interface_name\" type=\"s\"/>\n");
    out.push_str("      <arg name=\"changed_properties\" type=\"a{sv}\"/>\n");
    out.push_str("      <arg name=\"invalidated_properties\" type=\"as\"/>\n");
    out.push_str("    </signal>\n");
    out.push_str("  </interface>\n");
}

fn write_interface(out: &mut String, interface: &Interface) {
    let _ = writeln!(out, "  <interface name=\"{}\">", interface.name);

    for method in &interface.methods {
        let _ = writeln!(out, "    <method name=\"{}\">", method.name);

        for arg in &method.args {
            let direction = match arg.direction {
                Direction::In => "in",
                Direction::Out => "out",
            };

            let _ = writeln!(
                out,
                "      <arg name=\"{}\" type=\"{}\" direction=\"{direction}\"/>",
                arg.name,
                arg.ty.to_signature_string()
            );
        }

        for (name, value) in &method.annotations {
            let _ = writeln!(out, "      <annotation name=\"{name}\" value=\"{value}\"/>");
        }

        out.push_str("    </method>\n");
    }

    for signal in &interface.signals {
        let _ = writeln!(out, "    <signal name=\"{}\">", signal.name);

        for arg in &signal.args {
            let _ = writeln!(
                out,
                "      <arg name=\"{}\" type=\"{}\"/>",
                arg.name,
                arg.ty.to_signature_string()
            );
        }

        out.push_str("    </signal>\n");
    }

    for property in &interface.properties {
        let access = match property.access {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        };

        let _ = writeln!(
            out,
            "    <property name=\"{}\" type=\"{}\" access=\"{access}\"/>",
            property.name,
            property.ty.to_signature_string()
        );
    }

    out.push_str("  </interface>\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{Method, MethodArg, Property};
    use crate::signature::Element;

    #[test]
    fn renders_declared_interface_and_standard_ones() {
        let path = ObjectPathBuf::new("/com/example/Widget").unwrap();
        let interface = Interface::new("com.example.Widget")
            .with_method(
                Method::new("Resize")
                    .with_arg(MethodArg::input("width", Element::Int32))
                    .with_arg(MethodArg::input("height", Element::Int32)),
            )
            .with_property(Property::new("Title", Element::String, PropertyAccess::ReadWrite));

        let xml = write_document(&path, &[interface]);

        assert!(xml.starts_with("<?xml version=\"1.0\"?>\n"));
        assert!(xml.contains("<node name=\"/com/example/Widget\">"));
        assert!(xml.contains(bus::PEER_INTERFACE));
        assert!(xml.contains(bus::INTROSPECTABLE_INTERFACE));
        assert!(xml.contains(bus::PROPERTIES_INTERFACE));
        assert!(xml.contains("<method name=\"Resize\">"));
        assert!(xml.contains("<arg name=\"width\" type=\"i\" direction=\"in\"/>"));
        assert!(xml.contains("<property name=\"Title\" type=\"s\" access=\"readwrite\"/>"));
        assert!(xml.trim_end().ends_with("</node>"));
    }
}
