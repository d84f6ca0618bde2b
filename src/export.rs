//! Exported-object registration and dispatch (§4.H): the handler trait,
//! interface descriptors, and the three standard interfaces every
//! exported object implicitly answers to
//! (`Peer`, `Introspectable`, `Properties`).

use crate::error::ErrorKind;
use crate::introspect;
use crate::marshal::{AlignMode, Marshaller};
use crate::message::{Message, MessageKind};
use crate::object_path::ObjectPathBuf;
use crate::org_freedesktop_dbus as bus;
use crate::protocol::Endianness;
use crate::signature::{Element, Signature};
use crate::unmarshal::Unmarshaller;
use crate::value::{Value, Variant};

/// Whether a method argument flows into or out of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// An input argument.
    In,
    /// A return value.
    Out,
}

/// A single method or signal argument.
#[derive(Debug, Clone)]
pub struct MethodArg {
    /// The argument's name, as it appears in introspection XML.
    pub name: String,
    /// The argument's type.
    pub ty: Element,
    /// Whether this is an input or output argument. Ignored for signal
    /// arguments, which are always outbound.
    pub direction: Direction,
}

impl MethodArg {
    /// Construct an input argument.
    pub fn input(name: impl Into<String>, ty: Element) -> MethodArg {
        MethodArg {
            name: name.into(),
            ty,
            direction: Direction::In,
        }
    }

    /// Construct an output argument.
    pub fn output(name: impl Into<String>, ty: Element) -> MethodArg {
        MethodArg {
            name: name.into(),
            ty,
            direction: Direction::Out,
        }
    }
}

/// A method descriptor, used both for dispatch validation and
/// introspection.
#[derive(Debug, Clone)]
pub struct Method {
    /// The method's name.
    pub name: String,
    /// The method's arguments, in declaration order.
    pub args: Vec<MethodArg>,
    /// `(name, value)` annotations attached to the method.
    pub annotations: Vec<(String, String)>,
}

impl Method {
    /// Construct a method with no arguments.
    pub fn new(name: impl Into<String>) -> Method {
        Method {
            name: name.into(),
            args: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn with_arg(mut self, arg: MethodArg) -> Method {
        self.args.push(arg);
        self
    }

    /// Append an annotation.
    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Method {
        self.annotations.push((name.into(), value.into()));
        self
    }

    fn in_signature_string(&self) -> String {
        self.args
            .iter()
            .filter(|a| a.direction == Direction::In)
            .map(|a| a.ty.to_signature_string())
            .collect()
    }

    fn out_signature_string(&self) -> String {
        self.args
            .iter()
            .filter(|a| a.direction == Direction::Out)
            .map(|a| a.ty.to_signature_string())
            .collect()
    }
}

/// Whether a property may be read, written, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    /// Readable only.
    Read,
    /// Writable only.
    Write,
    /// Readable and writable.
    ReadWrite,
}

/// A property descriptor.
#[derive(Debug, Clone)]
pub struct Property {
    /// The property's name.
    pub name: String,
    /// The property's type.
    pub ty: Element,
    /// The property's access mode.
    pub access: PropertyAccess,
}

impl Property {
    /// Construct a property descriptor.
    pub fn new(name: impl Into<String>, ty: Element, access: PropertyAccess) -> Property {
        Property {
            name: name.into(),
            ty,
            access,
        }
    }
}

/// A signal descriptor, used for introspection only.
#[derive(Debug, Clone)]
pub struct SignalDesc {
    /// The signal's name.
    pub name: String,
    /// The signal's arguments, always outbound.
    pub args: Vec<MethodArg>,
}

impl SignalDesc {
    /// Construct a signal descriptor with no arguments.
    pub fn new(name: impl Into<String>) -> SignalDesc {
        SignalDesc {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn with_arg(mut self, name: impl Into<String>, ty: Element) -> SignalDesc {
        self.args.push(MethodArg::output(name, ty));
        self
    }
}

/// A single interface's full description: its methods, properties and
/// signals.
#[derive(Debug, Clone)]
pub struct Interface {
    /// The interface's dotted name.
    pub name: String,
    /// The interface's methods.
    pub methods: Vec<Method>,
    /// The interface's properties.
    pub properties: Vec<Property>,
    /// The interface's signals.
    pub signals: Vec<SignalDesc>,
}

impl Interface {
    /// Construct an empty interface.
    pub fn new(name: impl Into<String>) -> Interface {
        Interface {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Append a method.
    pub fn with_method(mut self, method: Method) -> Interface {
        self.methods.push(method);
        self
    }

    /// Append a property.
    pub fn with_property(mut self, property: Property) -> Interface {
        self.properties.push(property);
        self
    }

    /// Append a signal.
    pub fn with_signal(mut self, signal: SignalDesc) -> Interface {
        self.signals.push(signal);
        self
    }
}

/// A locally exported D-Bus object.
///
/// Handlers run synchronously within the connection's dispatch loop; an
/// implementation that needs to do its own asynchronous work should hand
/// off to a background task and reply from there instead of blocking
/// here.
pub trait ExportedObject: Send + Sync {
    /// The interfaces this object implements, excluding the three
    /// standard interfaces every object answers to implicitly.
    fn interfaces(&self) -> &[Interface];

    /// Handle a method call against one of `self.interfaces()`.
    ///
    /// `body` and `body_signature` are the raw, already-validated
    /// arguments; the returned signature must match the method's
    /// declared out-args.
    fn call(
        &self,
        interface: &str,
        method: &str,
        body: &[u8],
        body_signature: &Signature,
    ) -> Result<(Signature, Vec<u8>), ErrorKind>;

    /// Read a property's current value.
    fn get_property(&self, interface: &str, name: &str) -> Result<Value, ErrorKind>;

    /// Write a property's value.
    fn set_property(&self, interface: &str, name: &str, value: Value) -> Result<(), ErrorKind>;
}

/// Route an inbound method call to the appropriate interface handler,
/// including the three standard interfaces.
pub fn dispatch_method_call(
    object: &dyn ExportedObject,
    message: &Message,
) -> Result<(Signature, Vec<u8>), ErrorKind> {
    let MessageKind::MethodCall {
        interface,
        member,
        path,
    } = &message.kind
    else {
        return Err(ErrorKind::InvalidMessage("not a method call".into()));
    };

    match interface.as_deref() {
        Some(name) if name == bus::PEER_INTERFACE => dispatch_peer(message, member),
        Some(name) if name == bus::INTROSPECTABLE_INTERFACE => {
            dispatch_introspectable(object, message, path, member)
        }
        Some(name) if name == bus::PROPERTIES_INTERFACE => {
            dispatch_properties(object, member, message)
        }
        Some(name) => dispatch_user_interface(object, name, member, message),
        None => dispatch_unspecified(object, message, path, member),
    }
}

fn dispatch_peer(message: &Message, member: &str) -> Result<(Signature, Vec<u8>), ErrorKind> {
    match member {
        "Ping" => Ok((Signature::EMPTY, Vec::new())),
        "GetMachineId" => encode_body("s", &[Value::Str(machine_id())], message.endianness),
        other => Err(ErrorKind::InvalidMethod(other.to_string())),
    }
}

fn dispatch_introspectable(
    object: &dyn ExportedObject,
    message: &Message,
    path: &ObjectPathBuf,
    member: &str,
) -> Result<(Signature, Vec<u8>), ErrorKind> {
    if member != "Introspect" {
        return Err(ErrorKind::InvalidMethod(member.to_string()));
    }

    let xml = introspect::write_document(path, object.interfaces());
    encode_body("s", &[Value::Str(xml)], message.endianness)
}

fn dispatch_properties(
    object: &dyn ExportedObject,
    member: &str,
    message: &Message,
) -> Result<(Signature, Vec<u8>), ErrorKind> {
    match member {
        "Get" => {
            let mut values = decode_body(message, "ss")?;
            let name = expect_str(values.pop())?;
            let interface = expect_str(values.pop())?;

            let value = object.get_property(&interface, &name)?;
            let ty = property_type(object, &interface, &name)?;
            let variant = Value::Variant(Variant::new(element_signature(&ty), value));
            encode_body("v", &[variant], message.endianness)
        }
        "Set" => {
            let mut values = decode_body(message, "ssv")?;
            let value = expect_variant_value(values.pop())?;
            let name = expect_str(values.pop())?;
            let interface = expect_str(values.pop())?;

            object.set_property(&interface, &name, value)?;
            Ok((Signature::EMPTY, Vec::new()))
        }
        "GetAll" => {
            let mut values = decode_body(message, "s")?;
            let interface_name = expect_str(values.pop())?;

            let interface = object
                .interfaces()
                .iter()
                .find(|i| i.name == interface_name)
                .ok_or_else(|| ErrorKind::InvalidInterface(interface_name.clone()))?;

            let mut entries = Vec::new();

            for property in &interface.properties {
                if property.access == PropertyAccess::Write {
                    continue;
                }

                let value = object.get_property(&interface_name, &property.name)?;
                let variant = Value::Variant(Variant::new(element_signature(&property.ty), value));
                entries.push((Value::Str(property.name.clone()), variant));
            }

            encode_body("a{sv}", &[Value::Dict(entries)], message.endianness)
        }
        other => Err(ErrorKind::InvalidMethod(other.to_string())),
    }
}

fn dispatch_user_interface(
    object: &dyn ExportedObject,
    interface_name: &str,
    member: &str,
    message: &Message,
) -> Result<(Signature, Vec<u8>), ErrorKind> {
    let interface = object
        .interfaces()
        .iter()
        .find(|i| i.name == interface_name)
        .ok_or_else(|| ErrorKind::InvalidInterface(interface_name.to_string()))?;

    let method = interface
        .methods
        .iter()
        .find(|m| m.name == member)
        .ok_or_else(|| ErrorKind::InvalidMethod(member.to_string()))?;

    let got = message.body_signature.to_signature_string();

    if got != method.in_signature_string() {
        return Err(ErrorKind::InvalidMessage(format!(
            "expected arguments `{}`, got `{got}`",
            method.in_signature_string()
        )));
    }

    let (out_signature, body) =
        object.call(interface_name, member, &message.body, &message.body_signature)?;

    if out_signature.to_signature_string() != method.out_signature_string() {
        return Err(ErrorKind::MethodCallFailed(
            "handler returned a body that does not match its declared return type".into(),
        ));
    }

    Ok((out_signature, body))
}

/// Resolve a method call with no interface named, as the protocol allows
/// when the method name is unambiguous across an object's interfaces.
fn dispatch_unspecified(
    object: &dyn ExportedObject,
    message: &Message,
    path: &ObjectPathBuf,
    member: &str,
) -> Result<(Signature, Vec<u8>), ErrorKind> {
    let candidates: Vec<&str> = object
        .interfaces()
        .iter()
        .filter(|i| i.methods.iter().any(|m| m.name == member))
        .map(|i| i.name.as_str())
        .collect();

    match candidates.as_slice() {
        [only] => {
            let only = only.to_string();
            dispatch_user_interface(object, &only, member, message)
        }
        [] => match member {
            "Ping" | "GetMachineId" => dispatch_peer(message, member),
            "Introspect" => dispatch_introspectable(object, message, path, member),
            _ => Err(ErrorKind::InvalidMethod(member.to_string())),
        },
        _ => Err(ErrorKind::InvalidMessage(format!(
            "method `{member}` is ambiguous across interfaces"
        ))),
    }
}

fn property_type(
    object: &dyn ExportedObject,
    interface: &str,
    name: &str,
) -> Result<Element, ErrorKind> {
    object
        .interfaces()
        .iter()
        .find(|i| i.name == interface)
        .and_then(|i| i.properties.iter().find(|p| p.name == name))
        .map(|p| p.ty.clone())
        .ok_or_else(|| ErrorKind::PropertyNotFound(name.to_string()))
}

fn element_signature(ty: &Element) -> Signature {
    Signature::parse(&ty.to_signature_string()).expect("valid built-in signature")
}

fn machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "0".repeat(32))
}

fn decode_body(message: &Message, expected: &str) -> Result<Vec<Value>, ErrorKind> {
    let signature = Signature::parse(expected).expect("valid built-in signature");
    let mut unmarshaller = Unmarshaller::new(
        &message.body,
        &signature,
        message.endianness,
        AlignMode::Message,
        0,
    );

    let mut values = Vec::with_capacity(signature.elements().len());

    for _ in signature.elements() {
        values
            .push(unmarshaller.pop().map_err(|e| ErrorKind::InvalidMessage(e.to_string()))?);
    }

    unmarshaller
        .finish()
        .map_err(|e| ErrorKind::InvalidMessage(e.to_string()))?;

    Ok(values)
}

fn encode_body(
    signature_str: &str,
    values: &[Value],
    endianness: Endianness,
) -> Result<(Signature, Vec<u8>), ErrorKind> {
    let signature = Signature::parse(signature_str).expect("valid built-in signature");
    let mut marshaller = Marshaller::new(&signature, endianness, AlignMode::Message, 0);

    for value in values {
        marshaller
            .push(value)
            .map_err(|e| ErrorKind::MethodCallFailed(e.to_string()))?;
    }

    let body = marshaller
        .finish()
        .map_err(|e| ErrorKind::MethodCallFailed(e.to_string()))?;

    Ok((signature, body))
}

fn expect_str(value: Option<Value>) -> Result<String, ErrorKind> {
    match value {
        Some(Value::Str(s)) => Ok(s),
        _ => Err(ErrorKind::InvalidMessage("expected a string argument".into())),
    }
}

fn expect_variant_value(value: Option<Value>) -> Result<Value, ErrorKind> {
    match value {
        Some(Value::Variant(v)) => Ok(v.into_value()),
        _ => Err(ErrorKind::InvalidMessage("expected a variant argument".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_path::ObjectPath;
    use std::sync::Mutex;

    struct Counter {
        interfaces: Vec<Interface>,
        value: Mutex<i32>,
    }

    impl Counter {
        fn new() -> Counter {
            let interface = Interface::new("com.example.Counter")
                .with_method(
                    Method::new("Increment")
                        .with_arg(MethodArg::input("by", Element::Int32))
                        .with_arg(MethodArg::output("result", Element::Int32)),
                )
                .with_property(Property::new("Value", Element::Int32, PropertyAccess::Read));

            Counter {
                interfaces: vec![interface],
                value: Mutex::new(0),
            }
        }
    }

    impl ExportedObject for Counter {
        fn interfaces(&self) -> &[Interface] {
            &self.interfaces
        }

        fn call(
            &self,
            _interface: &str,
            method: &str,
            body: &[u8],
            body_signature: &Signature,
        ) -> Result<(Signature, Vec<u8>), ErrorKind> {
            assert_eq!(method, "Increment");
            let value = crate::unmarshal::unmarshal(body, body_signature, Endianness::NATIVE)
                .map_err(|e| ErrorKind::InvalidMessage(e.to_string()))?;
            let Value::Int32(by) = value else {
                return Err(ErrorKind::InvalidMessage("expected int32".into()));
            };

            let mut guard = self.value.lock().unwrap();
            *guard += by;
            encode_body("i", &[Value::Int32(*guard)], Endianness::NATIVE)
        }

        fn get_property(&self, _interface: &str, name: &str) -> Result<Value, ErrorKind> {
            assert_eq!(name, "Value");
            Ok(Value::Int32(*self.value.lock().unwrap()))
        }

        fn set_property(&self, _interface: &str, _name: &str, _value: Value) -> Result<(), ErrorKind> {
            Err(ErrorKind::PropertyNotFound("Value".into()))
        }
    }

    fn call_message(path: &str, interface: Option<&str>, member: &str, body: Vec<u8>, sig: &str) -> Message {
        let mut message = Message::method_call(
            ObjectPathBuf::new(path).unwrap(),
            member,
        );

        if let Some(interface) = interface {
            message = message.with_interface(interface);
        }

        message.with_body(Signature::parse(sig).unwrap(), body)
    }

    #[test]
    fn dispatches_user_method() {
        let counter = Counter::new();
        let body = encode_body("i", &[Value::Int32(5)], Endianness::NATIVE).unwrap().1;
        let message = call_message("/counter", Some("com.example.Counter"), "Increment", body, "i");

        let (sig, body) = dispatch_method_call(&counter, &message).unwrap();
        assert_eq!(sig.to_signature_string(), "i");
        let value = crate::unmarshal::unmarshal(&body, &sig, Endianness::NATIVE).unwrap();
        assert_eq!(value, Value::Int32(5));
    }

    #[test]
    fn rejects_wrong_argument_signature() {
        let counter = Counter::new();
        let body = encode_body("s", &[Value::Str("oops".into())], Endianness::NATIVE).unwrap().1;
        let message = call_message("/counter", Some("com.example.Counter"), "Increment", body, "s");
        assert!(dispatch_method_call(&counter, &message).is_err());
    }

    #[test]
    fn peer_ping_replies_with_empty_body() {
        let counter = Counter::new();
        let message = call_message("/counter", Some(bus::PEER_INTERFACE), "Ping", Vec::new(), "");
        let (sig, body) = dispatch_method_call(&counter, &message).unwrap();
        assert!(sig.is_empty());
        assert!(body.is_empty());
    }

    #[test]
    fn properties_get_returns_variant() {
        let counter = Counter::new();
        let body = encode_body(
            "ss",
            &[
                Value::Str("com.example.Counter".into()),
                Value::Str("Value".into()),
            ],
            Endianness::NATIVE,
        )
        .unwrap()
        .1;
        let message = call_message("/counter", Some(bus::PROPERTIES_INTERFACE), "Get", body, "ss");

        let (sig, body) = dispatch_method_call(&counter, &message).unwrap();
        assert_eq!(sig.to_signature_string(), "v");
        let value = crate::unmarshal::unmarshal(&body, &sig, Endianness::NATIVE).unwrap();
        assert_eq!(value, Value::Variant(Variant::new(Signature::parse("i").unwrap(), Value::Int32(0))));
    }

    #[test]
    fn introspect_lists_the_declared_interface() {
        let counter = Counter::new();
        let message = call_message("/counter", Some(bus::INTROSPECTABLE_INTERFACE), "Introspect", Vec::new(), "");
        let (sig, body) = dispatch_method_call(&counter, &message).unwrap();
        let value = crate::unmarshal::unmarshal(&body, &sig, Endianness::NATIVE).unwrap();
        let Value::Str(xml) = value else { panic!("expected string") };
        assert!(xml.contains("com.example.Counter"));
        assert!(xml.contains(ObjectPath::new("/counter").unwrap().as_str()));
    }

    #[test]
    fn unknown_object_path_interface_is_rejected() {
        let counter = Counter::new();
        let message = call_message("/counter", Some("com.example.Missing"), "Foo", Vec::new(), "");
        assert!(dispatch_method_call(&counter, &message).is_err());
    }
}
