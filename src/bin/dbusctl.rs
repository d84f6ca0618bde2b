//! `dbusctl`: a small command-line front-end over the `dbus-wire` engine.
//!
//! Argument parsing and result pretty-printing live here, outside the
//! wire-protocol core; everything this binary does could equally be done
//! by a caller linking the library directly.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use dbus_wire::org_freedesktop_dbus as bus;
use dbus_wire::protocol::Endianness;
use dbus_wire::{
    marshal, unmarshal, AlignMode, Connection, Element, ErrorKind, ExportedObject, Interface,
    Marshaller, Message, Method, MethodArg, ObjectPathBuf, Property, PropertyAccess, Signature,
    SignalDesc, Unmarshaller, Value, Variant,
};

#[derive(Debug, Clone, Copy)]
enum Bus {
    Session,
    System,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("dbusctl: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let mut bus = Bus::Session;
    let mut rest = Vec::new();

    // Consume the global `-b/--bus` flag wherever it appears before the
    // subcommand.
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-b" | "--bus" => {
                let value = args.next().context("--bus requires an argument")?;

                bus = match value.as_str() {
                    "session" => Bus::Session,
                    "system" => Bus::System,
                    other => bail!("unknown bus `{other}`, expected `session` or `system`"),
                };
            }
            other => rest.push(other.to_string()),
        }
    }

    let mut rest = rest.into_iter();
    let command = rest.next().context("expected a subcommand")?;

    match command.as_str() {
        "call" => call(bus, rest).await,
        "emit" => emit(bus, rest).await,
        "wait" => wait(bus, rest).await,
        "introspect" => introspect(bus, rest).await,
        "get-property" => get_property(bus, rest).await,
        "set-property" => set_property(bus, rest).await,
        "list" => list(bus).await,
        "echo-service" => echo_service(bus).await,
        other => bail!("unknown subcommand `{other}`"),
    }
}

async fn connect(bus: Bus) -> Result<Connection> {
    let connection = match bus {
        Bus::Session => Connection::session_bus().await,
        Bus::System => Connection::system_bus().await,
    }?;

    Ok(connection)
}

/// `call <service> <path> <interface> <method> <signature> [args…]`
async fn call(bus: Bus, mut args: impl Iterator<Item = String>) -> Result<()> {
    let service = args.next().context("missing <service>")?;
    let path = args.next().context("missing <path>")?;
    let interface = args.next().context("missing <interface>")?;
    let method = args.next().context("missing <method>")?;
    let signature = args.next().unwrap_or_default();
    let values: Vec<String> = args.collect();

    let path = ObjectPathBuf::new(path)?;
    let signature = Signature::parse(&signature)?;
    let body = encode_args(&signature, &values)?;

    let connection = connect(bus).await?;

    let message = Message::method_call(path, method)
        .with_interface(interface)
        .with_destination(service)
        .with_body(signature, body);

    let reply = connection
        .send(message)
        .await?
        .ok_or_else(|| anyhow!("method call did not expect a reply"))?;

    print_message_body(&reply)
}

/// `emit <path> <interface> <signal> <signature> [args…]`
async fn emit(bus: Bus, mut args: impl Iterator<Item = String>) -> Result<()> {
    let path = args.next().context("missing <path>")?;
    let interface = args.next().context("missing <interface>")?;
    let signal = args.next().context("missing <signal>")?;
    let signature = args.next().unwrap_or_default();
    let values: Vec<String> = args.collect();

    let path = ObjectPathBuf::new(path)?;
    let signature = Signature::parse(&signature)?;
    let body = encode_args(&signature, &values)?;

    let connection = connect(bus).await?;
    let message = Message::signal(path, interface, signal).with_body(signature, body);
    connection.send(message).await?;
    Ok(())
}

/// `wait <path> <interface> <signal> [--timeout N]`
async fn wait(bus: Bus, mut args: impl Iterator<Item = String>) -> Result<()> {
    let path = args.next().context("missing <path>")?;
    let interface = args.next().context("missing <interface>")?;
    let signal = args.next().context("missing <signal>")?;

    let mut timeout = None;

    while let Some(arg) = args.next() {
        if arg == "--timeout" {
            let value = args.next().context("--timeout requires an argument")?;
            timeout = Some(Duration::from_secs(value.parse()?));
        }
    }

    let path = ObjectPathBuf::new(path)?;
    let connection = connect(bus).await?;
    let mut receiver = connection.subscribe(path, interface, signal).await?;

    let message = match timeout {
        Some(duration) => tokio::time::timeout(duration, receiver.recv())
            .await
            .context("timed out waiting for signal")?
            .ok_or_else(|| anyhow!("connection closed while waiting for signal"))?,
        None => receiver
            .recv()
            .await
            .ok_or_else(|| anyhow!("connection closed while waiting for signal"))?,
    };

    print_message_body(&message)
}

/// `introspect <service> <path>`
async fn introspect(bus: Bus, mut args: impl Iterator<Item = String>) -> Result<()> {
    let service = args.next().context("missing <service>")?;
    let path = args.next().context("missing <path>")?;

    let path = ObjectPathBuf::new(path)?;
    let connection = connect(bus).await?;

    let message = Message::method_call(path, "Introspect")
        .with_interface(bus::INTROSPECTABLE_INTERFACE)
        .with_destination(service);

    let reply = connection
        .send(message)
        .await?
        .ok_or_else(|| anyhow!("Introspect did not return a reply"))?;

    let value = unmarshal(&reply.body, &reply.body_signature, reply.endianness)?;

    match value {
        Value::Str(xml) => println!("{xml}"),
        other => bail!("unexpected introspection reply shape: {}", other.type_name()),
    }

    Ok(())
}

/// `get-property <service> <path> <interface> <name>`
async fn get_property(bus: Bus, mut args: impl Iterator<Item = String>) -> Result<()> {
    let service = args.next().context("missing <service>")?;
    let path = args.next().context("missing <path>")?;
    let interface = args.next().context("missing <interface>")?;
    let name = args.next().context("missing <name>")?;

    let path = ObjectPathBuf::new(path)?;
    let sig = Signature::parse("ss")?;

    let mut marshaller = Marshaller::new(&sig, Endianness::NATIVE, AlignMode::Message, 0);
    marshaller.push(&Value::Str(interface))?;
    marshaller.push(&Value::Str(name))?;
    let body = marshaller.finish()?;

    let connection = connect(bus).await?;
    let message = Message::method_call(path, "Get")
        .with_interface(bus::PROPERTIES_INTERFACE)
        .with_destination(service)
        .with_body(sig, body);

    let reply = connection
        .send(message)
        .await?
        .ok_or_else(|| anyhow!("Get did not return a reply"))?;

    let value = unmarshal(&reply.body, &reply.body_signature, reply.endianness)?;

    match value {
        Value::Variant(variant) => println!("{}", variant.into_value()),
        other => bail!("unexpected Get reply shape: {}", other.type_name()),
    }

    Ok(())
}

/// `set-property <service> <path> <interface> <name> <signature> <value>`
async fn set_property(bus: Bus, mut args: impl Iterator<Item = String>) -> Result<()> {
    let service = args.next().context("missing <service>")?;
    let path = args.next().context("missing <path>")?;
    let interface = args.next().context("missing <interface>")?;
    let name = args.next().context("missing <name>")?;
    let signature = args.next().context("missing <signature>")?;
    let text = args.next().context("missing <value>")?;

    let path = ObjectPathBuf::new(path)?;
    let value_signature = Signature::parse(&signature)?;
    let value_element = value_signature.single()?.clone();
    let value = parse_scalar(&value_element, &text)?;

    let sig = Signature::parse("ssv")?;
    let mut marshaller = Marshaller::new(&sig, Endianness::NATIVE, AlignMode::Message, 0);
    marshaller.push(&Value::Str(interface))?;
    marshaller.push(&Value::Str(name))?;
    marshaller.push(&Value::Variant(Variant::new(value_signature, value)))?;
    let body = marshaller.finish()?;

    let connection = connect(bus).await?;
    let message = Message::method_call(path, "Set")
        .with_interface(bus::PROPERTIES_INTERFACE)
        .with_destination(service)
        .with_body(sig, body);

    connection
        .send(message)
        .await?
        .ok_or_else(|| anyhow!("Set did not return a reply"))?;

    Ok(())
}

/// `list`
async fn list(bus: Bus) -> Result<()> {
    let connection = connect(bus).await?;

    let message = Message::method_call(ObjectPathBuf::new(bus::PATH)?, bus::LIST_NAMES)
        .with_interface(bus::INTERFACE)
        .with_destination(bus::DESTINATION);

    let reply = connection
        .send(message)
        .await?
        .ok_or_else(|| anyhow!("ListNames did not return a reply"))?;

    let value = unmarshal(&reply.body, &reply.body_signature, reply.endianness)?;

    let Value::Array(names) = value else {
        bail!("unexpected ListNames reply shape");
    };

    for name in names {
        if let Value::Str(name) = name {
            println!("{name}");
        }
    }

    Ok(())
}

/// `echo-service`: a demonstration exported object answering
/// `com.example.Echo.Echo(s) -> s` at `/com/example/Echo`.
async fn echo_service(bus: Bus) -> Result<()> {
    let connection = connect(bus).await?;

    let path = ObjectPathBuf::new("/com/example/Echo")?;
    let object: Arc<dyn ExportedObject> = Arc::new(EchoObject::new());
    connection.export(path, object).await;

    println!(
        "echo-service: exported com.example.Echo at /com/example/Echo as {}",
        connection.unique_name().await.unwrap_or_default()
    );

    // Park forever; inbound calls are routed by the connection's
    // background reader task.
    std::future::pending::<()>().await;
    Ok(())
}

struct EchoObject {
    interfaces: Vec<Interface>,
}

impl EchoObject {
    fn new() -> EchoObject {
        let interface = Interface::new("com.example.Echo")
            .with_method(
                Method::new("Echo")
                    .with_arg(MethodArg::input("message", Element::String))
                    .with_arg(MethodArg::output("reply", Element::String)),
            )
            .with_property(Property::new(
                "CallCount",
                Element::Uint32,
                PropertyAccess::Read,
            ))
            .with_signal(SignalDesc::new("Echoed").with_arg("message", Element::String));

        EchoObject {
            interfaces: vec![interface],
        }
    }
}

impl ExportedObject for EchoObject {
    fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    fn call(
        &self,
        _interface: &str,
        method: &str,
        body: &[u8],
        body_signature: &Signature,
    ) -> std::result::Result<(Signature, Vec<u8>), ErrorKind> {
        if method != "Echo" {
            return Err(ErrorKind::InvalidMethod(method.to_string()));
        }

        let value = unmarshal(body, body_signature, Endianness::NATIVE)
            .map_err(|e| ErrorKind::InvalidMessage(e.to_string()))?;

        let Value::Str(message) = value else {
            return Err(ErrorKind::InvalidMessage(
                "expected a string argument".into(),
            ));
        };

        let out_sig = Signature::parse("s").expect("valid built-in signature");
        let body = marshal(&out_sig, Endianness::NATIVE, &Value::Str(message))
            .map_err(|e| ErrorKind::MethodCallFailed(e.to_string()))?;
        Ok((out_sig, body))
    }

    fn get_property(&self, _interface: &str, name: &str) -> std::result::Result<Value, ErrorKind> {
        match name {
            "CallCount" => Ok(Value::Uint32(0)),
            other => Err(ErrorKind::PropertyNotFound(other.to_string())),
        }
    }

    fn set_property(
        &self,
        _interface: &str,
        name: &str,
        _value: Value,
    ) -> std::result::Result<(), ErrorKind> {
        Err(ErrorKind::PropertyNotFound(name.to_string()))
    }
}

/// Encode a flat list of CLI argument strings against a top-level
/// signature, supporting the scalar element types plus comma-separated
/// arrays of them. This is deliberately simple: complex nested container
/// arguments are not a CLI concern.
fn encode_args(signature: &Signature, args: &[String]) -> Result<Vec<u8>> {
    if signature.elements().len() != args.len() {
        bail!(
            "signature `{}` expects {} argument(s), got {}",
            signature,
            signature.elements().len(),
            args.len()
        );
    }

    let mut marshaller = Marshaller::new(signature, Endianness::NATIVE, AlignMode::Message, 0);

    for (element, arg) in signature.elements().iter().zip(args) {
        let value = parse_cli_value(element, arg)?;
        marshaller.push(&value)?;
    }

    Ok(marshaller.finish()?)
}

fn parse_cli_value(element: &Element, text: &str) -> Result<Value> {
    if let Element::Array(inner) = element {
        if !matches!(**inner, Element::Array(_) | Element::Struct(_)) {
            let items = if text.is_empty() {
                Vec::new()
            } else {
                text.split(',')
                    .map(|part| parse_scalar(inner, part))
                    .collect::<Result<Vec<_>>>()?
            };

            return Ok(Value::Array(items));
        }
    }

    parse_scalar(element, text)
}

fn parse_scalar(element: &Element, text: &str) -> Result<Value> {
    Ok(match element {
        Element::Byte => Value::Byte(text.parse()?),
        Element::Bool => Value::Bool(text.parse()?),
        Element::Int16 => Value::Int16(text.parse()?),
        Element::Uint16 => Value::Uint16(text.parse()?),
        Element::Int32 => Value::Int32(text.parse()?),
        Element::Uint32 => Value::Uint32(text.parse()?),
        Element::Int64 => Value::Int64(text.parse()?),
        Element::Uint64 => Value::Uint64(text.parse()?),
        Element::Double => Value::Double(text.parse()?),
        Element::String => Value::Str(text.to_string()),
        Element::ObjectPath => Value::ObjectPath(ObjectPathBuf::new(text.to_string())?),
        Element::Signature => Value::Signature(Signature::parse(text)?),
        other => bail!("CLI argument parsing does not support type `{other}`"),
    })
}

fn print_message_body(message: &Message) -> Result<()> {
    if message.body_signature.is_empty() {
        return Ok(());
    }

    let mut unmarshaller = Unmarshaller::new(
        &message.body,
        &message.body_signature,
        message.endianness,
        AlignMode::Message,
        0,
    );

    for _ in message.body_signature.elements() {
        let value = unmarshaller.pop()?;
        println!("{value}");
    }

    Ok(())
}
