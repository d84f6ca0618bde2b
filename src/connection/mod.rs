//! The connection dispatcher (§4.G): socket I/O, the connection state
//! machine, serial allocation, pending-reply correlation, and signal /
//! method-call routing.

pub use self::builder::ConnectionBuilder;
mod builder;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, ErrorKind, RemoteError};
use crate::export::{dispatch_method_call, ExportedObject};
use crate::framer::Framer;
use crate::message::{Message, MessageKind};
use crate::object_path::ObjectPathBuf;
use crate::org_freedesktop_dbus as bus;
use crate::protocol::{Endianness, Flags};
use crate::sasl::{self, Mechanism};
use crate::signature::Signature;
use crate::value::Value;

/// The lifecycle state of a [`Connection`], per §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket has been opened yet.
    Disconnected,
    /// The socket is being opened.
    Connecting,
    /// The SASL handshake is in progress.
    Authenticating,
    /// `Hello` has completed and the connection has a unique name.
    Connected,
    /// A fatal error occurred; the connection must be reconnected.
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(detail) => write!(f, "error({detail})"),
        }
    }
}

/// A signal delivered to a subscribed handler.
pub type SignalSender = mpsc::UnboundedSender<Message>;

struct State {
    conn_state: ConnectionState,
    next_serial: u32,
    pending: HashMap<u32, oneshot::Sender<Result<Message, Error>>>,
    signal_handlers: HashMap<(ObjectPathBuf, String), SignalSender>,
    exported: HashMap<ObjectPathBuf, Arc<dyn ExportedObject>>,
    unique_name: Option<String>,
}

impl State {
    fn new() -> State {
        State {
            conn_state: ConnectionState::Disconnected,
            next_serial: 1,
            pending: HashMap::new(),
            signal_handlers: HashMap::new(),
            exported: HashMap::new(),
            unique_name: None,
        }
    }

    /// Allocate the next non-zero serial, wrapping around modulo 2^32.
    fn allocate_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);

        if self.next_serial == 0 {
            self.next_serial = 1;
        }

        serial
    }

    fn fail_all_pending(&mut self, error: impl Fn() -> Error) {
        for (_, sender) in self.pending.drain() {
            let _ = sender.send(Err(error()));
        }
    }
}

/// A client-side connection to a D-Bus bus daemon.
///
/// All shared state (the serial counter, the pending-reply table, the
/// signal-handler table and the exported-object registry) lives behind a
/// single mutex, per the mailbox model described in the design notes;
/// socket I/O runs on a dedicated background task that re-enters this
/// mailbox for every inbound message. Cloning a `Connection` is cheap: it
/// shares the same mailbox and socket.
#[derive(Clone)]
pub struct Connection {
    state: Arc<Mutex<State>>,
    writer: Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
    endianness: Endianness,
}

impl Connection {
    /// Connect to the session bus.
    pub async fn session_bus() -> Result<Connection, Error> {
        ConnectionBuilder::new().session().connect().await
    }

    /// Connect to the system bus.
    pub async fn system_bus() -> Result<Connection, Error> {
        ConnectionBuilder::new().system().connect().await
    }

    pub(crate) async fn connect(
        stream: UnixStream,
        mechanism: Mechanism,
        endianness: Endianness,
    ) -> Result<Connection, Error> {
        let state = Arc::new(Mutex::new(State::new()));
        state.lock().await.conn_state = ConnectionState::Connecting;

        let mut stream = stream;
        state.lock().await.conn_state = ConnectionState::Authenticating;
        sasl::authenticate(&mut stream, mechanism).await?;

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        let connection = Connection {
            state: state.clone(),
            writer: writer.clone(),
            endianness,
        };

        tokio::spawn(reader_task(read_half, state.clone(), writer.clone(), endianness));

        let hello_reply = connection
            .call_raw(
                Message::method_call(bus_path(), bus::HELLO)
                    .with_interface(bus::INTERFACE)
                    .with_destination(bus::DESTINATION),
            )
            .await?;

        let unique_name = match hello_reply.body_signature.to_signature_string().as_str() {
            "s" => {
                let value = crate::unmarshal::unmarshal(
                    &hello_reply.body,
                    &hello_reply.body_signature,
                    hello_reply.endianness,
                )?;

                match value {
                    Value::Str(name) => name,
                    _ => return Err(ErrorKind::InvalidMessageFormat.into()),
                }
            }
            _ => return Err(ErrorKind::InvalidMessageFormat.into()),
        };

        {
            let mut guard = state.lock().await;
            guard.unique_name = Some(unique_name);
            guard.conn_state = ConnectionState::Connected;
        }

        Ok(connection)
    }

    /// The connection's current state.
    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.conn_state.clone()
    }

    /// The bus name assigned to this connection by `Hello`.
    pub async fn unique_name(&self) -> Option<String> {
        self.state.lock().await.unique_name.clone()
    }

    /// Send a message, awaiting its reply if one is expected.
    ///
    /// Returns `Ok(None)` for messages that do not expect a reply.
    pub async fn send(&self, message: Message) -> Result<Option<Message>, Error> {
        if message.expects_reply() {
            Ok(Some(self.call_raw(message).await?))
        } else {
            self.write_fire_and_forget(message).await?;
            Ok(None)
        }
    }

    async fn call_raw(&self, message: Message) -> Result<Message, Error> {
        let (serial, receiver) = {
            let mut guard = self.state.lock().await;
            let serial = guard.allocate_serial();
            let (tx, rx) = oneshot::channel();
            guard.pending.insert(serial, tx);
            (serial, rx)
        };

        let mut message = message;
        message.endianness = self.endianness;
        message.serial = serial;

        if let Err(error) = self.write_message(&message).await {
            self.state.lock().await.pending.remove(&serial);
            return Err(error);
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ErrorKind::ConnectionClosed.into()),
        }
    }

    async fn write_fire_and_forget(&self, mut message: Message) -> Result<(), Error> {
        let serial = {
            let mut guard = self.state.lock().await;
            guard.allocate_serial()
        };

        message.endianness = self.endianness;
        message.serial = serial;
        self.write_message(&message).await
    }

    async fn write_message(&self, message: &Message) -> Result<(), Error> {
        let bytes = message.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Register a handler for signals matching `(path, interface)`,
    /// installing the corresponding match rule with the bus.
    ///
    /// Returns a channel the caller can poll for matching signals; drop
    /// the receiver (or call [`Connection::unsubscribe`]) to remove the
    /// subscription.
    pub async fn subscribe(
        &self,
        path: ObjectPathBuf,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<Message>, Error> {
        let interface = interface.into();
        let member = member.into();

        let rule = bus::signal_match_rule(path.as_str(), &interface, &member);
        let sig = Signature::parse("s").unwrap();
        let body = crate::marshal::marshal(&sig, self.endianness, &Value::Str(rule))?;

        self.call_raw(
            Message::method_call(bus_path(), bus::ADD_MATCH)
                .with_interface(bus::INTERFACE)
                .with_destination(bus::DESTINATION)
                .with_body(sig, body),
        )
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .signal_handlers
            .insert((path, interface), tx);
        Ok(rx)
    }

    /// Remove a previously installed signal subscription.
    pub async fn unsubscribe(&self, path: ObjectPathBuf, interface: impl Into<String>, member: impl Into<String>) -> Result<(), Error> {
        let interface = interface.into();
        let member = member.into();

        let rule = bus::signal_match_rule(path.as_str(), &interface, &member);
        let sig = Signature::parse("s").unwrap();
        let body = crate::marshal::marshal(&sig, self.endianness, &Value::Str(rule))?;

        self.call_raw(
            Message::method_call(bus_path(), bus::REMOVE_MATCH)
                .with_interface(bus::INTERFACE)
                .with_destination(bus::DESTINATION)
                .with_body(sig, body),
        )
        .await?;

        self.state.lock().await.signal_handlers.remove(&(path, interface));
        Ok(())
    }

    /// Export a local object at `path`.
    pub async fn export(&self, path: ObjectPathBuf, object: Arc<dyn ExportedObject>) {
        self.state.lock().await.exported.insert(path, object);
    }

    /// Unregister a previously exported object.
    pub async fn unexport(&self, path: &ObjectPathBuf) {
        self.state.lock().await.exported.remove(path);
    }

    /// Explicitly close the connection, failing every pending waiter with
    /// [`ErrorKind::ConnectionClosed`]. Idempotent.
    pub async fn disconnect(&self) {
        let mut guard = self.state.lock().await;
        guard.conn_state = ConnectionState::Disconnected;
        guard.signal_handlers.clear();
        guard.exported.clear();
        guard.fail_all_pending(|| ErrorKind::ConnectionClosed.into());
        drop(guard);

        let _ = self.writer.lock().await.shutdown().await;
    }
}

fn bus_path() -> ObjectPathBuf {
    ObjectPathBuf::new(bus::PATH).expect("valid built-in path")
}

async fn reader_task(
    mut read_half: tokio::net::unix::OwnedReadHalf,
    state: Arc<Mutex<State>>,
    writer: Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
    endianness: Endianness,
) {
    let mut framer = Framer::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) => {
                log::warn!("connection socket read failed: {error}");
                break;
            }
        };

        framer.feed(&buf[..n]);

        while let Some(result) = framer.next_frame_lossy() {
            let message = match result {
                Ok(message) => message,
                Err(error) => {
                    log::warn!("discarding malformed message frame: {error}");
                    continue;
                }
            };

            route_message(message, &state, &writer, endianness).await;
        }
    }

    let mut guard = state.lock().await;
    guard.conn_state = ConnectionState::Error("connection closed by peer".into());
    guard.fail_all_pending(|| ErrorKind::ConnectionClosed.into());
}

async fn route_message(
    message: Message,
    state: &Arc<Mutex<State>>,
    writer: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
    endianness: Endianness,
) {
    match &message.kind {
        MessageKind::MethodReturn { reply_serial } => {
            let reply_serial = *reply_serial;
            let mut guard = state.lock().await;

            if let Some(sender) = guard.pending.remove(&reply_serial) {
                let _ = sender.send(Ok(message));
            }
        }
        MessageKind::Error {
            error_name,
            reply_serial,
        } => {
            let reply_serial = *reply_serial;
            let error_name = error_name.clone();
            let mut guard = state.lock().await;

            if let Some(sender) = guard.pending.remove(&reply_serial) {
                let remote = decode_remote_error(&message, error_name);
                let _ = sender.send(Err(ErrorKind::Remote(remote).into()));
            }
        }
        MessageKind::Signal {
            path, interface, ..
        } => {
            let key = (path.clone(), interface.clone());
            let guard = state.lock().await;

            if let Some(sender) = guard.signal_handlers.get(&key) {
                let _ = sender.send(message);
            }
        }
        MessageKind::MethodCall { path, .. } => {
            let path = path.clone();
            let no_reply = message.flags & Flags::NO_REPLY_EXPECTED;

            let object = {
                let guard = state.lock().await;
                guard.exported.get(&path).cloned()
            };

            let reply = match object {
                Some(object) => dispatch_method_call(object.as_ref(), &message),
                None => Err(ErrorKind::ObjectNotExported(path.to_string())),
            };

            if no_reply {
                return;
            }

            let reply_serial = message.serial;
            let unique_name = state.lock().await.unique_name.clone();

            let mut reply_message = match reply {
                Ok((signature, body)) => {
                    Message::method_return(reply_serial).with_body(signature, body)
                }
                Err(kind) => Message::error_reply(reply_serial, error_name_for(&kind)),
            };

            if let Some(name) = unique_name {
                reply_message = reply_message.with_sender(name);
            }

            if let Some(destination) = message.sender.clone() {
                reply_message = reply_message.with_destination(destination);
            }

            let serial = {
                let mut guard = state.lock().await;
                guard.allocate_serial()
            };

            reply_message.endianness = endianness;
            reply_message.serial = serial;

            if let Ok(bytes) = reply_message.encode() {
                let mut writer = writer.lock().await;
                let _ = writer.write_all(&bytes).await;
            }
        }
    }
}

fn decode_remote_error(message: &Message, error_name: String) -> RemoteError {
    let mut strings = Vec::new();

    if let Ok(value) = crate::unmarshal::unmarshal(
        &message.body,
        &message.body_signature,
        message.endianness,
    ) {
        match value {
            Value::Str(s) => strings.push(s),
            Value::Array(items) => {
                for item in items {
                    if let Value::Str(s) = item {
                        strings.push(s);
                    }
                }
            }
            _ => {}
        }
    }

    let mut iter = strings.into_iter();
    let message_text = iter.next();
    let details = iter.collect::<Vec<_>>();

    RemoteError {
        error_name: error_name.into(),
        message: message_text.map(Into::into),
        details: details.into_iter().map(Into::into).collect(),
        sender: message.sender.clone().map(Into::into),
        reply_serial: match &message.kind {
            MessageKind::Error { reply_serial, .. } => *reply_serial,
            _ => 0,
        },
        endianness: message.endianness,
        body: message.body.clone().into_boxed_slice(),
    }
}

fn error_name_for(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidInterface(_) => "org.freedesktop.DBus.Error.UnknownInterface",
        ErrorKind::InvalidMethod(_) => "org.freedesktop.DBus.Error.UnknownMethod",
        ErrorKind::InvalidProperty(_) | ErrorKind::PropertyNotFound(_) => {
            "org.freedesktop.DBus.Error.UnknownProperty"
        }
        ErrorKind::InvalidSignal(_) => "org.freedesktop.DBus.Error.UnknownSignal",
        ErrorKind::ObjectNotExported(_) => "org.freedesktop.DBus.Error.UnknownObject",
        ErrorKind::InvalidMessage(_) => "org.freedesktop.DBus.Error.InvalidArgs",
        ErrorKind::MethodCallFailed(_) => "org.freedesktop.DBus.Error.Failed",
        _ => "org.freedesktop.DBus.Error.Failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_allocation_skips_zero() {
        let mut state = State::new();
        assert_eq!(state.allocate_serial(), 1);

        state.next_serial = 0xFFFF_FFFF;
        assert_eq!(state.allocate_serial(), 0xFFFF_FFFF);
        // Wrapping from u32::MAX lands on 0, which must be skipped.
        assert_eq!(state.allocate_serial(), 1);
    }

    /// Reads exactly one framed message off `stream` using the same
    /// framer the connection's reader task uses.
    async fn read_one_message(stream: &mut UnixStream) -> Message {
        let mut framer = Framer::new();
        let mut buf = [0u8; 4096];

        loop {
            if let Some(result) = framer.next_frame_lossy() {
                return result.expect("well-formed frame");
            }

            let n = stream.read(&mut buf).await.expect("socket read");
            assert!(n > 0, "peer closed before a full frame arrived");
            framer.feed(&buf[..n]);
        }
    }

    async fn drive_anonymous_handshake(stream: &mut UnixStream) {
        let mut preamble = [0u8; 1];
        stream.read_exact(&mut preamble).await.unwrap();
        assert_eq!(preamble, [0]);

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"AUTH ANONYMOUS\r\n");

        stream.write_all(b"OK 0123456789abcdef0123456789abcdef\r\n").await.unwrap();

        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"BEGIN\r\n");
    }

    async fn reply_to_hello(stream: &mut UnixStream, unique_name: &str) {
        let hello = read_one_message(stream).await;
        assert_eq!(hello.body_signature, Signature::EMPTY);

        let sig = Signature::parse("s").unwrap();
        let body = crate::marshal::marshal(&sig, Endianness::NATIVE, &Value::Str(unique_name.into())).unwrap();

        let mut reply = Message::method_return(hello.serial)
            .with_destination(unique_name.to_string())
            .with_sender(bus::DESTINATION)
            .with_body(sig, body);
        reply.endianness = Endianness::NATIVE;
        reply.serial = 1;

        stream.write_all(&reply.encode().unwrap()).await.unwrap();
    }

    /// Drives the full handshake and hands back a client `Connection`
    /// plus the server-side end of the socket pair.
    async fn connected_pair(unique_name: &str) -> (Connection, UnixStream) {
        let (client_stream, mut server_stream) = UnixStream::pair().unwrap();
        let unique_name = unique_name.to_string();

        let server = tokio::spawn(async move {
            drive_anonymous_handshake(&mut server_stream).await;
            reply_to_hello(&mut server_stream, &unique_name).await;
            server_stream
        });

        let connection = Connection::connect(client_stream, Mechanism::Anonymous, Endianness::NATIVE)
            .await
            .unwrap();

        let server_stream = server.await.unwrap();
        (connection, server_stream)
    }

    #[tokio::test]
    async fn hello_handshake_assigns_unique_name() {
        let (connection, _server) = connected_pair(":1.42").await;
        assert_eq!(connection.state().await, ConnectionState::Connected);
        assert_eq!(connection.unique_name().await.as_deref(), Some(":1.42"));
    }

    #[tokio::test]
    async fn replies_are_matched_to_the_call_that_sent_them_even_out_of_order() {
        let (connection, mut server) = connected_pair(":1.1").await;

        let first = connection.send(
            Message::method_call(bus_path(), "First").with_interface("com.example.X"),
        );
        let second = connection.send(
            Message::method_call(bus_path(), "Second").with_interface("com.example.X"),
        );

        let server = tokio::spawn(async move {
            let first_call = read_one_message(&mut server).await;
            let second_call = read_one_message(&mut server).await;

            // Reply to the second call first; the client must still
            // route each reply back to its own waiter.
            let sig = Signature::parse("s").unwrap();

            let mut second_reply = Message::method_return(second_call.serial)
                .with_body(sig.clone(), crate::marshal::marshal(&sig, Endianness::NATIVE, &Value::Str("second".into())).unwrap());
            second_reply.endianness = Endianness::NATIVE;
            second_reply.serial = 100;
            server.write_all(&second_reply.encode().unwrap()).await.unwrap();

            let mut first_reply = Message::method_return(first_call.serial)
                .with_body(sig.clone(), crate::marshal::marshal(&sig, Endianness::NATIVE, &Value::Str("first".into())).unwrap());
            first_reply.endianness = Endianness::NATIVE;
            first_reply.serial = 101;
            server.write_all(&first_reply.encode().unwrap()).await.unwrap();
        });

        let (first, second) = tokio::join!(first, second);

        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();

        let sig = Signature::parse("s").unwrap();
        assert_eq!(
            crate::unmarshal::unmarshal(&first.body, &sig, first.endianness).unwrap(),
            Value::Str("first".into())
        );
        assert_eq!(
            crate::unmarshal::unmarshal(&second.body, &sig, second.endianness).unwrap(),
            Value::Str("second".into())
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn signals_are_routed_to_their_subscriber() {
        let (connection, mut server) = connected_pair(":1.7").await;
        let path = ObjectPathBuf::new("/a").unwrap();

        let subscribe = connection.subscribe(path.clone(), "com.x", "Changed");

        let server_task = tokio::spawn(async move {
            let add_match = read_one_message(&mut server).await;
            let mut reply = Message::method_return(add_match.serial);
            reply.endianness = Endianness::NATIVE;
            reply.serial = 200;
            server.write_all(&reply.encode().unwrap()).await.unwrap();
            server
        });

        let mut receiver = subscribe.await.unwrap();
        let mut server = server_task.await.unwrap();

        let signal = Message::signal(path, "com.x", "Changed");
        let mut signal = signal;
        signal.endianness = Endianness::NATIVE;
        signal.serial = 201;
        server.write_all(&signal.encode().unwrap()).await.unwrap();

        let delivered = receiver.recv().await.expect("signal delivered");
        assert!(matches!(delivered.kind, MessageKind::Signal { .. }));
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_waiter() {
        let (connection, _server) = connected_pair(":1.9").await;

        let pending = connection.send(
            Message::method_call(bus_path(), "NeverReplied").with_interface("com.example.X"),
        );

        connection.disconnect().await;

        let error = pending.await.unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::ConnectionClosed));
    }
}
