use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::protocol::Endianness;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// Test if the error indicates that the underlying operation would
    /// block and should be retried once the socket is readable/writable
    /// again.
    #[inline]
    pub(crate) fn would_block(&self) -> bool {
        matches!(self.kind, ErrorKind::WouldBlock)
    }

    /// The kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => Self::new(ErrorKind::WouldBlock),
            _ => Self::new(ErrorKind::SocketError(error.to_string())),
        }
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(_error: Utf8Error) -> Self {
        Self::new(ErrorKind::InvalidValue("string"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorKind::*;

        match &self.kind {
            // configuration
            InvalidAddress(detail) => write!(f, "invalid d-bus address: {detail}"),
            EnvironmentVariableNotSet(name) => {
                write!(f, "environment variable `{name}` is not set")
            }
            UnsupportedTransport(name) => write!(f, "unsupported transport `{name}`"),
            // transport
            ConnectionFailed(detail) => write!(f, "connection failed: {detail}"),
            SocketError(detail) => write!(f, "socket error: {detail}"),
            ConnectionClosed => write!(f, "connection closed"),
            Timeout => write!(f, "operation timed out"),
            WouldBlock => write!(f, "would block"),
            // authentication
            AuthenticationFailed(detail) => write!(f, "authentication failed: {detail}"),
            InvalidAuthResponse(detail) => write!(f, "invalid SASL response: {detail}"),
            // protocol
            InvalidMessageFormat => write!(f, "invalid message format"),
            InvalidEndianness(byte) => write!(f, "invalid endianness byte `{byte:#04x}`"),
            InvalidMessageType(byte) => write!(f, "invalid message type `{byte}`"),
            InvalidBodyLength => write!(f, "invalid body length"),
            MissingRequiredHeaderField(code) => {
                write!(f, "missing required header field `{code}`")
            }
            UnsupportedProtocolVersion(byte) => {
                write!(f, "unsupported protocol version `{byte}`")
            }
            InvalidSerial => write!(f, "invalid (zero) serial"),
            MessageTooLarge => write!(f, "message exceeds the 128 MiB limit"),
            // codec
            ElementMismatch { got, expected } => {
                write!(f, "element mismatch: got `{got}`, expected `{expected}`")
            }
            InvalidValue(ty) => write!(f, "invalid value for type `{ty}`"),
            CannotMarshalType => write!(f, "type cannot be marshalled here"),
            InvalidSignature(detail) => write!(f, "invalid signature: {detail}"),
            Incomplete => write!(f, "value exhausted before signature did"),
            Truncated => write!(f, "buffer truncated before decoding finished"),
            // dispatch
            InvalidInterface(name) => write!(f, "unknown interface `{name}`"),
            InvalidMethod(name) => write!(f, "unknown method `{name}`"),
            InvalidProperty(name) => write!(f, "unknown property `{name}`"),
            InvalidSignal(name) => write!(f, "unknown signal `{name}`"),
            ObjectNotExported(path) => write!(f, "no object exported at `{path}`"),
            PropertyNotFound(name) => write!(f, "property `{name}` not found"),
            MethodCallFailed(detail) => write!(f, "method call failed: {detail}"),
            InvalidMessage(detail) => write!(f, "invalid message: {detail}"),
            SignalEmissionFailed(detail) => write!(f, "signal emission failed: {detail}"),
            // remote
            Remote(remote) => remote.fmt(f),
        }
    }
}

impl error::Error for Error {}

/// The category of an [`Error`].
///
/// This mirrors the taxonomy of failures that can occur while resolving an
/// address, authenticating, framing, decoding and dispatching D-Bus
/// messages.
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A D-Bus address string could not be parsed.
    InvalidAddress(String),
    /// A required environment variable was not set.
    EnvironmentVariableNotSet(&'static str),
    /// The address named a transport other than `unix`.
    UnsupportedTransport(String),
    /// Connecting the underlying socket failed.
    ConnectionFailed(String),
    /// A read or write on the socket failed.
    SocketError(String),
    /// The connection has already been closed.
    ConnectionClosed,
    /// An operation exceeded its deadline.
    Timeout,
    /// The underlying I/O operation would block.
    WouldBlock,
    /// The SASL handshake failed.
    AuthenticationFailed(String),
    /// The peer sent an unexpected SASL response.
    InvalidAuthResponse(String),
    /// A message could not be parsed as a valid D-Bus message.
    InvalidMessageFormat,
    /// The endianness byte was not `'l'` or `'B'`.
    InvalidEndianness(u8),
    /// The message type byte was not 1, 2, 3 or 4.
    InvalidMessageType(u8),
    /// The `body_length` field is inconsistent with the remaining bytes.
    InvalidBodyLength,
    /// A header field required for this message type was not present.
    MissingRequiredHeaderField(&'static str),
    /// The protocol version byte was not 1.
    UnsupportedProtocolVersion(u8),
    /// The message serial was zero.
    InvalidSerial,
    /// The message exceeds the 128 MiB limit.
    MessageTooLarge,
    /// A value did not match the signature element being marshalled.
    ElementMismatch {
        /// Human-readable description of the value that was given.
        got: &'static str,
        /// Human-readable description of the element that was expected.
        expected: &'static str,
    },
    /// A value could not be decoded for the named type.
    InvalidValue(&'static str),
    /// The type cannot be represented in a signature.
    CannotMarshalType,
    /// A signature string failed to parse.
    InvalidSignature(String),
    /// The value cursor was finalized before the signature was exhausted.
    Incomplete,
    /// The buffer ran out of bytes before decoding finished.
    Truncated,
    /// A method, signal or property referenced an unknown interface.
    InvalidInterface(String),
    /// A method call referenced an unknown method.
    InvalidMethod(String),
    /// A property access referenced an unknown property.
    InvalidProperty(String),
    /// A signal subscription referenced an unknown signal.
    InvalidSignal(String),
    /// No object is exported at the given path.
    ObjectNotExported(String),
    /// The named property does not exist on the object.
    PropertyNotFound(String),
    /// A user method handler failed.
    MethodCallFailed(String),
    /// An inbound message did not match what the dispatcher expected.
    InvalidMessage(String),
    /// Emitting a signal failed.
    SignalEmissionFailed(String),
    /// A structured error reply was received from a remote peer.
    Remote(RemoteError),
}

/// A structured D-Bus error reply.
#[derive(Debug, Clone)]
pub struct RemoteError {
    /// The dotted error name, e.g. `org.freedesktop.DBus.Error.NoReply`.
    pub error_name: Box<str>,
    /// The first string argument of the error body, if any.
    pub message: Option<Box<str>>,
    /// Any additional string arguments beyond the first.
    pub details: Vec<Box<str>>,
    /// The sender of the error, if known.
    pub sender: Option<Box<str>>,
    /// The serial of the message this is a reply to.
    pub reply_serial: u32,
    /// The endianness `body` was encoded with.
    pub endianness: Endianness,
    /// The raw, undecoded body of the error message.
    pub body: Box<[u8]>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.error_name),
            None => write!(f, "{}", self.error_name),
        }
    }
}
