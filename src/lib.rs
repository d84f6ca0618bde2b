//! A client-side D-Bus implementation for Tokio: the signature model, the
//! marshaller and unmarshaller, the message codec, the SASL handshake and
//! a connection dispatcher over Unix domain sockets.

#[doc(inline)]
pub use self::error::{Error, ErrorKind, RemoteError, Result};
mod error;

#[doc(inline)]
pub use self::protocol::{Endianness, Flags};
#[macro_use]
pub mod protocol;

#[doc(inline)]
pub use self::signature::{Element, Signature};
mod signature;

#[doc(inline)]
pub use self::value::{Value, Variant};
mod value;

#[doc(inline)]
pub use self::object_path::{ObjectPath, ObjectPathBuf};
mod object_path;

#[doc(inline)]
pub use self::marshal::{marshal, AlignMode, Marshaller};
mod marshal;

#[doc(inline)]
pub use self::unmarshal::{unmarshal, Unmarshaller};
mod unmarshal;

#[doc(inline)]
pub use self::message::{Message, MessageKind, MAX_MESSAGE_LENGTH};
mod message;

pub use self::framer::Framer;
mod framer;

#[cfg(feature = "tokio")]
pub mod sasl;

pub use self::address::Address;
mod address;

pub mod org_freedesktop_dbus;

#[doc(inline)]
pub use self::export::{
    dispatch_method_call, Direction, ExportedObject, Interface, Method, MethodArg, Property,
    PropertyAccess, SignalDesc,
};
mod export;

pub mod introspect;

#[doc(inline)]
#[cfg(feature = "tokio")]
pub use self::proxy::{Proxy, Subscription};
#[cfg(feature = "tokio")]
mod proxy;

#[doc(inline)]
#[cfg(feature = "tokio")]
pub use self::connection::{Connection, ConnectionBuilder, ConnectionState};
#[cfg(feature = "tokio")]
mod connection;
