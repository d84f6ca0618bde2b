//! A typed-ish client-side handle to a remote object (§4.H).

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::{Error, ErrorKind};
use crate::marshal::marshal;
use crate::message::Message;
use crate::object_path::ObjectPathBuf;
use crate::org_freedesktop_dbus as bus;
use crate::signature::{Element, Signature};
use crate::unmarshal::unmarshal;
use crate::value::{Value, Variant};

/// A handle bound to one `(destination, path, interface)` triple.
///
/// Proxies are cheap to construct and clone; all the state they carry is
/// owned strings plus a cloned [`Connection`].
#[derive(Clone)]
pub struct Proxy {
    connection: Connection,
    destination: String,
    path: ObjectPathBuf,
    interface: String,
}

impl Proxy {
    /// Bind a proxy to a remote object's interface.
    pub fn new(
        connection: Connection,
        destination: impl Into<String>,
        path: ObjectPathBuf,
        interface: impl Into<String>,
    ) -> Proxy {
        Proxy {
            connection,
            destination: destination.into(),
            path,
            interface: interface.into(),
        }
    }

    /// The object path this proxy addresses.
    pub fn path(&self) -> &ObjectPathBuf {
        &self.path
    }

    /// The interface this proxy addresses.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Invoke a method, awaiting its reply.
    pub async fn call(
        &self,
        member: &str,
        signature: Signature,
        body: Vec<u8>,
    ) -> Result<Message, Error> {
        let message = Message::method_call(self.path.clone(), member)
            .with_interface(self.interface.clone())
            .with_destination(self.destination.clone())
            .with_body(signature, body);

        self.connection
            .send(message)
            .await?
            .ok_or_else(|| ErrorKind::InvalidMessage("method call did not receive a reply".into()).into())
    }

    /// Emit a signal from this proxy's path and interface.
    pub async fn emit(
        &self,
        member: &str,
        signature: Signature,
        body: Vec<u8>,
    ) -> Result<(), Error> {
        let message = Message::signal(self.path.clone(), self.interface.clone(), member)
            .with_body(signature, body);

        self.connection.send(message).await?;
        Ok(())
    }

    /// Read a property via `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property(&self, name: &str) -> Result<Value, Error> {
        let sig = Signature::parse("ss").expect("valid built-in signature");
        let mut marshaller = crate::marshal::Marshaller::new(
            &sig,
            crate::protocol::Endianness::NATIVE,
            crate::marshal::AlignMode::Message,
            0,
        );
        marshaller.push(&Value::Str(self.interface.clone()))?;
        marshaller.push(&Value::Str(name.to_string()))?;
        let body = marshaller.finish()?;

        let reply = self.properties_call("Get", sig, body).await?;
        let value = unmarshal(&reply.body, &reply.body_signature, reply.endianness)?;

        match value {
            Value::Variant(variant) => Ok(variant.into_value()),
            other => Err(ErrorKind::InvalidValue(other.type_name()).into()),
        }
    }

    /// Write a property via `org.freedesktop.DBus.Properties.Set`.
    pub async fn set_property(&self, name: &str, ty: Element, value: Value) -> Result<(), Error> {
        let sig = Signature::parse("ssv").expect("valid built-in signature");
        let variant_sig = Signature::parse(&ty.to_signature_string())?;

        let mut marshaller = crate::marshal::Marshaller::new(
            &sig,
            crate::protocol::Endianness::NATIVE,
            crate::marshal::AlignMode::Message,
            0,
        );
        marshaller.push(&Value::Str(self.interface.clone()))?;
        marshaller.push(&Value::Str(name.to_string()))?;
        marshaller.push(&Value::Variant(Variant::new(variant_sig, value)))?;
        let body = marshaller.finish()?;

        self.properties_call("Set", sig, body).await?;
        Ok(())
    }

    /// Read every readable property via
    /// `org.freedesktop.DBus.Properties.GetAll`.
    pub async fn get_all_properties(&self) -> Result<Vec<(String, Value)>, Error> {
        let sig = Signature::parse("s").expect("valid built-in signature");
        let body = marshal(&sig, crate::protocol::Endianness::NATIVE, &Value::Str(self.interface.clone()))?;

        let reply = self.properties_call("GetAll", sig, body).await?;
        let value = unmarshal(&reply.body, &reply.body_signature, reply.endianness)?;

        let Value::Dict(entries) = value else {
            return Err(ErrorKind::InvalidValue("dict").into());
        };

        let mut out = Vec::with_capacity(entries.len());

        for (key, value) in entries {
            let Value::Str(name) = key else {
                return Err(ErrorKind::InvalidValue("string").into());
            };

            let value = match value {
                Value::Variant(variant) => variant.into_value(),
                other => other,
            };

            out.push((name, value));
        }

        Ok(out)
    }

    async fn properties_call(
        &self,
        member: &str,
        signature: Signature,
        body: Vec<u8>,
    ) -> Result<Message, Error> {
        let message = Message::method_call(self.path.clone(), member)
            .with_interface(bus::PROPERTIES_INTERFACE)
            .with_destination(self.destination.clone())
            .with_body(signature, body);

        self.connection
            .send(message)
            .await?
            .ok_or_else(|| ErrorKind::InvalidMessage("property call did not receive a reply".into()).into())
    }

    /// Subscribe to a signal, installing the corresponding match rule.
    pub async fn subscribe(&self, member: impl Into<String>) -> Result<Subscription, Error> {
        let member = member.into();
        let receiver = self
            .connection
            .subscribe(self.path.clone(), self.interface.clone(), member.clone())
            .await?;

        Ok(Subscription {
            connection: self.connection.clone(),
            path: self.path.clone(),
            interface: self.interface.clone(),
            member,
            receiver,
        })
    }
}

/// A live signal subscription.
///
/// Drop this (or call [`Subscription::unsubscribe`]) to stop receiving
/// and remove the bus match rule.
pub struct Subscription {
    connection: Connection,
    path: ObjectPathBuf,
    interface: String,
    member: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Await the next matching signal.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Decode the next matching signal's body against `signature`.
    pub async fn recv_value(&mut self, signature: &Signature) -> Option<Result<Value, Error>> {
        let message = self.receiver.recv().await?;
        Some(unmarshal(&message.body, signature, message.endianness))
    }

    /// Remove the match rule and stop receiving.
    pub async fn unsubscribe(self) -> Result<(), Error> {
        self.connection
            .unsubscribe(self.path, self.interface, self.member)
            .await
    }
}
