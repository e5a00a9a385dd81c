//! Remote-object handles.
//!
//! A `ProxyObject` addresses one object on one peer. Interface descriptions
//! are attached locally (or the raw introspection XML fetched from the
//! peer); method arguments are marshaled against the declared input
//! signature before anything is sent, so shape mismatches fail
//! synchronously at the call site.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use obus_msg::codec::{decode_all, encode_all, Value};
use obus_msg::message::flags as msg_flags;
use obus_msg::signature::TypeNode;
use obus_msg::{Message, MsgArg};

use crate::bus::{BusAttachment, CallOpts};
use crate::errors::{BusError, ErrorCode};
use crate::interface::{builtin, InterfaceDescription};
use crate::sessions::SessionId;

/// A handle for calling methods and accessing properties on a remote object.
pub struct ProxyObject {
    bus: BusAttachment,
    destination: String,
    path: String,
    session_id: SessionId,
    interfaces: RwLock<HashMap<String, Arc<InterfaceDescription>>>,
}

impl ProxyObject {
    pub(crate) fn new(
        bus: BusAttachment,
        destination: &str,
        path: &str,
        session_id: SessionId,
    ) -> Self {
        Self {
            bus,
            destination: destination.to_string(),
            path: path.to_string(),
            session_id,
            interfaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Attach a frozen interface description to this proxy.
    pub fn add_interface(&self, iface: Arc<InterfaceDescription>) {
        self.interfaces.write().insert(iface.name.clone(), iface);
    }

    pub fn interface(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        self.interfaces.read().get(name).cloned()
    }

    /// Call a method declared on an attached interface.
    ///
    /// Arguments are encoded per the declared input signature; a shape
    /// mismatch errors here, before anything crosses the wire. The reply is
    /// decoded per the declared output signature; a named error from the
    /// remote handler comes back verbatim as a `BusError`.
    pub async fn method_call(
        &self,
        interface: &str,
        member: &str,
        args: &[Value],
        opts: CallOpts,
    ) -> Result<Vec<Value>, BusError> {
        let iface = self.interface(interface).ok_or_else(|| {
            BusError::with_message(
                ErrorCode::BusUnknownInterface,
                format!("interface '{}' is not attached to this proxy", interface),
            )
        })?;
        let method = iface
            .method(member)
            .ok_or_else(|| {
                BusError::with_message(
                    ErrorCode::BusObjectNoSuchMember,
                    format!("interface '{}' has no method '{}'", interface, member),
                )
            })?
            .clone();

        // Malformed-call errors stay local.
        let body = encode_all(args, &method.in_sig)?;

        // A secured interface lazily authenticates the peer first.
        if iface.secure {
            self.bus.ensure_authenticated(&self.destination).await?;
        }

        let mut msg = Message::method_call(
            self.destination.clone(),
            self.path.clone(),
            interface,
            member,
            body,
        )
        .with_session(self.session_id)
        .with_flags(opts.flags);

        if method.no_reply {
            msg.header.flags |= msg_flags::NO_REPLY_EXPECTED;
            self.bus.call_raw(msg, opts.timeout).await?;
            return Ok(Vec::new());
        }

        let reply = self.bus.call_raw(msg, opts.timeout).await?;
        if reply.header.signature != method.out_sig {
            return Err(BusError::with_message(
                ErrorCode::BusBadSignature,
                format!(
                    "reply signature '{}' does not match declared '{}'",
                    reply.header.signature.text(),
                    method.out_sig.text()
                ),
            ));
        }
        Ok(decode_all(&reply.body))
    }

    /// Fetch the remote introspection XML.
    pub async fn introspect(&self) -> Result<String, BusError> {
        let msg = Message::method_call(
            self.destination.clone(),
            self.path.clone(),
            builtin::INTROSPECTABLE,
            builtin::INTROSPECT,
            vec![],
        )
        .with_session(self.session_id);
        let reply = self.bus.call_raw(msg, CallOpts::default().timeout).await?;
        match reply.body.first() {
            Some(MsgArg::Str(xml)) => Ok(xml.clone()),
            _ => Err(BusError::new(ErrorCode::BusBadSignature)),
        }
    }

    /// `org.freedesktop.DBus.Properties.Get`, unwrapping the variant.
    pub async fn get_property(&self, interface: &str, property: &str) -> Result<Value, BusError> {
        let msg = Message::method_call(
            self.destination.clone(),
            self.path.clone(),
            builtin::PROPERTIES,
            builtin::GET,
            vec![
                MsgArg::Str(interface.to_string()),
                MsgArg::Str(property.to_string()),
            ],
        )
        .with_session(self.session_id);
        let reply = self.bus.call_raw(msg, CallOpts::default().timeout).await?;
        match reply.body.first() {
            Some(MsgArg::Variant { value, .. }) => Ok(obus_msg::codec::decode(value)),
            _ => Err(BusError::new(ErrorCode::BusBadSignature)),
        }
    }

    /// `org.freedesktop.DBus.Properties.Set`. The value is wrapped in a
    /// variant tagged with `node`.
    pub async fn set_property(
        &self,
        interface: &str,
        property: &str,
        node: TypeNode,
        value: Value,
    ) -> Result<(), BusError> {
        let variant = obus_msg::codec::encode(
            &Value::Variant {
                node,
                value: Box::new(value),
            },
            &TypeNode::Variant,
        )?;
        let msg = Message::method_call(
            self.destination.clone(),
            self.path.clone(),
            builtin::PROPERTIES,
            builtin::SET,
            vec![
                MsgArg::Str(interface.to_string()),
                MsgArg::Str(property.to_string()),
                variant,
            ],
        )
        .with_session(self.session_id);
        self.bus.call_raw(msg, CallOpts::default().timeout).await?;
        Ok(())
    }

    /// `org.freedesktop.DBus.Properties.GetAll`: property name -> unwrapped
    /// value.
    pub async fn get_all_properties(
        &self,
        interface: &str,
    ) -> Result<Vec<(String, Value)>, BusError> {
        let msg = Message::method_call(
            self.destination.clone(),
            self.path.clone(),
            builtin::PROPERTIES,
            builtin::GET_ALL,
            vec![MsgArg::Str(interface.to_string())],
        )
        .with_session(self.session_id);
        let reply = self.bus.call_raw(msg, CallOpts::default().timeout).await?;
        match reply.body.first() {
            Some(MsgArg::Dict { entries, .. }) => Ok(entries
                .iter()
                .filter_map(|(k, v)| match (k, v) {
                    (MsgArg::Str(name), MsgArg::Variant { value, .. }) => {
                        Some((name.clone(), obus_msg::codec::decode(value)))
                    }
                    _ => None,
                })
                .collect()),
            _ => Err(BusError::new(ErrorCode::BusBadSignature)),
        }
    }

    /// Override the default call timeout for one call.
    pub fn call_opts(timeout: Duration) -> CallOpts {
        CallOpts {
            timeout,
            ..CallOpts::default()
        }
    }
}
