//! Wire message model: method calls, replies, errors, and signals.
//!
//! A `Message` is a header plus a body of marshaled arguments. The header's
//! signature field must match the body's actual shapes (`validate`). Byte
//! transports carry messages bincode-encoded and length-framed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::MarshalError;
use crate::signature::Signature;
use crate::value::MsgArg;

/// Header flags.
pub mod flags {
    /// No method reply is expected for this call
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Deliver to every node, not just the local segment
    pub const GLOBAL_BROADCAST: u8 = 0x20;
    /// Body is header-compressed on the wire
    pub const COMPRESSED: u8 = 0x40;
    /// Body is encrypted for the destination peer
    pub const ENCRYPTED: u8 = 0x80;
}

/// Session id stamped on sessionless (broadcast) messages.
pub const SESSION_ID_BROADCAST: u32 = 0;

// ============================================================================
// Error Types
// ============================================================================

/// Errors constructing or decoding wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// A header field required for the message type was absent
    #[error("missing header field '{0}'")]
    MissingHeaderField(&'static str),

    /// Header signature did not match the body shapes
    #[error("header signature '{expected}' does not match body '{found}'")]
    SignatureMismatch { expected: String, found: String },

    /// Body argument failed its shape check
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// Byte-level decode failed
    #[error("message decode failed: {0}")]
    Decode(String),

    /// Byte-level encode failed
    #[error("message encode failed: {0}")]
    Encode(String),
}

// ============================================================================
// Message Model
// ============================================================================

/// The four wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    /// Sender-scoped serial; never 0 on a sent message
    pub serial: u32,
    /// Serial of the call this return/error answers
    pub reply_serial: Option<u32>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    /// Signature of the body
    pub signature: Signature,
    /// Unique name of the sending attachment (stamped on send)
    pub sender: Option<String>,
    pub destination: Option<String>,
    /// 0 = sessionless/broadcast
    pub session_id: u32,
    pub flags: u8,
}

/// One wire message: header plus marshaled body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Vec<MsgArg>,
}

impl Message {
    /// Build a method call. Serial is stamped by the dispatcher at send time.
    pub fn method_call(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Vec<MsgArg>,
    ) -> Self {
        let signature = MsgArg::signature_of(&body);
        Self {
            header: MessageHeader {
                msg_type: MessageType::MethodCall,
                serial: 0,
                reply_serial: None,
                path: Some(path.into()),
                interface: Some(interface.into()),
                member: Some(member.into()),
                error_name: None,
                signature,
                sender: None,
                destination: Some(destination.into()),
                session_id: SESSION_ID_BROADCAST,
                flags: 0,
            },
            body,
        }
    }

    /// Build the reply to `call`.
    pub fn method_return(call: &Message, body: Vec<MsgArg>) -> Self {
        let signature = MsgArg::signature_of(&body);
        Self {
            header: MessageHeader {
                msg_type: MessageType::MethodReturn,
                serial: 0,
                reply_serial: Some(call.header.serial),
                path: None,
                interface: None,
                member: None,
                error_name: None,
                signature,
                sender: None,
                destination: call.header.sender.clone(),
                session_id: call.header.session_id,
                flags: 0,
            },
            body,
        }
    }

    /// Build a named error reply to `call`.
    ///
    /// The human message, when present, travels as a single string argument.
    pub fn error_reply(
        call: &Message,
        error_name: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        let body: Vec<MsgArg> = message.into_iter().map(MsgArg::Str).collect();
        let signature = MsgArg::signature_of(&body);
        Self {
            header: MessageHeader {
                msg_type: MessageType::Error,
                serial: 0,
                reply_serial: Some(call.header.serial),
                path: None,
                interface: None,
                member: None,
                error_name: Some(error_name.into()),
                signature,
                sender: None,
                destination: call.header.sender.clone(),
                session_id: call.header.session_id,
                flags: 0,
            },
            body,
        }
    }

    /// Build a signal emission.
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Vec<MsgArg>,
    ) -> Self {
        let signature = MsgArg::signature_of(&body);
        Self {
            header: MessageHeader {
                msg_type: MessageType::Signal,
                serial: 0,
                reply_serial: None,
                path: Some(path.into()),
                interface: Some(interface.into()),
                member: Some(member.into()),
                error_name: None,
                signature,
                sender: None,
                destination: None,
                session_id: SESSION_ID_BROADCAST,
                flags: 0,
            },
            body,
        }
    }

    /// Stamp a session id.
    pub fn with_session(mut self, session_id: u32) -> Self {
        self.header.session_id = session_id;
        self
    }

    /// Set header flags.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.header.flags = flags;
        self
    }

    /// Address a signal to a single peer instead of broadcasting.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.header.destination = Some(destination.into());
        self
    }

    /// Whether the sender declared it does not want a reply.
    pub fn no_reply_expected(&self) -> bool {
        self.header.flags & flags::NO_REPLY_EXPECTED != 0
    }

    /// Check per-type required headers and that the header signature
    /// matches the body's actual shapes.
    pub fn validate(&self) -> Result<(), MessageError> {
        match self.header.msg_type {
            MessageType::MethodCall => {
                if self.header.path.is_none() {
                    return Err(MessageError::MissingHeaderField("path"));
                }
                if self.header.member.is_none() {
                    return Err(MessageError::MissingHeaderField("member"));
                }
            }
            MessageType::MethodReturn => {
                if self.header.reply_serial.is_none() {
                    return Err(MessageError::MissingHeaderField("reply_serial"));
                }
            }
            MessageType::Error => {
                if self.header.error_name.is_none() {
                    return Err(MessageError::MissingHeaderField("error_name"));
                }
                if self.header.reply_serial.is_none() {
                    return Err(MessageError::MissingHeaderField("reply_serial"));
                }
            }
            MessageType::Signal => {
                if self.header.path.is_none() {
                    return Err(MessageError::MissingHeaderField("path"));
                }
                if self.header.interface.is_none() {
                    return Err(MessageError::MissingHeaderField("interface"));
                }
                if self.header.member.is_none() {
                    return Err(MessageError::MissingHeaderField("member"));
                }
            }
        }

        let actual = MsgArg::signature_of(&self.body);
        if actual != self.header.signature {
            return Err(MessageError::SignatureMismatch {
                expected: self.header.signature.text(),
                found: actual.text(),
            });
        }
        for (arg, node) in self.body.iter().zip(self.header.signature.nodes()) {
            arg.check_against(node)?;
        }
        Ok(())
    }

    /// Encode for a byte transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Decode from a byte transport and validate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        let msg: Message =
            bincode::deserialize(bytes).map_err(|e| MessageError::Decode(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
