//! Error surface for the bus core.
//!
//! `BusError` is the wire-facing error shape: a dotted error name, a
//! numeric code, and a human message. Well-known codes cover routing,
//! session, and security failures; application handlers raise their own
//! named errors through `reply_error`, which travel verbatim.

use thiserror::Error;

use obus_msg::codec::MarshalError;
use obus_msg::message::MessageError;
use obus_msg::validation::ValidationError;
use obus_transport::TransportError;

// ============================================================================
// Error Codes
// ============================================================================

/// Well-known bus status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    Fail = 1,
    Timeout = 6,
    AuthFail = 0x1004,
    BadArgCount = 0x100a,
    BusBadSignature = 0x9019,
    BusNotConnected = 0x9007,
    BusAlreadyConnected = 0x9008,
    BusNoSuchObject = 0x900f,
    BusUnknownInterface = 0x9010,
    BusObjectNoSuchMember = 0x9013,
    BusNoSuchProperty = 0x9044,
    BusPropertyAccessDenied = 0x9045,
    BusObjAlreadyExists = 0x9015,
    BusNoSession = 0x904c,
    BusReplyIsErrorMessage = 0x9028,
    BusUnexpectedDisposition = 0x9049,
    BusSecurityViolation = 0x902e,
    BusDestroyed = 0x9056,
    JoinSessionReplyNoSession = 0x90c8,
    JoinSessionReplyRejected = 0x90cb,
    JoinSessionReplyBadSessionOpts = 0x90cc,
    JoinSessionReplyAlreadyJoined = 0x90cd,
    JoinSessionReplyFailed = 0x90ce,
    BindSessionPortReplyAlreadyExists = 0x90d1,
    BindSessionPortReplyFailed = 0x90d3,
    UnbindSessionPortReplyBadPort = 0x90d5,
    RemoveSessionMemberNotBinder = 0x90f0,
    RemoveSessionMemberNotFound = 0x90f1,
    RemoveSessionMemberNotMultipoint = 0x90f2,
}

impl ErrorCode {
    /// The standard dotted error name for this code.
    pub fn error_name(self) -> &'static str {
        match self {
            ErrorCode::Ok => "org.obus.Bus.Ok",
            ErrorCode::Fail => "org.obus.Bus.Failed",
            ErrorCode::Timeout => "org.obus.Bus.Timeout",
            ErrorCode::AuthFail => "org.alljoyn.Bus.AuthFailed",
            ErrorCode::BadArgCount => "org.obus.Bus.BadArgCount",
            ErrorCode::BusBadSignature => "org.obus.Bus.BadSignature",
            ErrorCode::BusNotConnected => "org.obus.Bus.NotConnected",
            ErrorCode::BusAlreadyConnected => "org.obus.Bus.AlreadyConnected",
            ErrorCode::BusNoSuchObject => "org.freedesktop.DBus.Error.UnknownObject",
            ErrorCode::BusUnknownInterface => "org.freedesktop.DBus.Error.UnknownInterface",
            ErrorCode::BusObjectNoSuchMember => "org.freedesktop.DBus.Error.UnknownMethod",
            ErrorCode::BusNoSuchProperty => "org.freedesktop.DBus.Error.UnknownProperty",
            ErrorCode::BusPropertyAccessDenied => "org.freedesktop.DBus.Error.PropertyReadOnly",
            ErrorCode::BusObjAlreadyExists => "org.obus.Bus.ObjectAlreadyExists",
            ErrorCode::BusNoSession => "org.obus.Bus.NoSession",
            ErrorCode::BusReplyIsErrorMessage => "org.obus.Bus.ReplyIsErrorMessage",
            ErrorCode::BusUnexpectedDisposition => "org.obus.Bus.UnexpectedDisposition",
            ErrorCode::BusSecurityViolation => "org.alljoyn.Bus.SecurityViolation",
            ErrorCode::BusDestroyed => "org.obus.Bus.Destroyed",
            ErrorCode::JoinSessionReplyNoSession => "org.obus.Bus.JoinSession.NoSession",
            ErrorCode::JoinSessionReplyRejected => "org.obus.Bus.JoinSession.Rejected",
            ErrorCode::JoinSessionReplyBadSessionOpts => "org.obus.Bus.JoinSession.BadSessionOpts",
            ErrorCode::JoinSessionReplyAlreadyJoined => "org.obus.Bus.JoinSession.AlreadyJoined",
            ErrorCode::JoinSessionReplyFailed => "org.obus.Bus.JoinSession.Failed",
            ErrorCode::BindSessionPortReplyAlreadyExists => {
                "org.obus.Bus.BindSessionPort.AlreadyExists"
            }
            ErrorCode::BindSessionPortReplyFailed => "org.obus.Bus.BindSessionPort.Failed",
            ErrorCode::UnbindSessionPortReplyBadPort => "org.obus.Bus.UnbindSessionPort.BadPort",
            ErrorCode::RemoveSessionMemberNotBinder => {
                "org.obus.Bus.RemoveSessionMember.NotBinder"
            }
            ErrorCode::RemoveSessionMemberNotFound => {
                "org.obus.Bus.RemoveSessionMember.NotFound"
            }
            ErrorCode::RemoveSessionMemberNotMultipoint => {
                "org.obus.Bus.RemoveSessionMember.NotMultipoint"
            }
        }
    }

    /// Default human message for this code.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "no error",
            ErrorCode::Fail => "operation failed",
            ErrorCode::Timeout => "method call timed out",
            ErrorCode::AuthFail => "authentication failed",
            ErrorCode::BadArgCount => "wrong number of arguments",
            ErrorCode::BusBadSignature => "argument signature mismatch",
            ErrorCode::BusNotConnected => "bus attachment is not connected",
            ErrorCode::BusAlreadyConnected => "bus attachment is already connected",
            ErrorCode::BusNoSuchObject => "no object at this path",
            ErrorCode::BusUnknownInterface => "interface is not known to this object",
            ErrorCode::BusObjectNoSuchMember => "no such member on this interface",
            ErrorCode::BusNoSuchProperty => "no such property on this interface",
            ErrorCode::BusPropertyAccessDenied => "property access denied",
            ErrorCode::BusObjAlreadyExists => "an object is already registered at this path",
            ErrorCode::BusNoSession => "no such session",
            ErrorCode::BusReplyIsErrorMessage => "reply is an error message",
            ErrorCode::BusUnexpectedDisposition => "unexpected handshake disposition",
            ErrorCode::BusSecurityViolation => "security violation",
            ErrorCode::BusDestroyed => "bus attachment has been destroyed",
            ErrorCode::JoinSessionReplyNoSession => "no session port bound at this port",
            ErrorCode::JoinSessionReplyRejected => "session join was rejected",
            ErrorCode::JoinSessionReplyBadSessionOpts => "incompatible session options",
            ErrorCode::JoinSessionReplyAlreadyJoined => "already joined this session",
            ErrorCode::JoinSessionReplyFailed => "session join failed",
            ErrorCode::BindSessionPortReplyAlreadyExists => "session port is already bound",
            ErrorCode::BindSessionPortReplyFailed => "binding the session port failed",
            ErrorCode::UnbindSessionPortReplyBadPort => "session port is not bound",
            ErrorCode::RemoveSessionMemberNotBinder => "only the binder may remove members",
            ErrorCode::RemoveSessionMemberNotFound => "member is not part of this session",
            ErrorCode::RemoveSessionMemberNotMultipoint => "session is not multipoint",
        }
    }

    /// Reverse-map a numeric wire status to a well-known code.
    pub fn from_status(status: u32) -> ErrorCode {
        Self::ALL
            .iter()
            .copied()
            .find(|c| *c as u32 == status)
            .unwrap_or(ErrorCode::Fail)
    }

    /// Reverse-map a wire error name to a well-known code.
    pub fn from_error_name(name: &str) -> Option<ErrorCode> {
        Self::ALL.iter().copied().find(|c| c.error_name() == name)
    }

    const ALL: &'static [ErrorCode] = &[
            ErrorCode::Fail,
            ErrorCode::Timeout,
            ErrorCode::AuthFail,
            ErrorCode::BadArgCount,
            ErrorCode::BusBadSignature,
            ErrorCode::BusNotConnected,
            ErrorCode::BusAlreadyConnected,
            ErrorCode::BusNoSuchObject,
            ErrorCode::BusUnknownInterface,
            ErrorCode::BusObjectNoSuchMember,
            ErrorCode::BusNoSuchProperty,
            ErrorCode::BusPropertyAccessDenied,
            ErrorCode::BusObjAlreadyExists,
            ErrorCode::BusNoSession,
            ErrorCode::BusUnexpectedDisposition,
            ErrorCode::BusSecurityViolation,
            ErrorCode::BusDestroyed,
            ErrorCode::JoinSessionReplyNoSession,
            ErrorCode::JoinSessionReplyRejected,
            ErrorCode::JoinSessionReplyBadSessionOpts,
            ErrorCode::JoinSessionReplyAlreadyJoined,
            ErrorCode::JoinSessionReplyFailed,
            ErrorCode::BindSessionPortReplyAlreadyExists,
            ErrorCode::BindSessionPortReplyFailed,
            ErrorCode::UnbindSessionPortReplyBadPort,
            ErrorCode::RemoveSessionMemberNotBinder,
            ErrorCode::RemoveSessionMemberNotFound,
            ErrorCode::RemoveSessionMemberNotMultipoint,
    ];
}

// ============================================================================
// BusError
// ============================================================================

/// The wire-facing error shape: name, numeric code, human message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{name} ({code:?}): {message}")]
pub struct BusError {
    pub name: String,
    pub code: ErrorCode,
    pub message: String,
}

impl BusError {
    /// A well-known error with its default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            name: code.error_name().to_string(),
            code,
            message: code.default_message().to_string(),
        }
    }

    /// A well-known error with a specific message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            name: code.error_name().to_string(),
            code,
            message: message.into(),
        }
    }

    /// An application-defined error, propagated verbatim with name+message.
    pub fn app(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: ErrorCode::BusReplyIsErrorMessage,
            message: message.into(),
        }
    }

    /// Rebuild from a wire error message's name and optional message body.
    pub fn from_wire(name: &str, message: Option<String>) -> Self {
        match ErrorCode::from_error_name(name) {
            Some(code) => Self {
                name: name.to_string(),
                code,
                message: message.unwrap_or_else(|| code.default_message().to_string()),
            },
            None => Self {
                name: name.to_string(),
                code: ErrorCode::BusReplyIsErrorMessage,
                message: message.unwrap_or_default(),
            },
        }
    }

    /// Whether this error was raised by an application handler rather than
    /// the bus itself.
    pub fn is_app_error(&self) -> bool {
        self.code == ErrorCode::BusReplyIsErrorMessage
    }
}

impl From<MarshalError> for BusError {
    fn from(e: MarshalError) -> Self {
        let code = match e {
            MarshalError::ArityMismatch { .. } => ErrorCode::BadArgCount,
            _ => ErrorCode::BusBadSignature,
        };
        BusError::with_message(code, e.to_string())
    }
}

impl From<MessageError> for BusError {
    fn from(e: MessageError) -> Self {
        BusError::with_message(ErrorCode::BusBadSignature, e.to_string())
    }
}

impl From<ValidationError> for BusError {
    fn from(e: ValidationError) -> Self {
        BusError::with_message(ErrorCode::Fail, e.to_string())
    }
}

impl From<TransportError> for BusError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected => BusError::new(ErrorCode::BusNotConnected),
            TransportError::UnknownDestination(name) => BusError::with_message(
                ErrorCode::BusNoSuchObject,
                format!("no peer owns the name '{}'", name),
            ),
            TransportError::Timeout => BusError::new(ErrorCode::Timeout),
            other => BusError::with_message(ErrorCode::Fail, other.to_string()),
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_round_trip() {
        for code in [
            ErrorCode::Timeout,
            ErrorCode::BusUnknownInterface,
            ErrorCode::BusObjectNoSuchMember,
            ErrorCode::AuthFail,
            ErrorCode::JoinSessionReplyRejected,
        ] {
            let err = BusError::new(code);
            let back = BusError::from_wire(&err.name, Some(err.message.clone()));
            assert_eq!(back.code, code);
        }
    }

    #[test]
    fn test_app_error_travels_verbatim() {
        let err = BusError::app("com.example.Error.OutOfCheese", "no cheese");
        assert!(err.is_app_error());

        let back = BusError::from_wire(&err.name, Some(err.message.clone()));
        assert_eq!(back.name, "com.example.Error.OutOfCheese");
        assert_eq!(back.message, "no cheese");
        assert!(back.is_app_error());
    }

    #[test]
    fn test_marshal_error_mapping() {
        let err: BusError = MarshalError::ArityMismatch {
            expected: 2,
            found: 1,
        }
        .into();
        assert_eq!(err.code, ErrorCode::BadArgCount);

        let err: BusError = MarshalError::DuplicateDictKey.into();
        assert_eq!(err.code, ErrorCode::BusBadSignature);
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: BusError = TransportError::Disconnected.into();
        assert_eq!(err.code, ErrorCode::BusNotConnected);

        let err: BusError = TransportError::UnknownDestination(":x.1".into()).into();
        assert_eq!(err.code, ErrorCode::BusNoSuchObject);
    }
}
