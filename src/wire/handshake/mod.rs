use std::fmt;

use rmpv::Value;

use crate::wire::codec::MessageEnvelope;
use crate::wire::envelope::{EnvelopeError, PayloadMap, WireEnvelope, PROTOCOL_VERSION};

pub const HELLO_MESSAGE_TYPE: i64 = 1;
pub const HI_MESSAGE_TYPE: i64 = 103;
pub const AGENT_INIT_ERROR_CODE: &str = "AGENT_INIT_ERROR";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHello {
    pub request_id: String,
    pub user: Option<String>,
    pub client: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum HandshakeError {
    Envelope(EnvelopeError),
    UnexpectedMessageType {
        request_id: String,
        message_type: i64,
    },
    InvalidField {
        request_id: String,
        field: &'static str,
    },
}

impl HandshakeError {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Envelope(_) => None,
            Self::UnexpectedMessageType { request_id, .. }
            | Self::InvalidField { request_id, .. } => Some(request_id),
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(source) => write!(f, "handshake envelope error: {source}"),
            Self::UnexpectedMessageType { message_type, .. } => write!(
                f,
                "HELLO must be the first message on a new connection, got t={message_type}"
            ),
            Self::InvalidField { field, .. } => {
                write!(f, "HELLO field '{field}' must be a string")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

pub fn accept_hello(raw: &MessageEnvelope) -> Result<ClientHello, HandshakeError> {
    let envelope = WireEnvelope::from_raw(raw).map_err(HandshakeError::Envelope)?;
    envelope
        .validate_client_to_server()
        .map_err(HandshakeError::Envelope)?;

    if envelope.message_type != HELLO_MESSAGE_TYPE {
        return Err(HandshakeError::UnexpectedMessageType {
            request_id: envelope.request_id,
            message_type: envelope.message_type,
        });
    }

    let user = optional_string(&envelope, "user")?;
    let client = optional_string(&envelope, "client")?;
    Ok(ClientHello {
        request_id: envelope.request_id,
        user,
        client,
    })
}

pub fn hi_response(hello: &ClientHello) -> WireEnvelope {
    let mut payload = PayloadMap::new();
    payload.insert(
        "server".to_owned(),
        Value::String(env!("CARGO_PKG_NAME").into()),
    );
    payload.insert(
        "version".to_owned(),
        Value::String(env!("CARGO_PKG_VERSION").into()),
    );
    payload.insert("proto".to_owned(), Value::from(PROTOCOL_VERSION));
    WireEnvelope::new(HI_MESSAGE_TYPE, hello.request_id.clone(), payload)
}

fn optional_string(
    envelope: &WireEnvelope,
    field: &'static str,
) -> Result<Option<String>, HandshakeError> {
    match envelope.payload.get(field) {
        None | Some(Value::Nil) => Ok(None),
        Some(value) => value
            .as_str()
            .map(|text| Some(text.to_owned()))
            .ok_or_else(|| HandshakeError::InvalidField {
                request_id: envelope.request_id.clone(),
                field,
            }),
    }
}

#[cfg(test)]
mod tests {
    use rmpv::Value;

    use crate::wire::envelope::{EnvelopeError, PayloadMap, WireEnvelope, PROTOCOL_VERSION};

    use super::{accept_hello, hi_response, HandshakeError, HELLO_MESSAGE_TYPE, HI_MESSAGE_TYPE};

    fn hello(payload: PayloadMap) -> crate::wire::codec::MessageEnvelope {
        WireEnvelope::new(HELLO_MESSAGE_TYPE, "rid-1", payload).into_raw()
    }

    #[test]
    fn hello_is_answered_with_server_identity() {
        let mut payload = PayloadMap::new();
        payload.insert("user".to_owned(), Value::String("rods".into()));
        payload.insert("client".to_owned(), Value::String("imsg".into()));

        let accepted = accept_hello(&hello(payload)).expect("hello should be accepted");
        assert_eq!(accepted.user.as_deref(), Some("rods"));
        assert_eq!(accepted.client.as_deref(), Some("imsg"));

        let response = hi_response(&accepted);
        assert_eq!(response.message_type, HI_MESSAGE_TYPE);
        assert_eq!(response.request_id, "rid-1");
        assert_eq!(
            response.payload.get("server"),
            Some(&Value::String(env!("CARGO_PKG_NAME").into()))
        );
        assert_eq!(
            response.payload.get("proto"),
            Some(&Value::from(PROTOCOL_VERSION))
        );
    }

    #[test]
    fn anonymous_hello_is_accepted() {
        let accepted = accept_hello(&hello(PayloadMap::new())).expect("hello should be accepted");
        assert_eq!(accepted.user, None);
        assert_eq!(accepted.client, None);
    }

    #[test]
    fn non_hello_first_message_is_rejected_with_its_rid() {
        let raw = WireEnvelope::new(5, "rid-ping", PayloadMap::new()).into_raw();
        let err = accept_hello(&raw).expect_err("ping before hello should fail");

        assert_eq!(err.request_id(), Some("rid-ping"));
        assert!(matches!(
            err,
            HandshakeError::UnexpectedMessageType { message_type: 5, .. }
        ));
    }

    #[test]
    fn rejects_non_string_identity_and_empty_rid() {
        let mut payload = PayloadMap::new();
        payload.insert("user".to_owned(), Value::from(7));
        assert!(matches!(
            accept_hello(&hello(payload)),
            Err(HandshakeError::InvalidField { field: "user", .. })
        ));

        let raw = WireEnvelope::new(HELLO_MESSAGE_TYPE, "", PayloadMap::new()).into_raw();
        assert_eq!(
            accept_hello(&raw),
            Err(HandshakeError::Envelope(EnvelopeError::RequestIdRequired))
        );
    }
}
