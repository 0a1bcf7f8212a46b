pub mod commands;
pub mod runtime;

use std::fmt;

use chrono::{DateTime, Utc};
use rmpv::Value;

use crate::broker::{BrokerError, DeliveredMessage, Ticket};
use crate::wire::codec::CodecError;
use crate::wire::envelope::{EnvelopeError, PayloadMap, WireEnvelope};
use crate::wire::handshake::HandshakeError;

pub use commands::{evaluate_client_frame, ClientCommand};

pub const SEND_MESSAGE_TYPE: i64 = 2;
pub const RECEIVE_MESSAGE_TYPE: i64 = 3;
pub const REGISTER_MESSAGE_TYPE: i64 = 4;
pub const PING_MESSAGE_TYPE: i64 = 5;
pub const STATUS_MESSAGE_TYPE: i64 = 6;
pub const GETTICKET_MESSAGE_TYPE: i64 = 7;
pub const PONG_MESSAGE_TYPE: i64 = 105;

pub const PROTOCOL_VIOLATION_CODE: &str = "PROTOCOL_VIOLATION";
pub const UNMATCHED_TICKET_CODE: &str = "UNMATCHED_TICKET";
pub const NO_MESSAGE_CODE: &str = "NO_MESSAGE";
pub const DUPLICATE_TICKET_CODE: &str = "DUPLICATE_TICKET";
pub const INVALID_TICKET_CODE: &str = "INVALID_TICKET";
pub const SERVER_BUSY_CODE: &str = "SERVER_BUSY";
pub const INTERNAL_ERROR_CODE: &str = "INTERNAL_ERROR";

#[derive(Debug)]
pub enum SessionError {
    Codec(CodecError),
    Envelope(EnvelopeError),
    Handshake(HandshakeError),
    ProtocolViolation {
        request_id: Option<String>,
        message: String,
    },
}

impl SessionError {
    pub fn violation(request_id: &str, message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            request_id: Some(request_id.to_owned()),
            message: message.into(),
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::ProtocolViolation { request_id, .. } => request_id.as_deref(),
            Self::Handshake(source) => source.request_id(),
            Self::Codec(_) | Self::Envelope(_) => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "session codec error: {source}"),
            Self::Envelope(source) => write!(f, "session envelope error: {source}"),
            Self::Handshake(source) => write!(f, "session handshake error: {source}"),
            Self::ProtocolViolation {
                request_id,
                message,
            } => write!(
                f,
                "session protocol violation (rid={:?}): {}",
                request_id, message
            ),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CodecError> for SessionError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl From<EnvelopeError> for SessionError {
    fn from(value: EnvelopeError) -> Self {
        Self::Envelope(value)
    }
}

impl From<HandshakeError> for SessionError {
    fn from(value: HandshakeError) -> Self {
        Self::Handshake(value)
    }
}

pub fn broker_error_code(error: &BrokerError) -> &'static str {
    match error {
        BrokerError::TicketNotFound { .. } | BrokerError::UnmatchedTicket { .. } => {
            UNMATCHED_TICKET_CODE
        }
        BrokerError::NoMessage { .. } => NO_MESSAGE_CODE,
        BrokerError::DuplicateTicket { .. } => DUPLICATE_TICKET_CODE,
        BrokerError::ReservedTicket { .. }
        | BrokerError::InvalidTicket { .. }
        | BrokerError::ChannelNotEmpty { .. } => INVALID_TICKET_CODE,
        BrokerError::TicketSpaceExhausted { .. } => INTERNAL_ERROR_CODE,
    }
}

pub fn broker_error_response(request_id: &str, error: &BrokerError) -> WireEnvelope {
    WireEnvelope::err(request_id, broker_error_code(error), error.to_string())
}

pub fn pong_response(request_id: &str, now: DateTime<Utc>) -> WireEnvelope {
    let mut payload = PayloadMap::new();
    payload.insert(
        "server_time".to_owned(),
        Value::String(now.to_rfc3339().into()),
    );
    WireEnvelope::new(PONG_MESSAGE_TYPE, request_id, payload)
}

pub fn sequence_payload(sequence_number: u64) -> PayloadMap {
    let mut payload = PayloadMap::new();
    payload.insert("seq".to_owned(), Value::from(sequence_number));
    payload
}

pub fn ticket_payload(ticket: &Ticket) -> PayloadMap {
    let mut payload = PayloadMap::new();
    payload.insert("rcv".to_owned(), Value::from(ticket.receive_id));
    payload.insert("snd".to_owned(), Value::from(ticket.send_id));
    payload.insert(
        "exp".to_owned(),
        Value::from(ticket.expire_time.timestamp()),
    );
    payload.insert("flags".to_owned(), Value::from(ticket.flags.bits()));
    payload
}

pub fn delivered_payload(message: &DeliveredMessage) -> PayloadMap {
    let mut payload = PayloadMap::new();
    payload.insert("msg".to_owned(), Value::Binary(message.payload.clone()));
    payload.insert(
        "mt".to_owned(),
        Value::String(message.message_type.as_str().into()),
    );
    payload.insert(
        "from".to_owned(),
        Value::String(message.sender.as_str().into()),
    );
    payload.insert("seq".to_owned(), Value::from(message.sequence_number));
    payload.insert("num".to_owned(), Value::from(message.message_number));
    payload
}
