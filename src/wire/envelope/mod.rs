use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::MessageEnvelope;

pub const PROTOCOL_VERSION: i64 = 1;

pub const SERVER_OK_MESSAGE_TYPE: i64 = 101;
pub const SERVER_ERR_MESSAGE_TYPE: i64 = 102;

pub type PayloadMap = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct WireEnvelope {
    pub version: i64,
    pub message_type: i64,
    pub request_id: String,
    pub payload: PayloadMap,
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidProtocolVersion { expected: i64, actual: i64 },
    IntegerOutOfRange { field: &'static str },
    PayloadMapKeyMustBeUtf8String,
    RequestIdRequired,
    RequestIdMismatch { expected: String, actual: String },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::InvalidProtocolVersion { expected, actual } => {
                write!(f, "invalid protocol version {actual}, expected {expected}")
            }
            Self::IntegerOutOfRange { field } => {
                write!(f, "integer field '{field}' must fit signed int64")
            }
            Self::PayloadMapKeyMustBeUtf8String => {
                write!(f, "payload map keys must be UTF-8 strings")
            }
            Self::RequestIdRequired => write!(f, "request id must be non-empty"),
            Self::RequestIdMismatch { expected, actual } => write!(
                f,
                "server response rid mismatch, expected '{expected}', actual '{actual}'"
            ),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl WireEnvelope {
    pub fn new(message_type: i64, request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn ok(request_id: impl Into<String>, payload: Option<PayloadMap>) -> Self {
        Self::new(
            SERVER_OK_MESSAGE_TYPE,
            request_id,
            payload.unwrap_or_default(),
        )
    }

    pub fn err(request_id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        let message: String = message.into();
        let mut payload = PayloadMap::new();
        payload.insert("code".to_owned(), Value::String(code.into()));
        payload.insert("message".to_owned(), Value::String(message.into()));
        Self::new(SERVER_ERR_MESSAGE_TYPE, request_id, payload)
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        let version = parse_i64(raw.get("v"), "v")?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::InvalidProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        Ok(Self {
            version,
            message_type: parse_i64(raw.get("t"), "t")?,
            request_id: parse_string(raw.get("rid"), "rid")?,
            payload: parse_payload_map(raw.get("p"))?,
        })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let payload = self
            .payload
            .into_iter()
            .map(|(key, value)| (Value::String(key.into()), value))
            .collect::<Vec<_>>();

        let mut raw = MessageEnvelope::new();
        raw.insert("v".to_owned(), Value::Integer(self.version.into()));
        raw.insert("t".to_owned(), Value::Integer(self.message_type.into()));
        raw.insert("rid".to_owned(), Value::String(self.request_id.into()));
        raw.insert("p".to_owned(), Value::Map(payload));
        raw
    }

    pub fn validate_client_to_server(&self) -> Result<(), EnvelopeError> {
        if self.request_id.is_empty() {
            return Err(EnvelopeError::RequestIdRequired);
        }
        Ok(())
    }

    pub fn validate_server_response(&self, expected_request_id: &str) -> Result<(), EnvelopeError> {
        if self.request_id != expected_request_id {
            return Err(EnvelopeError::RequestIdMismatch {
                expected: expected_request_id.to_owned(),
                actual: self.request_id.clone(),
            });
        }
        Ok(())
    }

    pub fn error_code(&self) -> Option<&str> {
        if self.message_type != SERVER_ERR_MESSAGE_TYPE {
            return None;
        }
        self.payload.get("code").and_then(Value::as_str)
    }
}

fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::Integer(integer) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "int",
        });
    };

    integer
        .as_i64()
        .ok_or(EnvelopeError::IntegerOutOfRange { field })
}

fn parse_string(value: Option<&Value>, field: &'static str) -> Result<String, EnvelopeError> {
    value
        .ok_or(EnvelopeError::MissingField { field })?
        .as_str()
        .map(str::to_owned)
        .ok_or(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        })
}

fn parse_payload_map(value: Option<&Value>) -> Result<PayloadMap, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field: "p" })?;
    let Value::Map(entries) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field: "p",
            expected: "map",
        });
    };

    entries
        .iter()
        .map(|(key, value)| {
            key.as_str()
                .map(|key| (key.to_owned(), value.clone()))
                .ok_or(EnvelopeError::PayloadMapKeyMustBeUtf8String)
        })
        .collect()
}
