use chrono::{DateTime, Duration, Utc};
use rmpv::Value;

use crate::broker::{seconds, TicketFlags, TicketId, ANY_MESSAGE_NUMBER};
use crate::wire::codec::MessageEnvelope;
use crate::wire::envelope::WireEnvelope;
use crate::wire::handshake::HELLO_MESSAGE_TYPE;

use super::{
    SessionError, GETTICKET_MESSAGE_TYPE, PING_MESSAGE_TYPE, RECEIVE_MESSAGE_TYPE,
    REGISTER_MESSAGE_TYPE, SEND_MESSAGE_TYPE, STATUS_MESSAGE_TYPE,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    Send {
        request_id: String,
        receive_id: TicketId,
        send_id: TicketId,
        message_type: String,
        sender: Option<String>,
        payload: Vec<u8>,
        message_number: u32,
        receivers: i32,
        deliveries: i32,
    },
    Receive {
        request_id: String,
        receive_id: TicketId,
        message_number: u32,
    },
    Register {
        request_id: String,
        receive_id: TicketId,
        send_id: TicketId,
        expire_time: Option<DateTime<Utc>>,
        flags: TicketFlags,
    },
    GetTicket {
        request_id: String,
        ttl: Option<Duration>,
        flags: TicketFlags,
    },
    Ping {
        request_id: String,
    },
    Status {
        request_id: String,
    },
}

impl ClientCommand {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Send { request_id, .. }
            | Self::Receive { request_id, .. }
            | Self::Register { request_id, .. }
            | Self::GetTicket { request_id, .. }
            | Self::Ping { request_id }
            | Self::Status { request_id } => request_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "SEND",
            Self::Receive { .. } => "RECEIVE",
            Self::Register { .. } => "REGISTER",
            Self::GetTicket { .. } => "GETTICKET",
            Self::Ping { .. } => "PING",
            Self::Status { .. } => "STATUS",
        }
    }
}

// Decodes one post-handshake client frame into a command.
pub fn evaluate_client_frame(raw: &MessageEnvelope) -> Result<ClientCommand, SessionError> {
    let envelope = WireEnvelope::from_raw(raw)?;
    envelope.validate_client_to_server()?;
    let fields = PayloadFields::new(&envelope);

    match envelope.message_type {
        SEND_MESSAGE_TYPE => Ok(ClientCommand::Send {
            receive_id: fields.required_u32("rcv")?,
            send_id: fields.required_u32("snd")?,
            message_type: fields.required_string("mt")?,
            sender: fields.optional_string("from")?,
            payload: fields.required_body("msg")?,
            message_number: fields.optional_u32("num")?.unwrap_or(ANY_MESSAGE_NUMBER),
            receivers: fields.optional_i32("nrcv", 1)?.unwrap_or(1),
            deliveries: fields.optional_i32("ndeli", 0)?.unwrap_or(0),
            request_id: envelope.request_id.clone(),
        }),
        RECEIVE_MESSAGE_TYPE => Ok(ClientCommand::Receive {
            receive_id: fields.required_u32("rcv")?,
            message_number: fields.optional_u32("num")?.unwrap_or(ANY_MESSAGE_NUMBER),
            request_id: envelope.request_id.clone(),
        }),
        REGISTER_MESSAGE_TYPE => Ok(ClientCommand::Register {
            receive_id: fields.required_u32("rcv")?,
            send_id: fields.required_u32("snd")?,
            expire_time: fields.optional_timestamp("exp")?,
            flags: TicketFlags::from_bits(fields.optional_u32("flags")?.unwrap_or(0)),
            request_id: envelope.request_id.clone(),
        }),
        GETTICKET_MESSAGE_TYPE => Ok(ClientCommand::GetTicket {
            ttl: fields.optional_u32("ttl")?.map(u64::from).map(seconds),
            flags: TicketFlags::from_bits(fields.optional_u32("flags")?.unwrap_or(0)),
            request_id: envelope.request_id.clone(),
        }),
        PING_MESSAGE_TYPE => {
            fields.require_empty("PING")?;
            Ok(ClientCommand::Ping {
                request_id: envelope.request_id.clone(),
            })
        }
        STATUS_MESSAGE_TYPE => {
            fields.require_empty("STATUS")?;
            Ok(ClientCommand::Status {
                request_id: envelope.request_id.clone(),
            })
        }
        HELLO_MESSAGE_TYPE => Err(SessionError::violation(
            &envelope.request_id,
            "HELLO is only allowed once, as the first message",
        )),
        other => Err(SessionError::violation(
            &envelope.request_id,
            format!(
                "unsupported message type {other}; expected SEND, RECEIVE, REGISTER, PING, STATUS, or GETTICKET"
            ),
        )),
    }
}

struct PayloadFields<'a> {
    envelope: &'a WireEnvelope,
}

impl<'a> PayloadFields<'a> {
    fn new(envelope: &'a WireEnvelope) -> Self {
        Self { envelope }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        match self.envelope.payload.get(key) {
            None | Some(Value::Nil) => None,
            Some(value) => Some(value),
        }
    }

    fn violation(&self, message: String) -> SessionError {
        SessionError::violation(&self.envelope.request_id, message)
    }

    fn require_empty(&self, command: &str) -> Result<(), SessionError> {
        if self.envelope.payload.is_empty() {
            return Ok(());
        }
        Err(self.violation(format!("{command} payload must be an empty map")))
    }

    fn optional_integer(&self, key: &str, min: i64, max: i64) -> Result<Option<i64>, SessionError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.as_i64() {
            Some(raw) if (min..=max).contains(&raw) => Ok(Some(raw)),
            _ => Err(self.violation(format!(
                "payload key '{key}' must be an integer in range {min}..={max}"
            ))),
        }
    }

    fn optional_u32(&self, key: &str) -> Result<Option<u32>, SessionError> {
        Ok(self
            .optional_integer(key, 0, i64::from(u32::MAX))?
            .map(|raw| raw as u32))
    }

    fn required_u32(&self, key: &str) -> Result<u32, SessionError> {
        self.optional_u32(key)?
            .ok_or_else(|| self.violation(format!("payload must contain integer key '{key}'")))
    }

    fn optional_i32(&self, key: &str, min: i32) -> Result<Option<i32>, SessionError> {
        Ok(self
            .optional_integer(key, i64::from(min), i64::from(i32::MAX))?
            .map(|raw| raw as i32))
    }

    fn optional_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, SessionError> {
        let Some(raw) = self.optional_integer(key, 0, i64::MAX)? else {
            return Ok(None);
        };
        DateTime::<Utc>::from_timestamp(raw, 0)
            .map(Some)
            .ok_or_else(|| self.violation(format!("payload key '{key}' is not a valid unix time")))
    }

    fn optional_string(&self, key: &str) -> Result<Option<String>, SessionError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .as_str()
            .map(|text| Some(text.to_owned()))
            .ok_or_else(|| self.violation(format!("payload key '{key}' must be a string")))
    }

    fn required_string(&self, key: &str) -> Result<String, SessionError> {
        self.optional_string(key)?
            .ok_or_else(|| self.violation(format!("payload must contain string key '{key}'")))
    }

    // Message bodies travel as bin; str is accepted for text clients.
    fn required_body(&self, key: &str) -> Result<Vec<u8>, SessionError> {
        match self.get(key) {
            Some(Value::Binary(bytes)) => Ok(bytes.clone()),
            Some(Value::String(text)) => Ok(text.as_bytes().to_vec()),
            Some(_) => Err(self.violation(format!(
                "payload key '{key}' must be binary or string"
            ))),
            None => Err(self.violation(format!("payload must contain key '{key}'"))),
        }
    }
}
