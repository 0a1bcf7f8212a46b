use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, Read, Write};

use rmpv::{Integer, Value};

use crate::config;

pub const DEFAULT_MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const HARD_MAX_ENVELOPE_SIZE_BYTES: usize = 64 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

pub type MessageEnvelope = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: DEFAULT_MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidEnvelopeLimit { limit: usize },
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    TruncatedFrame { expected: usize, received: usize },
    Io(io::Error),
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    FloatNotAllowed,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvelopeLimit { limit } => write!(
                f,
                "max envelope size must be between 1 and {HARD_MAX_ENVELOPE_SIZE_BYTES} bytes, got {limit}"
            ),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => write!(f, "protocol error: frame length cannot be zero"),
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::TruncatedFrame { expected, received } => write!(
                f,
                "connection closed mid-frame after {received} of {expected} bytes"
            ),
            Self::Io(source) => write!(f, "frame transport error: {source}"),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::FloatNotAllowed => write!(f, "floats are not allowed in message envelope"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
        }
    }
}

impl std::error::Error for CodecError {}

// Outcome of waiting for the next frame on a blocking stream.
#[derive(Debug)]
pub enum FrameRead {
    Envelope(MessageEnvelope),
    Closed,
    TimedOut,
}

#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    max_envelope_size_bytes: usize,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            max_envelope_size_bytes: config.max_envelope_size_bytes,
        }
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, CodecError> {
        let limit = app_config.wire.max_envelope_size_bytes;
        if limit == 0 || limit > HARD_MAX_ENVELOPE_SIZE_BYTES {
            return Err(CodecError::InvalidEnvelopeLimit { limit });
        }

        Ok(Self::new(CodecConfig {
            max_envelope_size_bytes: limit,
        }))
    }

    pub fn max_envelope_size_bytes(&self) -> usize {
        self.max_envelope_size_bytes
    }

    pub fn encode_frame(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(envelope)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared_len = self.declared_length([frame[0], frame[1], frame[2], frame[3]])?;
        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    pub fn encode_payload(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let mut map_pairs = Vec::with_capacity(envelope.len());
        for (key, value) in envelope {
            validate_value(value)?;
            map_pairs.push((Value::String(key.as_str().into()), value.clone()));
        }

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &Value::Map(map_pairs))
            .map_err(CodecError::MessagePackEncode)?;

        if encoded.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        let mut cursor = Cursor::new(payload);
        let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        parse_envelope(value)
    }

    /// Waits for one complete frame on `reader`.
    ///
    /// A clean EOF or a read timeout before the first header byte are reported
    /// as [`FrameRead::Closed`] and [`FrameRead::TimedOut`]; once a frame has
    /// started, any interruption is an error.
    pub fn read_envelope<R: Read>(&self, reader: &mut R) -> Result<FrameRead, CodecError> {
        let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE_BYTES {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(FrameRead::Closed),
                Ok(0) => {
                    return Err(CodecError::TruncatedFrame {
                        expected: FRAME_HEADER_SIZE_BYTES,
                        received: filled,
                    })
                }
                Ok(read) => filled += read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if filled == 0 && is_timeout(&error) => {
                    return Ok(FrameRead::TimedOut)
                }
                Err(error) => return Err(CodecError::Io(error)),
            }
        }

        let declared_len = self.declared_length(header)?;
        let mut payload = vec![0_u8; declared_len];
        reader.read_exact(&mut payload).map_err(|error| {
            if error.kind() == io::ErrorKind::UnexpectedEof {
                CodecError::TruncatedFrame {
                    expected: declared_len,
                    received: 0,
                }
            } else {
                CodecError::Io(error)
            }
        })?;

        self.decode_payload(&payload).map(FrameRead::Envelope)
    }

    pub fn write_envelope<W: Write>(
        &self,
        writer: &mut W,
        envelope: &MessageEnvelope,
    ) -> Result<(), CodecError> {
        let frame = self.encode_frame(envelope)?;
        writer.write_all(&frame).map_err(CodecError::Io)?;
        writer.flush().map_err(CodecError::Io)
    }

    fn declared_length(&self, header: [u8; FRAME_HEADER_SIZE_BYTES]) -> Result<usize, CodecError> {
        let declared_len = u32::from_be_bytes(header) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.max_envelope_size_bytes,
            });
        }
        Ok(declared_len)
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

pub fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn parse_envelope(value: Value) -> Result<MessageEnvelope, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::EnvelopeMustBeMap);
    };

    let mut envelope = MessageEnvelope::new();
    for (key, value) in entries {
        let key = parse_key(&key)?;
        validate_value(&value)?;
        envelope.insert(key, value);
    }

    Ok(envelope)
}

fn parse_key(key: &Value) -> Result<String, CodecError> {
    key.as_str()
        .map(str::to_owned)
        .ok_or(CodecError::MapKeyMustBeUtf8String)
}

fn validate_value(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Nil | Value::Boolean(_) | Value::String(_) | Value::Binary(_) => Ok(()),
        Value::Integer(number) => validate_integer(number),
        Value::Array(values) => values.iter().try_for_each(validate_value),
        Value::Map(entries) => entries.iter().try_for_each(|(key, value)| {
            parse_key(key)?;
            validate_value(value)
        }),
        Value::F32(_) | Value::F64(_) => Err(CodecError::FloatNotAllowed),
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        return Ok(());
    }

    match number.as_u64() {
        Some(value) if value <= i64::MAX as u64 => Ok(()),
        _ => Err(CodecError::IntegerOutOfRange),
    }
}
