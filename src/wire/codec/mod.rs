use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, Read, Write};

use rmpv::{Integer, Value};

pub const MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

pub type MessageEnvelope = BTreeMap<String, Value>;

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    TruncatedFrame { declared: usize, received: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
    NonFiniteFloat,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "frame io error: {source}"),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => write!(f, "frame size {size} is smaller than 4-byte header"),
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::TruncatedFrame { declared, received } => write!(
                f,
                "connection closed after {received} of {declared} frame bytes"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
            Self::NonFiniteFloat => write!(f, "float values must be finite"),
        }
    }
}

impl std::error::Error for CodecError {}

pub fn encode_frame(envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(envelope)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
    let len = payload.len() as u32;
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one frame from a blocking stream. `Ok(None)` means the peer closed
/// the stream cleanly between frames.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<MessageEnvelope>, CodecError> {
    let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
    let header_read = read_full(reader, &mut header)?;
    if header_read == 0 {
        return Ok(None);
    }
    if header_read < FRAME_HEADER_SIZE_BYTES {
        return Err(CodecError::FrameTooShort { size: header_read });
    }

    let declared_len = declared_length(header)?;
    let mut payload = vec![0_u8; declared_len];
    let received = read_full(reader, &mut payload)?;
    if received < declared_len {
        return Err(CodecError::TruncatedFrame {
            declared: declared_len,
            received,
        });
    }

    decode_payload(&payload).map(Some)
}

pub fn write_frame(writer: &mut impl Write, envelope: &MessageEnvelope) -> Result<(), CodecError> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).map_err(CodecError::Io)?;
    writer.flush().map_err(CodecError::Io)
}

fn declared_length(header: [u8; FRAME_HEADER_SIZE_BYTES]) -> Result<usize, CodecError> {
    let declared_len = u32::from_be_bytes(header) as usize;
    if declared_len == 0 {
        return Err(CodecError::ProtocolZeroLength);
    }
    if declared_len > MAX_ENVELOPE_SIZE_BYTES {
        return Err(CodecError::ProtocolLengthTooLarge {
            length: declared_len,
            limit: MAX_ENVELOPE_SIZE_BYTES,
        });
    }
    Ok(declared_len)
}

fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> Result<usize, CodecError> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(CodecError::Io(error)),
        }
    }
    Ok(filled)
}

pub fn encode_payload(envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
    let mut map_pairs = Vec::with_capacity(envelope.len());

    for (key, value) in envelope {
        validate_value(value)?;
        map_pairs.push((Value::String(key.as_str().into()), value.clone()));
    }

    let mut encoded = Vec::new();
    rmpv::encode::write_value(&mut encoded, &Value::Map(map_pairs))
        .map_err(CodecError::MessagePackEncode)?;

    if encoded.len() > MAX_ENVELOPE_SIZE_BYTES {
        return Err(CodecError::PayloadTooLarge {
            size: encoded.len(),
            limit: MAX_ENVELOPE_SIZE_BYTES,
        });
    }

    Ok(encoded)
}

pub fn decode_payload(payload: &[u8]) -> Result<MessageEnvelope, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::ProtocolZeroLength);
    }
    if payload.len() > MAX_ENVELOPE_SIZE_BYTES {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            limit: MAX_ENVELOPE_SIZE_BYTES,
        });
    }

    let mut cursor = Cursor::new(payload);
    let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
    if cursor.position() as usize != payload.len() {
        return Err(CodecError::TrailingDataInPayload);
    }

    parse_envelope(value)
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
        Value::F32(number) if number.is_finite() => Ok(()),
        Value::F64(number) if number.is_finite() => Ok(()),
        Value::F32(_) | Value::F64(_) => Err(CodecError::NonFiniteFloat),
        Value::Array(values) => values.iter().try_for_each(validate_value),
        Value::Map(entries) => entries.iter().try_for_each(|(key, value)| {
            parse_key(key)?;
            validate_value(value)
        }),
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        Ok(())
    } else {
        Err(CodecError::IntegerOutOfRange)
    }
}

/// Converts a decoded wire value into the JSON model sessions work with.
/// Binary values become arrays of byte numbers.
pub fn wire_to_json(value: &Value) -> Result<serde_json::Value, CodecError> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(flag) => Ok(serde_json::Value::Bool(*flag)),
        Value::Integer(number) => number
            .as_i64()
            .map(serde_json::Value::from)
            .ok_or(CodecError::IntegerOutOfRange),
        Value::F32(number) => float_to_json(f64::from(*number)),
        Value::F64(number) => float_to_json(*number),
        Value::String(text) => text
            .as_str()
            .map(serde_json::Value::from)
            .ok_or(CodecError::MapKeyMustBeUtf8String),
        Value::Binary(bytes) => Ok(serde_json::Value::from(bytes.clone())),
        Value::Array(values) => values
            .iter()
            .map(wire_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        Value::Map(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (key, value) in entries {
                map.insert(parse_key(key)?, wire_to_json(value)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn float_to_json(number: f64) -> Result<serde_json::Value, CodecError> {
    serde_json::Number::from_f64(number)
        .map(serde_json::Value::Number)
        .ok_or(CodecError::NonFiniteFloat)
}

pub fn json_to_wire(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(flag) => Value::Boolean(*flag),
        serde_json::Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Value::from(integer)
            } else if let Some(integer) = number.as_u64() {
                Value::from(integer)
            } else {
                Value::F64(number.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(text) => Value::from(text.as_str()),
        serde_json::Value::Array(values) => Value::Array(values.iter().map(json_to_wire).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(key, value)| (Value::from(key.as_str()), json_to_wire(value)))
                .collect(),
        ),
    }
}
