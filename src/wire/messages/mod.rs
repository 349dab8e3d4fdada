use std::fmt;

use rmpv::Value;

use crate::bolt::{RequestMessage, ResponseMessage, ValueMap};
use crate::wire::codec::{json_to_wire, wire_to_json, CodecError, MessageEnvelope};

pub const SIGNATURE_KEY: &str = "s";
pub const FIELDS_KEY: &str = "f";

pub const INIT_SIGNATURE: i64 = 0x01;
pub const ACK_FAILURE_SIGNATURE: i64 = 0x0E;
pub const RESET_SIGNATURE: i64 = 0x0F;
pub const RUN_SIGNATURE: i64 = 0x10;
pub const DISCARD_ALL_SIGNATURE: i64 = 0x2F;
pub const PULL_ALL_SIGNATURE: i64 = 0x3F;
pub const SUCCESS_SIGNATURE: i64 = 0x70;
pub const RECORD_SIGNATURE: i64 = 0x71;
pub const IGNORED_SIGNATURE: i64 = 0x7E;
pub const FAILURE_SIGNATURE: i64 = 0x7F;

#[derive(Debug)]
pub enum MessageError {
    MissingSignature,
    UnknownSignature { signature: i64 },
    FieldCount { signature: i64, expected: usize, actual: usize },
    InvalidField { signature: i64, index: usize, expected: &'static str },
    Value(CodecError),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSignature => write!(f, "message has no integer signature"),
            Self::UnknownSignature { signature } => {
                write!(f, "unknown message signature 0x{signature:02X}")
            }
            Self::FieldCount {
                signature,
                expected,
                actual,
            } => write!(
                f,
                "message 0x{signature:02X} expects {expected} fields, got {actual}"
            ),
            Self::InvalidField {
                signature,
                index,
                expected,
            } => write!(
                f,
                "field {index} of message 0x{signature:02X} must be {expected}"
            ),
            Self::Value(source) => write!(f, "invalid message value: {source}"),
        }
    }
}

impl std::error::Error for MessageError {}

/// Signature and fields of one decoded envelope.
struct Structure<'a> {
    signature: i64,
    fields: &'a [Value],
}

impl<'a> Structure<'a> {
    fn parse(envelope: &'a MessageEnvelope) -> Result<Self, MessageError> {
        let signature = envelope
            .get(SIGNATURE_KEY)
            .and_then(Value::as_i64)
            .ok_or(MessageError::MissingSignature)?;
        let fields = match envelope.get(FIELDS_KEY) {
            None => &[][..],
            Some(Value::Array(fields)) => fields.as_slice(),
            Some(_) => {
                return Err(MessageError::InvalidField {
                    signature,
                    index: 0,
                    expected: "a field list",
                })
            }
        };
        Ok(Self { signature, fields })
    }

    fn expect_fields(&self, expected: usize) -> Result<(), MessageError> {
        if self.fields.len() == expected {
            Ok(())
        } else {
            Err(MessageError::FieldCount {
                signature: self.signature,
                expected,
                actual: self.fields.len(),
            })
        }
    }

    fn string(&self, index: usize) -> Result<String, MessageError> {
        self.fields[index]
            .as_str()
            .map(str::to_owned)
            .ok_or(MessageError::InvalidField {
                signature: self.signature,
                index,
                expected: "a string",
            })
    }

    fn map(&self, index: usize) -> Result<ValueMap, MessageError> {
        match wire_to_json(&self.fields[index]).map_err(MessageError::Value)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(MessageError::InvalidField {
                signature: self.signature,
                index,
                expected: "a map",
            }),
        }
    }
}

fn envelope(signature: i64, fields: Vec<Value>) -> MessageEnvelope {
    let mut envelope = MessageEnvelope::new();
    envelope.insert(SIGNATURE_KEY.to_owned(), Value::from(signature));
    envelope.insert(FIELDS_KEY.to_owned(), Value::Array(fields));
    envelope
}

fn map_to_wire(map: &ValueMap) -> Value {
    Value::Map(
        map.iter()
            .map(|(key, value)| (Value::from(key.as_str()), json_to_wire(value)))
            .collect(),
    )
}

pub fn decode_request(envelope: &MessageEnvelope) -> Result<RequestMessage, MessageError> {
    let structure = Structure::parse(envelope)?;
    match structure.signature {
        INIT_SIGNATURE => {
            structure.expect_fields(2)?;
            Ok(RequestMessage::Init {
                client_name: structure.string(0)?,
                auth_token: structure.map(1)?,
            })
        }
        RUN_SIGNATURE => {
            structure.expect_fields(2)?;
            Ok(RequestMessage::Run {
                statement: structure.string(0)?,
                parameters: structure.map(1)?,
            })
        }
        PULL_ALL_SIGNATURE => structure.expect_fields(0).map(|()| RequestMessage::PullAll),
        DISCARD_ALL_SIGNATURE => structure
            .expect_fields(0)
            .map(|()| RequestMessage::DiscardAll),
        RESET_SIGNATURE => structure.expect_fields(0).map(|()| RequestMessage::Reset),
        ACK_FAILURE_SIGNATURE => structure
            .expect_fields(0)
            .map(|()| RequestMessage::AckFailure),
        signature => Err(MessageError::UnknownSignature { signature }),
    }
}

pub fn encode_response(response: &ResponseMessage) -> MessageEnvelope {
    match response {
        ResponseMessage::Success(metadata) => {
            envelope(SUCCESS_SIGNATURE, vec![map_to_wire(metadata)])
        }
        ResponseMessage::Record(values) => envelope(
            RECORD_SIGNATURE,
            vec![Value::Array(values.iter().map(json_to_wire).collect())],
        ),
        ResponseMessage::Ignored => envelope(IGNORED_SIGNATURE, Vec::new()),
        ResponseMessage::Failure { status, message } => {
            let mut metadata = ValueMap::new();
            metadata.insert("code".to_owned(), status.wire_code().into());
            metadata.insert("message".to_owned(), message.as_str().into());
            envelope(FAILURE_SIGNATURE, vec![map_to_wire(&metadata)])
        }
    }
}
