// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The wire protocol spoken between peers and the server.
//!
//! Every frame is the ASCII decimal byte length of the payload, one space,
//! and then exactly that many payload bytes. The payload is a JSON object
//! carrying an integer `type` tag, the author's `src_id`, an optional `reply`
//! flag, and the fields of the message kind. Frames arrive back to back on a
//! TCP stream, so one read may contain half a message or several; the
//! [`MessageCodec`] buffers accordingly.

use crate::ot::TextOperation;
use bytes::{Buf, BytesMut};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Message kind tags as they appear on the wire.
const MSG_CONNECT: i64 = 1;
const MSG_OPERATION: i64 = 2;
const MSG_REMOVE: i64 = 4;
const MSG_GET_ALL: i64 = 7;
const MSG_SET_ALL: i64 = 8;
const MSG_RESPONSE: i64 = 10;
const MSG_KILL: i64 = 11;
const MSG_CONNECT_ACK: i64 = 12;
const MSG_REQUEST_ACK: i64 = 13;
const MSG_RESET: i64 = 16;
const MSG_LOGIN: i64 = 17;

/// `src_id` used for messages that originate from the server itself.
pub const SERVER_ID: i64 = -1;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame does not start with a decimal payload length")]
    InvalidHeader,
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("unknown message type {0}")]
    UnknownType(i64),
    #[error("message field {0:?} is missing or malformed")]
    InvalidField(&'static str),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Full session state as shipped in `SetAll` and `Reset` messages: the
/// document, the run-length encoded authorship ranges, and every peer's
/// cursor location.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub document: String,
    pub ranges: Vec<(i64, usize)>,
    pub locs: BTreeMap<i64, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Connect {
        name: String,
        hostname: String,
        port: u16,
    },
    ConnectAck,
    RequestAck,
    Operation {
        revision: usize,
        operation: TextOperation,
    },
    GetAll,
    SetAll(Snapshot),
    Reset(Snapshot),
    Remove {
        client_id: i64,
    },
    Response {
        text: String,
    },
    Kill {
        text: String,
    },
    Login {
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub src_id: i64,
    /// When set, the message is echoed back to its author on broadcast.
    pub reply: bool,
    pub body: Body,
}

impl Message {
    #[must_use]
    pub fn new(src_id: i64, body: Body) -> Self {
        Self {
            src_id,
            reply: false,
            body,
        }
    }

    #[must_use]
    pub fn server(body: Body) -> Self {
        Self::new(SERVER_ID, body)
    }

    fn type_tag(&self) -> i64 {
        match &self.body {
            Body::Connect { .. } => MSG_CONNECT,
            Body::Operation { .. } => MSG_OPERATION,
            Body::Remove { .. } => MSG_REMOVE,
            Body::GetAll => MSG_GET_ALL,
            Body::SetAll(_) => MSG_SET_ALL,
            Body::Response { .. } => MSG_RESPONSE,
            Body::Kill { .. } => MSG_KILL,
            Body::ConnectAck => MSG_CONNECT_ACK,
            Body::RequestAck => MSG_REQUEST_ACK,
            Body::Reset(_) => MSG_RESET,
            Body::Login { .. } => MSG_LOGIN,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), json!(self.type_tag()));
        map.insert("src_id".to_string(), json!(self.src_id));
        if self.reply {
            map.insert("reply".to_string(), json!(1));
        }
        match &self.body {
            Body::Connect {
                name,
                hostname,
                port,
            } => {
                map.insert("name".to_string(), json!(name));
                map.insert("hostname".to_string(), json!(hostname));
                map.insert("port".to_string(), json!(port));
            }
            Body::Operation {
                revision,
                operation,
            } => {
                map.insert("revision".to_string(), json!(revision));
                map.insert(
                    "operation".to_string(),
                    serde_json::to_value(operation)
                        .expect("Failed to convert operation to a JSON value"),
                );
            }
            Body::SetAll(snapshot) | Body::Reset(snapshot) => {
                map.insert("document".to_string(), json!(snapshot.document));
                map.insert("ranges".to_string(), json!(snapshot.ranges));
                map.insert(
                    "locs".to_string(),
                    serde_json::to_value(&snapshot.locs)
                        .expect("Failed to convert cursor locations to a JSON value"),
                );
            }
            Body::Remove { client_id } => {
                map.insert("client_id".to_string(), json!(client_id));
            }
            Body::Response { text } | Body::Kill { text } => {
                map.insert("string".to_string(), json!(text));
            }
            Body::Login { password } => {
                map.insert("password".to_string(), json!(password));
            }
            Body::ConnectAck | Body::RequestAck | Body::GetAll => {}
        }
        Value::Object(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let map = value
            .as_object()
            .ok_or(DecodeError::InvalidField("payload"))?;
        let tag = int_field(map, "type")?;
        let src_id = int_field(map, "src_id")?;
        let reply = map.get("reply").and_then(Value::as_i64).unwrap_or(0) == 1;

        let body = match tag {
            MSG_CONNECT => Body::Connect {
                name: str_field(map, "name")?,
                hostname: str_field(map, "hostname")?,
                port: u16::try_from(int_field(map, "port")?)
                    .map_err(|_| DecodeError::InvalidField("port"))?,
            },
            MSG_OPERATION => Body::Operation {
                revision: usize::try_from(int_field(map, "revision")?)
                    .map_err(|_| DecodeError::InvalidField("revision"))?,
                operation: typed_field(map, "operation")?,
            },
            MSG_REMOVE => Body::Remove {
                client_id: int_field(map, "client_id")?,
            },
            MSG_GET_ALL => Body::GetAll,
            MSG_SET_ALL => Body::SetAll(snapshot_fields(map)?),
            MSG_RESET => Body::Reset(snapshot_fields(map)?),
            MSG_RESPONSE => Body::Response {
                text: str_field(map, "string")?,
            },
            MSG_KILL => Body::Kill {
                text: str_field(map, "string")?,
            },
            MSG_CONNECT_ACK => Body::ConnectAck,
            MSG_REQUEST_ACK => Body::RequestAck,
            MSG_LOGIN => Body::Login {
                password: str_field(map, "password")?,
            },
            other => return Err(DecodeError::UnknownType(other)),
        };

        Ok(Self {
            src_id,
            reply,
            body,
        })
    }
}

fn int_field(map: &Map<String, Value>, key: &'static str) -> Result<i64, DecodeError> {
    map.get(key)
        .and_then(Value::as_i64)
        .ok_or(DecodeError::InvalidField(key))
}

fn str_field(map: &Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(DecodeError::InvalidField(key))
}

fn typed_field<T: serde::de::DeserializeOwned>(
    map: &Map<String, Value>,
    key: &'static str,
) -> Result<T, DecodeError> {
    let value = map.get(key).ok_or(DecodeError::InvalidField(key))?;
    serde_json::from_value(value.clone()).map_err(|_| DecodeError::InvalidField(key))
}

fn snapshot_fields(map: &Map<String, Value>) -> Result<Snapshot, DecodeError> {
    Ok(Snapshot {
        document: str_field(map, "document")?,
        ranges: typed_field(map, "ranges")?,
        locs: typed_field(map, "locs")?,
    })
}

/// A length will never take more digits than this; anything longer means the
/// peer is not speaking our protocol.
const MAX_HEADER_DIGITS: usize = 10;

#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        let Some(space) = src
            .iter()
            .take(MAX_HEADER_DIGITS + 1)
            .position(|byte| *byte == b' ')
        else {
            if src.len() > MAX_HEADER_DIGITS {
                return Err(DecodeError::InvalidHeader);
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&src[..space])?;
        let length: usize = header.parse().map_err(|_| DecodeError::InvalidHeader)?;

        let frame_end = space + 1 + length;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(space + 1);
        let payload = src.split_to(length);
        let value: Value = serde_json::from_str(std::str::from_utf8(&payload)?)?;
        Message::from_value(&value).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = DecodeError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), DecodeError> {
        let payload = message.to_value().to_string();
        let frame = format!("{} {payload}", payload.len());
        dst.extend_from_slice(frame.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::factories::insert;
    use pretty_assertions::assert_eq;

    fn encode(message: &Message) -> BytesMut {
        let mut buffer = BytesMut::new();
        MessageCodec
            .encode(message.clone(), &mut buffer)
            .expect("encoding failed");
        buffer
    }

    fn operation_message() -> Message {
        Message::new(
            3,
            Body::Operation {
                revision: 7,
                operation: insert(2, "hey"),
            },
        )
    }

    #[test]
    fn frame_starts_with_payload_byte_length() {
        let buffer = encode(&Message::server(Body::RequestAck));
        let text = std::str::from_utf8(&buffer).unwrap();
        let (header, payload) = text.split_once(' ').unwrap();
        assert_eq!(header.parse::<usize>().unwrap(), payload.len());
        assert_eq!(payload, r#"{"src_id":-1,"type":13}"#);
    }

    #[test]
    fn operation_round_trip() {
        let message = operation_message();
        let mut buffer = encode(&message);
        let decoded = MessageCodec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buffer.is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let message = Message::server(Body::Reset(Snapshot {
            document: "hällo".to_string(),
            ranges: vec![(0, 3), (1, 2)],
            locs: [(0, 3), (1, 5)].into(),
        }));
        let mut buffer = encode(&message);
        let decoded = MessageCodec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn reply_flag_defaults_to_off() {
        let value: Value =
            serde_json::from_str(r#"{"type":12,"src_id":2}"#).unwrap();
        let message = Message::from_value(&value).unwrap();
        assert!(!message.reply);

        let value: Value =
            serde_json::from_str(r#"{"type":12,"src_id":2,"reply":1}"#).unwrap();
        assert!(Message::from_value(&value).unwrap().reply);
    }

    #[test]
    fn partial_frames_are_buffered() {
        let mut codec = MessageCodec;
        let full = encode(&operation_message());

        // Feed byte by byte; only the last byte completes the message.
        let mut incremental = BytesMut::new();
        for (index, byte) in full.iter().enumerate() {
            incremental.extend_from_slice(&[*byte]);
            let result = codec.decode(&mut incremental).unwrap();
            if index + 1 < full.len() {
                assert_eq!(result, None);
            } else {
                assert_eq!(result, Some(operation_message()));
            }
        }
    }

    #[test]
    fn one_chunk_can_hold_several_messages() {
        let mut buffer = encode(&Message::new(1, Body::ConnectAck));
        buffer.extend_from_slice(&encode(&Message::new(2, Body::GetAll)));

        let mut codec = MessageCodec;
        let first = codec.decode(&mut buffer).unwrap().unwrap();
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.src_id, 1);
        assert_eq!(second, Message::new(2, Body::GetAll));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn garbage_header_is_an_error() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::from(&b"not a frame at all"[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(DecodeError::InvalidHeader)
        ));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::from(&br#"22 {"type":99,"src_id":0}"#[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(DecodeError::UnknownType(99))
        ));
    }

    #[test]
    fn missing_fields_are_an_error() {
        let value: Value = serde_json::from_str(r#"{"type":1,"src_id":0}"#).unwrap();
        assert!(matches!(
            Message::from_value(&value),
            Err(DecodeError::InvalidField("name"))
        ));
    }
}
