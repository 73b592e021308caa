//! Typed response wrappers
//!
//! Outcome-carrying responses have CBOR bodies. `AttachmentData` carries one
//! length-prefixed chunk of raw bytes; a zero-length chunk ends the stream.

use crate::{ProtocolError, Result, decode_body, encode_body};
use bytes::{Buf, BufMut};
use proven_channel::Message;
use proven_channel::message::MSG_TYPE;
use proven_common::OperationOutcome;
use serde::{Deserialize, Serialize};

const STREAM_COUNT: &str = "stream_count";

/// Response discriminator carried in the `msg_type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Prepared,
    Failed,
    Completed,
    Cancelled,
    RequestEnd,
    AttachmentData,
    Error,
}

impl ResponseType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepared" => Some(Self::Prepared),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "request_end" => Some(Self::RequestEnd),
            "attachment_data" => Some(Self::AttachmentData),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::RequestEnd => "request_end",
            Self::AttachmentData => "attachment_data",
            Self::Error => "error",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    description: String,
}

/// A typed protocol response
#[derive(Debug, Clone, PartialEq)]
pub enum ManagementResponse {
    /// Execute reached its prepare point; a Complete must follow
    Prepared { result: OperationOutcome },
    /// Execute failed before prepare; no Complete follows
    Failed { result: OperationOutcome },
    /// Terminal answer to Complete
    Completed {
        result: OperationOutcome,
        stream_count: u32,
    },
    /// The operation was cancelled before it prepared
    Cancelled,
    /// Empty acknowledgement
    RequestEnd,
    /// One chunk of an attachment; empty means end of stream
    AttachmentData(Vec<u8>),
    /// Protocol-level failure
    Error { description: String },
}

impl ManagementResponse {
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::Prepared { .. } => ResponseType::Prepared,
            Self::Failed { .. } => ResponseType::Failed,
            Self::Completed { .. } => ResponseType::Completed,
            Self::Cancelled => ResponseType::Cancelled,
            Self::RequestEnd => ResponseType::RequestEnd,
            Self::AttachmentData(_) => ResponseType::AttachmentData,
            Self::Error { .. } => ResponseType::Error,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self::Error {
            description: description.into(),
        }
    }

    /// Convert to a raw Message; routing headers are added by the connection
    pub fn into_message(self) -> Result<Message> {
        let response_type = self.response_type();
        let message = match self {
            Self::Prepared { result } | Self::Failed { result } => {
                Message::with_body(encode_body(&result)?)
            }
            Self::Completed {
                result,
                stream_count,
            } => Message::with_body(encode_body(&result)?)
                .with_header(STREAM_COUNT, stream_count.to_string()),
            Self::Cancelled | Self::RequestEnd => Message::with_body(Vec::new()),
            Self::AttachmentData(chunk) => {
                let mut body = Vec::with_capacity(4 + chunk.len());
                body.put_u32(chunk.len() as u32);
                body.put_slice(&chunk);
                Message::with_body(body)
            }
            Self::Error { description } => {
                Message::with_body(encode_body(&ErrorBody { description })?)
            }
        };
        Ok(message.with_header(MSG_TYPE, response_type.as_str()))
    }

    /// Parse a raw Message into a typed response
    pub fn from_message(msg: &Message) -> Result<Self> {
        let type_str = msg
            .msg_type()
            .ok_or(ProtocolError::MissingHeader(MSG_TYPE))?;
        let response_type = ResponseType::parse(type_str)
            .ok_or_else(|| ProtocolError::UnknownMessageType(type_str.to_string()))?;

        match response_type {
            ResponseType::Prepared => Ok(Self::Prepared {
                result: decode_body(&msg.body)?,
            }),
            ResponseType::Failed => Ok(Self::Failed {
                result: decode_body(&msg.body)?,
            }),
            ResponseType::Completed => {
                let stream_count = match msg.get_header(STREAM_COUNT) {
                    Some(value) => value.parse().map_err(|_| ProtocolError::InvalidHeader {
                        name: STREAM_COUNT,
                        value: value.to_string(),
                    })?,
                    None => 0,
                };
                Ok(Self::Completed {
                    result: decode_body(&msg.body)?,
                    stream_count,
                })
            }
            ResponseType::Cancelled => Ok(Self::Cancelled),
            ResponseType::RequestEnd => Ok(Self::RequestEnd),
            ResponseType::AttachmentData => {
                let mut body = msg.body.as_slice();
                if body.remaining() < 4 {
                    return Err(ProtocolError::Encoding(
                        "attachment chunk without length prefix".to_string(),
                    ));
                }
                let len = body.get_u32() as usize;
                if body.remaining() != len {
                    return Err(ProtocolError::Encoding(format!(
                        "attachment chunk declares {} bytes but carries {}",
                        len,
                        body.remaining()
                    )));
                }
                Ok(Self::AttachmentData(body.to_vec()))
            }
            ResponseType::Error => {
                let body: ErrorBody = decode_body(&msg.body)?;
                Ok(Self::Error {
                    description: body.description,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completed_carries_stream_count() {
        let response = ManagementResponse::Completed {
            result: OperationOutcome::success(json!("done")),
            stream_count: 3,
        };

        let msg = response.clone().into_message().unwrap();
        assert_eq!(msg.get_header("stream_count"), Some("3"));
        assert_eq!(ManagementResponse::from_message(&msg).unwrap(), response);
    }

    #[test]
    fn test_attachment_chunk_is_length_prefixed() {
        let msg = ManagementResponse::AttachmentData(b"abc".to_vec())
            .into_message()
            .unwrap();

        assert_eq!(msg.body, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_empty_chunk_terminates() {
        let msg = ManagementResponse::AttachmentData(Vec::new())
            .into_message()
            .unwrap();

        assert_eq!(msg.body, vec![0, 0, 0, 0]);
        assert_eq!(
            ManagementResponse::from_message(&msg).unwrap(),
            ManagementResponse::AttachmentData(Vec::new())
        );
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        let msg = Message::with_body(vec![0, 0, 0, 5, 1, 2])
            .with_header(MSG_TYPE, "attachment_data");

        assert!(matches!(
            ManagementResponse::from_message(&msg),
            Err(ProtocolError::Encoding(_))
        ));
    }

    #[test]
    fn test_failed_outcome_survives_encoding() {
        let response = ManagementResponse::Failed {
            result: OperationOutcome::failed("resource not found"),
        };

        let msg = response.clone().into_message().unwrap();
        assert_eq!(ManagementResponse::from_message(&msg).unwrap(), response);
    }
}
