//! Wire protocol for the push and pull channels
//!
//! Push channel messages travel over a stream as `kind (1 byte) | length
//! (u32, big endian) | body`. Text messages carry JSON: inbound image requests
//! and outbound notifications. Binary messages carry response frames, whose
//! body is `request_id (i32, little endian) | payload`. An empty payload means
//! the image is unavailable.

use crate::error::{PipelineError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

const KIND_TEXT: u8 = 1;
const KIND_BINARY: u8 = 2;
const HEADER_LEN: usize = 5;

/// Inbound messages are small JSON requests
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// A request for one file at one size.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    /// Unique only within one push connection
    pub request_id: i32,
    pub file_id: String,
    /// 0 = original resolution, otherwise the long-edge target
    pub size: u32,
    /// Higher is served first
    pub priority: f64,
}

#[derive(Deserialize)]
struct PushRequestWire {
    #[serde(rename = "requestid")]
    request_id: i32,
    #[serde(rename = "fileid")]
    file_id: String,
    size: u32,
    #[serde(default)]
    priority: f64,
}

#[derive(Deserialize)]
struct PullRequestWire {
    #[serde(rename = "fileid")]
    file_id: String,
    #[serde(default)]
    size: u32,
}

impl ImageRequest {
    pub fn new(request_id: i32, file_id: impl Into<String>, size: u32, priority: f64) -> Self {
        Self {
            request_id,
            file_id: file_id.into(),
            size,
            priority,
        }
    }

    /// Parse a push-channel request. Field names are matched case-insensitively.
    pub fn from_json(text: &str) -> Result<Self> {
        let wire: PushRequestWire = parse_case_insensitive(text)?;
        Ok(Self {
            request_id: wire.request_id,
            file_id: wire.file_id,
            size: wire.size,
            priority: wire.priority,
        })
    }

    /// Parse a pull request line: `{"fileId": .., "size": ..}`
    pub fn from_pull_json(text: &str, priority: f64) -> Result<Self> {
        let wire: PullRequestWire = parse_case_insensitive(text)?;
        Ok(Self::new(0, wire.file_id, wire.size, priority))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn parse_case_insensitive<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| PipelineError::Protocol(e.to_string()))?;
    let serde_json::Value::Object(fields) = value else {
        return Err(PipelineError::Protocol("expected a JSON object".to_string()));
    };

    let lowered: serde_json::Map<String, serde_json::Value> = fields
        .into_iter()
        .map(|(name, value)| (name.to_lowercase(), value))
        .collect();

    serde_json::from_value(serde_json::Value::Object(lowered))
        .map_err(|e| PipelineError::Protocol(e.to_string()))
}

/// Build a response frame: 4-byte little-endian request id, then the payload
pub fn encode_frame(request_id: i32, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_i32_le(request_id);
    frame.put_slice(payload);
    frame.freeze()
}

/// Split a response frame into request id and payload
pub fn decode_frame(frame: &[u8]) -> Result<(i32, &[u8])> {
    if frame.len() < 4 {
        return Err(PipelineError::Protocol(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let (id, payload) = frame.split_at(4);
    let request_id = i32::from_le_bytes([id[0], id[1], id[2], id[3]]);
    Ok((request_id, payload))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

/// Message framing for push connections
#[derive(Debug, Clone)]
pub struct ChannelCodec {
    max_len: usize,
}

impl ChannelCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_MESSAGE_LEN)
    }

    /// Clients reading full-size originals need a larger limit than the server
    pub fn with_max_length(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for ChannelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChannelCodec {
    type Item = WireMessage;
    type Error = PipelineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_len {
            return Err(PipelineError::Protocol(format!(
                "message of {} bytes exceeds limit of {}",
                len, self.max_len
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        match kind {
            KIND_TEXT => String::from_utf8(body.to_vec())
                .map(|text| Some(WireMessage::Text(text)))
                .map_err(|_| PipelineError::Protocol("text message is not UTF-8".to_string())),
            KIND_BINARY => Ok(Some(WireMessage::Binary(body))),
            other => Err(PipelineError::Protocol(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

impl Encoder<WireMessage> for ChannelCodec {
    type Error = PipelineError;

    fn encode(&mut self, message: WireMessage, dst: &mut BytesMut) -> Result<()> {
        let (kind, body): (u8, &[u8]) = match &message {
            WireMessage::Text(text) => (KIND_TEXT, text.as_bytes()),
            WireMessage::Binary(data) => (KIND_BINARY, data.as_ref()),
        };
        let len = u32::try_from(body.len())
            .map_err(|_| PipelineError::Protocol("message too large".to_string()))?;

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u8(kind);
        dst.put_u32(len);
        dst.put_slice(body);
        Ok(())
    }
}
