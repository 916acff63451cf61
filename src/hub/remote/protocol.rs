//! Bridge wire protocol
//!
//! Frame format: `[type:u8][length:u32 big-endian][payload:length bytes]`.
//! Requests, responses and errors carry JSON; data frames carry
//! `[topic_len:u16 BE][topic][flow record]`.

use crate::error::{HubError, Result};
use crate::flow::{decode_item, FlowItem};
use crate::registry::{PersistentData, Pooled, TypeRegistry};
use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum frame payload: 16 MiB
pub const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;
pub(crate) const HEADER_SIZE: usize = 5;

/// Success
pub const RSP_OK: i32 = 0;
/// No such subscription
pub const RSP_NOT_FOUND: i32 = 1;
/// Subscription id is not a valid id
pub const RSP_INVALID_ID: i32 = 2;
/// Any other failure
pub const RSP_OTHER: i32 = 3;
/// Subscriber name already active on the topic
pub const RSP_ALREADY_SUBSCRIBED: i32 = 4;
/// Malformed or unexpected request
pub const RSP_BAD_REQUEST: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 0x01,
    Response = 0x02,
    Data = 0x03,
    Error = 0x04,
    Close = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = HubError;

    fn try_from(value: u8) -> std::result::Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::Error),
            0x05 => Ok(Self::Close),
            _ => Err(HubError::Protocol(format!(
                "Unknown frame type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// A framed message on the wire
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(request: &Request) -> Result<Self> {
        Ok(Self {
            frame_type: FrameType::Request,
            payload: serde_json::to_vec(request)?,
        })
    }

    pub fn response(response: &Response) -> Result<Self> {
        Ok(Self {
            frame_type: FrameType::Response,
            payload: serde_json::to_vec(response)?,
        })
    }

    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            payload,
        }
    }

    pub fn error(info: &RspInfo) -> Result<Self> {
        Ok(Self {
            frame_type: FrameType::Error,
            payload: serde_json::to_vec(info)?,
        })
    }

    pub fn close() -> Self {
        Self {
            frame_type: FrameType::Close,
            payload: Vec::new(),
        }
    }

    /// Parse the JSON payload
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| HubError::Protocol(format!("Invalid {:?} payload: {}", self.frame_type, e)))
    }

    /// Append the wire encoding to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let len = self.payload.len();
        if len > MAX_FRAME_PAYLOAD as usize {
            return Err(HubError::Protocol(format!(
                "Payload too large: {} bytes (max {})",
                len, MAX_FRAME_PAYLOAD
            )));
        }
        buf.reserve(HEADER_SIZE + len);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(len as u32);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decode a frame from bytes
    ///
    /// Returns the frame and the number of bytes consumed, or `None` if incomplete.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let frame_type = FrameType::try_from(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len > MAX_FRAME_PAYLOAD {
            return Err(HubError::Protocol(format!(
                "Payload too large: {} bytes (max {})",
                len, MAX_FRAME_PAYLOAD
            )));
        }
        let total = HEADER_SIZE + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((
            Self {
                frame_type,
                payload: buf[HEADER_SIZE..total].to_vec(),
            },
            total,
        )))
    }
}

/// Subscribe request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqSub {
    pub topic: String,
    pub subscriber: String,
    /// Restart = 0, Resume = 1, Quick = 2
    pub resume_type: i32,
}

/// UnSubscribe request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqUnSub {
    pub topic: String,
    pub sub_id: String,
}

/// Client → server request; one per connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    GetTopics,
    Subscribe(ReqSub),
    UnSubscribe(ReqUnSub),
}

/// Topic name → declared metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topics {
    pub define: HashMap<String, HashMap<String, String>>,
}

/// Status reply; also the payload of error frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RspInfo {
    pub error_id: i32,
    #[serde(default)]
    pub error_msg: String,
}

impl RspInfo {
    pub fn ok() -> Self {
        Self {
            error_id: RSP_OK,
            error_msg: String::new(),
        }
    }

    pub fn new(error_id: i32, error_msg: impl Into<String>) -> Self {
        Self {
            error_id,
            error_msg: error_msg.into(),
        }
    }

    /// Map a hub error onto a wire status
    pub fn from_error(error: &HubError) -> Self {
        let code = match error {
            HubError::SubscriptionNotFound(_) => RSP_NOT_FOUND,
            HubError::AlreadySubscribed { .. } => RSP_ALREADY_SUBSCRIBED,
            HubError::Protocol(_) => RSP_BAD_REQUEST,
            _ => RSP_OTHER,
        };
        Self::new(code, error.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.error_id == RSP_OK
    }

    /// Turn a non-zero status into a hub error
    pub fn into_result(self) -> Result<()> {
        match self.error_id {
            RSP_OK => Ok(()),
            RSP_NOT_FOUND => Err(HubError::SubscriptionNotFound(self.error_msg)),
            code => Err(HubError::Remote {
                code,
                message: self.error_msg,
            }),
        }
    }
}

/// Subscribe acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribed {
    pub sub_id: String,
}

/// Server → client reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Topics(Topics),
    Subscribed(Subscribed),
    RspInfo(RspInfo),
}

/// Encode a data frame payload carrying one item of `topic`
pub fn encode_data<T: PersistentData>(
    buf: &mut BytesMut,
    topic: &str,
    item: &FlowItem<T>,
    registry: &TypeRegistry,
) -> Result<()> {
    let topic_len = u16::try_from(topic.len())
        .map_err(|_| HubError::Protocol(format!("Topic name too long: {} bytes", topic.len())))?;
    buf.put_u16(topic_len);
    buf.put_slice(topic.as_bytes());
    item.encode(registry, buf)
}

/// Decode a data frame payload into its topic and item
pub fn decode_data(payload: &[u8], registry: &TypeRegistry) -> Result<(String, FlowItem<Pooled>)> {
    let mut buf = payload;
    if buf.remaining() < 2 {
        return Err(HubError::Protocol("Truncated data frame".to_string()));
    }
    let topic_len = buf.get_u16() as usize;
    if buf.remaining() < topic_len {
        return Err(HubError::Protocol("Truncated topic name".to_string()));
    }
    let topic = String::from_utf8(buf[..topic_len].to_vec())
        .map_err(|e| HubError::Protocol(format!("Invalid topic name: {}", e)))?;
    buf.advance(topic_len);

    let item = decode_item(&mut buf, registry)?;
    Ok((topic, item))
}
