//! Bridge client: one TCP connection per call

use super::codec::FrameCodec;
use super::protocol::{
    decode_data, FrameType, ReqSub, ReqUnSub, Request, Response, RspInfo,
    RSP_ALREADY_SUBSCRIBED,
};
use crate::error::{HubError, Result};
use crate::flow::FlowItem;
use crate::registry::{Pooled, TypeRegistry};
use crate::types::ResumeKind;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

type Codec = FrameCodec<OwnedReadHalf, OwnedWriteHalf>;

/// Client of a remote bridge server
#[derive(Debug, Clone)]
pub struct HubClient {
    addr: String,
    connect_timeout: Duration,
}

impl HubClient {
    /// Create a client and verify the peer is reachable
    pub async fn connect(addr: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Self {
            addr: addr.into(),
            connect_timeout,
        };
        let stream = client.dial().await?;
        drop(stream);

        tracing::info!(addr = %client.addr, "Connected to remote hub");
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                HubError::Timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| HubError::Connection(format!("Failed to connect to {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn call(&self, request: &Request) -> Result<(Codec, Response)> {
        let (reader, writer) = self.dial().await?.into_split();
        let mut codec = FrameCodec::new(reader, writer);
        codec.writer.write_request(request).await?;
        let response = codec.reader.read_response().await?;
        Ok((codec, response))
    }

    /// Topic name → metadata on the remote hub
    pub async fn get_topics(&self) -> Result<HashMap<String, HashMap<String, String>>> {
        match self.call(&Request::GetTopics).await? {
            (_, Response::Topics(topics)) => Ok(topics.define),
            (_, other) => Err(unexpected("topics", &other)),
        }
    }

    /// Detach a subscription on the remote hub by its remote id
    pub async fn unsubscribe(&self, topic: &str, sub_id: &str) -> Result<()> {
        let request = Request::UnSubscribe(ReqUnSub {
            topic: topic.to_string(),
            sub_id: sub_id.to_string(),
        });
        match self.call(&request).await? {
            (_, Response::RspInfo(info)) => info.into_result(),
            (_, other) => Err(unexpected("status", &other)),
        }
    }

    /// Attach to a remote topic; items arrive on the returned stream
    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        resume: ResumeKind,
    ) -> Result<RemoteStream> {
        let request = Request::Subscribe(ReqSub {
            topic: topic.to_string(),
            subscriber: subscriber.to_string(),
            resume_type: resume.as_i32(),
        });

        let (codec, response) = match self.call(&request).await {
            Ok(reply) => reply,
            Err(HubError::Remote { code, .. }) if code == RSP_ALREADY_SUBSCRIBED => {
                return Err(HubError::AlreadySubscribed {
                    topic: topic.to_string(),
                    subscriber: subscriber.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        match response {
            Response::Subscribed(ack) => {
                tracing::info!(
                    addr = %self.addr,
                    topic = %topic,
                    subscriber = %subscriber,
                    sub_id = %ack.sub_id,
                    "Remote subscription established"
                );
                Ok(RemoteStream {
                    topic: topic.to_string(),
                    sub_id: ack.sub_id,
                    codec,
                })
            }
            Response::RspInfo(info) => Err(info
                .into_result()
                .err()
                .unwrap_or_else(|| HubError::Protocol("Subscribe answered with bare OK".to_string()))),
            other => Err(unexpected("subscribe ack", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> HubError {
    HubError::Protocol(format!("Expected {}, got {:?}", expected, got))
}

/// Data stream of a remote subscription
pub struct RemoteStream {
    topic: String,
    sub_id: String,
    codec: Codec,
}

impl RemoteStream {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscription id assigned by the remote hub
    pub fn sub_id(&self) -> &str {
        &self.sub_id
    }

    /// Next item, decoded through `registry`
    ///
    /// Returns `None` once the server closes the stream.
    pub async fn next(&mut self, registry: &TypeRegistry) -> Result<Option<(String, FlowItem<Pooled>)>> {
        loop {
            let Some(frame) = self.codec.reader.read_frame().await? else {
                return Ok(None);
            };
            match frame.frame_type {
                FrameType::Data => return decode_data(&frame.payload, registry).map(Some),
                FrameType::Close => return Ok(None),
                FrameType::Error => {
                    let info: RspInfo = frame.json()?;
                    return Err(HubError::Remote {
                        code: info.error_id,
                        message: info.error_msg,
                    });
                }
                other => {
                    tracing::debug!(frame_type = ?other, "Ignoring frame on remote stream");
                }
            }
        }
    }

    /// Tell the server we are done and drop the connection
    pub async fn close(mut self) {
        if let Err(e) = self.codec.writer.close().await {
            tracing::debug!(topic = %self.topic, error = %e, "Remote stream close failed");
        }
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("topic", &self.topic)
            .field("sub_id", &self.sub_id)
            .finish()
    }
}
