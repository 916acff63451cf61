//! Bridge server: exposes a local hub's topics to remote peers
//!
//! One request per connection. A `Subscribe` connection stays open and
//! streams data frames until either side closes it; the server then
//! unsubscribes on the caller's behalf.

use super::codec::FrameCodec;
use super::protocol::{
    encode_data, Frame, FrameType, ReqSub, ReqUnSub, Request, Response, RspInfo, Subscribed,
    Topics, RSP_BAD_REQUEST, RSP_INVALID_ID,
};
use crate::error::{HubError, Result};
use crate::hub::LocalHub;
use crate::registry::PersistentData;
use crate::types::ResumeKind;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Codec = FrameCodec<OwnedReadHalf, OwnedWriteHalf>;

/// Running bridge server
pub struct HubServer {
    local_addr: SocketAddr,
    token: CancellationToken,
    accept: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl HubServer {
    /// Bind `listen` and start accepting connections
    pub async fn bind<T: PersistentData + Clone>(
        hub: LocalHub<T>,
        listen: &str,
        shutdown_timeout: Duration,
        token: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| HubError::Connection(format!("Failed to listen on {}: {}", listen, e)))?;
        let local_addr = listener.local_addr()?;

        tracing::info!(hub = %hub.name(), addr = %local_addr, "Bridge server listening");

        let accept = tokio::spawn(accept_loop(hub, listener, token.clone()));
        Ok(Self {
            local_addr,
            token,
            accept: Mutex::new(Some(accept)),
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every connection
    ///
    /// Waits at most the shutdown timeout for connection tasks to finish,
    /// then aborts them. Idempotent.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.accept.lock().ok().and_then(|mut h| h.take());
        let Some(mut handle) = handle else {
            return;
        };

        if tokio::time::timeout(self.shutdown_timeout, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(
                addr = %self.local_addr,
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Bridge server did not stop in time, aborting connections"
            );
            handle.abort();
        }
        tracing::info!(addr = %self.local_addr, "Bridge server stopped");
    }
}

async fn accept_loop<T: PersistentData + Clone>(
    hub: LocalHub<T>,
    listener: TcpListener,
    token: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let hub = hub.clone();
                    let token = token.child_token();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(hub, stream, token).await {
                            tracing::warn!(peer = %peer, error = %e, "Bridge connection failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            },
            // Reap finished connections
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = token.cancelled() => break,
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn handle_connection<T: PersistentData + Clone>(
    hub: LocalHub<T>,
    stream: TcpStream,
    token: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut codec = FrameCodec::new(reader, writer);

    let frame = tokio::select! {
        frame = codec.reader.read_frame() => frame?,
        _ = token.cancelled() => return Ok(()),
    };
    let Some(frame) = frame else {
        return Ok(());
    };

    if frame.frame_type != FrameType::Request {
        let info = RspInfo::new(
            RSP_BAD_REQUEST,
            format!("Expected request, got {:?} frame", frame.frame_type),
        );
        return codec.writer.write_error(&info).await;
    }

    let request: Request = match frame.json() {
        Ok(request) => request,
        Err(e) => return codec.writer.write_error(&RspInfo::from_error(&e)).await,
    };

    match request {
        Request::GetTopics => {
            let define = hub
                .topics()
                .into_iter()
                .map(|(name, info)| (name, info.metadata))
                .collect();
            codec
                .writer
                .write_response(&Response::Topics(Topics { define }))
                .await?;
        }
        Request::UnSubscribe(req) => {
            let info = unsubscribe(&hub, &req).await;
            codec.writer.write_response(&Response::RspInfo(info)).await?;
        }
        Request::Subscribe(req) => {
            serve_subscription(&hub, &mut codec, req, token).await?;
        }
    }

    if let Err(e) = codec.writer.close().await {
        tracing::debug!(error = %e, "Close after reply failed");
    }
    Ok(())
}

async fn unsubscribe<T: PersistentData + Clone>(hub: &LocalHub<T>, req: &ReqUnSub) -> RspInfo {
    let id = match Uuid::parse_str(&req.sub_id) {
        Ok(id) => id,
        Err(e) => {
            return RspInfo::new(
                RSP_INVALID_ID,
                format!("Invalid subscription id '{}': {}", req.sub_id, e),
            )
        }
    };

    match hub.unsubscribe(id).await {
        Ok(()) => {
            tracing::info!(topic = %req.topic, id = %id, "Remote unsubscribe");
            RspInfo::ok()
        }
        Err(e) => RspInfo::from_error(&e),
    }
}

async fn serve_subscription<T: PersistentData + Clone>(
    hub: &LocalHub<T>,
    codec: &mut Codec,
    req: ReqSub,
    token: CancellationToken,
) -> Result<()> {
    let resume = match ResumeKind::try_from(req.resume_type) {
        Ok(resume) => resume,
        Err(e) => return codec.writer.write_error(&RspInfo::from_error(&e)).await,
    };

    let mut sub = match hub.subscribe(&req.topic, &req.subscriber, resume).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::info!(
                topic = %req.topic,
                subscriber = %req.subscriber,
                error = %e,
                "Remote subscribe rejected"
            );
            return codec.writer.write_error(&RspInfo::from_error(&e)).await;
        }
    };
    let id = sub.id();

    let ack = Response::Subscribed(Subscribed {
        sub_id: id.to_string(),
    });
    let mut result = codec.writer.write_response(&ack).await;

    let mut buf = BytesMut::new();
    let mut forwarded = 0u64;
    while result.is_ok() {
        tokio::select! {
            item = sub.recv_uncommitted() => match item {
                Some(item) => {
                    buf.clear();
                    result = match encode_data(&mut buf, &req.topic, &item, hub.registry()) {
                        Ok(()) => codec.writer.write_frame(&Frame::data(buf.to_vec())).await,
                        Err(e) => Err(e),
                    };
                    // Only items on the wire count towards the cursor
                    if result.is_ok() {
                        sub.commit(item.position());
                        forwarded += 1;
                    }
                }
                // Unsubscribed by id or hub released
                None => break,
            },
            frame = codec.reader.read_frame() => match frame {
                Ok(Some(frame)) if frame.frame_type != FrameType::Close => {
                    tracing::debug!(frame_type = ?frame.frame_type, "Ignoring frame on subscription stream");
                }
                Ok(_) => break,
                Err(e) => result = Err(e),
            },
            _ = token.cancelled() => break,
        }
    }

    tracing::info!(
        topic = %req.topic,
        subscriber = %req.subscriber,
        forwarded,
        "Remote subscription ended"
    );

    match hub.unsubscribe(id).await {
        Ok(()) | Err(HubError::SubscriptionNotFound(_)) | Err(HubError::Stopped) => {}
        Err(e) => tracing::warn!(id = %id, error = %e, "Implicit unsubscribe failed"),
    }

    match result {
        // Peer gone; nothing left to report
        Err(HubError::Connection(_)) => Ok(()),
        other => other,
    }
}
