//! Remote hub bridge: federates a local hub with a peer over TCP
//!
//! The server side exposes the local hub's topics (GetTopics / Subscribe /
//! UnSubscribe). The client side mirrors remote topics: every subscription
//! made through [`RemoteHub::subscribe`] is also opened on the peer, and the
//! items it streams are republished into the local hub under the same topic.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;

pub use client::{HubClient, RemoteStream};
pub use server::HubServer;

use crate::config::RemoteConfig;
use crate::error::{HubError, Result};
use crate::hub::{FlowHub, LocalHub, Subscription};
use crate::registry::PersistentData;
use crate::types::{PublishReceipt, PublishTimeout, ResumeKind, TopicInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Local hub plus a bridge server and/or a link to a peer hub
pub struct RemoteHub<T> {
    local: LocalHub<T>,
    config: RemoteConfig,
    server: Mutex<Option<HubServer>>,
    client: Mutex<Option<HubClient>>,
    /// Forwarding links keyed by local subscription id
    links: DashMap<Uuid, CancellationToken>,
    token: CancellationToken,
    stopped: AtomicBool,
}

impl<T: PersistentData + Clone> RemoteHub<T> {
    /// Wrap a local hub without starting anything
    pub fn new(local: LocalHub<T>, config: RemoteConfig) -> Self {
        Self {
            local,
            config,
            server: Mutex::new(None),
            client: Mutex::new(None),
            links: DashMap::new(),
            token: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Wrap a local hub and start the server and client named in `config`
    pub async fn start(local: LocalHub<T>, config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let hub = Self::new(local, config.clone());
        if let Some(listen) = &config.listen {
            hub.start_server(listen).await?;
        }
        if let Some(remote) = &config.remote {
            hub.start_client(remote).await?;
        }
        Ok(hub)
    }

    /// Serve the local hub on `listen`; returns the bound address
    pub async fn start_server(&self, listen: &str) -> Result<SocketAddr> {
        self.ensure_running()?;
        let server = HubServer::bind(
            self.local.clone(),
            listen,
            self.config.shutdown_timeout(),
            self.token.child_token(),
        )
        .await?;
        let addr = server.local_addr();

        let previous = self
            .server
            .lock()
            .map_err(HubError::lock)?
            .replace(server);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(addr)
    }

    /// Link to the peer at `remote`; fails if it cannot be dialed
    pub async fn start_client(&self, remote: &str) -> Result<()> {
        self.ensure_running()?;
        let client = HubClient::connect(remote, self.config.connect_timeout()).await?;
        *self.client.lock().map_err(HubError::lock)? = Some(client);
        Ok(())
    }

    pub fn local(&self) -> &LocalHub<T> {
        &self.local
    }

    /// Address the bridge server is bound to, if running
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .ok()
            .and_then(|server| server.as_ref().map(|s| s.local_addr()))
    }

    fn client(&self) -> Option<HubClient> {
        self.client.lock().ok().and_then(|client| client.clone())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HubError::Stopped);
        }
        Ok(())
    }

    /// Topics of the linked peer
    pub async fn remote_topics(&self) -> Result<HashMap<String, HashMap<String, String>>> {
        let client = self
            .client()
            .ok_or_else(|| HubError::Config("No remote hub configured".to_string()))?;
        client.get_topics().await
    }

    /// Publish into the local hub
    pub async fn publish(
        &self,
        topic: &str,
        value: T,
        timeout: PublishTimeout,
    ) -> Result<PublishReceipt> {
        self.ensure_running()?;
        self.local.publish(topic, value, timeout).await
    }

    /// Subscribe locally, then mirror the topic from the peer
    ///
    /// A peer that already has this subscriber rolls the local subscription
    /// back and fails with `AlreadySubscribed`. Any other peer failure is
    /// logged and the local subscription is returned alone.
    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        resume: ResumeKind,
    ) -> Result<Subscription<T>> {
        self.ensure_running()?;
        let sub = self.local.subscribe(topic, subscriber, resume).await?;

        let Some(client) = self.client() else {
            return Ok(sub);
        };

        match client.subscribe(topic, subscriber, resume).await {
            Ok(stream) => {
                let link = self.token.child_token();
                self.links.insert(sub.id(), link.clone());
                tokio::spawn(forward(self.local.clone(), client, stream, link));
            }
            Err(e @ HubError::AlreadySubscribed { .. }) => {
                if let Err(rollback) = self.local.unsubscribe(sub.id()).await {
                    tracing::warn!(id = %sub.id(), error = %rollback, "Rollback of local subscription failed");
                }
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    remote = %client.addr(),
                    topic = %topic,
                    subscriber = %subscriber,
                    error = %e,
                    "Remote subscribe failed, continuing with local subscription"
                );
            }
        }

        Ok(sub)
    }

    /// Unsubscribe locally and tear down the forwarding link
    pub async fn unsubscribe(&self, id: Uuid) -> Result<()> {
        if let Some((_, link)) = self.links.remove(&id) {
            link.cancel();
        }
        self.local.unsubscribe(id).await
    }

    pub fn topics(&self) -> HashMap<String, TopicInfo> {
        self.local.topics()
    }

    /// Stop the server, cancel every link and release the local hub; idempotent
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.token.cancel();
        self.links.clear();

        let server = self.server.lock().ok().and_then(|mut s| s.take());
        if let Some(server) = server {
            server.stop().await;
        }

        tracing::info!(hub = %self.local.name(), "Remote hub stopped");
        self.local.release().await
    }
}

/// Republish items streamed by the peer into the local hub
async fn forward<T: PersistentData + Clone>(
    local: LocalHub<T>,
    client: HubClient,
    mut stream: RemoteStream,
    token: CancellationToken,
) {
    let registry = local.registry().clone();
    let mut forwarded = 0u64;

    loop {
        let next = tokio::select! {
            next = stream.next(&registry) => next,
            _ = token.cancelled() => break,
        };

        match next {
            Ok(Some((topic, item))) => {
                let Some(value) = item.data.downcast_ref::<T>().cloned() else {
                    tracing::warn!(
                        topic = %topic,
                        tid = %item.data.tid(),
                        "Remote item has an unexpected type, skipping"
                    );
                    continue;
                };
                drop(item);

                match local.publish(&topic, value, PublishTimeout::Blocking).await {
                    Ok(_) => forwarded += 1,
                    Err(HubError::Stopped) => break,
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Republish of remote item failed");
                    }
                }
            }
            Ok(None) => {
                tracing::info!(topic = %stream.topic(), "Remote stream closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!(topic = %stream.topic(), error = %e, "Remote stream failed");
                break;
            }
        }
    }

    tracing::debug!(topic = %stream.topic(), forwarded, "Forwarding link ended");

    if token.is_cancelled() {
        if let Err(e) = client.unsubscribe(stream.topic(), stream.sub_id()).await {
            tracing::debug!(sub_id = %stream.sub_id(), error = %e, "Remote unsubscribe failed");
        }
    }
    stream.close().await;
}

#[async_trait]
impl<T: PersistentData + Clone> FlowHub<T> for RemoteHub<T> {
    async fn publish(
        &self,
        topic: &str,
        value: T,
        timeout: PublishTimeout,
    ) -> Result<PublishReceipt> {
        RemoteHub::publish(self, topic, value, timeout).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        resume: ResumeKind,
    ) -> Result<Subscription<T>> {
        RemoteHub::subscribe(self, topic, subscriber, resume).await
    }

    async fn unsubscribe(&self, id: Uuid) -> Result<()> {
        RemoteHub::unsubscribe(self, id).await
    }

    fn topics(&self) -> HashMap<String, TopicInfo> {
        self.local.topics()
    }

    async fn release(&self) -> Result<()> {
        self.stop().await
    }

    fn name(&self) -> &str {
        self.local.name()
    }
}
