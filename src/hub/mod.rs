//! Hub abstraction: the seam between producers/consumers and hub backends
//!
//! [`LocalHub`] keeps topics in-process with optional flow-log durability;
//! [`RemoteHub`] wraps a local hub and federates it with a peer over TCP.
//! Both implement [`FlowHub`], so stream consumers work against either.

use crate::error::Result;
use crate::flow::{FlowItem, Position};
use crate::registry::PersistentData;
use crate::types::{PublishReceipt, PublishTimeout, ResumeKind, SubscriptionState, TopicInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

pub mod local;
pub mod remote;
pub(crate) mod topic;

pub use local::LocalHub;
pub use remote::RemoteHub;

use topic::Subscriber;

/// Core trait for hub backends
#[async_trait]
pub trait FlowHub<T: PersistentData + Clone>: Send + Sync {
    /// Publish a value to a topic, creating the topic on first use
    async fn publish(&self, topic: &str, value: T, timeout: PublishTimeout)
        -> Result<PublishReceipt>;

    /// Attach a named subscriber with a replay policy
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        resume: ResumeKind,
    ) -> Result<Subscription<T>>;

    /// Detach a subscription and close its channel
    async fn unsubscribe(&self, id: Uuid) -> Result<()>;

    /// Snapshot of the known topics
    fn topics(&self) -> HashMap<String, TopicInfo>;

    /// Stop the hub; idempotent
    async fn release(&self) -> Result<()>;

    /// Hub name (e.g., "local", "edge")
    fn name(&self) -> &str;
}

/// Consumer handle of a subscription
///
/// Items arrive in topic order. The channel ends (`recv` returns `None`)
/// once the subscription is unsubscribed or the hub is released.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Arc<FlowItem<T>>>,
    shared: Arc<Subscriber<T>>,
}

impl<T: PersistentData> Subscription<T> {
    pub(crate) fn new(rx: mpsc::Receiver<Arc<FlowItem<T>>>, shared: Arc<Subscriber<T>>) -> Self {
        Self { rx, shared }
    }

    /// Subscription id
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn subscriber(&self) -> &str {
        &self.shared.name
    }

    /// Effective replay policy (a `Resume` on a non-durable topic reports `Restart`)
    pub fn resume(&self) -> ResumeKind {
        self.shared.resume
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Last position received through this handle
    pub fn cursor(&self) -> Position {
        self.shared.cursor()
    }

    /// Receive the next item
    pub async fn recv(&mut self) -> Option<Arc<FlowItem<T>>> {
        let item = self.rx.recv().await?;
        self.shared.observe(item.position());
        Some(item)
    }

    /// Receive without waiting
    pub fn try_recv(&mut self) -> Option<Arc<FlowItem<T>>> {
        let item = self.rx.try_recv().ok()?;
        self.shared.observe(item.position());
        Some(item)
    }

    /// Convert into a `Stream` of items
    pub fn into_stream(self) -> impl Stream<Item = Arc<FlowItem<T>>> + Send + Unpin + 'static {
        let shared = self.shared;
        ReceiverStream::new(self.rx).map(move |item| {
            shared.observe(item.position());
            item
        })
    }

    /// Receive without moving the cursor; pair with [`Self::commit`]
    pub(crate) async fn recv_uncommitted(&mut self) -> Option<Arc<FlowItem<T>>> {
        self.rx.recv().await
    }

    /// Move the cursor once an item has been handed on
    pub(crate) fn commit(&self, position: Position) {
        self.shared.observe(position);
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("topic", &self.shared.topic)
            .field("subscriber", &self.shared.name)
            .field("resume", &self.shared.resume)
            .finish()
    }
}
