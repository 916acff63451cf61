//! In-process hub with optional flow-log durability
//!
//! Each topic owns a serialized writer (`tokio::sync::Mutex<TopicLog>`) that
//! assigns positions, appends to the topic's flow log and fans the item out
//! to every live subscription while the guard is held, so every subscriber
//! observes the topic in publish order.
//!
//! `Resume` subscriptions replay the flow log from their durable cursor in a
//! background task. Once the reader hits the end of the log it takes the
//! writer guard, drains whatever was appended meanwhile, and joins the live
//! set before releasing the guard: no item is skipped or delivered twice.
//! Under the guard the replay only enqueues what fits in the channel; a full
//! channel sends it back to an unlocked catch-up pass so a slow consumer never
//! holds up publishers.

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::flow::{FlowItem, Position};
use crate::hub::topic::{Subscriber, Topic};
use crate::hub::{FlowHub, Subscription};
use crate::registry::{PersistentData, TypeRegistry};
use crate::state::{cursor_key, CursorStore, FileCursorStore, MemoryCursorStore};
use crate::storage::{FlowStore, OpenMode};
use crate::types::{
    DeliveryFailure, FailurePolicy, PublishReceipt, PublishTimeout, ResumeKind,
    SubscriptionState, TopicInfo,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Local pub/sub hub for records of type `T`
///
/// Cheap to clone; clones share the same topics and subscriptions.
pub struct LocalHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for LocalHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct HubInner<T> {
    config: HubConfig,
    registry: Arc<TypeRegistry>,
    topics: DashMap<String, Arc<Topic<T>>>,
    /// Hub-wide subscription index
    subscriptions: DashMap<Uuid, Arc<Subscriber<T>>>,
    /// Durable cursors of detached subscribers
    cursors: DashMap<String, Position>,
    cursor_store: Box<dyn CursorStore>,
    token: CancellationToken,
    stopped: AtomicBool,
}

impl<T: PersistentData + Clone> LocalHub<T> {
    /// Create a hub; `T` must already be registered with `registry`
    ///
    /// Cursors are kept in `<data_dir>/cursors.jsonl` (or `cursor_file`) when a
    /// data dir is configured, in memory otherwise.
    pub fn new(config: HubConfig, registry: Arc<TypeRegistry>) -> Result<Self> {
        let cursor_store: Box<dyn CursorStore> = match config.cursor_path() {
            Some(path) => Box::new(FileCursorStore::new(path)),
            None => Box::new(MemoryCursorStore::default()),
        };
        Self::with_cursor_store(config, registry, cursor_store)
    }

    /// Create a hub with an explicit cursor store
    pub fn with_cursor_store(
        config: HubConfig,
        registry: Arc<TypeRegistry>,
        cursor_store: Box<dyn CursorStore>,
    ) -> Result<Self> {
        config.validate()?;
        if registry.tid_of::<T>().is_none() {
            return Err(HubError::UnregisteredType(
                std::any::type_name::<T>().to_string(),
            ));
        }

        let cursors: DashMap<String, Position> = cursor_store.load()?.into_iter().collect();
        tracing::info!(
            hub = %config.name,
            data_dir = ?config.data_dir,
            cursors = cursors.len(),
            "Local hub created"
        );

        Ok(Self {
            inner: Arc::new(HubInner {
                config,
                registry,
                topics: DashMap::new(),
                subscriptions: DashMap::new(),
                cursors,
                cursor_store,
                token: CancellationToken::new(),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    /// Create a topic with metadata and explicit durability
    ///
    /// Declaring an existing topic returns it unchanged.
    pub fn declare_topic(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
        durable: bool,
    ) -> Result<TopicInfo> {
        self.inner.ensure_running()?;
        let topic = self.inner.topic_with(name, metadata, durable)?;
        Ok(topic.info())
    }

    /// Publish a value; see [`FlowHub::publish`]
    pub async fn publish(
        &self,
        topic: &str,
        value: T,
        timeout: PublishTimeout,
    ) -> Result<PublishReceipt> {
        self.inner.publish(topic, value, timeout).await
    }

    /// Attach a named subscriber; see [`FlowHub::subscribe`]
    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        resume: ResumeKind,
    ) -> Result<Subscription<T>> {
        self.inner.subscribe(topic, subscriber, resume).await
    }

    /// Detach a subscription, persist its cursor and close its channel
    pub async fn unsubscribe(&self, id: Uuid) -> Result<()> {
        self.inner.detach(id)
    }

    pub fn topics(&self) -> HashMap<String, TopicInfo> {
        self.inner.topic_infos()
    }

    /// Number of attached subscriptions across all topics
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Flush every topic log and persist cursors
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Close every subscription and store; idempotent
    pub async fn release(&self) -> Result<()> {
        self.inner.release().await
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }
}

#[async_trait]
impl<T: PersistentData + Clone> FlowHub<T> for LocalHub<T> {
    async fn publish(
        &self,
        topic: &str,
        value: T,
        timeout: PublishTimeout,
    ) -> Result<PublishReceipt> {
        self.inner.publish(topic, value, timeout).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        resume: ResumeKind,
    ) -> Result<Subscription<T>> {
        self.inner.subscribe(topic, subscriber, resume).await
    }

    async fn unsubscribe(&self, id: Uuid) -> Result<()> {
        self.inner.detach(id)
    }

    fn topics(&self) -> HashMap<String, TopicInfo> {
        self.inner.topic_infos()
    }

    async fn release(&self) -> Result<()> {
        self.inner.release().await
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }
}

impl<T: PersistentData + Clone> HubInner<T> {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HubError::Stopped);
        }
        Ok(())
    }

    /// Existing topic, or a new one with the configured default durability
    fn topic(&self, name: &str) -> Result<Arc<Topic<T>>> {
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic.value().clone());
        }
        self.topic_with(name, HashMap::new(), self.config.default_durable)
    }

    fn topic_with(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
        durable: bool,
    ) -> Result<Arc<Topic<T>>> {
        validate_topic_name(name)?;

        match self.topics.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let path = if durable {
                    Some(self.config.topic_path(name).ok_or_else(|| {
                        HubError::Config(format!(
                            "Durable topic '{}' requires a dataDir",
                            name
                        ))
                    })?)
                } else {
                    None
                };

                let topic = Arc::new(Topic::open(name, metadata, path, &self.registry)?);
                tracing::info!(
                    hub = %self.config.name,
                    topic = %name,
                    durable,
                    "Topic created"
                );
                entry.insert(topic.clone());
                Ok(topic)
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        value: T,
        timeout: PublishTimeout,
    ) -> Result<PublishReceipt> {
        self.ensure_running()?;
        let topic = self.topic(topic)?;

        let (position, outcomes) = {
            let mut log = topic.log.lock().await;
            let position = log.next;
            let item = Arc::new(FlowItem::at(position, value));

            if let Some(store) = log.store.as_mut() {
                store.write(item.as_ref())?;
                if self.config.flush_on_publish {
                    store.flush()?;
                }
            }
            log.next = position.next();
            topic.set_tail(position);

            let targets = topic.live_snapshot();
            let results =
                join_all(targets.iter().map(|sub| sub.deliver(item.clone(), timeout))).await;
            (position, targets.into_iter().zip(results).collect::<Vec<_>>())
        };

        let mut delivered = 0;
        let mut failures = Vec::new();
        for (sub, result) in outcomes {
            match result {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!(
                        topic = %topic.name,
                        subscriber = %sub.name,
                        position = %position,
                        error = %error,
                        "Delivery failed"
                    );

                    // A closed channel never recovers
                    let disconnect = matches!(error, HubError::SubscriberClosed { .. })
                        || self.config.failure_policy == FailurePolicy::Disconnect;
                    if disconnect {
                        if let Err(e) = self.detach(sub.id) {
                            tracing::debug!(subscriber = %sub.name, error = %e, "Detach after failure");
                            topic.live.remove(&sub.id);
                        }
                    }

                    failures.push(DeliveryFailure {
                        subscription_id: sub.id,
                        subscriber: sub.name.clone(),
                        error,
                    });
                }
            }
        }

        tracing::debug!(
            topic = %topic.name,
            position = %position,
            delivered,
            failed = failures.len(),
            "Published"
        );

        Ok(PublishReceipt {
            topic: topic.name.clone(),
            position,
            delivered,
            failures,
        })
    }

    async fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        subscriber: &str,
        resume: ResumeKind,
    ) -> Result<Subscription<T>> {
        self.ensure_running()?;
        if subscriber.trim().is_empty() {
            return Err(HubError::Config(
                "Subscriber name must not be empty".to_string(),
            ));
        }
        let topic = self.topic(topic)?;

        let resume = if resume == ResumeKind::Resume && !topic.durable {
            tracing::warn!(
                topic = %topic.name,
                subscriber = %subscriber,
                "Topic is not durable, resume falls back to restart"
            );
            ResumeKind::Restart
        } else {
            resume
        };

        self.reclaim_abandoned(&topic, subscriber)?;

        let key = cursor_key(&topic.name, subscriber);
        let from = match resume {
            ResumeKind::Resume => self
                .cursors
                .get(&key)
                .map(|c| *c.value())
                .unwrap_or(Position::ZERO),
            _ => Position::ZERO,
        };

        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let sub = Arc::new(Subscriber::new(
            &topic.name,
            subscriber,
            resume,
            from,
            tx,
            self.token.child_token(),
        ));

        match topic.names.entry(subscriber.to_string()) {
            Entry::Occupied(_) => {
                return Err(HubError::AlreadySubscribed {
                    topic: topic.name.clone(),
                    subscriber: subscriber.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(sub.id);
            }
        }
        self.subscriptions.insert(sub.id, sub.clone());

        match resume {
            ResumeKind::Restart | ResumeKind::Quick => {
                let tail = {
                    let _log = topic.log.lock().await;
                    let tail = topic.tail();
                    sub.reset_cursor(tail);
                    topic.live.insert(sub.id, sub.clone());
                    sub.set_state(SubscriptionState::Live);
                    tail
                };
                if resume == ResumeKind::Restart {
                    self.cursors.insert(key, tail);
                }
            }
            ResumeKind::Resume => {
                sub.set_state(SubscriptionState::Replaying);
                self.spawn_replay(topic.clone(), sub.clone(), from);
            }
        }

        tracing::info!(
            hub = %self.config.name,
            topic = %topic.name,
            subscriber = %subscriber,
            id = %sub.id,
            resume = %resume,
            "Subscribed"
        );

        Ok(Subscription::new(rx, sub))
    }

    /// Detach a previous subscription under this name whose handle was dropped
    fn reclaim_abandoned(&self, topic: &Topic<T>, subscriber: &str) -> Result<()> {
        let Some(id) = topic.names.get(subscriber).map(|e| *e.value()) else {
            return Ok(());
        };
        let abandoned = match self.subscriptions.get(&id) {
            Some(sub) => sub.is_abandoned(),
            None => {
                topic.names.remove_if(subscriber, |_, owner| *owner == id);
                return Ok(());
            }
        };
        if !abandoned {
            return Ok(());
        }

        tracing::info!(
            topic = %topic.name,
            subscriber = %subscriber,
            id = %id,
            "Reclaiming subscription whose handle was dropped"
        );
        match self.detach(id) {
            Ok(()) | Err(HubError::SubscriptionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn spawn_replay(self: &Arc<Self>, topic: Arc<Topic<T>>, sub: Arc<Subscriber<T>>, from: Position) {
        let hub = self.clone();
        tokio::spawn(async move {
            match hub.replay(&topic, &sub, from).await {
                Ok(replayed) => {
                    tracing::info!(
                        topic = %topic.name,
                        subscriber = %sub.name,
                        from = %from,
                        replayed,
                        "Replay complete, subscription live"
                    );
                }
                Err(e) if sub.token.is_cancelled() => {
                    tracing::debug!(subscriber = %sub.name, error = %e, "Replay cancelled");
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %topic.name,
                        subscriber = %sub.name,
                        error = %e,
                        "Replay failed, closing subscription"
                    );
                    if let Err(e) = hub.detach(sub.id) {
                        tracing::debug!(subscriber = %sub.name, error = %e, "Detach after replay failure");
                    }
                }
            }
        });
    }

    async fn replay(&self, topic: &Topic<T>, sub: &Arc<Subscriber<T>>, from: Position) -> Result<usize> {
        let path = topic.path.as_ref().ok_or_else(|| {
            HubError::Config(format!("Topic '{}' has no flow log", topic.name))
        })?;
        let mut reader = FlowStore::new(path, self.registry.clone());
        reader.open(OpenMode::ReadOnly)?;

        let closed = || HubError::SubscriberClosed {
            topic: topic.name.clone(),
            subscriber: sub.name.clone(),
        };

        let mut replayed = 0;
        let mut stalled: Option<Arc<FlowItem<T>>> = None;
        loop {
            // Waiting on the consumer here holds up nobody else
            if let Some(item) = stalled.take() {
                sub.deliver(item, PublishTimeout::Blocking).await?;
                replayed += 1;
            }
            replayed += drain(&mut reader, sub, from, PublishTimeout::Blocking)
                .await?
                .delivered;

            // Catch up with the writer, then go live before publishes resume
            let mut log = topic.log.lock().await;
            if let Some(store) = log.store.as_mut() {
                store.flush()?;
            }
            let pass = drain(&mut reader, sub, from, PublishTimeout::NonBlocking).await?;
            replayed += pass.delivered;
            if let Some(item) = pass.stalled {
                drop(log);
                tracing::debug!(
                    topic = %topic.name,
                    subscriber = %sub.name,
                    position = %item.position(),
                    "Channel full while catching up, releasing writer lock"
                );
                stalled = Some(item);
                continue;
            }

            if sub.token.is_cancelled() {
                return Err(closed());
            }
            topic.live.insert(sub.id, sub.clone());
            // A detach racing with the insert has already closed it
            if sub.state() == SubscriptionState::Closed {
                topic.live.remove(&sub.id);
                return Err(closed());
            }
            sub.set_state(SubscriptionState::Live);
            break;
        }

        reader.close()?;
        Ok(replayed)
    }

    fn detach(&self, id: Uuid) -> Result<()> {
        let (_, sub) = self
            .subscriptions
            .remove(&id)
            .ok_or_else(|| HubError::SubscriptionNotFound(id.to_string()))?;

        // Closed before leaving the live set, so a replay switching to live sees it
        sub.close();
        let topic = self.topics.get(&sub.topic).map(|t| t.value().clone());
        if let Some(topic) = topic {
            topic.detach(&sub.id, &sub.name);
        }

        tracing::info!(
            topic = %sub.topic,
            subscriber = %sub.name,
            id = %id,
            cursor = %sub.cursor(),
            "Unsubscribed"
        );

        if sub.tracks_cursor() {
            let key = cursor_key(&sub.topic, &sub.name);
            let cursor = sub.cursor();
            self.cursors.insert(key.clone(), cursor);
            self.cursor_store.commit(&key, cursor)?;
        }
        Ok(())
    }

    fn topic_infos(&self) -> HashMap<String, TopicInfo> {
        let topics: Vec<Arc<Topic<T>>> = self.topics.iter().map(|e| e.value().clone()).collect();
        topics
            .into_iter()
            .map(|topic| (topic.name.clone(), topic.info()))
            .collect()
    }

    /// Saved cursors overlaid with the live position of every tracked subscription
    fn cursor_snapshot(&self) -> HashMap<String, Position> {
        let mut snapshot: HashMap<String, Position> = self
            .cursors
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if sub.tracks_cursor() {
                snapshot.insert(cursor_key(&sub.topic, &sub.name), sub.cursor());
            }
        }
        snapshot
    }

    fn checkpoint_cursors(&self) -> Result<()> {
        self.cursor_store.checkpoint(&self.cursor_snapshot())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_running()?;
        let topics: Vec<Arc<Topic<T>>> = self.topics.iter().map(|e| e.value().clone()).collect();
        for topic in topics {
            let mut log = topic.log.lock().await;
            if let Some(store) = log.store.as_mut() {
                store.flush()?;
            }
        }
        self.checkpoint_cursors()
    }

    async fn release(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.token.cancel();

        let cursors = self.cursor_snapshot();
        let subs: Vec<Arc<Subscriber<T>>> = self
            .subscriptions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for sub in &subs {
            sub.close();
        }
        self.subscriptions.clear();

        let mut first_error = None;
        let topics: Vec<Arc<Topic<T>>> = self.topics.iter().map(|e| e.value().clone()).collect();
        for topic in topics {
            topic.live.clear();
            topic.names.clear();
            let mut log = topic.log.lock().await;
            if let Some(mut store) = log.store.take() {
                if let Err(e) = store.close() {
                    tracing::warn!(topic = %topic.name, error = %e, "Failed to close flow log");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.cursor_store.checkpoint(&cursors) {
            tracing::warn!(error = %e, "Failed to save cursors");
            first_error.get_or_insert(e);
        }

        tracing::info!(
            hub = %self.config.name,
            subscriptions = subs.len(),
            "Hub released"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Result of one replay pass over the log
struct Drained<T> {
    delivered: usize,
    /// Item the channel had no room for under a non-blocking pass
    stalled: Option<Arc<FlowItem<T>>>,
}

/// Deliver every record after `from` until the reader reaches the end of the log
///
/// With `NonBlocking` the pass stops at the first item the channel cannot
/// take and hands it back; it has already been read from the log.
async fn drain<T: PersistentData + Clone>(
    reader: &mut FlowStore,
    sub: &Subscriber<T>,
    from: Position,
    timeout: PublishTimeout,
) -> Result<Drained<T>> {
    let mut count = 0;
    loop {
        let (position, data) = match reader.read() {
            Ok(item) => {
                let position = item.position();
                if position <= from {
                    continue;
                }
                let data = item.data.downcast_ref::<T>().cloned().ok_or_else(|| {
                    HubError::Decode(format!(
                        "Record {} in {} is not a {}",
                        position,
                        reader.path().display(),
                        std::any::type_name::<T>()
                    ))
                })?;
                (position, data)
            }
            Err(HubError::EndOfLog) => {
                return Ok(Drained {
                    delivered: count,
                    stalled: None,
                })
            }
            Err(e) => return Err(e),
        };

        let item = Arc::new(FlowItem::at(position, data));
        match sub.deliver(item.clone(), timeout).await {
            Ok(()) => count += 1,
            Err(HubError::DeliveryTimeout { .. }) => {
                return Ok(Drained {
                    delivered: count,
                    stalled: Some(item),
                })
            }
            Err(e) => return Err(e),
        }
    }
}

fn validate_topic_name(name: &str) -> Result<()> {
    if name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(|c: char| c == '/' || c == '\\')
    {
        return Err(HubError::Config(format!("Invalid topic name: '{}'", name)));
    }
    Ok(())
}

impl<T> std::fmt::Debug for LocalHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("name", &self.inner.config.name)
            .field("topics", &self.inner.topics.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}
