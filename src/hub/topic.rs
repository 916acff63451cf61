//! Per-topic state: live subscriber set, name index and the serialized log writer

use crate::error::{HubError, Result};
use crate::flow::{FlowItem, Position};
use crate::registry::{PersistentData, TypeRegistry};
use crate::storage::{FlowStore, OpenMode};
use crate::types::{PublishTimeout, ResumeKind, SubscriptionState, TopicInfo};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Writer side of a topic, guarded by the topic's async mutex
///
/// Holding the guard serializes position assignment, log writes and fan-out.
pub(crate) struct TopicLog {
    /// Position the next published item receives
    pub next: Position,
    /// Open write handle; `None` for non-durable topics and after release
    pub store: Option<FlowStore>,
}

pub(crate) struct Topic<T> {
    pub name: String,
    pub metadata: HashMap<String, String>,
    pub durable: bool,
    /// Flow log location for durable topics
    pub path: Option<PathBuf>,
    /// Subscriptions receiving published items
    pub live: DashMap<Uuid, Arc<Subscriber<T>>>,
    /// Attached subscriber names (live or replaying)
    pub names: DashMap<String, Uuid>,
    pub log: tokio::sync::Mutex<TopicLog>,
    tail: Mutex<Position>,
}

impl<T: PersistentData + Clone> Topic<T> {
    /// Create a topic, opening (or creating) its flow log when durable
    ///
    /// An existing log keeps its records; publishing continues in the epoch
    /// after the last one found in the file.
    pub fn open(
        name: &str,
        metadata: HashMap<String, String>,
        path: Option<PathBuf>,
        registry: &Arc<TypeRegistry>,
    ) -> Result<Self> {
        let (tail, next, store) = match &path {
            Some(path) => {
                let last = FlowStore::tail(path, registry.clone())?;
                let mut store = FlowStore::new(path, registry.clone());
                store.open(OpenMode::WriteOnly)?;
                match last {
                    Some(last) => {
                        tracing::info!(
                            topic = %name,
                            last = %last,
                            epoch = last.epoch + 1,
                            "Reopened flow log, starting new epoch"
                        );
                        (last, Position::new(last.epoch + 1, 1), Some(store))
                    }
                    None => (Position::ZERO, Position::new(0, 1), Some(store)),
                }
            }
            None => (Position::ZERO, Position::new(0, 1), None),
        };

        Ok(Self {
            name: name.to_string(),
            metadata,
            durable: path.is_some(),
            path,
            live: DashMap::new(),
            names: DashMap::new(),
            log: tokio::sync::Mutex::new(TopicLog { next, store }),
            tail: Mutex::new(tail),
        })
    }

    /// Position of the last published item
    pub fn tail(&self) -> Position {
        self.tail.lock().map(|t| *t).unwrap_or_default()
    }

    pub fn set_tail(&self, position: Position) {
        if let Ok(mut tail) = self.tail.lock() {
            *tail = position;
        }
    }

    /// Snapshot of the live set for fan-out
    pub fn live_snapshot(&self) -> Vec<Arc<Subscriber<T>>> {
        self.live.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove a subscription from the live set and the name index
    pub fn detach(&self, id: &Uuid, subscriber: &str) {
        self.live.remove(id);
        self.names.remove_if(subscriber, |_, owner| owner == id);
    }

    pub fn info(&self) -> TopicInfo {
        TopicInfo {
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            durable: self.durable,
            subscribers: self.names.len(),
            tail: self.tail(),
        }
    }
}

/// Hub-side half of a subscription
pub(crate) struct Subscriber<T> {
    pub id: Uuid,
    pub topic: String,
    pub name: String,
    pub resume: ResumeKind,
    tx: Mutex<Option<mpsc::Sender<Arc<FlowItem<T>>>>>,
    cursor: Mutex<Position>,
    state: Mutex<SubscriptionState>,
    pub token: CancellationToken,
}

impl<T: PersistentData> Subscriber<T> {
    pub fn new(
        topic: &str,
        name: &str,
        resume: ResumeKind,
        cursor: Position,
        tx: mpsc::Sender<Arc<FlowItem<T>>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            name: name.to_string(),
            resume,
            tx: Mutex::new(Some(tx)),
            cursor: Mutex::new(cursor),
            state: Mutex::new(SubscriptionState::Attached),
            token,
        }
    }

    /// Last position handed to the consumer
    ///
    /// Items still buffered in the channel are not covered, so a later
    /// `Resume` replays them.
    pub fn cursor(&self) -> Position {
        self.cursor.lock().map(|c| *c).unwrap_or_default()
    }

    /// Move the cursor to the topic tail at attach time
    pub fn reset_cursor(&self, position: Position) {
        if let Ok(mut cursor) = self.cursor.lock() {
            *cursor = position;
        }
    }

    /// Record that the consumer took the item at `position`
    pub fn observe(&self, position: Position) {
        if let Ok(mut cursor) = self.cursor.lock() {
            if position > *cursor {
                *cursor = position;
            }
        }
    }

    /// The consumer handle was dropped without unsubscribing
    pub fn is_abandoned(&self) -> bool {
        self.tx
            .lock()
            .map(|tx| tx.as_ref().map_or(true, |tx| tx.is_closed()))
            .unwrap_or(true)
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SubscriptionState::Closed)
    }

    pub fn set_state(&self, state: SubscriptionState) {
        if let Ok(mut current) = self.state.lock() {
            if *current != SubscriptionState::Closed {
                *current = state;
            }
        }
    }

    /// Whether the durable cursor is kept for this subscription
    pub fn tracks_cursor(&self) -> bool {
        self.resume != ResumeKind::Quick
    }

    /// Cancel pending deliveries and close the channel
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = SubscriptionState::Closed;
        }
        self.token.cancel();
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    /// Enqueue one item according to the publish timeout
    pub async fn deliver(&self, item: Arc<FlowItem<T>>, timeout: PublishTimeout) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or_else(|| self.closed_error())?;
        match timeout {
            PublishTimeout::NonBlocking => match tx.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Err(self.timeout_error()),
                Err(TrySendError::Closed(_)) => return Err(self.closed_error()),
            },
            PublishTimeout::Blocking => {
                tokio::select! {
                    sent = tx.send(item) => sent.map_err(|_| self.closed_error())?,
                    _ = self.token.cancelled() => return Err(self.closed_error()),
                }
            }
            PublishTimeout::Bounded(limit) => {
                tokio::select! {
                    sent = tokio::time::timeout(limit, tx.send(item)) => match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Err(self.closed_error()),
                        Err(_) => return Err(self.timeout_error()),
                    },
                    _ = self.token.cancelled() => return Err(self.closed_error()),
                }
            }
        }
        Ok(())
    }

    fn closed_error(&self) -> HubError {
        HubError::SubscriberClosed {
            topic: self.topic.clone(),
            subscriber: self.name.clone(),
        }
    }

    fn timeout_error(&self) -> HubError {
        HubError::DeliveryTimeout {
            topic: self.topic.clone(),
            subscriber: self.name.clone(),
        }
    }
}
