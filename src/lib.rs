//! # a3s-flowhub
//!
//! Typed, persistent, topic-based publish/subscribe for the A3S ecosystem.
//!
//! ## Overview
//!
//! Producers publish strongly-typed records into named topics. Subscribers
//! attach with a replay policy (restart at the tail, resume from their last
//! position, or attach quickly without cursor bookkeeping) and receive an
//! ordered stream of items. Durable topics append every item to a flow log
//! keyed by `(epoch, sequence)`, and two hubs can be federated over TCP.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_flowhub::{HubConfig, HubError, LocalHub, PersistentData, PublishTimeout, ResumeKind, TypeRegistry};
//!
//! #[derive(Debug, Default, Clone)]
//! struct Tick(u64);
//!
//! impl PersistentData for Tick {
//!     fn serialize(&self) -> Vec<u8> {
//!         self.0.to_le_bytes().to_vec()
//!     }
//!
//!     fn deserialize(&mut self, data: &[u8]) -> a3s_flowhub::Result<()> {
//!         let bytes: [u8; 8] = data
//!             .try_into()
//!             .map_err(|_| HubError::Decode("bad tick".to_string()))?;
//!         self.0 = u64::from_le_bytes(bytes);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> a3s_flowhub::Result<()> {
//! let registry = Arc::new(TypeRegistry::new());
//! registry.register_default::<Tick>()?;
//!
//! let hub = LocalHub::<Tick>::new(HubConfig::in_memory("quotes"), registry)?;
//! let mut sub = hub.subscribe("ticks", "printer", ResumeKind::Restart).await?;
//!
//! hub.publish("ticks", Tick(42), PublishTimeout::Blocking).await?;
//! if let Some(item) = sub.recv().await {
//!     println!("{} -> {:?}", item.position(), item.data);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **TypeRegistry**: positional type ids and pooled decode instances
//! - **FlowItem** / **Position**: the ordered unit and its record format
//! - **FlowStore**: append-only flow log with sequential replay
//! - **LocalHub**: topics, subscriptions, fan-out and replay
//! - **RemoteHub**: TCP bridge federating two hubs
//! - **FlowHub** trait: common surface of both hubs

pub mod config;
pub mod error;
pub mod flow;
pub mod hub;
pub mod registry;
pub mod state;
pub mod storage;
pub mod types;

// Re-export core types
pub use config::{HubConfig, RemoteConfig};
pub use error::{HubError, Result};
pub use flow::{FlowItem, Position};
pub use hub::remote::{HubClient, HubServer, RemoteStream};
pub use hub::{FlowHub, LocalHub, RemoteHub, Subscription};
pub use registry::{PersistentData, Pooled, Tid, TypeRegistry};
pub use state::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use storage::{FlowStore, OpenMode};
pub use types::{
    DeliveryFailure, FailurePolicy, PublishReceipt, PublishTimeout, ResumeKind,
    SubscriptionState, TopicInfo,
};
