//! Core value types shared by the local hub and the remote bridge
//!
//! Serializable types use camelCase JSON for wire compatibility.

use crate::error::HubError;
use crate::flow::Position;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Replay policy chosen by a subscriber at attach time
///
/// Wire values: Restart = 0, Resume = 1, Quick = 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResumeKind {
    /// Deliver from the current tail; backlog is skipped and the durable cursor reset
    #[default]
    Restart,
    /// Replay from the subscriber's durable cursor, then go live
    Resume,
    /// Go live immediately without touching durable cursor state
    Quick,
}

impl ResumeKind {
    /// Wire representation
    pub fn as_i32(self) -> i32 {
        match self {
            ResumeKind::Restart => 0,
            ResumeKind::Resume => 1,
            ResumeKind::Quick => 2,
        }
    }
}

impl TryFrom<i32> for ResumeKind {
    type Error = HubError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResumeKind::Restart),
            1 => Ok(ResumeKind::Resume),
            2 => Ok(ResumeKind::Quick),
            other => Err(HubError::Protocol(format!("Unknown resume type: {}", other))),
        }
    }
}

impl fmt::Display for ResumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeKind::Restart => write!(f, "restart"),
            ResumeKind::Resume => write!(f, "resume"),
            ResumeKind::Quick => write!(f, "quick"),
        }
    }
}

/// How long a publish may wait on each subscriber's full channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishTimeout {
    /// Wait until delivered; a slow subscriber back-pressures the publisher
    Blocking,
    /// Single best-effort attempt
    NonBlocking,
    /// Wait at most this long
    Bounded(Duration),
}

impl PublishTimeout {
    /// Map the signed convention: negative blocks, zero never waits, positive bounds
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => PublishTimeout::Blocking,
            0 => PublishTimeout::NonBlocking,
            m => PublishTimeout::Bounded(Duration::from_millis(m as u64)),
        }
    }
}

impl From<Duration> for PublishTimeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            PublishTimeout::NonBlocking
        } else {
            PublishTimeout::Bounded(d)
        }
    }
}

/// What the hub does with a subscriber whose delivery failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Keep the subscription; the item is lost for that subscriber only
    #[default]
    Drop,
    /// Unsubscribe the failing subscriber and close its channel
    Disconnect,
}

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Attached,
    Replaying,
    Live,
    Closed,
}

/// Point-in-time description of a topic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInfo {
    /// Topic name
    pub name: String,

    /// Declared key-value metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Whether published items are written to a flow log
    pub durable: bool,

    /// Number of attached subscriptions
    pub subscribers: usize,

    /// Position of the last published item
    pub tail: Position,
}

/// Per-subscriber delivery failure reported by a publish
#[derive(Debug)]
pub struct DeliveryFailure {
    pub subscription_id: uuid::Uuid,
    pub subscriber: String,
    pub error: HubError,
}

/// Outcome of a publish
#[derive(Debug)]
pub struct PublishReceipt {
    /// Topic the item was published to
    pub topic: String,

    /// Position assigned to the item
    pub position: Position,

    /// Number of subscribers the item was enqueued for
    pub delivered: usize,

    /// Subscribers that could not take the item
    pub failures: Vec<DeliveryFailure>,
}

impl PublishReceipt {
    /// True when every live subscriber received the item
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_kind_wire_values() {
        for kind in [ResumeKind::Restart, ResumeKind::Resume, ResumeKind::Quick] {
            assert_eq!(ResumeKind::try_from(kind.as_i32()).unwrap(), kind);
        }
        assert_eq!(ResumeKind::Resume.as_i32(), 1);
        assert!(ResumeKind::try_from(7).is_err());
    }

    #[test]
    fn test_resume_kind_serialization() {
        let json = serde_json::to_string(&ResumeKind::Quick).unwrap();
        assert_eq!(json, "\"quick\"");
        assert_eq!(ResumeKind::default(), ResumeKind::Restart);
    }

    #[test]
    fn test_publish_timeout_from_millis() {
        assert_eq!(PublishTimeout::from_millis(-1), PublishTimeout::Blocking);
        assert_eq!(PublishTimeout::from_millis(0), PublishTimeout::NonBlocking);
        assert_eq!(
            PublishTimeout::from_millis(250),
            PublishTimeout::Bounded(Duration::from_millis(250))
        );
        assert_eq!(PublishTimeout::from(Duration::ZERO), PublishTimeout::NonBlocking);
    }

    #[test]
    fn test_failure_policy_serialization() {
        let json = serde_json::to_string(&FailurePolicy::Disconnect).unwrap();
        assert_eq!(json, "\"disconnect\"");
        let parsed: FailurePolicy = serde_json::from_str("\"drop\"").unwrap();
        assert_eq!(parsed, FailurePolicy::Drop);
    }

    #[test]
    fn test_topic_info_serialization() {
        let mut info = TopicInfo {
            name: "ticks".to_string(),
            durable: true,
            subscribers: 2,
            tail: Position::new(1, 42),
            ..Default::default()
        };
        info.metadata.insert("kind".to_string(), "market".to_string());

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"durable\":true"));
        assert!(json.contains("\"tail\":{\"epoch\":1,\"sequence\":42}"));

        let parsed: TopicInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
