//! Remote hub integration tests
//!
//! Two hubs federated over loopback TCP: an upstream hub serving its topics
//! and an edge hub mirroring them into its own local topics.

use a3s_flowhub::{
    FlowHub, HubClient, HubConfig, HubError, LocalHub, PersistentData, PublishTimeout,
    RemoteConfig, RemoteHub, ResumeKind, Subscription, TypeRegistry,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq)]
struct Quote {
    symbol: String,
    price: u32,
}

impl PersistentData for Quote {
    fn serialize(&self) -> Vec<u8> {
        let mut out = self.price.to_le_bytes().to_vec();
        out.extend_from_slice(self.symbol.as_bytes());
        out
    }

    fn deserialize(&mut self, data: &[u8]) -> a3s_flowhub::Result<()> {
        if data.len() < 4 {
            return Err(HubError::Decode("Quote too short".to_string()));
        }
        self.price = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.symbol =
            String::from_utf8(data[4..].to_vec()).map_err(|e| HubError::Decode(e.to_string()))?;
        Ok(())
    }
}

fn quote(symbol: &str, price: u32) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        price,
    }
}

fn registry() -> Arc<TypeRegistry> {
    let reg = TypeRegistry::new();
    reg.register_default::<Quote>().unwrap();
    Arc::new(reg)
}

fn local(name: &str) -> LocalHub<Quote> {
    LocalHub::new(HubConfig::in_memory(name), registry()).unwrap()
}

fn remote_config() -> RemoteConfig {
    RemoteConfig {
        connect_timeout_secs: 2,
        shutdown_timeout_secs: 2,
        ..Default::default()
    }
}

async fn upstream() -> (RemoteHub<Quote>, SocketAddr) {
    let hub = RemoteHub::new(local("upstream"), remote_config());
    let addr = hub.start_server("127.0.0.1:0").await.unwrap();
    (hub, addr)
}

async fn edge(name: &str, addr: SocketAddr) -> RemoteHub<Quote> {
    let hub = RemoteHub::new(local(name), remote_config());
    hub.start_client(&addr.to_string()).await.unwrap();
    hub
}

async fn next(sub: &mut Subscription<Quote>) -> Quote {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for item")
        .expect("subscription closed")
        .data
        .clone()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

// ─── Federation ──────────────────────────────────────────────────

#[tokio::test]
async fn test_items_flow_from_upstream_to_edge() {
    let (up, addr) = upstream().await;
    let edge = edge("edge", addr).await;

    let mut sub = edge
        .subscribe("quotes", "desk", ResumeKind::Restart)
        .await
        .unwrap();
    assert_eq!(up.local().subscription_count(), 1);

    for price in 1..=20 {
        up.publish("quotes", quote("600519", price), PublishTimeout::Blocking)
            .await
            .unwrap();
    }

    for price in 1..=20 {
        assert_eq!(next(&mut sub).await, quote("600519", price));
    }

    // Mirrored items land in the edge hub's own topic
    assert_eq!(edge.topics()["quotes"].tail.sequence, 20);

    edge.stop().await.unwrap();
    up.stop().await.unwrap();
}

#[tokio::test]
async fn test_edge_local_publish_still_delivered() {
    let (up, addr) = upstream().await;
    let edge = edge("edge", addr).await;

    let mut sub = edge
        .subscribe("quotes", "desk", ResumeKind::Quick)
        .await
        .unwrap();
    edge.publish("quotes", quote("local", 1), PublishTimeout::Blocking)
        .await
        .unwrap();
    assert_eq!(next(&mut sub).await, quote("local", 1));

    edge.stop().await.unwrap();
    up.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_duplicate_subscriber_rejected() {
    let (up, addr) = upstream().await;
    let first = edge("edge-1", addr).await;
    let second = edge("edge-2", addr).await;

    let _sub = first
        .subscribe("quotes", "desk", ResumeKind::Restart)
        .await
        .unwrap();

    let err = second
        .subscribe("quotes", "desk", ResumeKind::Restart)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::AlreadySubscribed { .. }));

    // Local half was rolled back, so the name is free on the second edge
    assert_eq!(second.local().subscription_count(), 0);
    assert_eq!(up.local().subscription_count(), 1);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
    up.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_tears_down_remote_link() {
    let (up, addr) = upstream().await;
    let edge = edge("edge", addr).await;

    let mut sub = edge
        .subscribe("quotes", "desk", ResumeKind::Restart)
        .await
        .unwrap();
    assert_eq!(up.local().subscription_count(), 1);

    edge.unsubscribe(sub.id()).await.unwrap();
    assert!(sub.recv().await.is_none());

    let upstream_local = up.local().clone();
    wait_until(move || upstream_local.subscription_count() == 0).await;

    // The subscriber name can attach again end to end
    edge.subscribe("quotes", "desk", ResumeKind::Restart)
        .await
        .unwrap();

    edge.stop().await.unwrap();
    up.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_peer_fails_startup() {
    // Bind then drop to get a port with no listener
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let hub = RemoteHub::new(local("edge"), remote_config());
    let err = hub.start_client(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, HubError::Connection(_) | HubError::Timeout(_)));
}

// ─── Bridge Client ───────────────────────────────────────────────

#[tokio::test]
async fn test_get_topics_returns_metadata() {
    let (up, addr) = upstream().await;
    let mut metadata = HashMap::new();
    metadata.insert("venue".to_string(), "xshg".to_string());
    up.local().declare_topic("quotes", metadata, false).unwrap();
    up.local().declare_topic("trades", HashMap::new(), false).unwrap();

    let edge = edge("edge", addr).await;
    let topics = edge.remote_topics().await.unwrap();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics["quotes"]["venue"], "xshg");
    assert!(topics["trades"].is_empty());

    edge.stop().await.unwrap();
    up.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_stream_and_unsubscribe() {
    let (up, addr) = upstream().await;
    let client = HubClient::connect(addr.to_string(), Duration::from_secs(2))
        .await
        .unwrap();
    let reg = registry();

    let mut stream = client
        .subscribe("quotes", "peek", ResumeKind::Quick)
        .await
        .unwrap();
    up.publish("quotes", quote("000001", 7), PublishTimeout::Blocking)
        .await
        .unwrap();

    let (topic, item) = stream.next(&reg).await.unwrap().unwrap();
    assert_eq!(topic, "quotes");
    assert_eq!(item.sequence, 1);
    assert_eq!(item.data.downcast_ref::<Quote>(), Some(&quote("000001", 7)));
    drop(item);

    client.unsubscribe("quotes", stream.sub_id()).await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(5), stream.next(&reg))
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none());

    up.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_cursor_covers_frames_sent() {
    let dir = tempfile::tempdir().unwrap();
    let durable = LocalHub::new(HubConfig::durable("upstream", dir.path()), registry()).unwrap();
    let up = RemoteHub::new(durable, remote_config());
    let addr = up.start_server("127.0.0.1:0").await.unwrap();

    let client = HubClient::connect(addr.to_string(), Duration::from_secs(2))
        .await
        .unwrap();
    let reg = registry();
    let mut stream = client
        .subscribe("quotes", "mirror", ResumeKind::Restart)
        .await
        .unwrap();
    for price in 1..=3 {
        up.publish("quotes", quote("600000", price), PublishTimeout::Blocking)
            .await
            .unwrap();
    }
    for price in 1..=3 {
        let (_, item) = stream.next(&reg).await.unwrap().unwrap();
        assert_eq!(item.data.downcast_ref::<Quote>(), Some(&quote("600000", price)));
    }
    stream.close().await;

    let upstream_local = up.local().clone();
    wait_until(move || upstream_local.subscription_count() == 0).await;

    // Resuming under the same name continues after what went over the wire
    let mut sub = up
        .local()
        .subscribe("quotes", "mirror", ResumeKind::Resume)
        .await
        .unwrap();
    up.publish("quotes", quote("600000", 4), PublishTimeout::Blocking)
        .await
        .unwrap();
    assert_eq!(next(&mut sub).await, quote("600000", 4));

    up.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_unsubscribe_errors() {
    let (up, addr) = upstream().await;
    let client = HubClient::connect(addr.to_string(), Duration::from_secs(2))
        .await
        .unwrap();

    let err = client
        .unsubscribe("quotes", &uuid::Uuid::new_v4().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::SubscriptionNotFound(_)));

    let err = client.unsubscribe("quotes", "not-a-uuid").await.unwrap_err();
    assert!(matches!(err, HubError::Remote { code: 2, .. }));

    up.stop().await.unwrap();
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_start_from_config_and_stop_is_idempotent() {
    let config = RemoteConfig {
        listen: Some("127.0.0.1:0".to_string()),
        ..remote_config()
    };
    let hub = RemoteHub::start(local("upstream"), config).await.unwrap();
    let addr = hub.server_addr().unwrap();

    HubClient::connect(addr.to_string(), Duration::from_secs(2))
        .await
        .unwrap();

    hub.stop().await.unwrap();
    hub.stop().await.unwrap();
    assert!(hub.local().is_stopped());
    assert!(hub.server_addr().is_none());
    assert!(matches!(
        hub.subscribe("quotes", "late", ResumeKind::Quick).await.unwrap_err(),
        HubError::Stopped
    ));
}

#[tokio::test]
async fn test_remote_hub_as_trait_object() {
    let (up, _addr) = upstream().await;
    let hub: Arc<dyn FlowHub<Quote>> = Arc::new(up);
    assert_eq!(hub.name(), "upstream");

    let mut sub = hub.subscribe("quotes", "s", ResumeKind::Quick).await.unwrap();
    hub.publish("quotes", quote("x", 1), PublishTimeout::Blocking)
        .await
        .unwrap();
    assert_eq!(next(&mut sub).await, quote("x", 1));
    hub.release().await.unwrap();
}
