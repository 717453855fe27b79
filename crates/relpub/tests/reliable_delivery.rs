// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::too_many_lines)] // Test scenarios

//! End-to-end publisher/subscriber tests over a lossy memory transport.
//!
//! Loss is injected with feed filters; time runs on tokio's paused clock so
//! heartbeats, retries and cache expiry are deterministic.

use parking_lot::Mutex;
use relpub::transport::memory::MemoryTransport;
use relpub::{
    CacheError, Delivery, Endpoint, Hooks, Publisher, ReceivedMessage, ReliabilityConfig,
    Subscriber,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> Arc<ReliabilityConfig> {
    // deadline 2s, heartbeat 200ms, message cache 10s
    Arc::new(
        ReliabilityConfig::new(Duration::from_millis(1000), Duration::from_millis(200))
            .expect("valid config"),
    )
}

fn endpoint(name: &str) -> Endpoint {
    Endpoint::new(format!("mem://{}", name), format!("mem://{}/recovery", name))
}

/// Frame filter dropping PUBLISH frames of `topic` whose nonce is in `lost`.
fn drop_publishes(topic: &'static str, lost: Vec<u64>) -> impl Fn(&[String]) -> bool + Send + Sync {
    move |frames: &[String]| {
        let is_lost = frames.first().map(String::as_str) == Some(topic)
            && frames.get(1).map(String::as_str) == Some("PUBLISH")
            && frames
                .get(2)
                .and_then(|n| n.parse::<u64>().ok())
                .is_some_and(|n| lost.contains(&n));
        !is_lost
    }
}

type Inbox = Arc<Mutex<Vec<ReceivedMessage>>>;

fn collector() -> (Inbox, impl Fn(&ReceivedMessage) + Send + Sync + 'static) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    (inbox, move |msg: &ReceivedMessage| sink.lock().push(msg.clone()))
}

fn nonces(inbox: &Inbox, delivery: Delivery) -> Vec<u64> {
    inbox
        .lock()
        .iter()
        .filter(|m| m.delivery == delivery)
        .map(|m| m.nonce)
        .collect()
}

async fn pause(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_gap_recovered_exactly_once() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    transport.set_feed_filter(drop_publishes("prices", vec![3]));
    let ep = endpoint("gap");

    let publisher = Publisher::new(config(), transport.clone(), ep.clone());
    publisher.open().await.expect("open");
    let subscriber = Subscriber::new(config(), transport.clone());
    let (inbox, callback) = collector();
    subscriber.subscribe(&ep, "prices", callback).await.expect("subscribe");

    for i in 0..5 {
        publisher.publish("prices", format!("p{}", i)).expect("publish");
    }
    pause(100).await;

    assert_eq!(nonces(&inbox, Delivery::Live), vec![0, 1, 2, 4]);
    assert_eq!(nonces(&inbox, Delivery::Recovered), vec![3]);
    let recovered = inbox
        .lock()
        .iter()
        .find(|m| m.nonce == 3)
        .cloned()
        .expect("nonce 3");
    assert_eq!(recovered.payload, "p3");
    assert!(recovered.is_recovered());

    let stats = subscriber.stats();
    assert_eq!(stats.gaps_detected, 1);
    assert_eq!(stats.delivered(), 5);
    assert_eq!(publisher.stats().recovered_served, 1);

    subscriber.close().await;
    publisher.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn test_trailing_loss_recovered_by_heartbeat() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    transport.set_feed_filter(drop_publishes("tail", vec![2]));
    let ep = endpoint("tail");

    let publisher = Publisher::new(config(), transport.clone(), ep.clone());
    publisher.open().await.expect("open");
    let subscriber = Subscriber::new(config(), transport.clone());
    let (inbox, callback) = collector();
    subscriber.subscribe(&ep, "tail", callback).await.expect("subscribe");

    for i in 0..3 {
        publisher.publish("tail", format!("t{}", i)).expect("publish");
    }
    pause(50).await;
    assert_eq!(nonces(&inbox, Delivery::Live), vec![0, 1]);

    // first heartbeat at 200ms announces nonce 2
    pause(300).await;
    assert_eq!(nonces(&inbox, Delivery::Recovered), vec![2]);
    assert_eq!(subscriber.last_seen(&ep, "tail"), Some(2));

    // later heartbeats change nothing
    pause(1000).await;
    assert_eq!(inbox.lock().len(), 3);

    subscriber.close().await;
    publisher.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn test_every_message_delivered_once_under_loss() {
    init_tracing();
    const TOTAL: u64 = 60;
    let lost: Vec<u64> = (0..TOTAL).filter(|n| n % 4 == 1 || n % 7 == 3).collect();

    let transport = Arc::new(MemoryTransport::new());
    transport.set_feed_filter(drop_publishes("bulk", lost.clone()));
    let ep = endpoint("bulk");

    let publisher = Publisher::new(config(), transport.clone(), ep.clone());
    publisher.open().await.expect("open");
    let subscriber = Subscriber::new(config(), transport.clone());
    let (inbox, callback) = collector();
    subscriber.subscribe(&ep, "bulk", callback).await.expect("subscribe");

    for i in 0..TOTAL {
        publisher.publish("bulk", format!("b{}", i)).expect("publish");
        if i % 10 == 9 {
            pause(20).await;
        }
    }
    pause(1000).await;

    let live = nonces(&inbox, Delivery::Live);
    assert!(live.windows(2).all(|w| w[0] < w[1]), "live deliveries ascend");
    assert!(live.iter().all(|n| !lost.contains(n)));

    let mut all: Vec<u64> = inbox.lock().iter().map(|m| m.nonce).collect();
    assert_eq!(all.len() as u64, TOTAL, "no duplicates, nothing missing");
    all.sort_unstable();
    assert_eq!(all, (0..TOTAL).collect::<Vec<_>>());

    let stats = subscriber.stats();
    assert_eq!(stats.recovered, lost.len() as u64);
    assert_eq!(stats.cache_misses, 0);

    subscriber.close().await;
    publisher.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn test_expired_message_reported_not_skipped_silently() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    // lose everything after nonce 0, heartbeats included
    transport.set_feed_filter(|frames: &[String]| frames.get(2).map(String::as_str) == Some("0"));
    let ep = endpoint("expiry");
    let cfg = config();

    let errors = Arc::new(Mutex::new(Vec::<CacheError>::new()));
    let errors_hook = errors.clone();
    let hooks = Hooks::new().on_cache_error(move |e| errors_hook.lock().push(e.clone()));

    let publisher = Publisher::new(cfg.clone(), transport.clone(), ep.clone());
    publisher.open().await.expect("open");
    let subscriber = Subscriber::new(cfg.clone(), transport.clone()).with_hooks(hooks);
    let (inbox, callback) = collector();
    subscriber.subscribe(&ep, "fx", callback).await.expect("subscribe");

    publisher.publish("fx", "first").expect("publish");
    publisher.publish("fx", "lost").expect("publish");
    tokio::time::sleep(cfg.publisher_cache_expiry() + cfg.expiry_buffer() + Duration::from_millis(100)).await;
    assert_eq!(publisher.cached_messages("fx"), 0);

    transport.clear_filters();
    publisher.publish("fx", "third").expect("publish");
    pause(100).await;

    let payloads: Vec<String> = inbox.lock().iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, vec!["first".to_string(), "third".to_string()]);
    assert_eq!(
        *errors.lock(),
        vec![CacheError {
            endpoint: ep.publish_address().to_string(),
            nonce: 1
        }]
    );
    assert_eq!(subscriber.stats().cache_misses, 1);
    assert_eq!(publisher.stats().cache_misses, 1);

    subscriber.close().await;
    publisher.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn test_endpoints_and_topics_are_independent() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let (ep_a, ep_b) = (endpoint("a"), endpoint("b"));

    let pub_a = Publisher::new(config(), transport.clone(), ep_a.clone());
    let pub_b = Publisher::new(config(), transport.clone(), ep_b.clone());
    pub_a.open().await.expect("open a");
    pub_b.open().await.expect("open b");

    let subscriber = Subscriber::new(config(), transport.clone());
    let (inbox_a, cb_a) = collector();
    let (inbox_b, cb_b) = collector();
    let (inbox_c, cb_c) = collector();
    subscriber.subscribe(&ep_a, "x", cb_a).await.expect("subscribe");
    subscriber.subscribe(&ep_b, "x", cb_b).await.expect("subscribe");
    subscriber.subscribe(&ep_a, "y", cb_c).await.expect("subscribe");

    pub_a.publish("x", "a0").expect("publish");
    pub_a.publish("x", "a1").expect("publish");
    pub_b.publish("x", "b0").expect("publish");
    pub_a.publish("y", "y0").expect("publish");
    pause(50).await;

    assert_eq!(nonces(&inbox_a, Delivery::Live), vec![0, 1]);
    assert_eq!(nonces(&inbox_b, Delivery::Live), vec![0]);
    assert_eq!(nonces(&inbox_c, Delivery::Live), vec![0]);
    assert_eq!(subscriber.stats().gaps_detected, 0);

    subscriber.close().await;
    pub_a.close().await.expect("close a");
    pub_b.close().await.expect("close b");
}

#[tokio::test(start_paused = true)]
async fn test_no_callbacks_after_close() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let ep = endpoint("closing");

    let publisher = Publisher::new(config(), transport.clone(), ep.clone());
    publisher.open().await.expect("open");
    let subscriber = Subscriber::new(config(), transport.clone());
    let (inbox, callback) = collector();
    subscriber.subscribe(&ep, "t", callback).await.expect("subscribe");

    publisher.publish("t", "before").expect("publish");
    pause(10).await;
    subscriber.close().await;
    assert_eq!(subscriber.subscription_count(), 0);

    publisher.publish("t", "after").expect("publish");
    pause(500).await;
    assert_eq!(inbox.lock().len(), 1);

    publisher.close().await.expect("close");
    assert!(!publisher.is_open());
}
