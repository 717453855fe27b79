// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message publisher.
//!
//! Assigns per-topic nonces, keeps every published envelope for
//! `publisher_cache_expiry`, announces the latest nonce of idle topics through
//! heartbeats, and answers recovery requests from the cache over a companion
//! [`ResponseServer`].

use crate::config::ReliabilityConfig;
use crate::hooks::{HighWaterMark, Hooks};
use crate::protocol::{
    encode_recovery_response, Envelope, ProtocolError, RecoveredItem, RecoveryRequest,
};
use crate::reliability::{ExpiryWindowCache, SendTicket, SerializedSendQueue};
use crate::rpc::{RequestRejected, ResponseServer, ServerError};
use crate::stats::{PublisherStats, PublisherStatsSnapshot};
use crate::transport::{Endpoint, Multipart, PublishSocket, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Publisher errors.
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Publisher already open")]
    AlreadyOpen,

    #[error("Publisher closed")]
    Closed,

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Recovery responder error: {0}")]
    Server(#[from] ServerError),
}

/// Per-topic publishing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicDetails {
    /// Nonce of the most recent PUBLISH.
    pub latest_nonce: u64,
    /// When the most recent PUBLISH was queued.
    pub latest_timestamp: Instant,
}

struct TopicState {
    details: TopicDetails,
    cache: ExpiryWindowCache<u64, Envelope>,
}

struct PublisherShared {
    topics: Mutex<HashMap<String, TopicState>>,
    /// Present while open.
    queue: Mutex<Option<Arc<SerializedSendQueue<Multipart>>>>,
    config: Arc<ReliabilityConfig>,
    stats: Arc<PublisherStats>,
}

struct OpenState {
    socket: Arc<dyn PublishSocket>,
    server: ResponseServer,
    heartbeat: JoinHandle<()>,
}

/// Reliable publisher bound to one [`Endpoint`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use relpub::transport::memory::MemoryTransport;
/// use relpub::{Endpoint, Publisher, ReliabilityConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(MemoryTransport::new());
/// let endpoint = Endpoint::new("mem://orders", "mem://orders/recovery");
/// let publisher = Publisher::new(Arc::new(ReliabilityConfig::default()), transport, endpoint);
///
/// publisher.open().await?;
/// let ticket = publisher.publish("orders.new", "{\"id\":1}")?;
/// ticket.await?;
/// publisher.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Publisher {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    hooks: Hooks,
    shared: Arc<PublisherShared>,
    state: tokio::sync::Mutex<Option<OpenState>>,
}

impl Publisher {
    /// Create a closed publisher.
    pub fn new(config: Arc<ReliabilityConfig>, transport: Arc<dyn Transport>, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            transport,
            hooks: Hooks::default(),
            shared: Arc::new(PublisherShared {
                topics: Mutex::new(HashMap::new()),
                queue: Mutex::new(None),
                config,
                stats: Arc::new(PublisherStats::new()),
            }),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Install the back-pressure handler.
    ///
    /// Only `on_high_water_mark` is used: cache errors are raised on the
    /// subscriber that failed to recover, not on the publisher.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Bind the feed, start the recovery responder and the heartbeat loop.
    pub async fn open(&self) -> Result<(), PublisherError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(PublisherError::AlreadyOpen);
        }

        let hooks = self.counting_hooks();
        let socket: Arc<dyn PublishSocket> = Arc::from(
            self.transport
                .bind_publisher(self.endpoint.publish_address())
                .await?,
        );

        let responder = {
            let shared = Arc::clone(&self.shared);
            move |payload: String| {
                let shared = Arc::clone(&shared);
                async move { shared.recover(&payload) }
            }
        };
        let server = match ResponseServer::bind(
            self.transport.as_ref(),
            self.endpoint.request_address(),
            &self.shared.config,
            hooks.clone(),
            responder,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                socket.close().await;
                return Err(e.into());
            }
        };

        let queue = Arc::new(SerializedSendQueue::new(Arc::clone(&socket), hooks));
        *self.shared.queue.lock() = Some(queue);

        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&self.shared)));

        tracing::info!("publisher open on {}", self.endpoint);
        *state = Some(OpenState {
            socket,
            server,
            heartbeat,
        });
        Ok(())
    }

    /// Queue `payload` on `topic` under the topic's next nonce.
    ///
    /// Returns once the message is cached and queued; await the ticket for
    /// send completion. The first nonce of a topic is 0.
    pub fn publish(&self, topic: &str, payload: impl Into<String>) -> Result<SendTicket, PublisherError> {
        if topic.is_empty() {
            return Err(PublisherError::InvalidTopic(topic.to_string()));
        }
        let queue = self
            .shared
            .queue
            .lock()
            .clone()
            .ok_or(PublisherError::Closed)?;

        let config = &self.shared.config;
        let now = Instant::now();
        let mut topics = self.shared.topics.lock();
        let nonce = match topics.get_mut(topic) {
            Some(state) => {
                state.details.latest_nonce += 1;
                state.details.latest_timestamp = now;
                state.details.latest_nonce
            }
            None => {
                tracing::debug!("new topic {:?} on {}", topic, self.endpoint);
                topics.insert(
                    topic.to_string(),
                    TopicState {
                        details: TopicDetails {
                            latest_nonce: 0,
                            latest_timestamp: now,
                        },
                        cache: ExpiryWindowCache::with_buffer(
                            config.publisher_cache_expiry(),
                            config.expiry_buffer(),
                        ),
                    },
                );
                0
            }
        };

        let envelope = Envelope::publish(topic, nonce, payload);
        let label = HighWaterMark {
            target: envelope.topic.clone(),
            nonce,
            payload: envelope.payload.clone(),
        };
        let frames = envelope.to_frames();
        if let Some(state) = topics.get(topic) {
            state.cache.set(nonce, envelope);
        }

        // Enqueue under the topics lock so queue order matches nonce order.
        let ticket = queue.enqueue(frames, label);
        drop(topics);

        self.shared.stats.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("queued {}#{}", topic, nonce);
        Ok(ticket)
    }

    /// Stop the responder, cancel heartbeats, drop cached messages and
    /// release the feed.
    ///
    /// Returns the fault that stopped the responder, if any.
    pub async fn close(&self) -> Result<(), PublisherError> {
        let Some(open) = self.state.lock().await.take() else {
            return Err(PublisherError::Closed);
        };

        let responder = open.server.close().await;
        open.heartbeat.abort();
        if let Some(queue) = self.shared.queue.lock().take() {
            queue.close();
        }
        for state in self.shared.topics.lock().values() {
            state.cache.clear();
        }
        open.socket.close().await;
        tracing::info!("publisher on {} closed", self.endpoint);

        responder.map_err(PublisherError::from)
    }

    pub fn is_open(&self) -> bool {
        self.shared.queue.lock().is_some()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Publishing state of `topic`, if anything was published on it.
    pub fn topic_details(&self, topic: &str) -> Option<TopicDetails> {
        self.shared.topics.lock().get(topic).map(|state| state.details)
    }

    /// Topics published so far.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of envelopes currently cached for `topic`.
    pub fn cached_messages(&self, topic: &str) -> usize {
        self.shared
            .topics
            .lock()
            .get(topic)
            .map_or(0, |state| state.cache.len())
    }

    /// Get snapshot of current stats.
    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// User hooks plus the back-pressure counter.
    fn counting_hooks(&self) -> Hooks {
        let user = self.hooks.clone();
        let stats = Arc::clone(&self.shared.stats);
        Hooks::new().on_high_water_mark(move |warning| {
            stats.high_water_marks.fetch_add(1, Ordering::Relaxed);
            user.high_water_mark(warning);
        })
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(open) = self.state.get_mut().take() {
            open.heartbeat.abort();
        }
        if let Some(queue) = self.shared.queue.lock().take() {
            queue.close();
        }
    }
}

impl PublisherShared {
    /// Answer a recovery request from the topic cache.
    fn recover(&self, payload: &str) -> Result<String, RequestRejected> {
        let request = RecoveryRequest::decode(payload)?;
        let topics = self.topics.lock();
        let Some(state) = topics.get(&request.topic) else {
            tracing::debug!("recovery request for unknown topic {:?}", request.topic);
            return Err(ProtocolError::UnknownTopic(request.topic).into());
        };

        self.stats.recovery_requests.fetch_add(1, Ordering::Relaxed);
        let items: Vec<RecoveredItem> = request
            .nonces
            .iter()
            .map(|nonce| match state.cache.get(nonce) {
                Some(envelope) => RecoveredItem::Found(envelope),
                None => RecoveredItem::Expired,
            })
            .collect();

        let expired = items
            .iter()
            .filter(|item| matches!(item, RecoveredItem::Expired))
            .count() as u64;
        let found = items.len() as u64 - expired;
        self.stats.recovered_served.fetch_add(found, Ordering::Relaxed);
        self.stats.cache_misses.fetch_add(expired, Ordering::Relaxed);
        tracing::debug!(
            "recovery for {:?}: {} found, {} expired",
            request.topic,
            found,
            expired
        );

        Ok(encode_recovery_response(&items))
    }

    /// Queue a heartbeat for every topic idle for at least `interval`.
    fn emit_heartbeats(&self) {
        let Some(queue) = self.queue.lock().clone() else {
            return;
        };
        let interval = self.config.heartbeat_interval();
        let now = Instant::now();

        let topics = self.topics.lock();
        for (topic, state) in topics.iter() {
            let details = state.details;
            if details.latest_timestamp + interval > now {
                continue;
            }
            let envelope = Envelope::heartbeat(topic.as_str(), details.latest_nonce);
            let label = HighWaterMark {
                target: topic.clone(),
                nonce: details.latest_nonce,
                payload: String::new(),
            };
            drop(queue.enqueue(envelope.to_frames(), label));
            self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn heartbeat_loop(shared: Arc<PublisherShared>) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        shared.emit_heartbeats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_recovery_response, MessageKind};
    use crate::rpc::{RequestClient, RequestOutcome};
    use crate::transport::memory::MemoryTransport;
    use crate::transport::SubscribeSocket;
    use std::time::Duration;

    fn config() -> Arc<ReliabilityConfig> {
        Arc::new(
            ReliabilityConfig::new(Duration::from_millis(1000), Duration::from_millis(200))
                .expect("valid config"),
        )
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("mem://pub", "mem://pub/recovery")
    }

    async fn feed_reader(transport: &MemoryTransport, prefix: &str) -> Box<dyn SubscribeSocket> {
        let socket = transport
            .connect_subscriber(endpoint().publish_address())
            .await
            .expect("subscriber");
        socket.subscribe(prefix);
        socket
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_requires_open() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = Publisher::new(config(), transport, endpoint());
        assert!(matches!(
            publisher.publish("t", "x"),
            Err(PublisherError::Closed)
        ));
        assert!(matches!(publisher.close().await, Err(PublisherError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_twice_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = Publisher::new(config(), transport, endpoint());
        publisher.open().await.expect("open");
        assert!(matches!(publisher.open().await, Err(PublisherError::AlreadyOpen)));
        publisher.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_in_use() {
        let transport = Arc::new(MemoryTransport::new());
        let first = Publisher::new(config(), transport.clone(), endpoint());
        let second = Publisher::new(config(), transport, endpoint());
        first.open().await.expect("open");
        assert!(matches!(
            second.open().await,
            Err(PublisherError::Transport(TransportError::AddressInUse(_)))
        ));
        first.close().await.expect("close");
        second.open().await.expect("open after release");
        second.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonces_start_at_zero_and_increase() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = Publisher::new(config(), transport.clone(), endpoint());
        publisher.open().await.expect("open");
        let reader = feed_reader(&transport, "t").await;

        for i in 0..3 {
            publisher.publish("t", format!("m{}", i)).expect("publish").await.expect("sent");
        }
        publisher.publish("other", "x").expect("publish").await.expect("sent");

        for expected in 0..3u64 {
            let envelope = Envelope::from_frames(&reader.recv().await.expect("frame")).expect("envelope");
            assert_eq!(envelope.kind, MessageKind::Publish);
            assert_eq!(envelope.nonce, expected);
            assert_eq!(envelope.payload, format!("m{}", expected));
        }
        assert_eq!(publisher.topic_details("t").map(|d| d.latest_nonce), Some(2));
        assert_eq!(publisher.topic_details("other").map(|d| d.latest_nonce), Some(0));
        assert_eq!(publisher.topics(), vec!["other".to_string(), "t".to_string()]);
        assert_eq!(publisher.stats().published, 4);

        publisher.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_topic_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = Publisher::new(config(), transport, endpoint());
        publisher.open().await.expect("open");
        assert!(matches!(
            publisher.publish("", "x"),
            Err(PublisherError::InvalidTopic(_))
        ));
        publisher.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_announces_latest_nonce_of_idle_topic() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = Publisher::new(config(), transport.clone(), endpoint());
        publisher.open().await.expect("open");
        let reader = feed_reader(&transport, "hb").await;

        publisher.publish("hb", "a").expect("publish");
        publisher.publish("hb", "b").expect("publish");
        reader.recv().await.expect("a");
        reader.recv().await.expect("b");

        // heartbeat tick at 200ms; topic idle since 0
        let frames = reader.recv().await.expect("heartbeat");
        let envelope = Envelope::from_frames(&frames).expect("envelope");
        assert_eq!(envelope.kind, MessageKind::Heartbeat);
        assert_eq!(envelope.nonce, 1);
        assert!(envelope.payload.is_empty());
        assert!(publisher.stats().heartbeats >= 1);

        publisher.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_for_busy_topic() {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = Publisher::new(config(), transport.clone(), endpoint());
        publisher.open().await.expect("open");

        // keep publishing more often than the heartbeat interval
        for i in 0..10 {
            publisher.publish("busy", format!("{}", i)).expect("publish");
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        assert_eq!(publisher.stats().heartbeats, 0);

        publisher.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_responder() {
        let transport = Arc::new(MemoryTransport::new());
        let cfg = config();
        let publisher = Publisher::new(cfg.clone(), transport.clone(), endpoint());
        publisher.open().await.expect("open");
        for i in 0..3 {
            publisher.publish("r", format!("m{}", i)).expect("publish");
        }

        let client = RequestClient::connect(
            transport.as_ref(),
            endpoint().request_address(),
            cfg,
            Hooks::new(),
        )
        .await
        .expect("client");

        let outcome = client
            .send(RecoveryRequest::new("r", vec![1, 2, 7]).encode())
            .await
            .expect("send");
        let items = decode_recovery_response(outcome.response().expect("response")).expect("decode");
        assert_eq!(
            items,
            vec![
                RecoveredItem::Found(Envelope::publish("r", 1, "m1")),
                RecoveredItem::Found(Envelope::publish("r", 2, "m2")),
                RecoveredItem::Expired,
            ]
        );

        let unknown = client
            .send(RecoveryRequest::new("nope", vec![0]).encode())
            .await
            .expect("send");
        assert!(matches!(unknown, RequestOutcome::Rejected { .. }));

        let malformed = client.send("{not json").await.expect("send");
        assert!(matches!(malformed, RequestOutcome::Rejected { .. }));

        let stats = publisher.stats();
        assert_eq!(stats.recovery_requests, 1);
        assert_eq!(stats.recovered_served, 2);
        assert_eq!(stats.cache_misses, 1);

        client.close().await;
        publisher.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiry_and_close_clears() {
        let transport = Arc::new(MemoryTransport::new());
        let cfg = config();
        let publisher = Publisher::new(cfg.clone(), transport, endpoint());
        publisher.open().await.expect("open");

        publisher.publish("c", "old").expect("publish");
        assert_eq!(publisher.cached_messages("c"), 1);
        tokio::time::sleep(cfg.publisher_cache_expiry() + cfg.expiry_buffer() + Duration::from_millis(1)).await;
        assert_eq!(publisher.cached_messages("c"), 0);

        publisher.publish("c", "new").expect("publish");
        assert_eq!(publisher.cached_messages("c"), 1);
        publisher.close().await.expect("close");
        assert_eq!(publisher.cached_messages("c"), 0);
        assert_eq!(publisher.topic_details("c").map(|d| d.latest_nonce), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_water_mark_reaches_hook_and_stats() {
        let transport = Arc::new(MemoryTransport::with_capacity(1));
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let warnings_hook = warnings.clone();
        let hooks = Hooks::new().on_high_water_mark(move |w| warnings_hook.lock().push(w.clone()));
        let publisher = Publisher::new(config(), transport.clone(), endpoint()).with_hooks(hooks);
        publisher.open().await.expect("open");
        let _reader = feed_reader(&transport, "x").await;

        let first = publisher.publish("x", "fits").expect("publish");
        let second = publisher.publish("x", "overflows").expect("publish");
        assert!(first.await.is_ok());
        assert!(matches!(second.await, Err(TransportError::HighWaterMark)));

        assert_eq!(
            *warnings.lock(),
            vec![HighWaterMark {
                target: "x".into(),
                nonce: 1,
                payload: "overflows".into()
            }]
        );
        assert_eq!(publisher.stats().high_water_marks, 1);
        publisher.close().await.expect("back-pressure is not fatal");
    }
}
