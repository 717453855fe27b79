// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable subscriber.
//!
//! One feed socket and one [`RequestClient`] per publisher endpoint, created on
//! the first subscription to that endpoint. A reader task per endpoint feeds
//! every frame through the topic's [`TopicSubscriptionTracker`]; new PUBLISH
//! payloads go to the topic's callbacks, gaps are recovered from the
//! publisher's cache in background tasks.
//!
//! Callbacks run on the reader task (live) or a recovery task (recovered) and
//! never under an internal lock. A recovered message may be delivered after
//! newer live messages of the same topic.

mod tracker;

pub use tracker::{RecoveryHandler, TopicSubscriptionTracker};

use crate::config::ReliabilityConfig;
use crate::hooks::{CacheError, Hooks};
use crate::protocol::{
    decode_recovery_response, Envelope, MessageKind, RecoveredItem, RecoveryRequest,
};
use crate::rpc::{RequestClient, RequestError, RequestOutcome};
use crate::stats::{SubscriberStats, SubscriberStatsSnapshot};
use crate::transport::{Endpoint, SubscribeSocket, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Subscriber errors.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("Subscriber closed")]
    Closed,

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request channel error: {0}")]
    Request(#[from] RequestError),
}

/// Handle returned by [`Subscriber::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// How a message reached the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Straight from the feed.
    Live,
    /// From the publisher's cache after a gap.
    Recovered,
}

/// A message handed to subscription callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub nonce: u64,
    pub payload: String,
    pub delivery: Delivery,
}

impl ReceivedMessage {
    pub fn is_recovered(&self) -> bool {
        self.delivery == Delivery::Recovered
    }
}

type Callback = Arc<dyn Fn(&ReceivedMessage) + Send + Sync>;

struct TopicEntry {
    tracker: TopicSubscriptionTracker,
    callbacks: BTreeMap<SubscriptionId, Callback>,
}

/// Connection to one publisher endpoint.
struct EndpointLink {
    endpoint: Endpoint,
    socket: Arc<dyn SubscribeSocket>,
    client: Arc<RequestClient>,
    topics: Mutex<HashMap<String, TopicEntry>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<SubscriberStats>,
    hooks: Hooks,
}

/// Reliable subscriber over any number of publisher endpoints.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use relpub::transport::memory::MemoryTransport;
/// use relpub::{Endpoint, ReliabilityConfig, Subscriber};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(MemoryTransport::new());
/// let subscriber = Subscriber::new(Arc::new(ReliabilityConfig::default()), transport);
/// let endpoint = Endpoint::new("mem://orders", "mem://orders/recovery");
///
/// let id = subscriber
///     .subscribe(&endpoint, "orders.new", |msg| {
///         println!("#{} {} ({:?})", msg.nonce, msg.payload, msg.delivery);
///     })
///     .await?;
/// // ...
/// subscriber.unsubscribe(id)?;
/// subscriber.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Subscriber {
    config: Arc<ReliabilityConfig>,
    transport: Arc<dyn Transport>,
    hooks: Hooks,
    endpoints: Mutex<HashMap<Endpoint, Arc<EndpointLink>>>,
    subscriptions: Mutex<HashMap<SubscriptionId, (Endpoint, String)>>,
    /// Serializes lazy endpoint connection.
    connecting: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    stats: Arc<SubscriberStats>,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn new(config: Arc<ReliabilityConfig>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            hooks: Hooks::default(),
            endpoints: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            connecting: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            stats: Arc::new(SubscriberStats::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Install back-pressure and cache-error handlers.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Register `callback` for `topic` on `endpoint`.
    ///
    /// Connects to the endpoint on first use. The first subscription to a
    /// topic starts tracking it; messages published earlier are not replayed
    /// to later callbacks.
    pub async fn subscribe<F>(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        callback: F,
    ) -> Result<SubscriptionId, SubscriberError>
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        if topic.is_empty() {
            return Err(SubscriberError::InvalidTopic(topic.to_string()));
        }
        if self.is_closed() {
            return Err(SubscriberError::Closed);
        }

        let link = self.link(endpoint).await?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        {
            let mut topics = link.topics.lock();
            let entry = topics.entry(topic.to_string()).or_insert_with(|| {
                tracing::debug!("tracking {:?} on {}", topic, endpoint);
                link.socket.subscribe(topic);
                TopicEntry {
                    tracker: TopicSubscriptionTracker::new(topic, recovery_handler(&link)),
                    callbacks: BTreeMap::new(),
                }
            });
            entry.callbacks.insert(id, Arc::new(callback));
        }
        self.subscriptions
            .lock()
            .insert(id, (endpoint.clone(), topic.to_string()));

        tracing::debug!("{} subscribed to {:?} on {}", id, topic, endpoint);
        Ok(id)
    }

    /// Remove a subscription. The topic is dropped once its last callback is.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubscriberError> {
        let Some((endpoint, topic)) = self.subscriptions.lock().remove(&id) else {
            return Err(SubscriberError::UnknownSubscription(id));
        };

        let link = self.endpoints.lock().get(&endpoint).cloned();
        if let Some(link) = link {
            let mut topics = link.topics.lock();
            let now_empty = match topics.get_mut(&topic) {
                Some(entry) => {
                    entry.callbacks.remove(&id);
                    entry.callbacks.is_empty()
                }
                None => false,
            };
            if now_empty {
                topics.remove(&topic);
                link.socket.unsubscribe(&topic);
                tracing::debug!("stopped tracking {:?} on {}", topic, endpoint);
            }
        }
        Ok(())
    }

    /// Release every socket and client and forget all subscriptions.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _connecting = self.connecting.lock().await;

        let links: Vec<Arc<EndpointLink>> = self.endpoints.lock().drain().map(|(_, link)| link).collect();
        for link in links {
            link.shutdown().await;
        }
        self.subscriptions.lock().clear();
        tracing::info!("subscriber closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Last nonce seen (or being recovered) for `topic` on `endpoint`.
    pub fn last_seen(&self, endpoint: &Endpoint, topic: &str) -> Option<u64> {
        let link = self.endpoints.lock().get(endpoint).cloned()?;
        let topics = link.topics.lock();
        topics.get(topic).and_then(|entry| entry.tracker.last_seen())
    }

    /// Get snapshot of current stats.
    pub fn stats(&self) -> SubscriberStatsSnapshot {
        self.stats.snapshot()
    }

    /// The link to `endpoint`, connecting it if needed.
    async fn link(&self, endpoint: &Endpoint) -> Result<Arc<EndpointLink>, SubscriberError> {
        let existing = self.endpoints.lock().get(endpoint).cloned();
        if let Some(link) = existing {
            return Ok(link);
        }

        let _connecting = self.connecting.lock().await;
        if self.is_closed() {
            return Err(SubscriberError::Closed);
        }
        let existing = self.endpoints.lock().get(endpoint).cloned();
        if let Some(link) = existing {
            return Ok(link);
        }

        let socket: Arc<dyn SubscribeSocket> = Arc::from(
            self.transport
                .connect_subscriber(endpoint.publish_address())
                .await?,
        );
        let client = match RequestClient::connect(
            self.transport.as_ref(),
            endpoint.request_address(),
            Arc::clone(&self.config),
            self.hooks.clone(),
        )
        .await
        {
            Ok(client) => Arc::new(client),
            Err(e) => {
                socket.close().await;
                return Err(e.into());
            }
        };

        let link = Arc::new(EndpointLink {
            endpoint: endpoint.clone(),
            socket,
            client,
            topics: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
            stats: Arc::clone(&self.stats),
            hooks: self.hooks.clone(),
        });
        let reader = tokio::spawn(read_loop(Arc::downgrade(&link), Arc::clone(&link.socket)));
        *link.reader.lock() = Some(reader);

        self.endpoints
            .lock()
            .insert(endpoint.clone(), Arc::clone(&link));
        tracing::info!("subscriber connected to {}", endpoint);
        Ok(link)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        for link in self.endpoints.get_mut().values() {
            if let Some(reader) = link.reader.lock().take() {
                reader.abort();
            }
        }
    }
}

fn recovery_handler(link: &Arc<EndpointLink>) -> RecoveryHandler {
    let link = Arc::downgrade(link);
    Arc::new(move |topic: &str, range: RangeInclusive<u64>| {
        if let Some(link) = link.upgrade() {
            link.spawn_recovery(topic.to_string(), range);
        }
    })
}

async fn read_loop(weak: Weak<EndpointLink>, socket: Arc<dyn SubscribeSocket>) {
    loop {
        let frames = match socket.recv().await {
            Ok(frames) => frames,
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!("feed reader stopped: {}", e);
                break;
            }
        };
        let Some(link) = weak.upgrade() else {
            break;
        };
        match Envelope::from_frames(&frames) {
            Ok(envelope) => link.on_envelope(envelope),
            Err(e) => tracing::debug!("dropping malformed feed frame: {}", e),
        }
    }
}

impl EndpointLink {
    fn on_envelope(&self, envelope: Envelope) {
        let callbacks: Vec<Callback> = {
            let mut topics = self.topics.lock();
            let Some(entry) = topics.get_mut(&envelope.topic) else {
                tracing::trace!("no subscription for {:?}", envelope.topic);
                return;
            };
            match envelope.kind {
                MessageKind::Heartbeat => {
                    entry.tracker.process_heartbeat(envelope.nonce);
                    return;
                }
                MessageKind::Publish => {
                    if !entry.tracker.process_publish(envelope.nonce) {
                        self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            entry.callbacks.values().cloned().collect()
        };

        self.stats.delivered_live.fetch_add(1, Ordering::Relaxed);
        let message = ReceivedMessage {
            topic: envelope.topic,
            nonce: envelope.nonce,
            payload: envelope.payload,
            delivery: Delivery::Live,
        };
        for callback in callbacks {
            callback(&message);
        }
    }

    fn spawn_recovery(self: Arc<Self>, topic: String, range: RangeInclusive<u64>) {
        self.stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let nonces: Vec<u64> = range.collect();
            let request = RecoveryRequest::new(topic.as_str(), nonces.clone());

            match self.client.send(request.encode()).await {
                Ok(RequestOutcome::Response(payload)) => match decode_recovery_response(&payload) {
                    Ok(items) => self.deliver_recovered(&topic, &nonces, items),
                    Err(e) => {
                        self.stats.recovery_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("unreadable recovery response for {:?}: {}", topic, e);
                    }
                },
                Ok(RequestOutcome::TimedOut { nonce, .. }) => {
                    self.stats.recovery_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "recovery of {:?} {:?} from {} timed out (request {})",
                        topic,
                        nonces,
                        self.endpoint,
                        nonce
                    );
                }
                Ok(RequestOutcome::CacheExpired { nonce, .. }) => {
                    self.stats.recovery_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("recovery request {} for {:?} expired on the server", nonce, topic);
                }
                Ok(RequestOutcome::Rejected { reason, .. }) => {
                    self.stats.recovery_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("recovery of {:?} rejected: {}", topic, reason);
                }
                Err(e) => tracing::debug!("recovery of {:?} abandoned: {}", topic, e),
            }
        });
    }

    fn deliver_recovered(&self, topic: &str, nonces: &[u64], items: Vec<RecoveredItem>) {
        if items.len() != nonces.len() {
            tracing::warn!(
                "recovery response for {:?} has {} items for {} nonces",
                topic,
                items.len(),
                nonces.len()
            );
        }

        // Nonces missing from a short response count as unrecoverable.
        let mut items = items.into_iter();
        for &nonce in nonces {
            let envelope = match items.next() {
                Some(RecoveredItem::Found(envelope)) => envelope,
                Some(RecoveredItem::Expired) | None => {
                    self.report_cache_miss(nonce);
                    continue;
                }
            };
            if envelope.kind != MessageKind::Publish || envelope.topic != topic || envelope.nonce != nonce {
                tracing::warn!("discarding mismatched recovered envelope {}#{}", envelope.topic, envelope.nonce);
                continue;
            }

            // Subscriptions may have changed while recovering.
            let callbacks: Vec<Callback> = match self.topics.lock().get(topic) {
                Some(entry) => entry.callbacks.values().cloned().collect(),
                None => return,
            };

            self.stats.recovered.fetch_add(1, Ordering::Relaxed);
            let message = ReceivedMessage {
                topic: envelope.topic,
                nonce,
                payload: envelope.payload,
                delivery: Delivery::Recovered,
            };
            for callback in callbacks {
                callback(&message);
            }
        }
    }

    fn report_cache_miss(&self, nonce: u64) {
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.hooks.cache_error(&CacheError {
            endpoint: self.endpoint.publish_address().to_string(),
            nonce,
        });
    }

    async fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.socket.close().await;
        self.client.close().await;
        self.topics.lock().clear();
        tracing::debug!("disconnected from {}", self.endpoint);
    }
}
