// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process memory transport.
//!
//! Routes frames between sockets of the same process through bounded tokio
//! channels. Behaves like a lossy network where it matters to the
//! reliability layer:
//!
//! - Feed subscriptions are prefix filters on the first frame.
//! - A subscriber only sees frames published after it subscribed (late join).
//! - Every socket queue is bounded; a full queue fails the send with
//!   [`TransportError::HighWaterMark`] instead of blocking.
//! - Replies to unknown peers and requests to an unbound router are dropped.
//! - Filters can drop feed, request or reply frames to simulate loss.
//!
//! Each [`MemoryTransport`] is its own isolated hub; clones share it.

use super::{
    DealerSocket, FrameSink, Multipart, PeerId, PublishSocket, Routed, RouterSocket,
    SubscribeSocket, Transport, TransportError,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

/// Default per-socket queue depth (matches the usual socket high-water-mark).
pub const DEFAULT_CAPACITY: usize = 1000;

/// Frame filter: return `true` to deliver, `false` to drop.
pub type FrameFilter = dyn Fn(&[String]) -> bool + Send + Sync;

/// In-process transport hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

struct Hub {
    capacity: usize,
    feeds: Mutex<HashMap<String, Arc<Feed>>>,
    routers: Mutex<HashMap<String, Arc<RouterSlot>>>,
    next_id: AtomicU64,
    feed_filter: RwLock<Option<Arc<FrameFilter>>>,
    request_filter: RwLock<Option<Arc<FrameFilter>>>,
    reply_filter: RwLock<Option<Arc<FrameFilter>>>,
}

impl Hub {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn feed(&self, address: &str) -> Arc<Feed> {
        self.feeds
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Feed::default()))
            .clone()
    }

    fn router(&self, address: &str) -> Arc<RouterSlot> {
        self.routers
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(RouterSlot::default()))
            .clone()
    }
}

fn passes(filter: &RwLock<Option<Arc<FrameFilter>>>, frames: &[String]) -> bool {
    let filter = filter.read().clone();
    filter.map_or(true, |f| f(frames))
}

fn check_address(address: &str) -> Result<(), TransportError> {
    if address.trim().is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

impl MemoryTransport {
    /// Create a hub with the default queue depth.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub whose socket queues hold at most `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                capacity: capacity.max(1),
                feeds: Mutex::new(HashMap::new()),
                routers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                feed_filter: RwLock::new(None),
                request_filter: RwLock::new(None),
                reply_filter: RwLock::new(None),
            }),
        }
    }

    /// Drop feed frames for which `filter` returns `false`.
    pub fn set_feed_filter<F>(&self, filter: F)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        *self.hub.feed_filter.write() = Some(Arc::new(filter));
    }

    /// Drop dealer-to-router frames for which `filter` returns `false`.
    pub fn set_request_filter<F>(&self, filter: F)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        *self.hub.request_filter.write() = Some(Arc::new(filter));
    }

    /// Drop router-to-dealer frames for which `filter` returns `false`.
    pub fn set_reply_filter<F>(&self, filter: F)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        *self.hub.reply_filter.write() = Some(Arc::new(filter));
    }

    /// Remove every loss filter.
    pub fn clear_filters(&self) {
        *self.hub.feed_filter.write() = None;
        *self.hub.request_filter.write() = None;
        *self.hub.reply_filter.write() = None;
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind_publisher(&self, address: &str) -> Result<Box<dyn PublishSocket>, TransportError> {
        check_address(address)?;
        let feed = self.hub.feed(address);
        if feed.bound.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AddressInUse(address.to_string()));
        }

        tracing::debug!("memory publisher bound at {}", address);
        Ok(Box::new(MemoryPublishSocket {
            hub: self.hub.clone(),
            feed,
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_subscriber(
        &self,
        address: &str,
    ) -> Result<Box<dyn SubscribeSocket>, TransportError> {
        check_address(address)?;
        let feed = self.hub.feed(address);
        let (tx, rx) = mpsc::channel(self.hub.capacity);
        let member = Arc::new(FeedMember {
            id: self.hub.next_id(),
            prefixes: Mutex::new(Vec::new()),
            tx,
        });
        feed.members.lock().push(member.clone());

        tracing::debug!("memory subscriber {} connected to {}", member.id, address);
        Ok(Box::new(MemorySubscribeSocket {
            feed,
            member,
            inbox: Inbox::new(rx),
        }))
    }

    async fn bind_router(&self, address: &str) -> Result<Box<dyn RouterSocket>, TransportError> {
        check_address(address)?;
        let slot = self.hub.router(address);
        let (tx, rx) = mpsc::channel(self.hub.capacity);
        {
            let mut inbox = slot.inbox.lock();
            if inbox.is_some() {
                return Err(TransportError::AddressInUse(address.to_string()));
            }
            *inbox = Some(tx);
        }

        tracing::debug!("memory router bound at {}", address);
        Ok(Box::new(MemoryRouterSocket {
            hub: self.hub.clone(),
            slot,
            inbox: Inbox::new(rx),
        }))
    }

    async fn connect_dealer(&self, address: &str) -> Result<Box<dyn DealerSocket>, TransportError> {
        check_address(address)?;
        let slot = self.hub.router(address);
        let peer = PeerId(self.hub.next_id());
        let (tx, rx) = mpsc::channel(self.hub.capacity);
        slot.peers.lock().insert(peer, tx);

        tracing::debug!("memory dealer {} connected to {}", peer, address);
        Ok(Box::new(MemoryDealerSocket {
            hub: self.hub.clone(),
            slot,
            peer,
            inbox: Inbox::new(rx),
        }))
    }
}

/// Receiving half of a socket: wakes pending receivers when closed.
struct Inbox<T> {
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl<T: Send> Inbox<T> {
    fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn recv(&self) -> Result<T, TransportError> {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            item = async { self.rx.lock().await.recv().await } => item.ok_or(TransportError::Closed),
            () = &mut notified => Err(TransportError::Closed),
        }
    }

    /// Returns `false` if the inbox was already closed.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.notify_waiters();
        true
    }
}

// ============================================================================
// Publish / Subscribe
// ============================================================================

#[derive(Default)]
struct Feed {
    bound: AtomicBool,
    members: Mutex<Vec<Arc<FeedMember>>>,
}

struct FeedMember {
    id: u64,
    prefixes: Mutex<Vec<String>>,
    tx: mpsc::Sender<Multipart>,
}

impl FeedMember {
    fn matches(&self, topic: &str) -> bool {
        self.prefixes.lock().iter().any(|p| topic.starts_with(p.as_str()))
    }
}

struct MemoryPublishSocket {
    hub: Arc<Hub>,
    feed: Arc<Feed>,
    closed: AtomicBool,
}

#[async_trait]
impl FrameSink<Multipart> for MemoryPublishSocket {
    async fn send(&self, frames: Multipart) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        if !passes(&self.hub.feed_filter, &frames) {
            tracing::trace!("memory feed dropped frame {:?}", frames.get(..3));
            return Ok(());
        }

        let topic = frames.first().map(String::as_str).unwrap_or_default();
        let members = self.feed.members.lock().clone();
        let mut rejected = false;
        for member in members.iter().filter(|m| m.matches(topic)) {
            match member.tx.try_send(frames.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => rejected = true,
                Err(TrySendError::Closed(_)) => {
                    self.feed.members.lock().retain(|m| m.id != member.id);
                }
            }
        }

        if rejected {
            Err(TransportError::HighWaterMark)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PublishSocket for MemoryPublishSocket {
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.feed.bound.store(false, Ordering::Release);
        }
    }
}

struct MemorySubscribeSocket {
    feed: Arc<Feed>,
    member: Arc<FeedMember>,
    inbox: Inbox<Multipart>,
}

#[async_trait]
impl SubscribeSocket for MemorySubscribeSocket {
    async fn recv(&self) -> Result<Multipart, TransportError> {
        self.inbox.recv().await
    }

    fn subscribe(&self, prefix: &str) {
        self.member.prefixes.lock().push(prefix.to_string());
    }

    fn unsubscribe(&self, prefix: &str) {
        let mut prefixes = self.member.prefixes.lock();
        if let Some(pos) = prefixes.iter().position(|p| p == prefix) {
            prefixes.remove(pos);
        }
    }

    async fn close(&self) {
        if self.inbox.close() {
            self.member.prefixes.lock().clear();
            self.feed.members.lock().retain(|m| m.id != self.member.id);
        }
    }
}

// ============================================================================
// Router / Dealer
// ============================================================================

#[derive(Default)]
struct RouterSlot {
    inbox: Mutex<Option<mpsc::Sender<Routed>>>,
    peers: Mutex<HashMap<PeerId, mpsc::Sender<Multipart>>>,
}

struct MemoryRouterSocket {
    hub: Arc<Hub>,
    slot: Arc<RouterSlot>,
    inbox: Inbox<Routed>,
}

#[async_trait]
impl FrameSink<Routed> for MemoryRouterSocket {
    async fn send(&self, routed: Routed) -> Result<(), TransportError> {
        if self.inbox.is_closed() {
            return Err(TransportError::Closed);
        }

        if !passes(&self.hub.reply_filter, &routed.frames) {
            tracing::trace!("memory reply to {} dropped", routed.peer);
            return Ok(());
        }

        let peer_tx = self.slot.peers.lock().get(&routed.peer).cloned();
        let Some(peer_tx) = peer_tx else {
            tracing::trace!("memory reply to unknown {} dropped", routed.peer);
            return Ok(());
        };

        match peer_tx.try_send(routed.frames) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::HighWaterMark),
            Err(TrySendError::Closed(_)) => {
                self.slot.peers.lock().remove(&routed.peer);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RouterSocket for MemoryRouterSocket {
    async fn recv(&self) -> Result<Routed, TransportError> {
        self.inbox.recv().await
    }

    async fn close(&self) {
        if self.inbox.close() {
            self.slot.inbox.lock().take();
        }
    }
}

struct MemoryDealerSocket {
    hub: Arc<Hub>,
    slot: Arc<RouterSlot>,
    peer: PeerId,
    inbox: Inbox<Multipart>,
}

#[async_trait]
impl FrameSink<Multipart> for MemoryDealerSocket {
    async fn send(&self, frames: Multipart) -> Result<(), TransportError> {
        if self.inbox.is_closed() {
            return Err(TransportError::Closed);
        }

        if !passes(&self.hub.request_filter, &frames) {
            tracing::trace!("memory request from {} dropped", self.peer);
            return Ok(());
        }

        let inbox = self.slot.inbox.lock().clone();
        let Some(inbox) = inbox else {
            // Nobody bound yet: the request is lost, the client will retry.
            return Ok(());
        };

        match inbox.try_send(Routed {
            peer: self.peer,
            frames,
        }) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::HighWaterMark),
        }
    }
}

#[async_trait]
impl DealerSocket for MemoryDealerSocket {
    async fn recv(&self) -> Result<Multipart, TransportError> {
        self.inbox.recv().await
    }

    async fn close(&self) {
        if self.inbox.close() {
            self.slot.peers.lock().remove(&self.peer);
        }
    }
}
