// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Response server (router side).
//!
//! The ResponseServer receives requests, dispatches each `(sender, nonce)` to
//! the handler at most once, and replays the cached reply to duplicates.

use crate::config::ReliabilityConfig;
use crate::hooks::{HighWaterMark, Hooks};
use crate::protocol::{encode_rejection, ProtocolError, RequestFrame, CACHE_EXPIRED_SENTINEL};
use crate::reliability::{ExpiryWindowCache, NonceGapTracker, NonceStatus, SerializedSendQueue};
use crate::rpc::error::{RequestRejected, ServerError};
use crate::transport::{PeerId, Routed, RouterSocket, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Handler trait for processing requests.
///
/// Implement this trait to define your service logic.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request payload and return the reply payload.
    ///
    /// An error is sent back to the caller as a rejection.
    async fn handle(&self, payload: String) -> Result<String, RequestRejected>;
}

/// A function-based request handler.
#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, RequestRejected>> + Send + 'static,
{
    async fn handle(&self, payload: String) -> Result<String, RequestRejected> {
        self(payload).await
    }
}

/// Cached reply: `None` while the handler runs.
type ReplySlot = watch::Receiver<Option<String>>;

struct ServerShared {
    address: String,
    handler: Arc<dyn RequestHandler>,
    queue: SerializedSendQueue<Routed>,
    replies: ExpiryWindowCache<(String, u64), ReplySlot>,
    trackers: Mutex<HashMap<String, NonceGapTracker>>,
    /// First fatal fault; reported by `close`.
    fault: Mutex<Option<ServerError>>,
    stop: Notify,
    closing: AtomicBool,
    requests_handled: AtomicU64,
    duplicates: AtomicU64,
}

/// Deduplicating request server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use relpub::rpc::{RequestRejected, ResponseServer};
/// use relpub::transport::memory::MemoryTransport;
/// use relpub::{Hooks, ReliabilityConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = MemoryTransport::new();
/// let config = Arc::new(ReliabilityConfig::default());
///
/// let handler = |payload: String| async move {
///     Ok::<_, RequestRejected>(payload.to_uppercase())
/// };
///
/// let server = ResponseServer::bind(&transport, "mem://svc", &config, Hooks::new(), handler).await?;
/// // ...
/// server.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ResponseServer {
    shared: Arc<ServerShared>,
    router: Arc<dyn RouterSocket>,
    serve: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseServer {
    /// Bind a router socket at `address` and start serving.
    pub async fn bind<H: RequestHandler>(
        transport: &dyn Transport,
        address: &str,
        config: &ReliabilityConfig,
        hooks: Hooks,
        handler: H,
    ) -> Result<Self, ServerError> {
        let router: Arc<dyn RouterSocket> = Arc::from(transport.bind_router(address).await?);

        let shared = Arc::new(ServerShared {
            address: address.to_string(),
            handler: Arc::new(handler),
            queue: SerializedSendQueue::new(Arc::clone(&router), hooks),
            replies: ExpiryWindowCache::with_buffer(
                config.response_cache_expiry(),
                config.expiry_buffer(),
            ),
            trackers: Mutex::new(HashMap::new()),
            fault: Mutex::new(None),
            stop: Notify::new(),
            closing: AtomicBool::new(false),
            requests_handled: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        });

        let serve = tokio::spawn(serve_loop(Arc::clone(&shared), Arc::clone(&router)));
        tracing::info!("response server listening on {}", address);

        Ok(Self {
            shared,
            router,
            serve: Mutex::new(Some(serve)),
        })
    }

    /// Address the server is bound to
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Number of handler invocations
    pub fn requests_handled(&self) -> u64 {
        self.shared.requests_handled.load(Ordering::Relaxed)
    }

    /// Number of duplicate requests answered without the handler
    pub fn duplicates(&self) -> u64 {
        self.shared.duplicates.load(Ordering::Relaxed)
    }

    /// Check if the serve loop is still running
    pub fn is_running(&self) -> bool {
        self.serve
            .lock()
            .as_ref()
            .is_some_and(|serve| !serve.is_finished())
    }

    /// Stop serving, forget every request and release the socket.
    ///
    /// Returns the fault that stopped the server, if any.
    pub async fn close(&self) -> Result<(), ServerError> {
        let Some(serve) = self.serve.lock().take() else {
            return Err(ServerError::Closed);
        };
        tracing::info!("response server on {} shutting down", self.shared.address);

        self.shared.closing.store(true, Ordering::Release);
        serve.abort();
        self.shared.queue.close();
        self.shared.replies.clear();
        self.shared.trackers.lock().clear();
        self.router.close().await;

        match self.shared.fault.lock().take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

impl Drop for ResponseServer {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        if let Some(serve) = self.serve.get_mut().take() {
            serve.abort();
        }
        self.shared.queue.close();
    }
}

impl ServerShared {
    fn record_fault(&self, fault: ServerError) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        tracing::error!("response server on {} failed: {}", self.address, fault);
        self.fault.lock().get_or_insert(fault);
        self.stop.notify_one();
    }

    /// Queue `reply` for `peer` and watch the send for fatal faults.
    async fn reply(&self, peer: PeerId, sender_id: String, nonce: u64, reply: String) {
        let frames = RequestFrame::new(sender_id.as_str(), nonce, reply.as_str()).to_frames();
        let label = HighWaterMark {
            target: sender_id,
            nonce,
            payload: reply,
        };

        match self.queue.enqueue(Routed { peer, frames }, label).await {
            Ok(()) => {}
            // Reported to the hook by the queue
            Err(TransportError::HighWaterMark) => {}
            Err(e) => self.record_fault(e.into()),
        }
    }
}

async fn serve_loop(shared: Arc<ServerShared>, router: Arc<dyn RouterSocket>) {
    loop {
        let routed = tokio::select! {
            result = router.recv() => result,
            () = shared.stop.notified() => break,
        };
        let routed = match routed {
            Ok(routed) => routed,
            Err(TransportError::Closed) => break,
            Err(e) => {
                shared.record_fault(e.into());
                break;
            }
        };

        let request = match RequestFrame::from_frames(&routed.frames) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("dropping malformed request from {}: {}", routed.peer, e);
                continue;
            }
        };
        let peer = routed.peer;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| dispatch(&shared, peer, request))) {
            shared.record_fault(ServerError::DispatchPanicked(panic_message(panic.as_ref())));
            break;
        }
    }
    tracing::debug!("response server on {} stopped serving", shared.address);
}

/// Classify one request and answer it without blocking the serve loop.
fn dispatch(shared: &Arc<ServerShared>, peer: PeerId, request: RequestFrame) {
    let RequestFrame {
        sender_id,
        nonce,
        payload,
    } = request;
    let key = (sender_id.clone(), nonce);

    let status = shared
        .trackers
        .lock()
        .entry(sender_id.clone())
        .or_default()
        .observe(nonce);

    match status {
        NonceStatus::New => {
            tracing::debug!("request {} from {}: new", nonce, sender_id);
            let (slot_tx, slot_rx) = watch::channel(None);
            shared.replies.set(key, slot_rx);

            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                shared.requests_handled.fetch_add(1, Ordering::Relaxed);
                let handler = Arc::clone(&shared.handler);
                let reply = match tokio::spawn(async move { handler.handle(payload).await }).await {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(rejected)) => {
                        tracing::debug!("request {} from {} rejected: {}", nonce, sender_id, rejected.reason);
                        encode_rejection(&rejected.reason)
                    }
                    Err(e) => {
                        tracing::error!("handler for request {} from {} failed: {}", nonce, sender_id, e);
                        encode_rejection("request handler failed")
                    }
                };
                slot_tx.send_replace(Some(reply.clone()));
                shared.reply(peer, sender_id, nonce, reply).await;
            });
        }
        NonceStatus::OutOfWindow => {
            tracing::warn!("request {} from {}: outside the nonce window, rejected", nonce, sender_id);
            let reason = ProtocolError::NonceOutOfWindow(nonce).to_string();
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                shared
                    .reply(peer, sender_id, nonce, encode_rejection(&reason))
                    .await;
            });
        }
        NonceStatus::Seen => {
            shared.duplicates.fetch_add(1, Ordering::Relaxed);
            let Some(mut slot) = shared.replies.get(&key) else {
                tracing::debug!("request {} from {}: duplicate, expired", nonce, sender_id);
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    shared
                        .reply(peer, sender_id, nonce, CACHE_EXPIRED_SENTINEL.to_string())
                        .await;
                });
                return;
            };

            tracing::debug!("request {} from {}: duplicate, cached", nonce, sender_id);
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let reply = match slot.wait_for(Option::is_some).await {
                    Ok(reply) => reply.clone(),
                    // Handler task went away with the server
                    Err(_) => None,
                };
                if let Some(reply) = reply {
                    shared.reply(peer, sender_id, nonce, reply).await;
                }
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
