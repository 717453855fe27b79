// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request client (dealer side).
//!
//! The RequestClient sends requests to a ResponseServer and resends them until
//! a reply arrives or the request deadline passes.

use crate::config::ReliabilityConfig;
use crate::hooks::{CacheError, HighWaterMark, Hooks};
use crate::protocol::{decode_rejection, RequestFrame, CACHE_EXPIRED_SENTINEL};
use crate::reliability::{CancellableDelay, DelayOutcome, SerializedSendQueue};
use crate::rpc::error::{RequestError, RequestResult};
use crate::transport::{DealerSocket, Multipart, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<String>>>>;

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The server answered.
    Response(String),
    /// The server had seen the request but no longer remembered the answer.
    CacheExpired { endpoint: String, nonce: u64 },
    /// No reply before the deadline.
    TimedOut { nonce: u64, request: String },
    /// The server's handler refused the request.
    Rejected { nonce: u64, reason: String },
}

impl RequestOutcome {
    /// The response payload, if any.
    pub fn response(&self) -> Option<&str> {
        match self {
            Self::Response(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Retrying request client bound to one server address.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use relpub::rpc::RequestClient;
/// use relpub::transport::memory::MemoryTransport;
/// use relpub::{Hooks, ReliabilityConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = MemoryTransport::new();
/// let config = Arc::new(ReliabilityConfig::default());
/// let client = RequestClient::connect(&transport, "mem://svc", config, Hooks::new()).await?;
///
/// let outcome = client.send("[\"EURUSD\",4]").await?;
/// println!("{:?}", outcome);
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct RequestClient {
    /// Server address
    address: String,

    /// Identifier stamped on every request, stable for the client's lifetime
    client_id: String,

    dealer: Arc<dyn DealerSocket>,

    queue: SerializedSendQueue<Multipart>,

    /// Next request nonce
    sequence: AtomicU64,

    /// Pending requests: nonce -> reply channel
    pending: PendingMap,

    /// Retry waits, cut short on close
    delay: CancellableDelay,

    config: Arc<ReliabilityConfig>,
    hooks: Hooks,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RequestClient {
    /// Connect a dealer socket to `address` and start the reply listener.
    pub async fn connect(
        transport: &dyn Transport,
        address: &str,
        config: Arc<ReliabilityConfig>,
        hooks: Hooks,
    ) -> RequestResult<Self> {
        let dealer: Arc<dyn DealerSocket> = Arc::from(transport.connect_dealer(address).await?);
        let client_id = generate_client_id();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let queue = SerializedSendQueue::new(Arc::clone(&dealer), hooks.clone());
        let reader = start_reply_listener(Arc::clone(&dealer), Arc::clone(&pending), client_id.clone());

        tracing::debug!("request client {} connected to {}", client_id, address);

        Ok(Self {
            address: address.to_string(),
            client_id,
            dealer,
            queue,
            sequence: AtomicU64::new(0),
            pending,
            delay: CancellableDelay::new(),
            config,
            hooks,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    /// Send `payload` and wait for its outcome.
    ///
    /// The request is resent every `response_timeout` until a reply arrives
    /// or `2 x maximum_latency` has passed. Only a closed client is an error.
    pub async fn send(&self, payload: impl Into<String>) -> RequestResult<RequestOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RequestError::Closed);
        }
        let payload = payload.into();

        let nonce = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frames = RequestFrame::new(self.client_id.as_str(), nonce, payload.as_str()).to_frames();
        let label = HighWaterMark {
            target: self.address.clone(),
            nonce,
            payload: payload.clone(),
        };

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(nonce, tx);

        let deadline = Instant::now() + self.config.request_deadline();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if attempt > 1 {
                tracing::debug!("resending request {} to {} (attempt {})", nonce, self.address, attempt);
            }
            // Back-pressure goes to the hook via the queue; keep waiting either way.
            drop(self.queue.enqueue(frames.clone(), label.clone()));

            let wait = self
                .config
                .response_timeout()
                .min(deadline.saturating_duration_since(Instant::now()));

            tokio::select! {
                biased;
                reply = &mut rx => {
                    return match reply {
                        Ok(reply) => Ok(self.classify(nonce, reply)),
                        Err(_) => Err(RequestError::Closed),
                    };
                }
                outcome = self.delay.sleep(wait) => {
                    if outcome == DelayOutcome::Cancelled {
                        self.pending.lock().remove(&nonce);
                        return Err(RequestError::Closed);
                    }
                }
            }

            if Instant::now() >= deadline {
                self.pending.lock().remove(&nonce);
                tracing::warn!(
                    "request {} to {} timed out after {} attempts",
                    nonce,
                    self.address,
                    attempt
                );
                return Ok(RequestOutcome::TimedOut {
                    nonce,
                    request: payload,
                });
            }
        }
    }

    fn classify(&self, nonce: u64, reply: String) -> RequestOutcome {
        if reply == CACHE_EXPIRED_SENTINEL {
            let error = CacheError {
                endpoint: self.address.clone(),
                nonce,
            };
            self.hooks.cache_error(&error);
            return RequestOutcome::CacheExpired {
                endpoint: error.endpoint,
                nonce,
            };
        }
        if let Some(reason) = decode_rejection(&reply) {
            tracing::debug!("request {} to {} rejected: {}", nonce, self.address, reason);
            return RequestOutcome::Rejected {
                nonce,
                reason: reason.to_string(),
            };
        }
        RequestOutcome::Response(reply)
    }

    /// Server address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Identifier stamped on this client's requests
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Settle every in-flight request with [`RequestError::Closed`] and
    /// release the socket.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.delay.cancel_all();
        self.pending.lock().clear();
        self.queue.close();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.dealer.close().await;
        tracing::debug!("request client {} closed", self.client_id);
    }
}

impl Drop for RequestClient {
    fn drop(&mut self) {
        self.delay.cancel_all();
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Generate an identifier unique to this client instance.
fn generate_client_id() -> String {
    use std::hash::{Hash, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    // Hash the thread id for additional uniqueness
    let tid_hash = {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        hasher.finish() as u32
    };

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:016x}-{:08x}-{}", nanos, tid_hash, seq)
}

/// Start the reply listener task.
fn start_reply_listener(
    dealer: Arc<dyn DealerSocket>,
    pending: PendingMap,
    client_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frames = match dealer.recv().await {
                Ok(frames) => frames,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::warn!("request client {} reply listener stopped: {}", client_id, e);
                    break;
                }
            };

            let reply = match RequestFrame::from_frames(&frames) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!("dropping malformed reply: {}", e);
                    continue;
                }
            };
            if reply.sender_id != client_id {
                tracing::debug!("dropping reply addressed to {}", reply.sender_id);
                continue;
            }

            match pending.lock().remove(&reply.nonce) {
                // Receiver may have given up already
                Some(tx) => drop(tx.send(reply.payload)),
                None => tracing::debug!("dropping late reply for nonce {}", reply.nonce),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_client_id_is_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_ne!(a, b);
        assert_eq!(a.split('-').count(), 3);
    }

    #[test]
    fn outcome_accessors() {
        let ok = RequestOutcome::Response("x".into());
        assert_eq!(ok.response(), Some("x"));
        assert!(!ok.is_timed_out());

        let timed_out = RequestOutcome::TimedOut {
            nonce: 1,
            request: "r".into(),
        };
        assert!(timed_out.is_timed_out());
        assert_eq!(timed_out.response(), None);
    }
}
