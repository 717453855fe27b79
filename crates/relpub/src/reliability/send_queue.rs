// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serialized outbound queue.
//!
//! Sockets in this layer are single-writer: a send must complete before the
//! next starts. Callers enqueue from anywhere without blocking; one drain task
//! owns the sink and performs the sends in FIFO order.

use crate::hooks::{HighWaterMark, Hooks};
use crate::transport::{FrameSink, TransportError};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct QueuedSend<T> {
    item: T,
    label: HighWaterMark,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Completion of one queued send.
///
/// Dropping the ticket does not cancel the send. If the queue is closed before
/// the item is sent, the ticket resolves to [`TransportError::Closed`].
#[derive(Debug)]
pub struct SendTicket {
    rx: oneshot::Receiver<Result<(), TransportError>>,
}

impl Future for SendTicket {
    type Output = Result<(), TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TransportError::Closed)))
    }
}

/// FIFO feeding a single-writer sink with at most one send in flight.
pub struct SerializedSendQueue<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedSend<T>>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + 'static> SerializedSendQueue<T> {
    /// Start the drain task for `sink`.
    ///
    /// Back-pressure rejections are reported to `hooks` with the label given
    /// at enqueue time.
    pub fn new<S>(sink: Arc<S>, hooks: Hooks) -> Self
    where
        S: FrameSink<T> + ?Sized,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedSend<T>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let drain_pending = Arc::clone(&pending);

        let drain = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = sink.send(job.item).await;
                if let Err(e) = &result {
                    if e.is_high_water_mark() {
                        hooks.high_water_mark(&job.label);
                    } else {
                        tracing::warn!(
                            "send to {} failed (nonce {}): {}",
                            job.label.target,
                            job.label.nonce,
                            e
                        );
                    }
                }
                drain_pending.fetch_sub(1, Ordering::Relaxed);
                let _ = job.done.send(result);
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
            pending,
        }
    }

    /// Append `item`. Never blocks.
    pub fn enqueue(&self, item: T, label: HighWaterMark) -> SendTicket {
        let (done, rx) = oneshot::channel();
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            self.pending.fetch_add(1, Ordering::Relaxed);
            if tx.send(QueuedSend { item, label, done }).is_err() {
                self.pending.fetch_sub(1, Ordering::Relaxed);
            }
        }
        // A dropped `done` resolves the ticket as Closed.
        SendTicket { rx }
    }

    /// Items queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting items and abort the drain task.
    ///
    /// Items not yet sent are discarded; their tickets resolve as closed.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(drain) = self.drain.lock().take() {
            drain.abort();
        }
        self.pending.store(0, Ordering::Relaxed);
    }
}

impl<T> Drop for SerializedSendQueue<T> {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.get_mut().take() {
            drain.abort();
        }
    }
}
