//! Bounded work queue between item discovery and the download workers.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::media::MediaItem;

/// Message carried by the queue.
#[derive(Debug)]
pub enum QueueMessage {
    Item(MediaItem),
    /// No more work for the worker that receives it.
    Shutdown,
}

/// Every consumer is gone, so nothing can be enqueued.
#[derive(Debug, thiserror::Error)]
#[error("media queue is closed")]
pub struct QueueClosed;

/// Bounded multi-consumer queue of media items.
///
/// Tracks how many enqueued items have not been marked complete so the
/// orchestrator can wait for a run to drain.
#[derive(Debug, Clone)]
pub struct MediaQueue {
    sender: mpsc::Sender<QueueMessage>,
    receiver: Arc<Mutex<mpsc::Receiver<QueueMessage>>>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl MediaQueue {
    /// Create a queue holding at most `capacity` pending messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (outstanding, _) = watch::channel(0);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            outstanding: Arc::new(outstanding),
        }
    }

    /// Enqueue an item, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the receiving side is gone.
    pub async fn enqueue(&self, item: MediaItem) -> Result<(), QueueClosed> {
        self.outstanding.send_modify(|n| *n += 1);
        if self.sender.send(QueueMessage::Item(item)).await.is_err() {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            return Err(QueueClosed);
        }
        Ok(())
    }

    /// Next item, or `None` once this consumer received its shutdown signal.
    pub async fn dequeue(&self) -> Option<MediaItem> {
        let message = self.receiver.lock().await.recv().await;
        match message {
            Some(QueueMessage::Item(item)) => Some(item),
            Some(QueueMessage::Shutdown) | None => None,
        }
    }

    /// Record that a dequeued item reached a terminal state.
    pub fn mark_complete(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Items enqueued but not yet marked complete.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until every enqueued item has been marked complete.
    pub async fn join(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Send one shutdown signal per consumer, after any queued items.
    pub async fn close(&self, consumers: usize) {
        for _ in 0..consumers {
            if self.sender.send(QueueMessage::Shutdown).await.is_err() {
                break;
            }
        }
    }
}
