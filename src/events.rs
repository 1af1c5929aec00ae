//! Structured progress events published by a run.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::archiver::RunStats;
use crate::manifest::EntryStatus;

/// One progress event. Serialises with an `event` tag for JSON consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArchiveEvent {
    RunStarted {
        source: String,
        workers: usize,
    },
    ItemStarted {
        worker: usize,
        post_id: String,
        filename: String,
    },
    ItemResolved {
        worker: usize,
        post_id: String,
        filename: String,
        status: EntryStatus,
        byte_size: Option<u64>,
    },
    Error {
        post_id: Option<String>,
        message: String,
    },
    RunComplete {
        stats: RunStats,
    },
}

/// Fan-out of [`ArchiveEvent`]s to any number of subscribers.
///
/// Publishing never blocks; slow subscribers miss events rather than
/// stalling workers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ArchiveEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ArchiveEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
