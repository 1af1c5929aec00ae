use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetch::HttpFetcher;
use super::queue::MediaQueue;
use super::stats::{RunStats, StatsCollector};
use super::worker::DownloadWorker;
use crate::config::Config;
use crate::events::{ArchiveEvent, EventBus};
use crate::manifest::ManifestStore;
use crate::media::MediaItem;
use crate::recovery::RecoveryEngine;
use crate::wayback::WaybackClient;

/// Owns the worker pool for one run over a set of media items.
pub struct Orchestrator {
    config: Config,
    fetcher: HttpFetcher,
    manifest: ManifestStore,
    recovery: Option<Arc<RecoveryEngine>>,
    events: EventBus,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Config,
        fetcher: HttpFetcher,
        manifest: ManifestStore,
        recovery: Option<Arc<RecoveryEngine>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            manifest,
            recovery,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Build the full pipeline from configuration.
    ///
    /// Creates the output directory, loads (or quarantines) the manifest,
    /// and wires the Wayback client into the recovery engine when recovery
    /// is enabled. The archive client shares the primary fetcher's token
    /// bucket, so both count against one request budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the output
    /// directory cannot be created, or the manifest cannot be read.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create output directory {}",
                    config.output_dir.display()
                )
            })?;

        let fetcher = HttpFetcher::from_config(&config)?;
        info!(
            requests_per_second = fetcher.limiter().rate(),
            burst = fetcher.limiter().capacity(),
            max_attempts = fetcher.retry_policy().max_attempts(),
            "Request budget"
        );
        let manifest = ManifestStore::load(
            config.manifest_path(),
            &config.source_id,
            config.manifest_flush_every,
        )
        .await
        .context("Failed to load manifest")?;

        let recovery = if config.recovery_enabled {
            let index = WaybackClient::new(
                fetcher.clone(),
                &config.wayback_base_url,
                config.max_snapshots_per_lookup,
            );
            info!(base_url = %config.wayback_base_url, "Archive recovery enabled");
            Some(Arc::new(RecoveryEngine::from_config(
                &config,
                Arc::new(index),
            )))
        } else {
            info!("Archive recovery disabled");
            None
        };

        Ok(Self::new(config, fetcher, manifest, recovery))
    }

    /// Subscribe to progress events of subsequent runs.
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.events.subscribe()
    }

    /// Token that stops the run when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Archive a finite list of items.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run`].
    pub async fn run_items(&self, items: Vec<MediaItem>) -> Result<RunStats> {
        self.run(futures_util::stream::iter(items)).await
    }

    /// Archive every item the stream yields, then flush the manifest.
    ///
    /// Per-item failures are reflected in the returned statistics, never as
    /// an error. On cancellation no further items are dequeued; in-flight
    /// items get `shutdown_grace` to finish before being aborted.
    ///
    /// # Errors
    ///
    /// Returns an error only if the manifest cannot be saved at the end of
    /// the run.
    pub async fn run<S>(&self, items: S) -> Result<RunStats>
    where
        S: Stream<Item = MediaItem>,
    {
        let started = Instant::now();
        let workers = self.config.worker_concurrency.max(1);
        let stats = Arc::new(StatsCollector::default());
        let queue = MediaQueue::new(self.config.queue_capacity);

        info!(
            source = %self.config.source_id,
            workers,
            output_dir = %self.config.output_dir.display(),
            "Archive run starting"
        );
        self.events.emit(ArchiveEvent::RunStarted {
            source: self.config.source_id.clone(),
            workers,
        });

        let worker = DownloadWorker::new(
            self.fetcher.clone(),
            self.manifest.clone(),
            self.recovery.clone(),
            self.config.output_dir.clone(),
            self.config.resume_enabled,
            self.events.clone(),
            Arc::clone(&stats),
        );
        let mut pool = JoinSet::new();
        for id in 0..workers {
            pool.spawn(worker.clone().run(id, queue.clone(), self.cancel.clone()));
        }

        let mut cancelled = self.enqueue_all(items, &queue, &stats).await;

        if !cancelled {
            // Shutdown messages wait for room in the queue, which only
            // running workers make, so the stop signal must win here too.
            let finish = async {
                queue.close(workers).await;
                queue.join().await;
            };
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => cancelled = true,
                () = finish => debug!("Queue drained"),
            }
        }

        if cancelled {
            info!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                outstanding = queue.outstanding(),
                "Stop requested; waiting for in-flight items"
            );
            let drained =
                tokio::time::timeout(self.config.shutdown_grace, drain(&mut pool)).await;
            if drained.is_err() {
                warn!("Grace period elapsed; aborting in-flight downloads");
                pool.abort_all();
                drain(&mut pool).await;
            }
        } else {
            drain(&mut pool).await;
        }

        self.manifest
            .save()
            .await
            .context("Failed to save manifest at end of run")?;

        let run = stats.snapshot(started.elapsed(), cancelled);
        info!(
            discovered = run.discovered,
            downloaded = run.downloaded,
            recovered = run.recovered,
            skipped = run.skipped,
            missing = run.missing,
            failed = run.failed,
            bytes = run.bytes_transferred,
            elapsed_ms = run.elapsed.as_millis() as u64,
            errors = run.errors.len(),
            cancelled,
            "Archive run complete"
        );
        self.events
            .emit(ArchiveEvent::RunComplete { stats: run.clone() });
        Ok(run)
    }

    /// Feed the queue. Returns true if the run was cancelled meanwhile.
    async fn enqueue_all<S>(&self, items: S, queue: &MediaQueue, stats: &StatsCollector) -> bool
    where
        S: Stream<Item = MediaItem>,
    {
        let mut items = pin!(items);
        let mut seen = HashSet::new();

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return true,
                next = items.next() => next,
            };
            let Some(item) = next else {
                return false;
            };

            stats.discovered();
            if !seen.insert(item.key()) {
                debug!(
                    post_id = %item.post_id,
                    filename = %item.filename(),
                    "Duplicate item in this run; dropping"
                );
                stats.duplicate();
                continue;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return true,
                result = queue.enqueue(item) => {
                    if let Err(e) = result {
                        error!("Failed to enqueue item: {e}");
                        return false;
                    }
                }
            }
        }
    }
}

async fn drain(pool: &mut JoinSet<()>) {
    while let Some(result) = pool.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Worker task panicked: {e}");
            } else {
                debug!("Worker task cancelled: {e}");
            }
        }
    }
}
