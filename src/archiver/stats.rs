//! Per-run counters shared by the workers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::worker::ItemOutcome;

/// Final statistics of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub discovered: u64,
    pub duplicates: u64,
    pub downloaded: u64,
    /// Items stored from an archived copy.
    pub recovered: u64,
    pub skipped: u64,
    pub missing: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub errors: Vec<String>,
    /// True when the run was stopped before every item resolved.
    pub cancelled: bool,
}

impl RunStats {
    /// Items that reached a terminal status in this run.
    #[must_use]
    pub fn resolved(&self) -> u64 {
        self.downloaded + self.recovered + self.skipped + self.missing + self.failed
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "discovered={} downloaded={} recovered={} skipped={} missing={} failed={} duplicates={}",
            self.discovered,
            self.downloaded,
            self.recovered,
            self.skipped,
            self.missing,
            self.failed,
            self.duplicates
        )?;
        write!(
            f,
            "bytes={} elapsed={:.1}s errors={}{}",
            self.bytes_transferred,
            self.elapsed.as_secs_f64(),
            self.errors.len(),
            if self.cancelled { " (cancelled)" } else { "" }
        )?;
        for error in &self.errors {
            write!(f, "\n  - {error}")?;
        }
        Ok(())
    }
}

/// Lock-free counters plus the error list, updated concurrently by workers.
#[derive(Debug, Default)]
pub struct StatsCollector {
    discovered: AtomicU64,
    duplicates: AtomicU64,
    downloaded: AtomicU64,
    recovered: AtomicU64,
    skipped: AtomicU64,
    missing: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    errors: Mutex<Vec<String>>,
}

impl StatsCollector {
    pub fn discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: &ItemOutcome) {
        let counter = match outcome {
            ItemOutcome::Skipped => &self.skipped,
            ItemOutcome::Downloaded { bytes } => {
                self.bytes.fetch_add(*bytes, Ordering::Relaxed);
                &self.downloaded
            }
            ItemOutcome::Archived { bytes } => {
                self.bytes.fetch_add(*bytes, Ordering::Relaxed);
                &self.recovered
            }
            ItemOutcome::Missing => &self.missing,
            ItemOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.into());
    }

    #[must_use]
    pub fn snapshot(&self, elapsed: Duration, cancelled: bool) -> RunStats {
        RunStats {
            discovered: self.discovered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
            elapsed,
            errors: self
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            cancelled,
        }
    }
}
