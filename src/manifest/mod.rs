//! Durable, resumable record of every media item's provenance and status.

mod models;
mod store;

pub use models::{
    EntryKey, EntryStatus, Manifest, ManifestEntry, ManifestFile, ManifestStats, RetrievedFrom,
};
pub use store::{ManifestError, ManifestStore, Verification};
