//! Feed media archiver library.
//!
//! Downloads every media asset referenced by a blog-like feed into a local
//! directory, records provenance in a resumable manifest, and falls back to
//! the Wayback Machine when the original host no longer serves an asset.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod archiver;
pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod fs_utils;
pub mod manifest;
pub mod media;
pub mod recovery;
pub mod source;
pub mod wayback;
