//! # pixstore
//!
//! Journaled on-disk blob store with LRU eviction.
//!
//! ## Design
//! - One file per committed blob, named by its key
//! - Append-only journal recording edits, commits, reads and removals
//! - Writes go to a temp file and are published by rename
//! - Total blob size is bounded; least recently used entries go first

#![warn(missing_docs)]

mod error;
mod journal;
mod store;

pub use error::{Error, Result};
pub use journal::{is_valid_key, MAX_KEY_LEN};
pub use store::{DiskLru, Editor, Snapshot};
