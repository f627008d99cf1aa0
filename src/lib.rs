//! # Changelog: a multi-file append-only keyed log.
//!
//! This crate implements the on-disk changelog of a directory replication
//! server: an ordered stream of `(key, value)` records stored as a chain of
//! files in one directory, with strictly non-decreasing append, forward
//! traversal via positionable cursors, age-based whole-file purging, and
//! size-triggered rotation of the writable head file.
//!
//! ## Design constraints
//!
//! These invariants are the groundwork for keeping the design simple:
//! - records are appended with non-decreasing keys, so records within a file
//!   and across files are globally ascending
//! - rotation is a rename, never a copy; no record is ever overwritten
//! - space is reclaimed in whole files only, never by rewriting a file
//! - all records are checksummed (CRC32)
//! - one process owns a log directory at a time, enforced with an advisory
//!   lock file
//! - writes are not durable until [`Log::sync_to_file_system`] returns
//!
//! ## On-disk layout
//!
//! A log directory contains exactly one writable file, always named
//! `head.log`, plus zero or more immutable rotated files named
//! `<lowKey>_<highKey>.log`, where the key strings come from the
//! [`RecordParser`].  The name alone determines a rotated file's key bounds:
//! it is the persisted index, and the contents are not cross-checked against
//! it at startup.
//!
//! In memory, the files form an inventory ordered by *partition key*: the
//! high key for a rotated file, and the parser's `max_key` sentinel --
//! strictly greater than any real key -- for the head.  "The file that should
//! contain key `k`" is then a ceiling lookup, and the head is always the
//! last entry.
//!
//! Records are framed on disk as
//!
//!   record:
//!     `payload_len`: uint32
//!     `checksum`:    uint32 (CRC32 of `payload`)
//!     `payload`:     uint8[] (parser-encoded key and value)
//!
//! with records packed sequentially and never spanning files.
//!
//! ## Rotation
//!
//! When an append finds the head past its size threshold, the head is closed
//! for writes, renamed to its range-encoded name, reopened read-only, and
//! replaced by a fresh empty head.  Live cursors that were reading the head
//! are rebound onto the renamed file at the same byte offset -- valid because
//! the bytes did not move.  A single record larger than the threshold is
//! still accepted; files may exceed the limit by one record.
//!
//! ## Reading
//!
//! A [`LogCursor`] walks the inventory in key order, crossing file
//! boundaries transparently.  Cursor operations take the log's shared lock
//! while rotation and the other mutations take the exclusive lock, so a
//! cursor never observes a half-rotated directory.  A cursor that has
//! consumed everything parks at the end of the head and picks up later
//! appends on its next advance.
//!
//! ## Purging
//!
//! [`Log::purge_up_to`] deletes every file whose partition key sits strictly
//! below a boundary key.  Surviving files are never rewritten, so records
//! below the boundary that share a file with records above it survive too.
//! The head is never purged.  Cursors positioned in a purged file are
//! invalidated and behave like the empty cursor from then on.
//!
//! ## Sharing
//!
//! A [`LogRegistry`] hands out one [`Log`] per directory, reference-counted
//! across openers; the last [`Log::close`] performs the real shutdown.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

mod cursor;
mod error;
mod file;
mod log;
mod parser;
mod record;
mod registry;

#[cfg(test)]
mod tests;

pub use cursor::LogCursor;
pub use error::ChangelogError;
pub use log::{Log, HEAD_LOG_FILE_NAME, LOCK_FILE_NAME, LOG_FILE_EXTENSION};
pub use parser::{Record, RecordParser};
pub use registry::LogRegistry;

/// Strategy for matching a key when positioning a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    /// Position exactly on the requested key; fail if it is absent.
    Exact,
    /// Position on the first record whose key is at or above the requested
    /// key.
    Nearest,
}
